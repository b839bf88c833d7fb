//! Broker Sync
//!
//! Multi-broker execution core: per-broker rate limiting, retries with
//! backoff, a shared order snapshot cache, a SQLite execution ledger with
//! derived order status, and reconciliation against live broker state.

pub mod broker;
pub mod cache;
pub mod common;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod ledger;
pub mod monitor;
pub mod reconcile;
pub mod types;

pub use broker::{BrokerAdapter, BrokerGateway, BrokerOrder, OrderStatus, PaperBroker};
pub use cache::OrderSnapshotCache;
pub use config::Config;
pub use context::ProcessContext;
pub use error::{BrokerError, CoreError, CoreResult, ErrorKind};
pub use health::{Connectivity, HealthMonitor};
pub use ledger::{LogicalOrderStatus, SqliteLedger};
pub use monitor::OrderMonitor;
pub use reconcile::{ReconcileAction, ReconcileReport, ReconciliationEngine};
pub use types::*;
