//! Execution ledger
//!
//! Append-mostly record of broker-confirmed executions. A *logical order* is
//! one trading intent; it owns any number of ENTRY and EXIT records, one per
//! broker order. Its status is never stored: it is derived from the records
//! by [`resolver::resolve_status`].

pub mod bracket;
pub mod resolver;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::broker::OrderStatus;
use crate::types::{BrokerId, Money, TradeDirection};

pub use bracket::{classify_leg, exit_from_bracket, record_filled_leg, BracketLeg};
pub use resolver::{realized_pnl, resolve_status, summarize, vwap, LogicalOrderSummary};
pub use store::{CleanupReport, SqliteLedger};

// =============================================================================
// Data Models
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionSide {
    Entry,
    Exit,
}

impl ExecutionSide {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionSide::Entry => "ENTRY",
            ExecutionSide::Exit => "EXIT",
        }
    }
}

impl FromStr for ExecutionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ENTRY" => Ok(ExecutionSide::Entry),
            "EXIT" => Ok(ExecutionSide::Exit),
            other => Err(format!("unknown execution side: {other}")),
        }
    }
}

impl fmt::Display for ExecutionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an EXIT record exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitKind {
    /// Bracket stoploss leg filled
    Stoploss,
    /// Bracket target leg filled
    Target,
    /// Operator closed the position by hand
    Manual,
    /// Exit placed by the trading logic or reconciliation
    Signal,
}

impl ExitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitKind::Stoploss => "STOPLOSS",
            ExitKind::Target => "TARGET",
            ExitKind::Manual => "MANUAL",
            ExitKind::Signal => "SIGNAL",
        }
    }
}

impl FromStr for ExitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STOPLOSS" => Ok(ExitKind::Stoploss),
            "TARGET" => Ok(ExitKind::Target),
            "MANUAL" => Ok(ExitKind::Manual),
            "SIGNAL" => Ok(ExitKind::Signal),
            other => Err(format!("unknown exit kind: {other}")),
        }
    }
}

/// Derived status of a logical order.
///
/// Progresses `AwaitingEntry -> Pending -> Open -> Closed`; `Cancelled` and
/// `Failed` are reachable only while nothing has filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogicalOrderStatus {
    AwaitingEntry,
    Pending,
    Open,
    Closed,
    Cancelled,
    Failed,
}

impl LogicalOrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LogicalOrderStatus::Closed | LogicalOrderStatus::Cancelled | LogicalOrderStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogicalOrderStatus::AwaitingEntry => "AWAITING_ENTRY",
            LogicalOrderStatus::Pending => "PENDING",
            LogicalOrderStatus::Open => "OPEN",
            LogicalOrderStatus::Closed => "CLOSED",
            LogicalOrderStatus::Cancelled => "CANCELLED",
            LogicalOrderStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for LogicalOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub logical_order_id: i64,
    pub broker_id: BrokerId,
    pub side: ExecutionSide,
    pub direction: TradeDirection,
    pub symbol: String,
    pub status: OrderStatus,
    pub quantity: i64,
    pub executed_quantity: i64,
    pub execution_price: Option<Money>,
    /// None when the broker never accepted the order
    pub broker_order_id: Option<String>,
    pub order_type: Option<String>,
    pub product_type: Option<String>,
    pub exit_kind: Option<ExitKind>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_bracket(&self) -> bool {
        self.product_type
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case(crate::broker::BRACKET_PRODUCT))
    }
}

/// A record about to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewExecution {
    pub logical_order_id: i64,
    pub broker_id: BrokerId,
    pub side: ExecutionSide,
    pub direction: TradeDirection,
    pub symbol: String,
    pub status: OrderStatus,
    pub quantity: i64,
    pub executed_quantity: i64,
    pub execution_price: Option<Money>,
    pub broker_order_id: Option<String>,
    pub order_type: Option<String>,
    pub product_type: Option<String>,
    pub exit_kind: Option<ExitKind>,
    pub note: Option<String>,
}

impl NewExecution {
    /// Entry accepted by the broker, nothing filled yet
    pub fn entry(
        logical_order_id: i64,
        broker_id: BrokerId,
        direction: TradeDirection,
        symbol: impl Into<String>,
        quantity: i64,
        broker_order_id: impl Into<String>,
    ) -> Self {
        Self {
            logical_order_id,
            broker_id,
            side: ExecutionSide::Entry,
            direction,
            symbol: symbol.into(),
            status: OrderStatus::Pending,
            quantity,
            executed_quantity: 0,
            execution_price: None,
            broker_order_id: Some(broker_order_id.into()),
            order_type: None,
            product_type: None,
            exit_kind: None,
            note: None,
        }
    }

    /// Entry the broker refused; there is no broker order id
    pub fn failed_entry(
        logical_order_id: i64,
        broker_id: BrokerId,
        direction: TradeDirection,
        symbol: impl Into<String>,
        quantity: i64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            status: OrderStatus::Failed,
            broker_order_id: None,
            note: Some(reason.into()),
            ..Self::entry(logical_order_id, broker_id, direction, symbol, quantity, String::new())
        }
    }

    /// Exit against an existing entry, trading the opposite direction
    pub fn exit(
        entry: &ExecutionRecord,
        broker_order_id: impl Into<String>,
        quantity: i64,
        kind: ExitKind,
    ) -> Self {
        Self {
            logical_order_id: entry.logical_order_id,
            broker_id: entry.broker_id.clone(),
            side: ExecutionSide::Exit,
            direction: entry.direction.opposite(),
            symbol: entry.symbol.clone(),
            status: OrderStatus::Pending,
            quantity,
            executed_quantity: 0,
            execution_price: None,
            broker_order_id: Some(broker_order_id.into()),
            order_type: None,
            product_type: entry.product_type.clone(),
            exit_kind: Some(kind),
            note: None,
        }
    }

    pub fn filled(mut self, quantity: i64, price: Money) -> Self {
        self.executed_quantity = quantity;
        self.execution_price = Some(price);
        self.status = if quantity >= self.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_order_type(mut self, order_type: impl Into<String>) -> Self {
        self.order_type = Some(order_type.into());
        self
    }

    pub fn with_product_type(mut self, product_type: impl Into<String>) -> Self {
        self.product_type = Some(product_type.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Fields a conditional update may change. `None` keeps the stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUpdate {
    pub status: OrderStatus,
    pub executed_quantity: Option<i64>,
    pub execution_price: Option<Money>,
    pub note: Option<String>,
}

impl ExecutionUpdate {
    pub fn status(status: OrderStatus) -> Self {
        Self {
            status,
            executed_quantity: None,
            execution_price: None,
            note: None,
        }
    }

    pub fn fill(status: OrderStatus, executed_quantity: i64, price: Option<Money>) -> Self {
        Self {
            status,
            executed_quantity: Some(executed_quantity),
            execution_price: price,
            note: None,
        }
    }
}
