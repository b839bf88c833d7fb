//! Reconciliation of ledger state against live broker state
//!
//! The engine fetches every open record's order straight from the broker,
//! fixes the ledger where the broker is ahead, and reports what the logical
//! order now needs: an exit for filled entries, a cancel for entries that
//! never filled. A snapshot copy is only used to report a failed lookup as
//! stale. When any lookup leaves the live state unknown it recommends
//! nothing.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broker::{
    BrokerGateway, BrokerOrder, OrderAck, OrderLookup, OrderStatus, StatusTranslator,
};
use crate::cache::OrderSnapshotCache;
use crate::error::CoreResult;
use crate::ledger::{
    record_filled_leg, resolve_status, ExecutionRecord, ExecutionSide, ExecutionUpdate, ExitKind,
    LogicalOrderStatus, NewExecution, SqliteLedger,
};
use crate::types::BrokerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReconcileAction {
    Exit,
    Cancel,
    None,
}

/// A record whose live state differed from the ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    pub record_id: i64,
    pub broker_order_id: String,
    pub local_status: OrderStatus,
    pub live_status: OrderStatus,
    pub local_filled: i64,
    pub live_filled: i64,
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub logical_order_id: i64,
    pub status: LogicalOrderStatus,
    pub action: ReconcileAction,
    pub discrepancies: Vec<Discrepancy>,
    pub exits_recorded: usize,
    /// Some live state could not be confirmed
    pub ambiguous: bool,
    /// An EXIT order is still working at the broker
    pub exit_in_flight: bool,
}

impl ReconcileReport {
    pub fn writes(&self) -> usize {
        self.discrepancies.iter().filter(|d| d.applied).count() + self.exits_recorded
    }
}

pub struct ReconciliationEngine {
    ledger: Arc<SqliteLedger>,
    gateways: HashMap<BrokerId, Arc<BrokerGateway>>,
    translator: Arc<StatusTranslator>,
    /// Last-resort source when a live lookup fails
    cache: Option<Arc<OrderSnapshotCache>>,
}

impl ReconciliationEngine {
    pub fn new(
        ledger: Arc<SqliteLedger>,
        gateways: HashMap<BrokerId, Arc<BrokerGateway>>,
        translator: Arc<StatusTranslator>,
    ) -> Self {
        Self {
            ledger,
            gateways,
            translator,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<OrderSnapshotCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn gateway(&self, broker: &BrokerId) -> Option<&Arc<BrokerGateway>> {
        self.gateways.get(broker)
    }

    /// Live lookup, falling back to the snapshot copy as `Stale`
    async fn lookup(&self, gateway: &BrokerGateway, record: &ExecutionRecord, order_id: &str) -> OrderLookup {
        let product = record.product_type.as_deref();
        let lookup = gateway.fetch_order(order_id, product).await;
        let OrderLookup::AdapterError(err) = lookup else {
            return lookup;
        };
        let Some(cache) = &self.cache else {
            return OrderLookup::AdapterError(err);
        };
        match cache.get_order_by_id(&record.broker_id, order_id, product).await {
            Ok(Some(order)) => {
                warn!(order_id, error = %err, "live lookup failed, only a stale snapshot is available");
                OrderLookup::Stale(order)
            }
            _ => OrderLookup::AdapterError(err),
        }
    }

    pub async fn reconcile(&self, logical_order_id: i64) -> CoreResult<ReconcileReport> {
        let records = self.ledger.records_for(logical_order_id)?;
        let mut discrepancies = Vec::new();
        let mut ambiguous = false;

        for record in records.iter().filter(|r| r.status.is_live()) {
            let Some(order_id) = record.broker_order_id.as_deref() else {
                continue;
            };
            let Some(gateway) = self.gateway(&record.broker_id) else {
                warn!(broker = %record.broker_id, "no gateway for broker, cannot reconcile record");
                ambiguous = true;
                continue;
            };

            let order = match self.lookup(gateway, record, order_id).await {
                OrderLookup::Found(order) => order,
                OrderLookup::NotFound => {
                    warn!(record_id = record.id, order_id, "order missing on broker");
                    ambiguous = true;
                    continue;
                }
                OrderLookup::Stale(_) | OrderLookup::AdapterError(_) => {
                    ambiguous = true;
                    continue;
                }
            };

            match self.apply_live(record, &order) {
                Ok(Some(discrepancy)) => discrepancies.push(discrepancy),
                Ok(None) => {}
                Err(err) => {
                    error!(record_id = record.id, error = %err, "could not apply live state");
                    ambiguous = true;
                }
            }
        }

        let exits_recorded = match self.record_bracket_exits(logical_order_id).await {
            Ok(n) => n,
            Err(err) => {
                warn!(logical_order_id, error = %err, "bracket leg check failed");
                ambiguous = true;
                0
            }
        };

        let current = self.ledger.records_for(logical_order_id)?;
        let status = resolve_status(&current);
        let exit_in_flight = current
            .iter()
            .any(|r| r.side == ExecutionSide::Exit && r.status.is_live());
        let action = if ambiguous {
            ReconcileAction::None
        } else {
            match status {
                LogicalOrderStatus::Open if exit_in_flight => {
                    info!(logical_order_id, "exit already working at broker, nothing to place");
                    ReconcileAction::None
                }
                LogicalOrderStatus::Open => ReconcileAction::Exit,
                LogicalOrderStatus::Pending => ReconcileAction::Cancel,
                _ => ReconcileAction::None,
            }
        };

        let report = ReconcileReport {
            logical_order_id,
            status,
            action,
            discrepancies,
            exits_recorded,
            ambiguous,
            exit_in_flight,
        };
        info!(
            logical_order_id,
            status = %report.status,
            action = ?report.action,
            writes = report.writes(),
            ambiguous,
            "reconciliation complete"
        );
        Ok(report)
    }

    /// Reconcile every logical order that is not terminal
    pub async fn reconcile_open(&self) -> CoreResult<Vec<ReconcileReport>> {
        let mut reports = Vec::new();
        for id in self.ledger.open_logical_orders()? {
            reports.push(self.reconcile(id).await?);
        }
        Ok(reports)
    }

    fn apply_live(&self, record: &ExecutionRecord, order: &BrokerOrder) -> CoreResult<Option<Discrepancy>> {
        let live_status = self.translator.order_status(&record.broker_id, order)?;
        let live_filled = order.filled_quantity.max(record.executed_quantity);
        if live_status == record.status && live_filled == record.executed_quantity {
            debug!(record_id = record.id, status = %live_status, "ledger agrees with broker");
            return Ok(None);
        }

        let update = ExecutionUpdate::fill(live_status, live_filled, order.average_price);
        let applied = self.ledger.update_if_status(record.id, record.status, &update)?;
        Ok(Some(Discrepancy {
            record_id: record.id,
            broker_order_id: order.order_id.clone(),
            local_status: record.status,
            live_status,
            local_filled: record.executed_quantity,
            live_filled,
            applied,
        }))
    }

    /// Record a filled bracket leg as EXIT, once
    async fn record_bracket_exits(&self, logical_order_id: i64) -> CoreResult<usize> {
        let records = self.ledger.records_for(logical_order_id)?;
        let mut recorded = 0;
        let mut books: HashMap<BrokerId, Vec<BrokerOrder>> = HashMap::new();

        for entry in records
            .iter()
            .filter(|r| r.side == ExecutionSide::Entry && r.is_bracket() && r.executed_quantity > 0)
        {
            let already_exited = records.iter().any(|r| {
                r.side == ExecutionSide::Exit && r.broker_id == entry.broker_id && r.executed_quantity > 0
            });
            if already_exited {
                continue;
            }
            let Some(gateway) = self.gateway(&entry.broker_id) else {
                continue;
            };
            if !books.contains_key(&entry.broker_id) {
                let book = gateway.get_order_details().await?;
                books.insert(entry.broker_id.clone(), book);
            }
            let Some(book) = books.get(&entry.broker_id) else {
                continue;
            };
            if record_filled_leg(&self.ledger, entry, book, &self.translator)? {
                recorded += 1;
            }
        }
        Ok(recorded)
    }

    /// Carry out the recommended action through the broker gateways.
    ///
    /// An exit places one closing order per broker for its open quantity,
    /// less whatever earlier exits still have working, and records it as a
    /// pending EXIT. A cancel is only sent; the outcome is picked up by the
    /// next reconciliation.
    pub async fn execute(&self, report: &ReconcileReport) -> CoreResult<Vec<OrderAck>> {
        let records = self.ledger.records_for(report.logical_order_id)?;
        let mut acks = Vec::new();

        match report.action {
            ReconcileAction::None => {}
            ReconcileAction::Cancel => {
                for entry in records
                    .iter()
                    .filter(|r| r.side == ExecutionSide::Entry && r.status.is_live())
                {
                    let (Some(order_id), Some(gateway)) =
                        (entry.broker_order_id.as_deref(), self.gateway(&entry.broker_id))
                    else {
                        continue;
                    };
                    acks.push(gateway.cancel_order(order_id, entry.product_type.as_deref()).await?);
                }
            }
            ReconcileAction::Exit => {
                let mut open: HashMap<BrokerId, i64> = HashMap::new();
                for r in &records {
                    let signed = match r.side {
                        ExecutionSide::Entry => r.executed_quantity,
                        ExecutionSide::Exit if r.status.is_live() => -r.quantity.max(r.executed_quantity),
                        ExecutionSide::Exit => -r.executed_quantity,
                    };
                    *open.entry(r.broker_id.clone()).or_insert(0) += signed;
                }

                for entry in records.iter().filter(|r| r.side == ExecutionSide::Entry) {
                    let qty = open.get(&entry.broker_id).copied().unwrap_or(0);
                    if qty <= 0 {
                        continue;
                    }
                    let (Some(order_id), Some(gateway)) =
                        (entry.broker_order_id.as_deref(), self.gateway(&entry.broker_id))
                    else {
                        continue;
                    };
                    let ack = gateway.exit_order(order_id, entry.product_type.as_deref()).await?;
                    let mut exit = NewExecution::exit(entry, ack.order_id.clone(), qty, ExitKind::Signal)
                        .with_note("reconciliation exit");
                    // The closing order is a plain order even when the entry was a bracket
                    exit.product_type = None;
                    match self.ledger.insert(&exit) {
                        Ok(_) => {}
                        Err(e) if e.is_constraint_violation() => {
                            warn!(order_id = %ack.order_id, "exit order already recorded");
                        }
                        Err(e) => {
                            error!(
                                order_id = %ack.order_id,
                                logical_order_id = report.logical_order_id,
                                error = %e,
                                "exit placed at broker but not recorded in ledger"
                            );
                            return Err(e);
                        }
                    }
                    open.insert(entry.broker_id.clone(), 0);
                    acks.push(ack);
                }
            }
        }
        Ok(acks)
    }
}
