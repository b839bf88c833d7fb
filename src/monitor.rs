//! Watches one logical order until it reaches a terminal status
//!
//! Reads broker state from the snapshot cache only, so any number of
//! monitors cost no extra broker calls.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::broker::{StatusObservation, StatusTranslator};
use crate::cache::OrderSnapshotCache;
use crate::error::{CoreError, CoreResult};
use crate::ledger::{
    record_filled_leg, resolve_status, ExecutionRecord, ExecutionSide, ExecutionUpdate,
    LogicalOrderStatus, SqliteLedger,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct OrderMonitor {
    logical_order_id: i64,
    ledger: Arc<SqliteLedger>,
    cache: Arc<OrderSnapshotCache>,
    translator: Arc<StatusTranslator>,
    poll_interval: Duration,
}

impl OrderMonitor {
    pub fn new(
        logical_order_id: i64,
        ledger: Arc<SqliteLedger>,
        cache: Arc<OrderSnapshotCache>,
        translator: Arc<StatusTranslator>,
    ) -> Self {
        Self {
            logical_order_id,
            ledger,
            cache,
            translator,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn logical_order_id(&self) -> i64 {
        self.logical_order_id
    }

    /// Poll until the order is terminal or `shutdown` flips to true.
    /// Returns the last status seen.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> LogicalOrderStatus {
        info!(logical_order_id = self.logical_order_id, "monitoring order");
        let mut status = LogicalOrderStatus::AwaitingEntry;
        loop {
            match self.check_once().await {
                Ok(current) => {
                    if current != status {
                        info!(logical_order_id = self.logical_order_id, from = %status, to = %current, "order status changed");
                    }
                    status = current;
                    if status.is_terminal() {
                        break;
                    }
                }
                Err(err) => warn!(logical_order_id = self.logical_order_id, error = %err, "monitor check failed"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(logical_order_id = self.logical_order_id, "monitor stopping on shutdown");
                        break;
                    }
                }
                _ = sleep(self.poll_interval) => {}
            }
        }
        status
    }

    /// One pass: bring live records up to date from the snapshot, record a
    /// filled bracket leg, and derive the current status
    pub async fn check_once(&self) -> CoreResult<LogicalOrderStatus> {
        let records = self.ledger.records_for(self.logical_order_id)?;

        for record in records.iter().filter(|r| r.status.is_live()) {
            if let Err(err) = self.sync_record(record).await {
                match err {
                    CoreError::CacheNotInitialized { .. } => {
                        debug!(broker = %record.broker_id, "snapshot not ready yet");
                    }
                    other => warn!(record_id = record.id, error = %other, "could not sync record"),
                }
            }
        }

        let records = self.ledger.records_for(self.logical_order_id)?;
        let has_exit = |entry: &ExecutionRecord| {
            records.iter().any(|r| {
                r.side == ExecutionSide::Exit && r.broker_id == entry.broker_id && r.executed_quantity > 0
            })
        };
        let mut wrote_exit = false;
        for entry in records.iter().filter(|r| {
            r.side == ExecutionSide::Entry && r.is_bracket() && r.executed_quantity > 0
        }) {
            if has_exit(entry) {
                continue;
            }
            let orders = match self.cache.get_orders(&entry.broker_id).await {
                Ok(orders) => orders,
                Err(err) => {
                    debug!(broker = %entry.broker_id, error = %err, "no snapshot for bracket check");
                    continue;
                }
            };
            match record_filled_leg(&self.ledger, entry, &orders, &self.translator) {
                Ok(written) => wrote_exit |= written,
                Err(err) => warn!(record_id = entry.id, error = %err, "could not record bracket exit"),
            }
        }

        if wrote_exit {
            Ok(resolve_status(&self.ledger.records_for(self.logical_order_id)?))
        } else {
            Ok(resolve_status(&records))
        }
    }

    async fn sync_record(&self, record: &ExecutionRecord) -> CoreResult<()> {
        let Some(order_id) = record.broker_order_id.as_deref() else {
            return Ok(());
        };
        let Some(order) = self
            .cache
            .get_order_by_id(&record.broker_id, order_id, record.product_type.as_deref())
            .await?
        else {
            return Ok(());
        };

        let live = match self.translator.observe_order(&record.broker_id, &order) {
            StatusObservation::Known(status) => status,
            StatusObservation::Unmapped(_) => return Ok(()),
        };
        let filled = order.filled_quantity.max(record.executed_quantity);
        if live == record.status && filled == record.executed_quantity {
            return Ok(());
        }

        let update = ExecutionUpdate::fill(live, filled, order.average_price);
        self.ledger.update_if_status(record.id, record.status, &update)?;
        Ok(())
    }
}
