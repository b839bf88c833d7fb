//! Per-broker order book snapshots
//!
//! A background task per broker pulls the full order book on a fixed
//! interval and swaps it in whole. Readers always get a complete snapshot:
//! a read that lands while a refresh is running waits for it to finish and
//! returns the fresh book. A failed refresh keeps the previous snapshot.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::broker::{normalize_order_id, BrokerGateway, BrokerOrder, StatusObservation, StatusTranslator};
use crate::error::{CoreError, CoreResult};
use crate::types::BrokerId;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

struct BrokerSlot {
    gateway: Arc<BrokerGateway>,
    refresh_lock: tokio::sync::Mutex<()>,
    refreshing: AtomicBool,
    snapshot: RwLock<Option<Arc<Vec<BrokerOrder>>>>,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
    /// Fired (then reset) whenever a refresh attempt ends
    updated: Notify,
    refresh_requested: Notify,
    refreshes: AtomicU64,
    failures: AtomicU64,
    loop_started: AtomicBool,
}

impl BrokerSlot {
    fn current(&self) -> Option<Arc<Vec<BrokerOrder>>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Clears the in-progress flag and wakes readers even if the refresh future
/// is dropped half way
struct RefreshGuard<'a>(&'a BrokerSlot);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.refreshing.store(false, Ordering::Release);
        self.0.updated.notify_waiters();
    }
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub orders: usize,
    pub refreshes: u64,
    pub failures: u64,
    pub last_refresh: Option<DateTime<Utc>>,
}

pub struct OrderSnapshotCache {
    translator: Arc<StatusTranslator>,
    refresh_interval: Duration,
    slots: RwLock<HashMap<BrokerId, Arc<BrokerSlot>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OrderSnapshotCache {
    pub fn new(translator: Arc<StatusTranslator>, refresh_interval: Duration) -> CoreResult<Self> {
        if refresh_interval.is_zero() {
            return Err(CoreError::Configuration(
                "cache refresh interval must be positive".to_string(),
            ));
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            translator,
            refresh_interval,
            slots: RwLock::new(HashMap::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Track a broker. No snapshot exists until its first refresh succeeds.
    pub fn register(&self, gateway: Arc<BrokerGateway>) {
        let broker = gateway.broker_id().clone();
        let slot = Arc::new(BrokerSlot {
            gateway,
            refresh_lock: tokio::sync::Mutex::new(()),
            refreshing: AtomicBool::new(false),
            snapshot: RwLock::new(None),
            last_refresh: RwLock::new(None),
            updated: Notify::new(),
            refresh_requested: Notify::new(),
            refreshes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            loop_started: AtomicBool::new(false),
        });
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(broker, slot);
    }

    pub fn brokers(&self) -> Vec<BrokerId> {
        let mut brokers: Vec<_> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        brokers.sort();
        brokers
    }

    fn slot(&self, broker: &BrokerId) -> CoreResult<Arc<BrokerSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(broker)
            .cloned()
            .ok_or_else(|| CoreError::CacheNotInitialized {
                broker: broker.clone(),
            })
    }

    /// Pull the broker's order book now and swap it in. Returns the number of
    /// orders in the new snapshot.
    pub async fn refresh(&self, broker: &BrokerId) -> CoreResult<usize> {
        let slot = self.slot(broker)?;
        let _lock = slot.refresh_lock.lock().await;
        slot.refreshing.store(true, Ordering::Release);
        let _guard = RefreshGuard(&slot);

        match slot.gateway.get_order_details().await {
            Ok(orders) => {
                let count = orders.len();
                *slot.snapshot.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(Arc::new(orders));
                *slot.last_refresh.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(Utc::now());
                slot.refreshes.fetch_add(1, Ordering::Relaxed);
                debug!(broker = %broker, orders = count, "order snapshot refreshed");
                Ok(count)
            }
            Err(err) => {
                slot.failures.fetch_add(1, Ordering::Relaxed);
                warn!(broker = %broker, error = %err, "order snapshot refresh failed, keeping previous snapshot");
                Err(err)
            }
        }
    }

    /// Current snapshot. Waits out a refresh that is in progress.
    pub async fn get_orders(&self, broker: &BrokerId) -> CoreResult<Arc<Vec<BrokerOrder>>> {
        let slot = self.slot(broker)?;

        let updated = slot.updated.notified();
        tokio::pin!(updated);
        updated.as_mut().enable();
        if slot.refreshing.load(Ordering::Acquire) {
            updated.await;
        }

        slot.current().ok_or_else(|| CoreError::CacheNotInitialized {
            broker: broker.clone(),
        })
    }

    pub async fn get_order_by_id(
        &self,
        broker: &BrokerId,
        order_id: &str,
        product_type: Option<&str>,
    ) -> CoreResult<Option<BrokerOrder>> {
        let lookup_id = normalize_order_id(broker, order_id, product_type);
        let orders = self.get_orders(broker).await?;
        Ok(orders.iter().find(|o| o.order_id == lookup_id).cloned())
    }

    /// Canonical status of one order; unmapped codes come back raw
    pub async fn get_order_status_by_id(
        &self,
        broker: &BrokerId,
        order_id: &str,
        product_type: Option<&str>,
    ) -> CoreResult<Option<StatusObservation>> {
        let order = self.get_order_by_id(broker, order_id, product_type).await?;
        Ok(order.map(|o| self.translator.observe_order(broker, &o)))
    }

    /// Ask the broker's loop for an immediate refresh. The old snapshot stays
    /// readable until the new one lands.
    pub fn invalidate(&self, broker: &BrokerId, reason: &str) -> CoreResult<()> {
        let slot = self.slot(broker)?;
        info!(broker = %broker, reason, "order snapshot invalidated");
        slot.refresh_requested.notify_one();
        Ok(())
    }

    pub fn last_refreshed(&self, broker: &BrokerId) -> Option<DateTime<Utc>> {
        let slot = self.slot(broker).ok()?;
        let last = *slot.last_refresh.read().unwrap_or_else(PoisonError::into_inner);
        last
    }

    pub fn stats(&self, broker: &BrokerId) -> CoreResult<CacheStats> {
        let slot = self.slot(broker)?;
        let orders = slot.current().map_or(0, |s| s.len());
        let last_refresh = *slot.last_refresh.read().unwrap_or_else(PoisonError::into_inner);
        Ok(CacheStats {
            orders,
            refreshes: slot.refreshes.load(Ordering::Relaxed),
            failures: slot.failures.load(Ordering::Relaxed),
            last_refresh,
        })
    }

    /// Spawn a refresh loop for every registered broker that lacks one
    pub fn start(self: &Arc<Self>) {
        let slots: Vec<(BrokerId, Arc<BrokerSlot>)> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(b, s)| (b.clone(), Arc::clone(s)))
            .collect();

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for (broker, slot) in slots {
            if slot.loop_started.swap(true, Ordering::AcqRel) {
                continue;
            }
            info!(broker = %broker, interval_secs = self.refresh_interval.as_secs_f64(), "starting order snapshot loop");
            let cache = Arc::clone(self);
            let shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(cache.refresh_loop(broker, slot, shutdown)));
        }
    }

    async fn refresh_loop(
        self: Arc<Self>,
        broker: BrokerId,
        slot: Arc<BrokerSlot>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            // Failures are logged inside refresh; the loop keeps going
            let _ = self.refresh(&broker).await;

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(self.refresh_interval) => {}
                _ = slot.refresh_requested.notified() => {
                    debug!(broker = %broker, "refreshing early on invalidation");
                }
            }
        }
        slot.loop_started.store(false, Ordering::Release);
        debug!(broker = %broker, "order snapshot loop stopped");
    }

    /// Signal every loop to stop and wait for them. An in-flight broker call
    /// is allowed to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "order snapshot loop ended abnormally");
            }
        }
        let _ = self.shutdown.send(false);
    }
}
