//! Process-wide wiring
//!
//! One `ProcessContext` per process owns the shared rate limiter registry,
//! the gateways, the snapshot cache, broker health and the ledger.
//! Components receive what they need from here instead of reaching for
//! globals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::{BrokerAdapter, BrokerGateway, StatusTranslator};
use crate::cache::OrderSnapshotCache;
use crate::common::{RateLimiterRegistry, RetryOrchestrator};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::health::HealthMonitor;
use crate::ledger::{LogicalOrderStatus, SqliteLedger};
use crate::monitor::OrderMonitor;
use crate::reconcile::ReconciliationEngine;
use crate::types::BrokerId;

pub struct ProcessContext {
    config: Config,
    limits: Arc<RateLimiterRegistry>,
    retry: Arc<RetryOrchestrator>,
    translator: Arc<StatusTranslator>,
    gateways: HashMap<BrokerId, Arc<BrokerGateway>>,
    cache: Arc<OrderSnapshotCache>,
    ledger: Arc<SqliteLedger>,
    health: Arc<HealthMonitor>,
    shutdown: watch::Sender<bool>,
    monitors: Mutex<Vec<JoinHandle<LogicalOrderStatus>>>,
    health_loops: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessContext {
    /// Open the ledger at the configured path and wire everything up
    pub fn open(config: Config, adapters: Vec<Arc<dyn BrokerAdapter>>) -> CoreResult<Self> {
        let ledger = SqliteLedger::open(&config.ledger.db_path)?;
        Self::build(config, ledger, adapters)
    }

    pub fn build(
        config: Config,
        ledger: SqliteLedger,
        adapters: Vec<Arc<dyn BrokerAdapter>>,
    ) -> CoreResult<Self> {
        let limits = Arc::new(RateLimiterRegistry::new(
            config.rate_configs()?,
            config.fallback_rate()?,
        ));
        let retry = Arc::new(RetryOrchestrator::new(Arc::clone(&limits)));
        let translator = Arc::new(config.translator()?);
        let cache = Arc::new(OrderSnapshotCache::new(
            Arc::clone(&translator),
            config.refresh_interval(),
        )?);

        let mut gateways = HashMap::new();
        for adapter in adapters {
            let broker = adapter.broker_id().clone();
            let gateway = Arc::new(
                BrokerGateway::new(adapter, Arc::clone(&retry), config.circuit_breaker.clone())
                    .with_policies(config.gateway_policies(&broker)),
            );
            cache.register(Arc::clone(&gateway));
            if gateways.insert(broker.clone(), gateway).is_some() {
                return Err(CoreError::Configuration(format!(
                    "broker {broker} registered twice"
                )));
            }
        }

        let health = Arc::new(HealthMonitor::new(config.health_interval()));
        let (shutdown, _) = watch::channel(false);
        info!(brokers = gateways.len(), "process context ready");
        Ok(Self {
            config,
            limits,
            retry,
            translator,
            gateways,
            cache,
            ledger: Arc::new(ledger),
            health,
            shutdown,
            monitors: Mutex::new(Vec::new()),
            health_loops: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn limits(&self) -> &Arc<RateLimiterRegistry> {
        &self.limits
    }

    pub fn retry(&self) -> &Arc<RetryOrchestrator> {
        &self.retry
    }

    pub fn translator(&self) -> &Arc<StatusTranslator> {
        &self.translator
    }

    pub fn cache(&self) -> &Arc<OrderSnapshotCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<SqliteLedger> {
        &self.ledger
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn gateway(&self, broker: &BrokerId) -> CoreResult<&Arc<BrokerGateway>> {
        self.gateways.get(broker).ok_or_else(|| {
            CoreError::Configuration(format!("no adapter registered for broker {broker}"))
        })
    }

    pub fn reconciler(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(
            Arc::clone(&self.ledger),
            self.gateways.clone(),
            Arc::clone(&self.translator),
        )
        .with_cache(Arc::clone(&self.cache))
    }

    pub fn monitor(&self, logical_order_id: i64) -> OrderMonitor {
        OrderMonitor::new(
            logical_order_id,
            Arc::clone(&self.ledger),
            Arc::clone(&self.cache),
            Arc::clone(&self.translator),
        )
        .with_poll_interval(self.config.poll_interval())
    }

    /// Watch `logical_order_id` in the background until it is terminal or
    /// the context shuts down
    pub fn spawn_monitor(&self, logical_order_id: i64) {
        let monitor = self.monitor(logical_order_id);
        let handle = tokio::spawn(monitor.run(self.shutdown.subscribe()));
        let mut monitors = self.monitors.lock().unwrap_or_else(PoisonError::into_inner);
        monitors.retain(|h| !h.is_finished());
        monitors.push(handle);
    }

    /// Monitors still running
    pub fn active_monitors(&self) -> usize {
        let mut monitors = self.monitors.lock().unwrap_or_else(PoisonError::into_inner);
        monitors.retain(|h| !h.is_finished());
        monitors.len()
    }

    /// Start the snapshot loops and one health check loop per broker
    pub fn start(&self) {
        self.cache.start();

        let mut loops = self.health_loops.lock().unwrap_or_else(PoisonError::into_inner);
        if !loops.is_empty() {
            return;
        }
        for gateway in self.gateways.values() {
            let health = Arc::clone(&self.health);
            loops.push(tokio::spawn(
                health.run(Arc::clone(gateway), self.shutdown.subscribe()),
            ));
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop monitors, health checks and snapshot loops, waiting for
    /// in-flight work
    pub async fn shutdown(&self) {
        info!("shutting down");
        let _ = self.shutdown.send(true);
        let monitors: Vec<_> = self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in monitors {
            match handle.await {
                Ok(status) => info!(status = %status, "monitor finished"),
                Err(e) => warn!(error = %e, "monitor task failed"),
            }
        }
        let loops: Vec<_> = self
            .health_loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "health check loop ended abnormally");
            }
        }
        self.cache.stop().await;
    }
}
