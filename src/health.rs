//! Periodic broker connectivity checks
//!
//! Each broker gets a loop that asks its gateway for the account profile on
//! a fixed interval and records whether the session is usable. A failed
//! check marks the broker disconnected until a later check succeeds.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::broker::BrokerGateway;
use crate::types::BrokerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Connectivity {
    /// No check has completed yet
    Unknown,
    Connected,
    Disconnected,
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Connectivity::Unknown => "UNKNOWN",
            Connectivity::Connected => "CONNECTED",
            Connectivity::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerHealth {
    pub state: Connectivity,
    pub last_check: Option<DateTime<Utc>>,
    /// Failure message of the last check, if it failed
    pub note: Option<String>,
    pub checks: u64,
}

impl Default for BrokerHealth {
    fn default() -> Self {
        Self {
            state: Connectivity::Unknown,
            last_check: None,
            note: None,
            checks: 0,
        }
    }
}

#[derive(Debug)]
pub struct HealthMonitor {
    interval: Duration,
    brokers: RwLock<HashMap<BrokerId, BrokerHealth>>,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            brokers: RwLock::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one profile check against `gateway` and record the outcome
    pub async fn check(&self, gateway: &BrokerGateway) -> Connectivity {
        let broker = gateway.broker_id();
        let outcome = gateway.get_profile().await;

        let mut brokers = self.brokers.write().unwrap_or_else(PoisonError::into_inner);
        let health = brokers.entry(broker.clone()).or_default();
        health.checks += 1;
        health.last_check = Some(Utc::now());
        match outcome {
            Ok(profile) => {
                if health.state != Connectivity::Connected {
                    info!(broker = %broker, client_id = %profile.client_id, "broker connected");
                } else {
                    debug!(broker = %broker, "profile check ok");
                }
                health.state = Connectivity::Connected;
                health.note = None;
            }
            Err(err) => {
                error!(broker = %broker, error = %err, "profile check failed, broker disconnected");
                health.state = Connectivity::Disconnected;
                health.note = Some(err.to_string());
            }
        }
        health.state
    }

    pub fn status(&self, broker: &BrokerId) -> BrokerHealth {
        self.brokers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(broker)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connectivity(&self, broker: &BrokerId) -> Connectivity {
        self.status(broker).state
    }

    pub fn snapshot(&self) -> HashMap<BrokerId, BrokerHealth> {
        self.brokers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Check `gateway` every interval until shutdown. A failed check never
    /// ends the loop.
    pub async fn run(
        self: Arc<Self>,
        gateway: Arc<BrokerGateway>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let broker = gateway.broker_id().clone();
        info!(broker = %broker, interval_secs = self.interval.as_secs(), "starting health check loop");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.check(&gateway).await;

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep(self.interval) => {}
            }
        }
        debug!(broker = %broker, "health check loop stopped");
    }
}
