//! Per-broker circuit breaker
//!
//! Stops hammering a broker that is clearly down. While the circuit is open,
//! gateway calls fail fast with `CoreError::CircuitOpen` and never consume
//! rate-limit budget.
//!
//! States:
//! - Closed: normal operation
//! - Open: broker is failing, calls are rejected
//! - HalfOpen: probing whether the broker recovered

use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::types::BrokerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive outage-type failures before opening
    pub failure_threshold: u32,
    /// Consecutive successes in HalfOpen before closing
    pub success_threshold: u32,
    /// How long to stay Open before probing
    #[serde(rename = "open_timeout_secs", deserialize_with = "secs::deserialize")]
    pub open_timeout: Duration,
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    broker: BrokerId,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    config: CircuitBreakerConfig,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(broker: BrokerId, config: CircuitBreakerConfig) -> Self {
        Self {
            broker,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            config,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call may go out now. An Open circuit whose timeout elapsed
    /// moves to HalfOpen and lets the probe through.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => match self.opened_at {
                Some(opened) if opened.elapsed() >= self.config.open_timeout => {
                    info!(broker = %self.broker, "circuit breaker half-open, probing broker");
                    self.state = CircuitState::HalfOpen;
                    self.failure_count = 0;
                    self.success_count = 0;
                    true
                }
                Some(_) => false,
                None => true,
            },
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    info!(broker = %self.broker, "circuit breaker closed after recovery");
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call. Rejections and not-found answers prove the broker
    /// is reachable, so they count as successes for breaker purposes.
    pub fn record_failure(&mut self, kind: ErrorKind) {
        if kind.is_business_outcome() {
            self.record_success();
            return;
        }

        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    warn!(
                        broker = %self.broker,
                        failures = self.failure_count,
                        "circuit breaker opened"
                    );
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(broker = %self.broker, "circuit breaker re-opened, probe failed");
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                self.failure_count = 0;
                self.success_count = 0;
            }
            CircuitState::Open => self.opened_at = Some(Instant::now()),
        }
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.opened_at = None;
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}
