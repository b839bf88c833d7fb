//! Retry with exponential backoff, jitter and rate-limit acquisition
//!
//! Every attempt, including retries, re-acquires budget from the broker's
//! rate limiter when the policy names a broker, so a retry storm can never
//! push a broker past its limit.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::common::rate_limiter::RateLimiterRegistry;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::types::BrokerId;

/// Retry behaviour for one class of broker call
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    name: &'static str,
    max_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: f64,
    max_delay: Duration,
    jitter_enabled: bool,
    retryable: BTreeSet<ErrorKind>,
    rate_limit_broker: Option<BrokerId>,
    rate_limit_tokens: u32,
}

const TRANSIENT: [ErrorKind; 4] = [
    ErrorKind::Network,
    ErrorKind::Timeout,
    ErrorKind::RateLimited,
    ErrorKind::Api,
];

impl RetryPolicy {
    /// Build a custom policy. `max_attempts` counts the first call.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_multiplier: f64,
        max_delay: Duration,
    ) -> CoreResult<Self> {
        if max_attempts == 0 {
            return Err(CoreError::Configuration(
                "max_attempts must be >= 1".to_string(),
            ));
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(CoreError::Configuration(format!(
                "backoff_multiplier must be >= 1.0, got {backoff_multiplier}"
            )));
        }
        Ok(Self {
            name: "custom",
            max_attempts,
            initial_delay,
            backoff_multiplier,
            max_delay,
            jitter_enabled: true,
            retryable: TRANSIENT.into_iter().collect(),
            rate_limit_broker: None,
            rate_limit_tokens: 1,
        })
    }

    fn preset(
        name: &'static str,
        max_attempts: u32,
        initial_delay_ms: u64,
        backoff_multiplier: f64,
        max_delay_secs: u64,
        retryable: &[ErrorKind],
    ) -> Self {
        Self {
            name,
            max_attempts,
            initial_delay: Duration::from_millis(initial_delay_ms),
            backoff_multiplier,
            max_delay: Duration::from_secs(max_delay_secs),
            jitter_enabled: true,
            retryable: retryable.iter().copied().collect(),
            rate_limit_broker: None,
            rate_limit_tokens: 1,
        }
    }

    pub fn standard() -> Self {
        Self::preset("default", 3, 1_000, 2.0, 30, &TRANSIENT)
    }

    pub fn aggressive() -> Self {
        Self::preset("aggressive", 5, 500, 1.5, 15, &TRANSIENT)
    }

    pub fn conservative() -> Self {
        Self::preset("conservative", 2, 2_000, 3.0, 60, &TRANSIENT)
    }

    /// Order placement, cancel and exit: retried hard, including after an
    /// expired session the re-auth loop may have refreshed.
    pub fn critical() -> Self {
        Self::preset(
            "critical",
            5,
            500,
            1.2,
            10,
            &[
                ErrorKind::Network,
                ErrorKind::Timeout,
                ErrorKind::RateLimited,
                ErrorKind::Api,
                ErrorKind::Auth,
            ],
        )
    }

    /// Read-only queries: only connectivity problems are worth a retry
    pub fn data_fetch() -> Self {
        Self::preset(
            "data_fetch",
            3,
            1_000,
            2.0,
            20,
            &[ErrorKind::Network, ErrorKind::Timeout],
        )
    }

    /// Look up a named preset; unknown names fall back to `default`
    pub fn named(name: &str) -> Self {
        match name {
            "aggressive" => Self::aggressive(),
            "conservative" => Self::conservative(),
            "critical" | "order_critical" => Self::critical(),
            "data_fetch" => Self::data_fetch(),
            _ => Self::standard(),
        }
    }

    pub fn with_rate_limit(mut self, broker: BrokerId, tokens: u32) -> Self {
        self.rate_limit_broker = Some(broker);
        self.rate_limit_tokens = tokens;
        self
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter_enabled = enabled;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn rate_limit_broker(&self) -> Option<&BrokerId> {
        self.rate_limit_broker.as_ref()
    }

    pub fn is_retryable(&self, err: &CoreError) -> bool {
        err.broker_kind()
            .is_some_and(|kind| self.retryable.contains(&kind))
    }

    /// Backoff before retry number `retry` (1-based), without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter_enabled && !base.is_zero() {
            let jitter = rand::rng().random_range(0.0..=base.as_secs_f64() * 0.1);
            (base + Duration::from_secs_f64(jitter)).min(self.max_delay)
        } else {
            base
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Aggregate retry counters
#[derive(Debug, Clone, Serialize)]
pub struct RetryStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// attempts used -> number of calls
    pub attempts_histogram: BTreeMap<u32, u64>,
    pub last_reset: DateTime<Utc>,
}

impl Default for RetryStats {
    fn default() -> Self {
        Self {
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            attempts_histogram: BTreeMap::new(),
            last_reset: Utc::now(),
        }
    }
}

impl RetryStats {
    fn record(&mut self, attempts: u32, success: bool) {
        self.total_calls += 1;
        if success {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
        }
        *self.attempts_histogram.entry(attempts).or_insert(0) += 1;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.successful_calls as f64 / self.total_calls as f64 * 100.0
        }
    }
}

/// Runs broker operations under a [`RetryPolicy`]
#[derive(Debug)]
pub struct RetryOrchestrator {
    limits: Arc<RateLimiterRegistry>,
    stats: Mutex<RetryStats>,
}

impl RetryOrchestrator {
    pub fn new(limits: Arc<RateLimiterRegistry>) -> Self {
        Self {
            limits,
            stats: Mutex::new(RetryStats::default()),
        }
    }

    pub fn limits(&self) -> &Arc<RateLimiterRegistry> {
        &self.limits
    }

    /// Execute `operation` until it succeeds, fails with a non-retryable
    /// error, or the policy runs out of attempts.
    pub async fn run<T, F, Fut>(&self, policy: &RetryPolicy, operation: F) -> CoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        self.run_gated(policy, || Ok(()), operation).await
    }

    /// Like [`run`](Self::run), but `gate` is asked before every attempt,
    /// ahead of any rate-limit token. A gate refusal on the first attempt is
    /// returned as is; once an attempt has failed, the refusal ends the
    /// sequence as `RetryExhausted` over that last failure.
    pub async fn run_gated<T, G, F, Fut>(
        &self,
        policy: &RetryPolicy,
        mut gate: G,
        mut operation: F,
    ) -> CoreResult<T>
    where
        G: FnMut() -> CoreResult<()>,
        F: FnMut() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let mut attempt: u32 = 0;
        let mut last_err: Option<CoreError> = None;
        loop {
            if let Err(refused) = gate() {
                let Some(err) = last_err else {
                    return Err(refused);
                };
                warn!(
                    policy = policy.name,
                    attempts = attempt,
                    reason = %refused,
                    error = %err,
                    "retry stopped before next attempt"
                );
                self.record(attempt, false);
                return Err(CoreError::RetryExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
            attempt += 1;

            let result = match policy.rate_limit_broker.as_ref() {
                Some(broker) => {
                    let _permit = self
                        .limits
                        .acquire(broker, policy.rate_limit_tokens)
                        .await?;
                    operation().await
                }
                None => operation().await,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            policy = policy.name,
                            attempt,
                            max_attempts = policy.max_attempts,
                            "retry succeeded"
                        );
                    }
                    self.record(attempt, true);
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !policy.is_retryable(&err) {
                self.record(attempt, false);
                return Err(err);
            }

            if attempt >= policy.max_attempts {
                error!(
                    policy = policy.name,
                    attempts = attempt,
                    error = %err,
                    "all retry attempts failed"
                );
                self.record(attempt, false);
                return Err(CoreError::RetryExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = policy.delay_for(attempt);
            warn!(
                policy = policy.name,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, retrying"
            );
            sleep(delay).await;
            last_err = Some(err);
        }
    }

    fn record(&self, attempts: u32, success: bool) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(attempts, success);
    }

    pub fn stats(&self) -> RetryStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = RetryStats::default();
    }
}
