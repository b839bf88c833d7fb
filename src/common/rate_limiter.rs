//! Per-broker rate limiting using a token bucket
//!
//! One [`BrokerRateLimiter`] exists per broker and lives for the process
//! lifetime. Every outbound broker call (order placement, market-data polling,
//! position sync, snapshot refresh) resolves its limiter through the shared
//! [`RateLimiterRegistry`], which is constructed once at startup and passed
//! down explicitly.
//!
//! Fairness across waiters on the same broker is best-effort (lock acquisition
//! order), not strict FIFO.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::types::BrokerId;

/// Rate configuration for one broker
///
/// Immutable once handed to a bucket; changing limits means replacing the
/// bucket via [`RateLimiterRegistry::configure_broker`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateConfig {
    requests_per_second: f64,
    burst_capacity: u32,
    window_seconds: f64,
}

impl RateConfig {
    /// Validate and build a configuration. `burst_capacity` defaults to the
    /// rps (rounded up) when not given.
    pub fn new(
        requests_per_second: f64,
        burst_capacity: Option<u32>,
        window_seconds: f64,
    ) -> CoreResult<Self> {
        if !requests_per_second.is_finite() || requests_per_second <= 0.0 {
            return Err(CoreError::Configuration(format!(
                "requests_per_second must be > 0, got {requests_per_second}"
            )));
        }
        if !window_seconds.is_finite() || window_seconds <= 0.0 {
            return Err(CoreError::Configuration(format!(
                "window_seconds must be > 0, got {window_seconds}"
            )));
        }
        let burst_capacity = burst_capacity.unwrap_or(requests_per_second.ceil() as u32);
        if burst_capacity == 0 {
            return Err(CoreError::Configuration(
                "burst_capacity must be >= 1".to_string(),
            ));
        }
        Ok(Self {
            requests_per_second,
            burst_capacity,
            window_seconds,
        })
    }

    /// Infallible constructor for the built-in defaults
    const fn preset(requests_per_second: f64, burst_capacity: u32) -> Self {
        Self {
            requests_per_second,
            burst_capacity,
            window_seconds: 1.0,
        }
    }

    pub fn requests_per_second(&self) -> f64 {
        self.requests_per_second
    }

    pub fn burst_capacity(&self) -> u32 {
        self.burst_capacity
    }

    pub fn window_seconds(&self) -> f64 {
        self.window_seconds
    }

    /// Minimum spacing between two consecutive calls
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.requests_per_second)
    }
}

/// Built-in per-broker defaults
pub fn default_rate_configs() -> HashMap<BrokerId, RateConfig> {
    HashMap::from([
        (BrokerId::new("fyers"), RateConfig::preset(10.0, 15)),
        (BrokerId::new("angel"), RateConfig::preset(5.0, 8)),
        (BrokerId::new("zerodha"), RateConfig::preset(5.0, 5)),
    ])
}

/// Conservative limits for brokers without an explicit configuration
pub const FALLBACK_RATE_CONFIG: RateConfig = RateConfig::preset(3.0, 5);

/// Token bucket: refills continuously at `refill_rate` tokens/s up to `capacity`
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// New buckets start full
    pub fn new(config: &RateConfig) -> Self {
        let capacity = f64::from(config.burst_capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: config.requests_per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Take `requested` tokens if available
    fn try_take(&mut self, requested: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= requested {
            self.tokens -= requested;
            true
        } else {
            false
        }
    }

    /// Time until `requested` tokens will be available
    fn wait_time(&self, requested: f64) -> Duration {
        let missing = (requested - self.tokens).max(0.0);
        Duration::from_secs_f64(missing / self.refill_rate)
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

#[derive(Debug)]
struct LimiterState {
    bucket: TokenBucket,
    call_count: u64,
    /// Earliest instant the next call may start (inter-call spacing)
    next_slot: Instant,
    last_call_time: Option<DateTime<Utc>>,
}

/// Rate limiter for a single broker
#[derive(Debug)]
pub struct BrokerRateLimiter {
    broker_id: BrokerId,
    config: RateConfig,
    state: Mutex<LimiterState>,
    in_flight: Arc<AtomicUsize>,
}

impl BrokerRateLimiter {
    pub fn new(broker_id: BrokerId, config: RateConfig) -> Self {
        Self {
            broker_id,
            state: Mutex::new(LimiterState {
                bucket: TokenBucket::new(&config),
                call_count: 0,
                next_slot: Instant::now(),
                last_call_time: None,
            }),
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn broker_id(&self) -> &BrokerId {
        &self.broker_id
    }

    pub fn config(&self) -> &RateConfig {
        &self.config
    }

    fn check_request(&self, tokens: u32) -> CoreResult<f64> {
        if tokens == 0 || tokens > self.config.burst_capacity {
            return Err(CoreError::Configuration(format!(
                "cannot acquire {} tokens from {} bucket with capacity {}",
                tokens, self.broker_id, self.config.burst_capacity
            )));
        }
        Ok(f64::from(tokens))
    }

    /// Wait until `tokens` are available, consume them, then enforce the
    /// minimum inter-call spacing before returning.
    ///
    /// The returned permit marks the call as in flight until dropped.
    pub async fn acquire(&self, tokens: u32) -> CoreResult<RatePermit> {
        let requested = self.check_request(tokens)?;

        let slot = loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if state.bucket.try_take(requested, now) {
                    state.call_count += 1;
                    state.last_call_time = Some(Utc::now());
                    let slot = state.next_slot.max(now);
                    state.next_slot = slot + self.config.min_interval();
                    debug!(
                        broker = %self.broker_id,
                        tokens,
                        call = state.call_count,
                        "rate limiter acquired tokens"
                    );
                    break slot;
                }
                state.bucket.wait_time(requested)
            };
            debug!(
                broker = %self.broker_id,
                wait_ms = wait.as_millis() as u64,
                tokens,
                "rate limiting: waiting for tokens"
            );
            sleep(wait).await;
        };

        if slot > Instant::now() {
            sleep_until(slot).await;
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(RatePermit {
            broker_id: self.broker_id.clone(),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Non-blocking variant: consume `tokens` if available right now
    pub async fn try_acquire(&self, tokens: u32) -> CoreResult<bool> {
        let requested = self.check_request(tokens)?;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if state.bucket.try_take(requested, now) {
            state.call_count += 1;
            state.last_call_time = Some(Utc::now());
            state.next_slot = state.next_slot.max(now) + self.config.min_interval();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Current token level after refilling
    pub async fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.bucket.refill(Instant::now());
        state.bucket.tokens()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> LimiterStats {
        let mut state = self.state.lock().await;
        state.bucket.refill(Instant::now());
        LimiterStats {
            call_count: state.call_count,
            last_call_time: state.last_call_time,
            current_tokens: state.bucket.tokens(),
            capacity: state.bucket.capacity(),
            refill_rate: state.bucket.refill_rate(),
            in_flight: self.in_flight(),
        }
    }
}

/// Scoped rate budget. Dropping the permit ends the call's in-flight window,
/// on success, error and cancellation alike.
#[derive(Debug)]
pub struct RatePermit {
    broker_id: BrokerId,
    in_flight: Arc<AtomicUsize>,
}

impl RatePermit {
    pub fn broker_id(&self) -> &BrokerId {
        &self.broker_id
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot of a limiter's counters
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub call_count: u64,
    pub last_call_time: Option<DateTime<Utc>>,
    pub current_tokens: f64,
    pub capacity: f64,
    pub refill_rate: f64,
    pub in_flight: usize,
}

/// Single source of truth for broker rate limits
///
/// Construct one per process and share it behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    configs: RwLock<HashMap<BrokerId, RateConfig>>,
    limiters: RwLock<HashMap<BrokerId, Arc<BrokerRateLimiter>>>,
    fallback: RateConfig,
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(default_rate_configs(), FALLBACK_RATE_CONFIG)
    }
}

impl RateLimiterRegistry {
    pub fn new(configs: HashMap<BrokerId, RateConfig>, fallback: RateConfig) -> Self {
        Self {
            configs: RwLock::new(configs),
            limiters: RwLock::new(HashMap::new()),
            fallback,
        }
    }

    /// Set limits for a broker. An existing bucket is discarded so the next
    /// caller gets a fresh one built from the new config.
    pub fn configure_broker(&self, broker: &BrokerId, config: RateConfig) {
        self.configs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(broker.clone(), config);
        self.limiters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(broker);
        info!(
            broker = %broker,
            rps = config.requests_per_second,
            burst = config.burst_capacity,
            "configured rate limits"
        );
    }

    /// Effective config for a broker (explicit or fallback)
    pub fn config_for(&self, broker: &BrokerId) -> RateConfig {
        self.configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(broker)
            .copied()
            .unwrap_or(self.fallback)
    }

    /// All explicitly configured brokers, sorted by id
    pub fn configured(&self) -> Vec<(BrokerId, RateConfig)> {
        let mut out: Vec<_> = self
            .configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn fallback(&self) -> RateConfig {
        self.fallback
    }

    /// Get or lazily create the limiter for a broker
    pub fn limiter(&self, broker: &BrokerId) -> Arc<BrokerRateLimiter> {
        if let Some(limiter) = self
            .limiters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(broker)
        {
            return Arc::clone(limiter);
        }

        let config = self.config_for(broker);
        let mut limiters = self.limiters.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(limiters.entry(broker.clone()).or_insert_with(|| {
            info!(
                broker = %broker,
                rps = config.requests_per_second,
                burst = config.burst_capacity,
                "created rate limiter"
            );
            Arc::new(BrokerRateLimiter::new(broker.clone(), config))
        }))
    }

    pub async fn acquire(&self, broker: &BrokerId, tokens: u32) -> CoreResult<RatePermit> {
        self.limiter(broker).acquire(tokens).await
    }

    pub async fn try_acquire(&self, broker: &BrokerId, tokens: u32) -> CoreResult<bool> {
        self.limiter(broker).try_acquire(tokens).await
    }

    /// Counters for every limiter created so far
    pub async fn stats(&self) -> HashMap<BrokerId, LimiterStats> {
        let limiters: Vec<_> = self
            .limiters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut out = HashMap::with_capacity(limiters.len());
        for limiter in limiters {
            out.insert(limiter.broker_id().clone(), limiter.stats().await);
        }
        out
    }
}
