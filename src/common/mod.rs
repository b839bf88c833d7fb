//! Resilience building blocks shared by every broker integration
//!
//! - Token-bucket rate limiting per broker
//! - Retry with exponential backoff and jitter
//! - Circuit breaker for broker outages

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::{
    default_rate_configs, BrokerRateLimiter, LimiterStats, RateConfig, RateLimiterRegistry,
    RatePermit, TokenBucket, FALLBACK_RATE_CONFIG,
};
pub use retry::{RetryOrchestrator, RetryPolicy, RetryStats};
