//! Configuration management
//!
//! Handles loading and parsing of the JSON configuration file. Every section
//! is optional and falls back to built-in defaults. Values are validated when
//! they are turned into runtime objects, before anything talks to a broker.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::broker::{GatewayPolicies, StatusTranslator};
use crate::common::{default_rate_configs, CircuitBreakerConfig, RateConfig, RetryPolicy};
use crate::error::{CoreError, CoreResult};
use crate::types::BrokerId;

/// Environment variable that overrides `ledger.db_path`
pub const LEDGER_DB_ENV: &str = "BROKER_SYNC_LEDGER_DB";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Per-broker limits, merged over the built-in defaults
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitEntry>,
    /// Limits for brokers with no entry of their own
    #[serde(default)]
    pub fallback_rate_limit: Option<RateLimitEntry>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Overrides keyed by preset name (`critical`, `data_fetch`, ...)
    #[serde(default)]
    pub retry: HashMap<String, RetryOverride>,
    #[serde(default, skip_serializing)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Extra status code translations: broker -> code -> canonical status
    #[serde(default)]
    pub status_overrides: HashMap<String, HashMap<String, String>>,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env();
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Config file when it exists, defaults otherwise
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::from_file(path);
        }
        debug!(path = %path.as_ref().display(), "config file not found, using defaults");
        let mut config = Config::default();
        config.apply_env();
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(db_path) = std::env::var(LEDGER_DB_ENV) {
            if !db_path.trim().is_empty() {
                self.ledger.db_path = PathBuf::from(db_path);
            }
        }
    }

    /// Check every section without building anything long-lived
    pub fn validate(&self) -> CoreResult<()> {
        self.rate_configs()?;
        self.fallback_rate()?;
        self.translator()?;
        if self.cache.refresh_interval_secs == 0 {
            return Err(CoreError::Configuration(
                "cache.refresh_interval_secs must be > 0".to_string(),
            ));
        }
        if self.health.check_interval_secs == 0 {
            return Err(CoreError::Configuration(
                "health.check_interval_secs must be > 0".to_string(),
            ));
        }
        if self.monitor.poll_interval_secs == 0 {
            return Err(CoreError::Configuration(
                "monitor.poll_interval_secs must be > 0".to_string(),
            ));
        }
        for (name, over) in &self.retry {
            if over.max_attempts == Some(0) {
                return Err(CoreError::Configuration(format!(
                    "retry.{name}.max_attempts must be >= 1"
                )));
            }
        }
        Ok(())
    }

    /// Built-in defaults with the configured entries layered on top
    pub fn rate_configs(&self) -> CoreResult<HashMap<BrokerId, RateConfig>> {
        let mut configs = default_rate_configs();
        for (broker, entry) in &self.rate_limits {
            let config = entry.to_rate_config().map_err(|e| {
                CoreError::Configuration(format!("rate_limits.{broker}: {e}"))
            })?;
            configs.insert(BrokerId::new(broker), config);
        }
        Ok(configs)
    }

    pub fn fallback_rate(&self) -> CoreResult<RateConfig> {
        match &self.fallback_rate_limit {
            Some(entry) => entry.to_rate_config(),
            None => Ok(crate::common::FALLBACK_RATE_CONFIG),
        }
    }

    /// Built-in status tables plus `status_overrides`
    pub fn translator(&self) -> CoreResult<StatusTranslator> {
        let mut translator = StatusTranslator::with_defaults()?;
        for (broker, table) in &self.status_overrides {
            translator.load_table(
                &BrokerId::new(broker),
                table.iter().map(|(code, status)| (code.as_str(), status.as_str())),
            )?;
        }
        Ok(translator)
    }

    /// Gateway presets for `broker` with any configured overrides applied
    pub fn gateway_policies(&self, broker: &BrokerId) -> GatewayPolicies {
        let mut policies = GatewayPolicies::for_broker(broker);
        if let Some(over) = self.retry.get("critical") {
            policies.critical = over.apply(policies.critical);
        }
        if let Some(over) = self.retry.get("data_fetch") {
            policies.data_fetch = over.apply(policies.data_fetch);
        }
        policies
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.cache.refresh_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.poll_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health.check_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub requests_per_second: f64,
    #[serde(default)]
    pub burst_capacity: Option<u32>,
    #[serde(default = "default_window")]
    pub window_seconds: f64,
}

fn default_window() -> f64 {
    1.0
}

impl RateLimitEntry {
    pub fn to_rate_config(&self) -> CoreResult<RateConfig> {
        RateConfig::new(self.requests_per_second, self.burst_capacity, self.window_seconds)
    }
}

/// Order snapshot cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub refresh_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            refresh_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            poll_interval_secs: 5,
        }
    }
}

/// Broker connectivity checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        HealthConfig {
            check_interval_secs: 300,
        }
    }
}

/// Execution ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub db_path: PathBuf,
    /// Terminal logical orders older than this are removed by `cleanup`
    pub retention_days: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            db_path: PathBuf::from("state/execution_ledger.db"),
            retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverride {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub initial_delay_ms: Option<u64>,
    #[serde(default)]
    pub jitter: Option<bool>,
}

impl RetryOverride {
    pub fn apply(&self, mut policy: RetryPolicy) -> RetryPolicy {
        if let Some(n) = self.max_attempts {
            policy = policy.with_max_attempts(n);
        }
        if let Some(ms) = self.initial_delay_ms {
            policy = policy.with_initial_delay(Duration::from_millis(ms));
        }
        if let Some(jitter) = self.jitter {
            policy = policy.with_jitter(jitter);
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.cache.refresh_interval_secs, 60);
        assert_eq!(config.monitor.poll_interval_secs, 5);
        assert_eq!(config.ledger.retention_days, 90);
        assert_eq!(config.health_interval(), Duration::from_secs(300));
        assert!(config.validate().is_ok());

        let bad: Config = serde_json::from_str(r#"{ "health": { "check_interval_secs": 0 } }"#).unwrap();
        assert!(bad.validate().is_err());

        let rates = config.rate_configs().unwrap();
        assert_eq!(rates[&BrokerId::new("fyers")].burst_capacity(), 15);
        assert_eq!(config.fallback_rate().unwrap().burst_capacity(), 5);
    }

    #[test]
    fn test_rate_limits_merge_over_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "rate_limits": {
                    "Zerodha": { "requests_per_second": 3, "burst_capacity": 3 },
                    "dhan": { "requests_per_second": 2.5 }
                }
            }"#,
        )
        .unwrap();
        let rates = config.rate_configs().unwrap();
        assert_eq!(rates[&BrokerId::new("zerodha")].burst_capacity(), 3);
        assert_eq!(rates[&BrokerId::new("dhan")].burst_capacity(), 3);
        assert_eq!(rates[&BrokerId::new("angel")].burst_capacity(), 8);
    }

    #[test]
    fn test_invalid_rate_rejected() {
        let config: Config = serde_json::from_str(
            r#"{ "rate_limits": { "fyers": { "requests_per_second": 0 } } }"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(CoreError::Configuration(_))));

        let config: Config = serde_json::from_str(
            r#"{ "rate_limits": { "fyers": { "requests_per_second": 5, "window_seconds": -1 } } }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_status_overrides_validated() {
        let config: Config = serde_json::from_str(
            r#"{ "status_overrides": { "dhan": { "TRADED": "FILLED" } } }"#,
        )
        .unwrap();
        assert!(config.translator().is_ok());

        let config: Config = serde_json::from_str(
            r#"{ "status_overrides": { "dhan": { "TRADED": "DONE" } } }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_overrides() {
        let config: Config = serde_json::from_str(
            r#"{ "retry": { "critical": { "max_attempts": 2, "jitter": false } } }"#,
        )
        .unwrap();
        let policies = config.gateway_policies(&BrokerId::new("fyers"));
        assert_eq!(policies.critical.max_attempts(), 2);
        assert_eq!(policies.data_fetch.max_attempts(), 3);

        let bad: Config =
            serde_json::from_str(r#"{ "retry": { "critical": { "max_attempts": 0 } } }"#).unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_circuit_breaker_section() {
        let config: Config = serde_json::from_str(
            r#"{ "circuit_breaker": { "failure_threshold": 3, "open_timeout_secs": 30 } }"#,
        )
        .unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.success_threshold, 2);
        assert_eq!(config.circuit_breaker.open_timeout, Duration::from_secs(30));
    }
}
