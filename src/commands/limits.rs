//! Limits command implementation

use anyhow::Result;
use broker_sync::common::{RateConfig, RateLimiterRegistry};
use broker_sync::Config;
use tracing::info;

fn print_row(broker: &str, config: &RateConfig, attempts: Option<(u32, u32)>) {
    let attempts = match attempts {
        Some((critical, data_fetch)) => format!("{critical}/{data_fetch}"),
        None => "-".to_string(),
    };
    println!(
        "{:<12} {:>8.2} {:>6} {:>8.2} {:>12} {:>8}",
        broker,
        config.requests_per_second(),
        config.burst_capacity(),
        config.window_seconds(),
        format!("{}ms", config.min_interval().as_millis()),
        attempts,
    );
}

pub fn run(config_path: String) -> Result<()> {
    let config = Config::load_or_default(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    let registry = RateLimiterRegistry::new(config.rate_configs()?, config.fallback_rate()?);

    println!("\n{}", "=".repeat(64));
    println!("EFFECTIVE RATE LIMITS");
    println!("{}", "=".repeat(64));
    println!(
        "{:<12} {:>8} {:>6} {:>8} {:>12} {:>8}",
        "Broker", "Req/s", "Burst", "Window", "Spacing", "Retries"
    );
    for (broker, rate) in registry.configured() {
        let policies = config.gateway_policies(&broker);
        print_row(
            broker.as_str(),
            &rate,
            Some((policies.critical.max_attempts(), policies.data_fetch.max_attempts())),
        );
    }
    let fallback = registry.fallback();
    print_row("(fallback)", &fallback, None);
    println!("{}", "=".repeat(64));
    println!(
        "Snapshot refresh: {}s   Monitor poll: {}s   Ledger: {}",
        config.cache.refresh_interval_secs,
        config.monitor.poll_interval_secs,
        config.ledger.db_path.display()
    );

    Ok(())
}
