//! Cleanup command implementation

use anyhow::{Context, Result};
use broker_sync::{Config, SqliteLedger};
use tracing::info;

pub fn run(config_path: String, days_override: Option<u32>, backup: Option<String>) -> Result<()> {
    let config = Config::load_or_default(&config_path)?;
    let ledger = SqliteLedger::open(&config.ledger.db_path)
        .with_context(|| format!("Failed to open ledger {}", config.ledger.db_path.display()))?;

    let retention_days = match days_override {
        Some(days) => {
            info!("Overriding retention to: {} days", days);
            days
        }
        None => config.ledger.retention_days,
    };

    if let Some(path) = backup {
        let exported = ledger
            .export_json(&path)
            .with_context(|| format!("Failed to back up ledger to {path}"))?;
        info!("Backed up {} records to: {}", exported, path);
    }

    let report = ledger.cleanup(retention_days)?;

    println!("\n{}", "=".repeat(60));
    println!("LEDGER CLEANUP");
    println!("{}", "=".repeat(60));
    println!("Retention:          {} days", retention_days);
    println!("Logical orders:     {}", report.logical_orders);
    println!("Records removed:    {}", report.records);
    println!("{}", "=".repeat(60));

    Ok(())
}
