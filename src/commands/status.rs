//! Status command implementation

use anyhow::{Context, Result};
use broker_sync::ledger::{ExecutionRecord, ExecutionSide};
use broker_sync::{Config, SqliteLedger};
use serde_json::json;
use tracing::info;

pub fn run(config_path: String, logical_order_id: i64, as_json: bool) -> Result<()> {
    let config = Config::load_or_default(&config_path)?;
    let ledger = SqliteLedger::open(&config.ledger.db_path)
        .with_context(|| format!("Failed to open ledger {}", config.ledger.db_path.display()))?;
    info!("Opened ledger: {}", config.ledger.db_path.display());

    let records = ledger.records_for(logical_order_id)?;
    let summary = ledger.summary(logical_order_id)?;

    if as_json {
        let out = json!({ "summary": summary, "records": records });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let price = |p: Option<broker_sync::Money>| p.map(|m| m.round_dp(2).to_string()).unwrap_or_else(|| "-".into());

    println!("\n{}", "=".repeat(60));
    println!("LOGICAL ORDER {}", logical_order_id);
    println!("{}", "=".repeat(60));
    println!("Status:             {}", summary.status);
    println!("Entry filled:       {}", summary.entry_filled);
    println!("Exit filled:        {}", summary.exit_filled);
    println!("Open quantity:      {}", summary.open_quantity());
    println!("Entry VWAP:         {}", price(summary.entry_vwap));
    println!("Exit VWAP:          {}", price(summary.exit_vwap));
    println!("Realized P&L:       {}", price(summary.realized_pnl));
    println!("{}", "-".repeat(60));

    if records.is_empty() {
        println!("No execution records");
    }
    for r in &records {
        let kind = record_kind(r);
        println!(
            "#{:<5} {:<8} {:<15} {:<4} {:<18} {:>5}/{:<5} @ {:<10} {}",
            r.id,
            r.broker_id,
            kind,
            r.direction.as_str(),
            r.status.as_str(),
            r.executed_quantity,
            r.quantity,
            price(r.execution_price),
            r.broker_order_id.as_deref().unwrap_or("-"),
        );
    }
    println!("{}", "=".repeat(60));

    Ok(())
}

/// Side label, with the exit reason for EXIT rows
fn record_kind(record: &ExecutionRecord) -> String {
    match (record.side, record.exit_kind) {
        (ExecutionSide::Exit, Some(kind)) => format!("EXIT/{}", kind.as_str()),
        (side, _) => side.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_sync::ledger::{ExitKind, NewExecution};
    use broker_sync::{BrokerId, Money, TradeDirection};

    #[test]
    fn test_manual_exit_label() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let logical = ledger.create_logical_order("INFY", None).unwrap();
        let entry = NewExecution::entry(logical, BrokerId::new("zerodha"), TradeDirection::Buy, "INFY", 10, "Z-1")
            .filled(10, Money::from_i64(1500));
        let entry_id = ledger.insert(&entry).unwrap();
        let entry = ledger.record(entry_id).unwrap().unwrap();
        let exit = NewExecution::exit(&entry, "Z-2", 10, ExitKind::Manual)
            .filled(10, Money::from_i64(1510))
            .with_note("closed by operator");
        ledger.insert(&exit).unwrap();

        let labels: Vec<String> = ledger.records_for(logical).unwrap().iter().map(record_kind).collect();
        assert_eq!(labels, vec!["ENTRY".to_string(), "EXIT/MANUAL".to_string()]);
    }
}
