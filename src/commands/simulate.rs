//! Simulate command implementation
//!
//! Drives one bracket order through its whole life against the paper
//! broker: placement, entry fill, target fill with the stoploss leg
//! cancelled, then a reconciliation pass. Uses an in-memory ledger so the
//! configured database is never touched.

use anyhow::{Context, Result};
use broker_sync::broker::{normalize_order_id, OrderRequest, BRACKET_PRODUCT};
use broker_sync::ledger::{classify_leg, BracketLeg, NewExecution};
use broker_sync::{
    BrokerAdapter, BrokerId, Config, LogicalOrderStatus, Money, OrderMonitor, OrderStatus,
    PaperBroker, ProcessContext, SqliteLedger, TradeDirection,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::info;

pub fn run(config_path: String, broker: String, symbol: String, quantity: i64) -> Result<()> {
    let config = Config::load_or_default(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config, BrokerId::new(&broker), symbol, quantity))
}

async fn step(ctx: &ProcessContext, monitor: &OrderMonitor, broker: &BrokerId, label: &str) -> Result<LogicalOrderStatus> {
    let orders = ctx.cache().refresh(broker).await?;
    let status = monitor.check_once().await?;
    info!(orders, status = %status, "{}", label);
    println!("{:<28} {}", label, status);
    Ok(status)
}

async fn run_async(config: Config, broker: BrokerId, symbol: String, quantity: i64) -> Result<()> {
    let entry_price = Money::from_decimal(dec!(115.50));
    let stoploss = Money::from_decimal(dec!(113.00));
    let target = Money::from_decimal(dec!(116.85));

    let paper = Arc::new(PaperBroker::new(broker.clone()));
    paper.set_last_price(&symbol, entry_price);
    let adapter: Arc<dyn BrokerAdapter> = paper.clone();
    let ctx = ProcessContext::build(config, SqliteLedger::open_in_memory()?, vec![adapter])?;
    let gateway = ctx.gateway(&broker)?;
    let ledger = ctx.ledger();

    println!("\n{}", "=".repeat(60));
    println!("BRACKET SIMULATION ({broker} {symbol} x{quantity})");
    println!("{}", "=".repeat(60));

    let logical_order_id = ledger.create_logical_order(&symbol, Some("simulate"))?;
    let request = OrderRequest::market(&symbol, TradeDirection::Buy, quantity).bracket(stoploss, target);
    let ack = gateway.place_order(&request).await?;
    ledger.insert(
        &NewExecution::entry(
            logical_order_id,
            broker.clone(),
            TradeDirection::Buy,
            &symbol,
            quantity,
            ack.order_id.clone(),
        )
        .with_order_type(request.order_type.clone())
        .with_product_type(BRACKET_PRODUCT),
    )?;
    let entry_id = normalize_order_id(&broker, &ack.order_id, Some(BRACKET_PRODUCT)).into_owned();
    println!("{:<28} {} (entry leg {})", "Broker ack", ack.order_id, entry_id);

    let monitor = ctx.monitor(logical_order_id);
    step(&ctx, &monitor, &broker, "Placed").await?;

    paper.fill(&entry_id, quantity, entry_price);
    step(&ctx, &monitor, &broker, "Entry filled").await?;

    // Target fills, the broker cancels the stoploss sibling
    for leg in paper.orders() {
        match classify_leg(&leg, &entry_id) {
            Some(BracketLeg::Target) => {
                paper.fill(&leg.order_id, quantity, target);
            }
            Some(BracketLeg::Stoploss) => {
                paper.set_status(&leg.order_id, OrderStatus::Cancelled);
            }
            _ => {}
        }
    }
    let status = step(&ctx, &monitor, &broker, "Target filled").await?;

    let report = ctx.reconciler().reconcile(logical_order_id).await?;
    let summary = ledger.summary(logical_order_id)?;
    let price = |p: Option<Money>| p.map(|m| m.round_dp(2).to_string()).unwrap_or_else(|| "-".into());

    println!("{}", "-".repeat(60));
    println!("Final status:       {}", status);
    println!("Entry VWAP:         {}", price(summary.entry_vwap));
    println!("Exit VWAP:          {}", price(summary.exit_vwap));
    println!("Realized P&L:       {}", price(summary.realized_pnl));
    println!("Reconcile action:   {:?} (writes: {})", report.action, report.writes());
    println!("Broker calls:       {}", paper.call_count("get_order_details") + paper.call_count("place_order"));
    println!("{}", "=".repeat(60));

    ctx.shutdown().await;
    Ok(())
}
