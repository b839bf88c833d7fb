//! Integration tests for the broker-sync execution core
//!
//! These tests drive the public API across modules: gateways over the paper
//! broker, the snapshot cache, the execution ledger, the order monitor and
//! the reconciliation engine.

use approx::assert_relative_eq;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use broker_sync::broker::{normalize_order_id, OrderRequest, BRACKET_PRODUCT};
use broker_sync::ledger::{classify_leg, BracketLeg, ExecutionSide, ExitKind, NewExecution};
use broker_sync::{
    BrokerAdapter, BrokerError, BrokerId, Config, Connectivity, LogicalOrderStatus, Money,
    OrderStatus, PaperBroker, ProcessContext, ReconcileAction, SqliteLedger, TradeDirection,
};

// =============================================================================
// Test Utilities
// =============================================================================

fn money(d: rust_decimal::Decimal) -> Money {
    Money::from_decimal(d)
}

fn setup(broker: &str, config: Config) -> (Arc<PaperBroker>, ProcessContext) {
    let paper = Arc::new(PaperBroker::new(broker));
    let adapter: Arc<dyn BrokerAdapter> = paper.clone();
    let ctx = ProcessContext::build(config, SqliteLedger::open_in_memory().unwrap(), vec![adapter])
        .unwrap();
    (paper, ctx)
}

/// Place an order through the gateway and record it as a pending ENTRY.
/// Returns (logical order id, broker entry order id).
async fn place_entry(
    ctx: &ProcessContext,
    broker: &str,
    request: OrderRequest,
) -> (i64, String) {
    let broker = BrokerId::new(broker);
    let gateway = ctx.gateway(&broker).unwrap();
    let ack = gateway.place_order(&request).await.unwrap();

    let logical = ctx
        .ledger()
        .create_logical_order(&request.symbol, Some("integration"))
        .unwrap();
    let mut entry = NewExecution::entry(
        logical,
        broker.clone(),
        request.direction,
        request.symbol.clone(),
        request.quantity,
        ack.order_id.clone(),
    )
    .with_order_type(request.order_type.clone());
    if request.product_type == BRACKET_PRODUCT {
        entry = entry.with_product_type(BRACKET_PRODUCT);
    }
    ctx.ledger().insert(&entry).unwrap();

    let entry_id =
        normalize_order_id(&broker, &ack.order_id, Some(request.product_type.as_str())).into_owned();
    (logical, entry_id)
}

/// Fill the target leg of a bracket and cancel the stoploss leg
fn fill_target(paper: &PaperBroker, entry_id: &str, quantity: i64, price: Money) {
    for leg in paper.orders() {
        match classify_leg(&leg, entry_id) {
            Some(BracketLeg::Target) => {
                paper.fill(&leg.order_id, quantity, price);
            }
            Some(BracketLeg::Stoploss) => {
                paper.set_status(&leg.order_id, OrderStatus::Cancelled);
            }
            _ => {}
        }
    }
}

// =============================================================================
// Bracket Lifecycle
// =============================================================================

#[tokio::test]
async fn test_bracket_target_fill_closes_order() {
    let (paper, ctx) = setup("fyers", Config::default());
    let fyers = BrokerId::new("fyers");

    let request = OrderRequest::market("NIFTY24OCTFUT", TradeDirection::Buy, 75)
        .bracket(money(dec!(113.00)), money(dec!(116.85)));
    let (logical, entry_id) = place_entry(&ctx, "fyers", request).await;
    assert!(entry_id.ends_with("-BO-1"));

    let monitor = ctx.monitor(logical);
    ctx.cache().refresh(&fyers).await.unwrap();
    assert_eq!(monitor.check_once().await.unwrap(), LogicalOrderStatus::Pending);

    paper.fill(&entry_id, 75, money(dec!(115.50)));
    ctx.cache().refresh(&fyers).await.unwrap();
    assert_eq!(monitor.check_once().await.unwrap(), LogicalOrderStatus::Open);

    fill_target(&paper, &entry_id, 75, money(dec!(116.85)));
    ctx.cache().refresh(&fyers).await.unwrap();
    assert_eq!(monitor.check_once().await.unwrap(), LogicalOrderStatus::Closed);

    let records = ctx.ledger().records_for(logical).unwrap();
    assert_eq!(records.len(), 2);
    let exit = records.iter().find(|r| r.side == ExecutionSide::Exit).unwrap();
    assert_eq!(exit.exit_kind, Some(ExitKind::Target));
    assert_eq!(exit.direction, TradeDirection::Sell);
    assert_eq!(exit.executed_quantity, 75);

    let summary = ctx.ledger().summary(logical).unwrap();
    assert_eq!(summary.exit_vwap, Some(money(dec!(116.85))));
    assert_eq!(summary.realized_pnl, Some(money(dec!(101.25))));
    assert_relative_eq!(summary.realized_pnl.unwrap().to_f64(), 101.25, epsilon = 1e-9);

    // Nothing left to do, and checking again writes nothing
    let writes = ctx.ledger().writes();
    let report = ctx.reconciler().reconcile(logical).await.unwrap();
    assert_eq!(report.status, LogicalOrderStatus::Closed);
    assert_eq!(report.action, ReconcileAction::None);
    assert_eq!(report.writes(), 0);
    assert_eq!(monitor.check_once().await.unwrap(), LogicalOrderStatus::Closed);
    assert_eq!(ctx.ledger().writes(), writes);
}

#[tokio::test]
async fn test_monitor_stops_at_terminal_status() {
    let (paper, ctx) = setup("zerodha", Config::default());
    let zerodha = BrokerId::new("zerodha");

    let request = OrderRequest::market("BANKNIFTY", TradeDirection::Sell, 30)
        .bracket(money(dec!(52300)), money(dec!(51900)));
    let (logical, entry_id) = place_entry(&ctx, "zerodha", request).await;
    paper.fill(&entry_id, 30, money(dec!(52100)));
    fill_target(&paper, &entry_id, 30, money(dec!(51900)));
    ctx.cache().refresh(&zerodha).await.unwrap();

    let status = tokio::time::timeout(
        Duration::from_secs(5),
        ctx.monitor(logical).run(ctx.shutdown_signal()),
    )
    .await
    .unwrap();
    assert_eq!(status, LogicalOrderStatus::Closed);

    // Short entry: (51900 - 52100) * -1 * 30
    let summary = ctx.ledger().summary(logical).unwrap();
    assert_eq!(summary.realized_pnl, Some(money(dec!(6000))));
}

#[tokio::test(start_paused = true)]
async fn test_spawned_monitor_stops_on_shutdown() {
    let (_paper, ctx) = setup("angel", Config::default());
    let request = OrderRequest::market("RELIANCE", TradeDirection::Buy, 10);
    let (logical, _) = place_entry(&ctx, "angel", request).await;

    ctx.start();
    ctx.spawn_monitor(logical);
    tokio::time::sleep(Duration::from_secs(12)).await;

    tokio::time::timeout(Duration::from_secs(30), ctx.shutdown())
        .await
        .expect("shutdown should not hang");
    let summary = ctx.ledger().summary(logical).unwrap();
    assert_eq!(summary.status, LogicalOrderStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_finished_monitors_are_released() {
    let (paper, ctx) = setup("zerodha", Config::default());
    let zerodha = BrokerId::new("zerodha");

    let request = OrderRequest::market("BANKNIFTY", TradeDirection::Buy, 30)
        .bracket(money(dec!(51900)), money(dec!(52300)));
    let (closed, entry_id) = place_entry(&ctx, "zerodha", request).await;
    paper.fill(&entry_id, 30, money(dec!(52100)));
    fill_target(&paper, &entry_id, 30, money(dec!(52300)));
    ctx.cache().refresh(&zerodha).await.unwrap();

    ctx.spawn_monitor(closed);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ctx.active_monitors(), 0);

    let (pending, _) = place_entry(&ctx, "zerodha", OrderRequest::market("SBIN", TradeDirection::Buy, 10)).await;
    ctx.spawn_monitor(pending);
    ctx.spawn_monitor(pending);
    assert_eq!(ctx.active_monitors(), 2);

    ctx.shutdown().await;
    assert_eq!(ctx.active_monitors(), 0);
}

// =============================================================================
// Broker Health
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_health_loop_survives_failed_checks() {
    let mut config = Config::default();
    config.cache.refresh_interval_secs = 3600;
    config.health.check_interval_secs = 10;
    let (paper, ctx) = setup("angel", config);
    let angel = BrokerId::new("angel");

    assert_eq!(ctx.health().connectivity(&angel), Connectivity::Unknown);
    ctx.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ctx.health().connectivity(&angel), Connectivity::Connected);

    // Next check at ~10s spends all three data_fetch attempts
    for _ in 0..3 {
        paper.fail_next(BrokerError::network("angel", "connection reset"));
    }
    tokio::time::sleep(Duration::from_secs(16)).await;
    let status = ctx.health().status(&angel);
    assert_eq!(status.state, Connectivity::Disconnected);
    assert!(status.note.unwrap().contains("connection reset"));

    tokio::time::sleep(Duration::from_secs(12)).await;
    let status = ctx.health().status(&angel);
    assert_eq!(status.state, Connectivity::Connected);
    assert!(status.checks >= 3);
    assert_eq!(paper.call_count("get_profile"), 5);

    tokio::time::timeout(Duration::from_secs(30), ctx.shutdown())
        .await
        .expect("shutdown should not hang");
    let checks = ctx.health().status(&angel).checks;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(ctx.health().status(&angel).checks, checks);
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn test_reconcile_fill_recommends_exit_and_is_idempotent() {
    let (paper, ctx) = setup("zerodha", Config::default());
    let request = OrderRequest::market("INFY", TradeDirection::Buy, 10);
    let (logical, order_id) = place_entry(&ctx, "zerodha", request).await;

    paper.fill(&order_id, 10, money(dec!(1500.25)));
    let engine = ctx.reconciler();

    let report = engine.reconcile(logical).await.unwrap();
    assert_eq!(report.status, LogicalOrderStatus::Open);
    assert_eq!(report.action, ReconcileAction::Exit);
    assert!(!report.ambiguous);
    assert_eq!(report.discrepancies.len(), 1);
    let d = &report.discrepancies[0];
    assert_eq!(d.local_status, OrderStatus::Pending);
    assert_eq!(d.live_status, OrderStatus::Filled);
    assert!(d.applied);
    assert_eq!(report.writes(), 1);

    // Live state now equals local state: no writes
    let writes = ctx.ledger().writes();
    let again = engine.reconcile(logical).await.unwrap();
    assert_eq!(again.writes(), 0);
    assert_eq!(again.action, ReconcileAction::Exit);
    assert_eq!(ctx.ledger().writes(), writes);

    // Carry out the exit, then the next pass sees it filled
    paper.set_last_price("INFY", money(dec!(1510.25)));
    let acks = engine.execute(&again).await.unwrap();
    assert_eq!(acks.len(), 1);
    assert_eq!(paper.call_count("exit_order"), 1);

    let closed = engine.reconcile(logical).await.unwrap();
    assert_eq!(closed.status, LogicalOrderStatus::Closed);
    assert_eq!(closed.action, ReconcileAction::None);
    let summary = ctx.ledger().summary(logical).unwrap();
    assert_eq!(summary.realized_pnl, Some(money(dec!(100))));
}

#[tokio::test]
async fn test_reconcile_working_exit_is_not_placed_twice() {
    let (paper, ctx) = setup("zerodha", Config::default());
    let request = OrderRequest::market("INFY", TradeDirection::Buy, 10);
    let (logical, order_id) = place_entry(&ctx, "zerodha", request).await;
    paper.fill(&order_id, 10, money(dec!(1500.25)));
    let engine = ctx.reconciler();

    let report = engine.reconcile(logical).await.unwrap();
    assert_eq!(report.action, ReconcileAction::Exit);
    let acks = engine.execute(&report).await.unwrap();
    assert_eq!(acks.len(), 1);
    let exit_id = acks[0].order_id.clone();

    // Broker accepted the exit but has not filled it yet
    let mut working = paper.order(&exit_id).unwrap();
    working.filled_quantity = 0;
    working.average_price = None;
    paper.upsert_order(working);
    paper.set_status(&exit_id, OrderStatus::Pending);

    let again = engine.reconcile(logical).await.unwrap();
    assert_eq!(again.status, LogicalOrderStatus::Open);
    assert!(again.exit_in_flight);
    assert!(!again.ambiguous);
    assert_eq!(again.action, ReconcileAction::None);
    assert!(engine.execute(&again).await.unwrap().is_empty());

    // An out-of-date report asking for an exit places nothing either
    assert!(engine.execute(&report).await.unwrap().is_empty());
    assert_eq!(paper.call_count("exit_order"), 1);

    paper.fill(&exit_id, 10, money(dec!(1505.25)));
    let closed = engine.reconcile(logical).await.unwrap();
    assert_eq!(closed.status, LogicalOrderStatus::Closed);
    assert!(!closed.exit_in_flight);
    let summary = ctx.ledger().summary(logical).unwrap();
    assert_eq!(summary.exit_filled, 10);
    assert_eq!(summary.realized_pnl, Some(money(dec!(50))));
}

#[tokio::test]
async fn test_reconcile_unfilled_entry_recommends_cancel() {
    let (paper, ctx) = setup("angel", Config::default());
    let request = OrderRequest::market("TCS", TradeDirection::Buy, 5);
    let (logical, order_id) = place_entry(&ctx, "angel", request).await;
    let engine = ctx.reconciler();

    let report = engine.reconcile(logical).await.unwrap();
    assert_eq!(report.status, LogicalOrderStatus::Pending);
    assert_eq!(report.action, ReconcileAction::Cancel);
    assert_eq!(report.writes(), 0);

    engine.execute(&report).await.unwrap();
    assert_eq!(paper.call_count("cancel_order"), 1);
    let order = paper.order(&order_id).unwrap();
    assert_eq!(order.status.to_string(), "CANCELLED");

    let after = engine.reconcile(logical).await.unwrap();
    assert_eq!(after.status, LogicalOrderStatus::Cancelled);
    assert_eq!(after.action, ReconcileAction::None);
    assert_eq!(after.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_adapter_failures_recommend_nothing() {
    let (paper, ctx) = setup("zerodha", Config::default());
    let request = OrderRequest::market("SBIN", TradeDirection::Buy, 100);
    let (logical, order_id) = place_entry(&ctx, "zerodha", request).await;
    paper.fill(&order_id, 100, money(dec!(820)));

    for _ in 0..3 {
        paper.fail_next(BrokerError::network("zerodha", "connection reset"));
    }
    let writes = ctx.ledger().writes();
    let report = ctx.reconciler().reconcile(logical).await.unwrap();
    assert!(report.ambiguous);
    assert_eq!(report.action, ReconcileAction::None);
    assert_eq!(report.status, LogicalOrderStatus::Pending);
    assert_eq!(ctx.ledger().writes(), writes);
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_stale_snapshot_is_ambiguous() {
    let (paper, ctx) = setup("zerodha", Config::default());
    let zerodha = BrokerId::new("zerodha");
    let request = OrderRequest::market("SBIN", TradeDirection::Buy, 100);
    let (logical, order_id) = place_entry(&ctx, "zerodha", request).await;
    paper.fill(&order_id, 100, money(dec!(820)));
    ctx.cache().refresh(&zerodha).await.unwrap();

    for _ in 0..3 {
        paper.fail_next(BrokerError::timeout("zerodha", "gateway timeout"));
    }
    let report = ctx.reconciler().reconcile(logical).await.unwrap();
    assert!(report.ambiguous);
    assert_eq!(report.action, ReconcileAction::None);
    assert!(report.discrepancies.is_empty());
}

#[tokio::test]
async fn test_reconcile_missing_order_is_ambiguous() {
    let (_paper, ctx) = setup("angel", Config::default());
    let angel = BrokerId::new("angel");
    let logical = ctx.ledger().create_logical_order("HDFCBANK", None).unwrap();
    ctx.ledger()
        .insert(&NewExecution::entry(
            logical,
            angel,
            TradeDirection::Buy,
            "HDFCBANK",
            20,
            "GHOST-1",
        ))
        .unwrap();

    let report = ctx.reconciler().reconcile(logical).await.unwrap();
    assert!(report.ambiguous);
    assert_eq!(report.action, ReconcileAction::None);
}

#[tokio::test]
async fn test_reconcile_open_covers_every_live_order() {
    let (paper, ctx) = setup("zerodha", Config::default());
    let (filled, filled_id) =
        place_entry(&ctx, "zerodha", OrderRequest::market("ITC", TradeDirection::Buy, 1)).await;
    let (pending, _) =
        place_entry(&ctx, "zerodha", OrderRequest::market("ITC", TradeDirection::Buy, 1)).await;
    paper.fill(&filled_id, 1, money(dec!(450)));

    let reports = ctx.reconciler().reconcile_open().await.unwrap();
    assert_eq!(reports.len(), 2);
    let action = |id: i64| reports.iter().find(|r| r.logical_order_id == id).unwrap().action;
    assert_eq!(action(filled), ReconcileAction::Exit);
    assert_eq!(action(pending), ReconcileAction::Cancel);
}

// =============================================================================
// Rate Limiting
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_gateway_calls_respect_shared_rate_limit() {
    let config: Config = serde_json::from_str(
        r#"{ "rate_limits": { "fyers": { "requests_per_second": 2, "burst_capacity": 1 } } }"#,
    )
    .unwrap();
    let (paper, ctx) = setup("fyers", config);
    let gateway = ctx.gateway(&BrokerId::new("fyers")).unwrap();

    let start = tokio::time::Instant::now();
    for _ in 0..5 {
        gateway.get_positions().await.unwrap();
    }
    assert!(start.elapsed() >= Duration::from_millis(1_500));
    assert_eq!(paper.call_count("get_positions"), 5);

    let stats = ctx.limits().stats().await;
    assert_eq!(stats[&BrokerId::new("fyers")].call_count, 5);
}
