//! Logical order status and P&L derived from execution records

use serde::Serialize;

use crate::broker::OrderStatus;
use crate::ledger::{ExecutionRecord, ExecutionSide, LogicalOrderStatus};
use crate::types::{Money, TradeDirection};

fn side_records(
    records: &[ExecutionRecord],
    side: ExecutionSide,
) -> impl Iterator<Item = &ExecutionRecord> {
    records.iter().filter(move |r| r.side == side)
}

pub fn filled_quantity(records: &[ExecutionRecord], side: ExecutionSide) -> i64 {
    side_records(records, side).map(|r| r.executed_quantity).sum()
}

/// Derive the logical order status.
///
/// - no ENTRY records: awaiting entry
/// - nothing filled: pending while any ENTRY is still working, otherwise
///   cancelled (any cancelled/expired entry) or failed
/// - something filled: closed once exits cover the entries and no ENTRY is
///   still working, open before that
pub fn resolve_status(records: &[ExecutionRecord]) -> LogicalOrderStatus {
    let mut entries = side_records(records, ExecutionSide::Entry).peekable();
    if entries.peek().is_none() {
        return LogicalOrderStatus::AwaitingEntry;
    }

    let entry_live = side_records(records, ExecutionSide::Entry).any(|r| r.status.is_live());
    let entry_filled = filled_quantity(records, ExecutionSide::Entry);
    let exit_filled = filled_quantity(records, ExecutionSide::Exit);

    if entry_filled == 0 {
        if entry_live {
            return LogicalOrderStatus::Pending;
        }
        let cancelled = side_records(records, ExecutionSide::Entry)
            .any(|r| matches!(r.status, OrderStatus::Cancelled | OrderStatus::Expired));
        return if cancelled {
            LogicalOrderStatus::Cancelled
        } else {
            LogicalOrderStatus::Failed
        };
    }

    if exit_filled >= entry_filled && !entry_live {
        LogicalOrderStatus::Closed
    } else {
        LogicalOrderStatus::Open
    }
}

/// Quantity-weighted average execution price for one side
pub fn vwap(records: &[ExecutionRecord], side: ExecutionSide) -> Option<Money> {
    let mut notional = Money::ZERO;
    let mut quantity = 0i64;
    for record in side_records(records, side) {
        if let (Some(price), qty) = (record.execution_price, record.executed_quantity) {
            if qty > 0 {
                notional += price * Money::from_i64(qty);
                quantity += qty;
            }
        }
    }
    (quantity > 0).then(|| notional / Money::from_i64(quantity))
}

/// Realized P&L on the quantity matched between entries and exits.
/// Sign follows the entry direction: long profits when exit > entry.
pub fn realized_pnl(records: &[ExecutionRecord]) -> Option<Money> {
    let entry = vwap(records, ExecutionSide::Entry)?;
    let exit = vwap(records, ExecutionSide::Exit)?;
    let matched = filled_quantity(records, ExecutionSide::Entry)
        .min(filled_quantity(records, ExecutionSide::Exit));
    let direction = side_records(records, ExecutionSide::Entry)
        .next()
        .map_or(TradeDirection::Buy, |r| r.direction);

    let per_unit = (exit - entry) * Money::from_i64(direction.sign());
    Some(per_unit * Money::from_i64(matched))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogicalOrderSummary {
    pub logical_order_id: i64,
    pub status: LogicalOrderStatus,
    pub entry_filled: i64,
    pub exit_filled: i64,
    pub entry_vwap: Option<Money>,
    pub exit_vwap: Option<Money>,
    pub realized_pnl: Option<Money>,
}

impl LogicalOrderSummary {
    pub fn open_quantity(&self) -> i64 {
        self.entry_filled - self.exit_filled
    }
}

pub fn summarize(logical_order_id: i64, records: &[ExecutionRecord]) -> LogicalOrderSummary {
    LogicalOrderSummary {
        logical_order_id,
        status: resolve_status(records),
        entry_filled: filled_quantity(records, ExecutionSide::Entry),
        exit_filled: filled_quantity(records, ExecutionSide::Exit),
        entry_vwap: vwap(records, ExecutionSide::Entry),
        exit_vwap: vwap(records, ExecutionSide::Exit),
        realized_pnl: realized_pnl(records),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BrokerId;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn record(side: ExecutionSide, status: OrderStatus, qty: i64, price: Option<Money>) -> ExecutionRecord {
        ExecutionRecord {
            id: 0,
            logical_order_id: 1,
            broker_id: BrokerId::new("fyers"),
            side,
            direction: match side {
                ExecutionSide::Entry => TradeDirection::Buy,
                ExecutionSide::Exit => TradeDirection::Sell,
            },
            symbol: "NIFTY".into(),
            status,
            quantity: qty.max(75),
            executed_quantity: qty,
            execution_price: price,
            broker_order_id: Some("X".into()),
            order_type: None,
            product_type: None,
            exit_kind: None,
            note: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn px(d: rust_decimal::Decimal) -> Option<Money> {
        Some(Money::from_decimal(d))
    }

    #[test]
    fn test_awaiting_entry() {
        assert_eq!(resolve_status(&[]), LogicalOrderStatus::AwaitingEntry);
    }

    #[test]
    fn test_entry_filled_exit_filled_is_closed() {
        let records = vec![
            record(ExecutionSide::Entry, OrderStatus::Filled, 75, px(dec!(115.5))),
            record(ExecutionSide::Exit, OrderStatus::Filled, 75, px(dec!(116.85))),
        ];
        assert_eq!(resolve_status(&records), LogicalOrderStatus::Closed);
    }

    #[test]
    fn test_cancelled_entry_without_fill() {
        let records = vec![record(ExecutionSide::Entry, OrderStatus::Cancelled, 0, None)];
        assert_eq!(resolve_status(&records), LogicalOrderStatus::Cancelled);

        let records = vec![record(ExecutionSide::Entry, OrderStatus::Failed, 0, None)];
        assert_eq!(resolve_status(&records), LogicalOrderStatus::Failed);
    }

    #[test]
    fn test_live_entry_wins_over_cancelled_sibling() {
        let records = vec![
            record(ExecutionSide::Entry, OrderStatus::Cancelled, 0, None),
            record(ExecutionSide::Entry, OrderStatus::Pending, 0, None),
        ];
        assert_eq!(resolve_status(&records), LogicalOrderStatus::Pending);
    }

    #[test]
    fn test_partial_exit_is_open() {
        let records = vec![
            record(ExecutionSide::Entry, OrderStatus::Filled, 75, px(dec!(100))),
            record(ExecutionSide::Exit, OrderStatus::PartiallyFilled, 25, px(dec!(101))),
        ];
        assert_eq!(resolve_status(&records), LogicalOrderStatus::Open);
    }

    #[test]
    fn test_working_entry_keeps_order_open() {
        let records = vec![
            record(ExecutionSide::Entry, OrderStatus::PartiallyFilled, 30, px(dec!(100))),
            record(ExecutionSide::Exit, OrderStatus::Filled, 30, px(dec!(101))),
        ];
        assert_eq!(resolve_status(&records), LogicalOrderStatus::Open);
    }

    #[test]
    fn test_vwap_and_pnl() {
        let records = vec![
            record(ExecutionSide::Entry, OrderStatus::Filled, 50, px(dec!(100))),
            record(ExecutionSide::Entry, OrderStatus::Filled, 50, px(dec!(102))),
            record(ExecutionSide::Exit, OrderStatus::Filled, 100, px(dec!(105))),
        ];
        assert_eq!(vwap(&records, ExecutionSide::Entry), px(dec!(101)));
        assert_eq!(realized_pnl(&records), px(dec!(400)));
    }

    #[test]
    fn test_short_pnl_sign() {
        let mut entry = record(ExecutionSide::Entry, OrderStatus::Filled, 10, px(dec!(200)));
        entry.direction = TradeDirection::Sell;
        let mut exit = record(ExecutionSide::Exit, OrderStatus::Filled, 10, px(dec!(190)));
        exit.direction = TradeDirection::Buy;
        assert_eq!(realized_pnl(&[entry, exit]), px(dec!(100)));
    }

    #[test]
    fn test_summary() {
        let records = vec![
            record(ExecutionSide::Entry, OrderStatus::Filled, 75, px(dec!(115.5))),
            record(ExecutionSide::Exit, OrderStatus::Filled, 75, px(dec!(116.85))),
        ];
        let summary = summarize(1, &records);
        assert_eq!(summary.status, LogicalOrderStatus::Closed);
        assert_eq!(summary.open_quantity(), 0);
        assert_eq!(summary.realized_pnl, px(dec!(101.25)));
    }
}
