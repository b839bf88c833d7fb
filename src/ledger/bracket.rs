//! Bracket order legs
//!
//! A bracket order is an entry plus a stoploss and a target leg, linked to
//! the entry through `parent_id`. Whichever leg fills becomes the EXIT
//! record; the broker cancels the other one and it is ignored.

use tracing::warn;

use crate::broker::{normalize_order_id, BrokerOrder, OrderStatus, StatusTranslator};
use crate::error::CoreResult;
use crate::ledger::{ExecutionRecord, ExitKind, NewExecution, SqliteLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BracketLeg {
    Entry,
    Stoploss,
    Target,
}

impl BracketLeg {
    pub fn exit_kind(self) -> Option<ExitKind> {
        match self {
            BracketLeg::Entry => None,
            BracketLeg::Stoploss => Some(ExitKind::Stoploss),
            BracketLeg::Target => Some(ExitKind::Target),
        }
    }
}

/// Role of `order` within the bracket whose entry is `entry_order_id`,
/// or `None` if it belongs to another order
pub fn classify_leg(order: &BrokerOrder, entry_order_id: &str) -> Option<BracketLeg> {
    if order.order_id == entry_order_id {
        return Some(BracketLeg::Entry);
    }
    if order.parent_id.as_deref() != Some(entry_order_id) {
        return None;
    }

    let is_stop = order.order_type.as_deref().is_some_and(|t| {
        let t = t.to_ascii_uppercase();
        t.starts_with("SL") || t.contains("STOP")
    });
    if is_stop || (order.order_type.is_none() && order.order_id.ends_with("-BO-2")) {
        Some(BracketLeg::Stoploss)
    } else {
        Some(BracketLeg::Target)
    }
}

/// EXIT record for the filled leg of `entry`'s bracket, if one has filled.
///
/// Returns `None` when the entry is not a bracket, has no broker id, or no
/// child leg is filled yet.
pub fn exit_from_bracket(
    entry: &ExecutionRecord,
    orders: &[BrokerOrder],
    translator: &StatusTranslator,
) -> Option<NewExecution> {
    if !entry.is_bracket() {
        return None;
    }
    let broker_order_id = entry.broker_order_id.as_deref()?;
    let entry_id = normalize_order_id(&entry.broker_id, broker_order_id, entry.product_type.as_deref());

    let mut filled = orders.iter().filter_map(|order| {
        let leg = classify_leg(order, &entry_id)?;
        let kind = leg.exit_kind()?;
        match translator.order_status(&entry.broker_id, order) {
            Ok(OrderStatus::Filled) => Some((kind, order)),
            Ok(_) => None,
            Err(err) => {
                warn!(order_id = %order.order_id, error = %err, "skipping bracket leg with unknown status");
                None
            }
        }
    });

    let (kind, leg) = filled.next()?;
    if let Some((_, other)) = filled.next() {
        warn!(
            entry = %entry_id,
            recorded = %leg.order_id,
            ignored = %other.order_id,
            "both bracket legs report filled, recording the first"
        );
    }

    let quantity = if leg.filled_quantity > 0 {
        leg.filled_quantity
    } else {
        leg.quantity
    };
    let mut exit = NewExecution::exit(entry, leg.order_id.clone(), leg.quantity, kind);
    exit = match leg.average_price {
        Some(price) => exit.filled(quantity, price),
        None => {
            warn!(order_id = %leg.order_id, "filled bracket leg without average price");
            exit.with_status(OrderStatus::Filled)
        }
    };
    if let Some(order_type) = &leg.order_type {
        exit = exit.with_order_type(order_type.clone());
    }
    Some(exit)
}

/// Insert the EXIT record for `entry`'s filled bracket leg unless that leg
/// is already in the ledger. Returns whether a record was written.
pub fn record_filled_leg(
    ledger: &SqliteLedger,
    entry: &ExecutionRecord,
    orders: &[BrokerOrder],
    translator: &StatusTranslator,
) -> CoreResult<bool> {
    let Some(exit) = exit_from_bracket(entry, orders, translator) else {
        return Ok(false);
    };
    let leg_id = exit.broker_order_id.as_deref().unwrap_or_default();
    if ledger.find_by_broker_order(&entry.broker_id, leg_id)?.is_some() {
        return Ok(false);
    }
    ledger.insert(&exit)?;
    Ok(true)
}
