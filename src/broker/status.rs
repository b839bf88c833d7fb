//! Canonical order status vocabulary and per-broker translation
//!
//! Brokers report status as numeric codes (Fyers) or free-form strings
//! (Zerodha, Angel). Every translation goes through one [`StatusTranslator`],
//! whose tables are checked against [`OrderStatus`] when they are built.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::broker::types::{BrokerOrder, RawStatus};
use crate::error::{CoreError, CoreResult};
use crate::types::BrokerId;

/// Canonical status of a single broker order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    TriggerPending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Failed,
    Expired,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 8] = [
        OrderStatus::Pending,
        OrderStatus::TriggerPending,
        OrderStatus::PartiallyFilled,
        OrderStatus::Filled,
        OrderStatus::Cancelled,
        OrderStatus::Rejected,
        OrderStatus::Failed,
        OrderStatus::Expired,
    ];

    /// Terminal statuses never change again on the broker side
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Failed
                | OrderStatus::Expired
        )
    }

    /// Still working on the broker (may fill further)
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    pub fn has_fill(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::PartiallyFilled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::TriggerPending => "TRIGGER_PENDING",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    /// Accepts canonical names and common spellings (`PARTIAL`, `CANCELED`,
    /// `OrderStatus.FILLED`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = normalize_key(s);
        let status = match key.as_ref() {
            "PENDING" => OrderStatus::Pending,
            "TRIGGER PENDING" => OrderStatus::TriggerPending,
            "PARTIALLY FILLED" | "PARTIAL" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELLED" | "CANCELED" => OrderStatus::Cancelled,
            "REJECTED" => OrderStatus::Rejected,
            "FAILED" => OrderStatus::Failed,
            "EXPIRED" => OrderStatus::Expired,
            _ => return Err(format!("unknown order status: {s}")),
        };
        Ok(status)
    }
}

/// Upper-case, strip enum-style prefixes, treat `_` and runs of spaces alike
fn normalize_key(raw: &str) -> Cow<'_, str> {
    let trimmed = raw.trim();
    let trimmed = trimmed.rsplit_once('.').map_or(trimmed, |(_, tail)| tail);
    let upper = trimmed.to_ascii_uppercase().replace('_', " ");
    Cow::Owned(upper.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Result of looking up a broker status code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusObservation {
    Known(OrderStatus),
    /// No table entry; carries the raw value for the caller to log or store
    Unmapped(String),
}

impl StatusObservation {
    pub fn known(&self) -> Option<OrderStatus> {
        match self {
            StatusObservation::Known(status) => Some(*status),
            StatusObservation::Unmapped(_) => None,
        }
    }
}

const FYERS_TABLE: &[(&str, &str)] = &[
    ("1", "CANCELLED"),
    ("2", "FILLED"),
    ("4", "PENDING"), // transit
    ("5", "REJECTED"),
    ("6", "PENDING"),
    ("7", "EXPIRED"),
];

const ZERODHA_TABLE: &[(&str, &str)] = &[
    ("COMPLETE", "FILLED"),
    ("OPEN", "PENDING"),
    ("OPEN PENDING", "PENDING"),
    ("VALIDATION PENDING", "PENDING"),
    ("PUT ORDER REQ RECEIVED", "PENDING"),
    ("MODIFY PENDING", "PENDING"),
    ("CANCEL PENDING", "PENDING"),
    ("TRIGGER PENDING", "TRIGGER_PENDING"),
    ("CANCELLED", "CANCELLED"),
    ("REJECTED", "REJECTED"),
];

const ANGEL_TABLE: &[(&str, &str)] = &[
    ("COMPLETE", "FILLED"),
    ("OPEN", "PENDING"),
    ("OPEN PENDING", "PENDING"),
    ("VALIDATION PENDING", "PENDING"),
    ("MODIFY PENDING", "PENDING"),
    ("TRIGGER PENDING", "TRIGGER_PENDING"),
    ("CANCELLED", "CANCELLED"),
    ("REJECTED", "REJECTED"),
];

/// Per-broker status translation tables
#[derive(Debug, Clone)]
pub struct StatusTranslator {
    tables: HashMap<BrokerId, HashMap<String, OrderStatus>>,
}

impl StatusTranslator {
    /// Built-in tables for fyers, zerodha and angel
    pub fn with_defaults() -> CoreResult<Self> {
        let mut translator = Self {
            tables: HashMap::new(),
        };
        translator.load_table(&BrokerId::new("fyers"), FYERS_TABLE.iter().copied())?;
        translator.load_table(&BrokerId::new("zerodha"), ZERODHA_TABLE.iter().copied())?;
        translator.load_table(&BrokerId::new("angel"), ANGEL_TABLE.iter().copied())?;
        Ok(translator)
    }

    /// Merge entries into a broker's table. Every target must name an
    /// [`OrderStatus`] member or the whole load is rejected.
    pub fn load_table<'a>(
        &mut self,
        broker: &BrokerId,
        entries: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> CoreResult<()> {
        let mut parsed = HashMap::new();
        for (code, target) in entries {
            let status = OrderStatus::from_str(target).map_err(|_| {
                CoreError::Configuration(format!(
                    "status table for {broker}: {code:?} maps to unknown status {target:?}"
                ))
            })?;
            parsed.insert(normalize_key(code).into_owned(), status);
        }
        self.tables.entry(broker.clone()).or_default().extend(parsed);
        Ok(())
    }

    /// Strict translation: broker table first, then canonical names
    pub fn translate(&self, broker: &BrokerId, raw: &RawStatus) -> CoreResult<OrderStatus> {
        let key = normalize_key(&raw.to_string()).into_owned();
        if let Some(status) = self.tables.get(broker).and_then(|t| t.get(&key)) {
            return Ok(*status);
        }
        if let RawStatus::Text(text) = raw {
            if let Ok(status) = OrderStatus::from_str(text) {
                return Ok(status);
            }
        }
        Err(CoreError::UnknownStatusCode {
            broker: broker.clone(),
            code: raw.to_string(),
        })
    }

    /// Lenient translation used by snapshot readers: an unmapped code is
    /// logged and handed back raw
    pub fn observe(&self, broker: &BrokerId, raw: &RawStatus) -> StatusObservation {
        match self.translate(broker, raw) {
            Ok(status) => StatusObservation::Known(status),
            Err(_) => {
                warn!(broker = %broker, code = %raw, "unmapped broker status code");
                StatusObservation::Unmapped(raw.to_string())
            }
        }
    }

    /// Status of a whole order. Brokers that have no partial-fill code
    /// report a working order with fills as plain pending.
    pub fn order_status(&self, broker: &BrokerId, order: &BrokerOrder) -> CoreResult<OrderStatus> {
        let status = self.translate(broker, &order.status)?;
        Ok(promote_partial(status, order.filled_quantity))
    }

    pub fn observe_order(&self, broker: &BrokerId, order: &BrokerOrder) -> StatusObservation {
        match self.observe(broker, &order.status) {
            StatusObservation::Known(status) => {
                StatusObservation::Known(promote_partial(status, order.filled_quantity))
            }
            unmapped => unmapped,
        }
    }
}

fn promote_partial(status: OrderStatus, filled_quantity: i64) -> OrderStatus {
    match status {
        OrderStatus::Pending | OrderStatus::TriggerPending if filled_quantity > 0 => {
            OrderStatus::PartiallyFilled
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> StatusTranslator {
        StatusTranslator::with_defaults().unwrap()
    }

    #[test]
    fn test_fyers_numeric_codes() {
        let t = translator();
        let fyers = BrokerId::new("fyers");
        assert_eq!(t.translate(&fyers, &RawStatus::Code(2)).unwrap(), OrderStatus::Filled);
        assert_eq!(t.translate(&fyers, &RawStatus::Code(1)).unwrap(), OrderStatus::Cancelled);
        assert_eq!(t.translate(&fyers, &RawStatus::Code(6)).unwrap(), OrderStatus::Pending);
        assert!(t.translate(&fyers, &RawStatus::Code(42)).is_err());
    }

    #[test]
    fn test_string_brokers() {
        let t = translator();
        let zerodha = BrokerId::new("zerodha");
        assert_eq!(
            t.translate(&zerodha, &RawStatus::Text("COMPLETE".into())).unwrap(),
            OrderStatus::Filled
        );
        assert_eq!(
            t.translate(&zerodha, &RawStatus::Text("trigger pending".into())).unwrap(),
            OrderStatus::TriggerPending
        );
        let angel = BrokerId::new("angel");
        assert_eq!(
            t.translate(&angel, &RawStatus::Text("open".into())).unwrap(),
            OrderStatus::Pending
        );
    }

    #[test]
    fn test_canonical_names_accepted_for_any_broker() {
        let t = translator();
        let paper = BrokerId::new("paper");
        assert_eq!(
            t.translate(&paper, &RawStatus::Text("OrderStatus.PARTIALLY_FILLED".into()))
                .unwrap(),
            OrderStatus::PartiallyFilled
        );
    }

    #[test]
    fn test_observe_passes_unknown_through() {
        let t = translator();
        let obs = t.observe(&BrokerId::new("zerodha"), &RawStatus::Text("AMO REQ RECEIVED".into()));
        assert_eq!(obs, StatusObservation::Unmapped("AMO REQ RECEIVED".to_string()));
        assert_eq!(obs.known(), None);
    }

    #[test]
    fn test_invalid_table_rejected_at_load() {
        let mut t = translator();
        let err = t
            .load_table(&BrokerId::new("dhan"), [("TRADED", "DONE")])
            .unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));

        t.load_table(&BrokerId::new("dhan"), [("TRADED", "FILLED")]).unwrap();
        assert_eq!(
            t.translate(&BrokerId::new("dhan"), &RawStatus::Text("traded".into())).unwrap(),
            OrderStatus::Filled
        );
    }

    #[test]
    fn test_working_order_with_fills_is_partial() {
        let t = translator();
        let fyers = BrokerId::new("fyers");
        let order = BrokerOrder {
            order_id: "2408".into(),
            parent_id: None,
            symbol: "NIFTY".into(),
            direction: None,
            status: RawStatus::Code(6),
            quantity: 75,
            filled_quantity: 25,
            average_price: None,
            order_type: None,
            product_type: None,
            updated_at: None,
        };
        assert_eq!(t.order_status(&fyers, &order).unwrap(), OrderStatus::PartiallyFilled);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(OrderStatus::PartiallyFilled.is_live());
        assert!(OrderStatus::PartiallyFilled.has_fill());
        assert_eq!(OrderStatus::ALL.len(), 8);
    }
}
