//! Normalized records exchanged with broker adapters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BrokerError;
use crate::types::{Money, TradeDirection};

/// Product type string that marks a bracket order
pub const BRACKET_PRODUCT: &str = "BO";

/// Status exactly as the broker reported it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawStatus {
    Code(i64),
    Text(String),
}

impl fmt::Display for RawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawStatus::Code(code) => write!(f, "{code}"),
            RawStatus::Text(text) => f.write_str(text),
        }
    }
}

impl From<i64> for RawStatus {
    fn from(code: i64) -> Self {
        RawStatus::Code(code)
    }
}

impl From<&str> for RawStatus {
    fn from(text: &str) -> Self {
        RawStatus::Text(text.to_string())
    }
}

/// One order as seen in a broker's order book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub order_id: String,
    /// Set on bracket child legs
    #[serde(default)]
    pub parent_id: Option<String>,
    pub symbol: String,
    #[serde(default)]
    pub direction: Option<TradeDirection>,
    pub status: RawStatus,
    pub quantity: i64,
    #[serde(default)]
    pub filled_quantity: i64,
    #[serde(default)]
    pub average_price: Option<Money>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl BrokerOrder {
    pub fn is_bracket(&self) -> bool {
        self.product_type
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case(BRACKET_PRODUCT))
    }
}

/// Parameters for a new order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: TradeDirection,
    pub quantity: i64,
    pub order_type: String,
    pub product_type: String,
    #[serde(default)]
    pub limit_price: Option<Money>,
    /// Bracket legs, only meaningful with product type `BO`
    #[serde(default)]
    pub stoploss: Option<Money>,
    #[serde(default)]
    pub target: Option<Money>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, direction: TradeDirection, quantity: i64) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            quantity,
            order_type: "MARKET".to_string(),
            product_type: "INTRADAY".to_string(),
            limit_price: None,
            stoploss: None,
            target: None,
        }
    }

    pub fn bracket(mut self, stoploss: Money, target: Money) -> Self {
        self.product_type = BRACKET_PRODUCT.to_string();
        self.stoploss = Some(stoploss);
        self.target = Some(target);
        self
    }
}

/// Broker acknowledgement of a place/cancel/exit request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed net quantity, negative when short
    pub net_quantity: i64,
    pub average_price: Money,
    pub product_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub available: Money,
    pub used_margin: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub client_id: String,
    pub name: Option<String>,
}

/// Outcome of a live single-order lookup
#[derive(Debug, Clone)]
pub enum OrderLookup {
    /// Fresh record from the broker
    Found(BrokerOrder),
    /// Live lookup failed; this is the last snapshot copy
    Stale(BrokerOrder),
    NotFound,
    AdapterError(BrokerError),
}

impl OrderLookup {
    /// The record when it is known to be current
    pub fn fresh(&self) -> Option<&BrokerOrder> {
        match self {
            OrderLookup::Found(order) => Some(order),
            _ => None,
        }
    }

    /// Lookups that leave the live state unknown
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, OrderLookup::Stale(_) | OrderLookup::AdapterError(_))
    }
}
