//! Core value types shared across the execution core

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub};
use std::str::FromStr;

/// Broker identifier using Arc<str> for cheap cloning
///
/// Broker ids are cloned into every limiter, cache entry, ledger row and log
/// span. Names are normalized to lowercase so `"Fyers"` and `"fyers"` resolve
/// to the same limiter and translation table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerId(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

/// Custom serde for Arc<str>
mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.trim().to_ascii_lowercase().as_str()))
    }
}

impl BrokerId {
    pub fn new(s: impl AsRef<str>) -> Self {
        BrokerId(std::sync::Arc::from(
            s.as_ref().trim().to_ascii_lowercase().as_str(),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BrokerId {
    fn from(value: &str) -> Self {
        BrokerId::new(value)
    }
}

/// Trade direction of a broker order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl TradeDirection {
    /// +1 for long entries, -1 for short entries
    pub fn sign(self) -> i64 {
        match self {
            TradeDirection::Buy => 1,
            TradeDirection::Sell => -1,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            TradeDirection::Buy => TradeDirection::Sell,
            TradeDirection::Sell => TradeDirection::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TradeDirection::Buy => "BUY",
            TradeDirection::Sell => "SELL",
        }
    }
}

impl FromStr for TradeDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" | "B" | "1" => Ok(TradeDirection::Buy),
            "SELL" | "S" | "-1" => Ok(TradeDirection::Sell),
            other => Err(format!("unknown trade direction: {other}")),
        }
    }
}

impl fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Money Type - Precise Decimal Arithmetic for Prices and P&L
// ============================================================================

/// Money type for precise decimal arithmetic on execution prices, VWAPs and P&L.
///
/// Wraps `rust_decimal::Decimal` so that VWAP and realized P&L derived from
/// broker fills match the broker's own contract notes to the paisa.
///
/// # Example
/// ```
/// use broker_sync::Money;
/// let entry: Money = "115.50".parse().unwrap();
/// let exit: Money = "116.85".parse().unwrap();
/// assert_eq!(((exit - entry) * Money::from_i64(75)).to_string(), "101.25");
/// ```
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Create from f64. Broker adapters report prices as floats; the decimal
    /// conversion keeps the shortest round-trip representation.
    pub fn from_f64(value: f64) -> Self {
        Money(Decimal::try_from(value).unwrap_or_else(|_| {
            if value.is_nan() || value.is_infinite() {
                Decimal::ZERO
            } else {
                Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO)
            }
        }))
    }

    pub fn from_decimal(value: Decimal) -> Self {
        Money(value)
    }

    pub fn from_i64(value: i64) -> Self {
        Money(Decimal::from(value))
    }

    pub fn to_f64(self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn round_dp(self, dp: u32) -> Self {
        Money(self.0.round_dp(dp))
    }

    pub fn inner(self) -> Decimal {
        self.0
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}

impl FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim()).map(Money)
    }
}

impl PartialEq for Money {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}

impl Div for Money {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        if rhs.0.is_zero() {
            Money::ZERO
        } else {
            Money(self.0 / rhs.0)
        }
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money(value)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_broker_id_is_case_insensitive() {
        assert_eq!(BrokerId::new("Fyers"), BrokerId::new("fyers"));
        assert_eq!(BrokerId::new(" ZERODHA ").as_str(), "zerodha");
    }

    #[test]
    fn test_direction_parsing_and_sign() {
        assert_eq!("buy".parse::<TradeDirection>().unwrap(), TradeDirection::Buy);
        assert_eq!("-1".parse::<TradeDirection>().unwrap(), TradeDirection::Sell);
        assert!("HOLD".parse::<TradeDirection>().is_err());
        assert_eq!(TradeDirection::Sell.sign(), -1);
        assert_eq!(TradeDirection::Buy.opposite(), TradeDirection::Sell);
    }

    #[test]
    fn test_money_precision() {
        let a = Money::from_f64(0.1);
        let b = Money::from_f64(0.2);
        assert_eq!(a + b, Money::from_f64(0.3));
    }

    #[test]
    fn test_money_pnl_is_exact() {
        let entry = Money::from_decimal(dec!(115.50));
        let exit = Money::from_decimal(dec!(116.85));
        let pnl = (exit - entry) * Money::from_i64(75);
        assert_eq!(pnl, Money::from_decimal(dec!(101.25)));
    }

    #[test]
    fn test_money_div_by_zero() {
        assert_eq!(Money::from_i64(10) / Money::ZERO, Money::ZERO);
    }

    #[test]
    fn test_money_from_str_and_display() {
        let m: Money = "116.850".parse().unwrap();
        assert_eq!(m.to_string(), "116.85");
        assert!("abc".parse::<Money>().is_err());
    }
}
