//! Broker boundary
//!
//! Concrete broker integrations implement [`BrokerAdapter`]. The core never
//! talks to an adapter directly; every call goes through a [`BrokerGateway`]
//! so it is rate limited, retried and guarded by the circuit breaker.

pub mod gateway;
pub mod paper;
pub mod status;
pub mod types;

use async_trait::async_trait;
use std::borrow::Cow;

use crate::error::BrokerError;
use crate::types::BrokerId;

pub use gateway::{BrokerGateway, GatewayPolicies};
pub use paper::PaperBroker;
pub use status::{OrderStatus, StatusObservation, StatusTranslator};
pub use types::{
    Balance, BrokerOrder, OrderAck, OrderLookup, OrderRequest, Position, Profile, RawStatus,
    BRACKET_PRODUCT,
};

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn broker_id(&self) -> &BrokerId;

    /// Full order book for the trading day
    async fn get_order_details(&self) -> Result<Vec<BrokerOrder>, BrokerError>;

    /// Single order by broker id. The default scans the order book.
    async fn get_order(&self, order_id: &str) -> Result<Option<BrokerOrder>, BrokerError> {
        let orders = self.get_order_details().await?;
        Ok(orders.into_iter().find(|o| o.order_id == order_id))
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, BrokerError>;

    async fn cancel_order(
        &self,
        order_id: &str,
        product_type: Option<&str>,
    ) -> Result<OrderAck, BrokerError>;

    async fn exit_order(
        &self,
        order_id: &str,
        product_type: Option<&str>,
    ) -> Result<OrderAck, BrokerError>;

    async fn get_balance(&self) -> Result<Balance, BrokerError>;

    async fn get_profile(&self) -> Result<Profile, BrokerError>;
}

/// Order id as it appears in the broker's order book.
///
/// Fyers acknowledges a bracket order with its base id but lists the entry
/// leg as `<base>-BO-1`. Every lookup goes through here.
pub fn normalize_order_id<'a>(
    broker: &BrokerId,
    order_id: &'a str,
    product_type: Option<&str>,
) -> Cow<'a, str> {
    let is_bracket = product_type.is_some_and(|p| p.eq_ignore_ascii_case(BRACKET_PRODUCT));
    if broker.as_str() == "fyers" && is_bracket && !order_id.contains("-BO-") {
        Cow::Owned(format!("{order_id}-BO-1"))
    } else {
        Cow::Borrowed(order_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fyers_bracket_ids_get_entry_suffix() {
        let fyers = BrokerId::new("fyers");
        assert_eq!(normalize_order_id(&fyers, "2408", Some("BO")), "2408-BO-1");
        assert_eq!(normalize_order_id(&fyers, "2408-BO-1", Some("BO")), "2408-BO-1");
        assert_eq!(normalize_order_id(&fyers, "2409-BO-2", Some("bo")), "2409-BO-2");
    }

    #[test]
    fn test_other_ids_untouched() {
        let fyers = BrokerId::new("fyers");
        assert_eq!(normalize_order_id(&fyers, "2408", Some("INTRADAY")), "2408");
        assert_eq!(normalize_order_id(&fyers, "2408", None), "2408");
        let zerodha = BrokerId::new("zerodha");
        assert_eq!(normalize_order_id(&zerodha, "2408", Some("BO")), "2408");
    }
}
