//! In-memory broker adapter.
//!
//! Orders rest until the caller scripts what happens to them (`fill`,
//! `set_status`). Failures can be queued with `fail_next` and are returned by
//! the next adapter call of any kind. No network I/O.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::broker::status::OrderStatus;
use crate::broker::types::{
    Balance, BrokerOrder, OrderAck, OrderRequest, Position, Profile, RawStatus,
};
use crate::broker::BrokerAdapter;
use crate::error::BrokerError;
use crate::types::{BrokerId, Money, TradeDirection};

#[derive(Debug, Default)]
struct PaperState {
    next_id: u64,
    orders: Vec<BrokerOrder>,
    failures: VecDeque<BrokerError>,
    calls: HashMap<&'static str, u32>,
    last_prices: HashMap<String, Money>,
    latency: Duration,
}

pub struct PaperBroker {
    broker: BrokerId,
    balance: Money,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(broker: impl Into<BrokerId>) -> Self {
        Self {
            broker: broker.into(),
            balance: Money::from_i64(1_000_000),
            state: Mutex::new(PaperState {
                next_id: 1000,
                ..PaperState::default()
            }),
        }
    }

    pub fn with_balance(mut self, balance: Money) -> Self {
        self.balance = balance;
        self
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an error for the next adapter call
    pub fn fail_next(&self, err: BrokerError) {
        self.state().failures.push_back(err);
    }

    /// Delay every adapter call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn set_last_price(&self, symbol: &str, price: Money) {
        self.state().last_prices.insert(symbol.to_string(), price);
    }

    pub fn call_count(&self, op: &str) -> u32 {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    pub fn orders(&self) -> Vec<BrokerOrder> {
        self.state().orders.clone()
    }

    pub fn order(&self, order_id: &str) -> Option<BrokerOrder> {
        self.state().orders.iter().find(|o| o.order_id == order_id).cloned()
    }

    /// Insert or replace an order in the book
    pub fn upsert_order(&self, order: BrokerOrder) {
        let mut state = self.state();
        match state.orders.iter_mut().find(|o| o.order_id == order.order_id) {
            Some(existing) => *existing = order,
            None => state.orders.push(order),
        }
    }

    /// Fill `quantity` at `price`, as a partial fill when it falls short of
    /// the order size
    pub fn fill(&self, order_id: &str, quantity: i64, price: Money) -> bool {
        let raw = |s| self.raw_status(s);
        let mut state = self.state();
        let Some(order) = state.orders.iter_mut().find(|o| o.order_id == order_id) else {
            return false;
        };
        let filled = quantity.min(order.quantity);
        order.filled_quantity = filled;
        order.average_price = Some(price);
        order.status = if filled >= order.quantity {
            raw(OrderStatus::Filled)
        } else {
            raw(OrderStatus::PartiallyFilled)
        };
        order.updated_at = Some(Utc::now());
        true
    }

    pub fn set_status(&self, order_id: &str, status: OrderStatus) -> bool {
        let raw = self.raw_status(status);
        let mut state = self.state();
        match state.orders.iter_mut().find(|o| o.order_id == order_id) {
            Some(order) => {
                order.status = raw;
                order.updated_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Status in the wire format this broker uses
    pub fn raw_status(&self, status: OrderStatus) -> RawStatus {
        if self.broker.as_str() != "fyers" {
            return RawStatus::Text(status.as_str().to_string());
        }
        let code = match status {
            OrderStatus::Cancelled => 1,
            OrderStatus::Filled => 2,
            OrderStatus::Rejected | OrderStatus::Failed => 5,
            OrderStatus::Expired => 7,
            OrderStatus::Pending | OrderStatus::TriggerPending | OrderStatus::PartiallyFilled => 6,
        };
        RawStatus::Code(code)
    }

    fn status_of(&self, order: &BrokerOrder) -> OrderStatus {
        match &order.status {
            RawStatus::Code(1) => OrderStatus::Cancelled,
            RawStatus::Code(2) => OrderStatus::Filled,
            RawStatus::Code(5) => OrderStatus::Rejected,
            RawStatus::Code(7) => OrderStatus::Expired,
            RawStatus::Code(_) => OrderStatus::Pending,
            RawStatus::Text(text) => text.parse().unwrap_or(OrderStatus::Pending),
        }
    }

    /// Count the call, honor latency, pop a scripted failure if one is queued
    async fn enter(&self, op: &'static str) -> Result<(), BrokerError> {
        let latency = {
            let mut state = self.state();
            *state.calls.entry(op).or_insert(0) += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.state().failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn allocate_id(&self) -> u64 {
        let mut state = self.state();
        state.next_id += 1;
        state.next_id
    }

    fn new_order(&self, id: String, request: &OrderRequest, status: OrderStatus) -> BrokerOrder {
        BrokerOrder {
            order_id: id,
            parent_id: None,
            symbol: request.symbol.clone(),
            direction: Some(request.direction),
            status: self.raw_status(status),
            quantity: request.quantity,
            filled_quantity: 0,
            average_price: None,
            order_type: Some(request.order_type.clone()),
            product_type: Some(request.product_type.clone()),
            updated_at: Some(Utc::now()),
        }
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn broker_id(&self) -> &BrokerId {
        &self.broker
    }

    async fn get_order_details(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        self.enter("get_order_details").await?;
        Ok(self.orders())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        self.enter("get_positions").await?;
        let mut net: HashMap<String, (i64, Money, i64)> = HashMap::new();
        for order in self.orders() {
            let (Some(direction), Some(price)) = (order.direction, order.average_price) else {
                continue;
            };
            if order.filled_quantity == 0 {
                continue;
            }
            let entry = net.entry(order.symbol.clone()).or_insert((0, Money::ZERO, 0));
            entry.0 += direction.sign() * order.filled_quantity;
            entry.1 += price * Money::from_i64(order.filled_quantity);
            entry.2 += order.filled_quantity;
        }
        let mut positions: Vec<Position> = net
            .into_iter()
            .filter(|(_, (qty, _, _))| *qty != 0)
            .map(|(symbol, (qty, notional, traded))| Position {
                symbol,
                net_quantity: qty,
                average_price: notional / Money::from_i64(traded),
                product_type: None,
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, BrokerError> {
        self.enter("place_order").await?;
        if request.quantity <= 0 {
            return Err(BrokerError::rejected(
                self.broker.clone(),
                format!("invalid quantity {}", request.quantity),
            ));
        }

        let base = self.allocate_id().to_string();
        let is_bracket = request.stoploss.is_some() && request.target.is_some();
        if !is_bracket {
            let order = self.new_order(base.clone(), request, OrderStatus::Pending);
            self.upsert_order(order);
            return Ok(OrderAck {
                order_id: base,
                message: None,
            });
        }

        // Bracket legs hang off the entry via parent_id
        let entry_id = format!("{base}-BO-1");
        let entry = self.new_order(entry_id.clone(), request, OrderStatus::Pending);
        let mut stoploss = self.new_order(format!("{base}-BO-2"), request, OrderStatus::TriggerPending);
        stoploss.parent_id = Some(entry_id.clone());
        stoploss.direction = Some(request.direction.opposite());
        stoploss.order_type = Some("SL-M".to_string());
        let mut target = self.new_order(format!("{base}-BO-3"), request, OrderStatus::Pending);
        target.parent_id = Some(entry_id.clone());
        target.direction = Some(request.direction.opposite());
        target.order_type = Some("LIMIT".to_string());

        self.upsert_order(entry);
        self.upsert_order(stoploss);
        self.upsert_order(target);

        // Fyers acknowledges brackets with the bare base id
        let ack_id = if self.broker.as_str() == "fyers" { base } else { entry_id };
        Ok(OrderAck {
            order_id: ack_id,
            message: Some("bracket order placed".to_string()),
        })
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        _product_type: Option<&str>,
    ) -> Result<OrderAck, BrokerError> {
        self.enter("cancel_order").await?;
        let Some(order) = self.order(order_id) else {
            return Err(BrokerError::not_found(self.broker.clone(), format!("order {order_id}")));
        };
        let status = self.status_of(&order);
        if status.is_terminal() {
            return Err(BrokerError::rejected(
                self.broker.clone(),
                format!("order {order_id} already {status}"),
            ));
        }
        self.set_status(order_id, OrderStatus::Cancelled);
        for child in self.orders().iter().filter(|o| o.parent_id.as_deref() == Some(order_id)) {
            if self.status_of(child).is_live() {
                self.set_status(&child.order_id, OrderStatus::Cancelled);
            }
        }
        Ok(OrderAck {
            order_id: order_id.to_string(),
            message: Some("cancelled".to_string()),
        })
    }

    async fn exit_order(
        &self,
        order_id: &str,
        _product_type: Option<&str>,
    ) -> Result<OrderAck, BrokerError> {
        self.enter("exit_order").await?;
        let Some(order) = self.order(order_id) else {
            return Err(BrokerError::not_found(self.broker.clone(), format!("order {order_id}")));
        };
        for child in self.orders().iter().filter(|o| o.parent_id.as_deref() == Some(order_id)) {
            if self.status_of(child).is_live() {
                self.set_status(&child.order_id, OrderStatus::Cancelled);
            }
        }
        if order.filled_quantity == 0 {
            self.set_status(order_id, OrderStatus::Cancelled);
            return Ok(OrderAck {
                order_id: order_id.to_string(),
                message: Some("nothing filled, entry cancelled".to_string()),
            });
        }

        let price = self
            .state()
            .last_prices
            .get(&order.symbol)
            .copied()
            .or(order.average_price)
            .unwrap_or(Money::ZERO);
        let exit_id = self.allocate_id().to_string();
        let mut exit = order.clone();
        exit.order_id = exit_id.clone();
        exit.parent_id = Some(order_id.to_string());
        exit.direction = order.direction.map(TradeDirection::opposite);
        exit.quantity = order.filled_quantity;
        exit.filled_quantity = order.filled_quantity;
        exit.average_price = Some(price);
        exit.order_type = Some("MARKET".to_string());
        exit.status = self.raw_status(OrderStatus::Filled);
        exit.updated_at = Some(Utc::now());
        self.upsert_order(exit);

        Ok(OrderAck {
            order_id: exit_id,
            message: Some("position exited".to_string()),
        })
    }

    async fn get_balance(&self) -> Result<Balance, BrokerError> {
        self.enter("get_balance").await?;
        Ok(Balance {
            available: self.balance,
            used_margin: Money::ZERO,
        })
    }

    async fn get_profile(&self) -> Result<Profile, BrokerError> {
        self.enter("get_profile").await?;
        Ok(Profile {
            client_id: format!("PAPER-{}", self.broker.as_str().to_ascii_uppercase()),
            name: Some("Paper Trading".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_bracket_placement_creates_legs() {
        let paper = PaperBroker::new("fyers");
        let request = OrderRequest::market("NIFTY24OCTFUT", TradeDirection::Buy, 75)
            .bracket(Money::from_decimal(dec!(110)), Money::from_decimal(dec!(120)));
        let ack = paper.place_order(&request).await.unwrap();
        assert!(!ack.order_id.contains("-BO-"));

        let orders = paper.get_order_details().await.unwrap();
        assert_eq!(orders.len(), 3);
        let entry_id = format!("{}-BO-1", ack.order_id);
        let children: Vec<_> = orders
            .iter()
            .filter(|o| o.parent_id.as_deref() == Some(entry_id.as_str()))
            .collect();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.direction == Some(TradeDirection::Sell)));
    }

    #[tokio::test]
    async fn test_fill_and_positions() {
        let paper = PaperBroker::new("paper");
        let ack = paper
            .place_order(&OrderRequest::market("BANKNIFTY", TradeDirection::Sell, 30))
            .await
            .unwrap();
        assert!(paper.fill(&ack.order_id, 15, Money::from_decimal(dec!(51000))));
        let order = paper.order(&ack.order_id).unwrap();
        assert_eq!(order.status, RawStatus::Text("PARTIALLY_FILLED".into()));

        let positions = paper.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].net_quantity, -15);
    }

    #[tokio::test]
    async fn test_cancel_terminal_order_is_rejected() {
        let paper = PaperBroker::new("paper");
        let ack = paper
            .place_order(&OrderRequest::market("NIFTY", TradeDirection::Buy, 75))
            .await
            .unwrap();
        paper.fill(&ack.order_id, 75, Money::from_i64(100));
        let err = paper.cancel_order(&ack.order_id, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Rejected);
    }

    #[tokio::test]
    async fn test_scripted_failure_consumed_once() {
        let paper = PaperBroker::new("paper");
        paper.fail_next(BrokerError::network("paper", "reset"));
        assert!(paper.get_balance().await.is_err());
        assert!(paper.get_balance().await.is_ok());
        assert_eq!(paper.call_count("get_balance"), 2);
    }
}
