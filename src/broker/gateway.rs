//! Resilient front door to a single broker adapter
//!
//! Order-mutating calls (place, cancel, exit) run under the `critical` retry
//! preset, everything else under `data_fetch`. Both presets draw tokens from
//! the broker's rate limiter on every attempt.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::broker::types::{Balance, BrokerOrder, OrderAck, OrderLookup, OrderRequest, Position, Profile};
use crate::broker::{normalize_order_id, BrokerAdapter};
use crate::common::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryOrchestrator, RetryPolicy};
use crate::error::{BrokerError, CoreError, CoreResult, ErrorKind};
use crate::types::BrokerId;

/// Retry presets bound to one broker's rate limiter
#[derive(Debug, Clone)]
pub struct GatewayPolicies {
    pub critical: RetryPolicy,
    pub data_fetch: RetryPolicy,
}

impl GatewayPolicies {
    pub fn for_broker(broker: &BrokerId) -> Self {
        Self {
            critical: RetryPolicy::critical().with_rate_limit(broker.clone(), 1),
            data_fetch: RetryPolicy::data_fetch().with_rate_limit(broker.clone(), 1),
        }
    }
}

pub struct BrokerGateway {
    broker: BrokerId,
    adapter: Arc<dyn BrokerAdapter>,
    retry: Arc<RetryOrchestrator>,
    breaker: Mutex<CircuitBreaker>,
    policies: GatewayPolicies,
}

impl BrokerGateway {
    pub fn new(
        adapter: Arc<dyn BrokerAdapter>,
        retry: Arc<RetryOrchestrator>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let broker = adapter.broker_id().clone();
        Self {
            breaker: Mutex::new(CircuitBreaker::new(broker.clone(), breaker_config)),
            policies: GatewayPolicies::for_broker(&broker),
            broker,
            adapter,
            retry,
        }
    }

    pub fn with_policies(mut self, policies: GatewayPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn broker_id(&self) -> &BrokerId {
        &self.broker
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner).state()
    }

    fn ensure_closed(&self) -> CoreResult<()> {
        let allowed = self
            .breaker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .can_attempt();
        if allowed {
            Ok(())
        } else {
            Err(CoreError::CircuitOpen {
                broker: self.broker.clone(),
            })
        }
    }

    fn observe<T>(&self, result: &Result<T, BrokerError>) {
        let mut breaker = self.breaker.lock().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(_) => breaker.record_success(),
            Err(e) => breaker.record_failure(e.kind()),
        }
    }

    /// Run one adapter call under `policy`. The breaker is consulted before
    /// every attempt, ahead of its rate-limit token. If it opens partway
    /// through, the caller gets the last broker failure, not `CircuitOpen`.
    async fn call<T, F, Fut>(&self, policy: &RetryPolicy, op: F) -> CoreResult<T>
    where
        F: Fn(Arc<dyn BrokerAdapter>) -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        self.retry
            .run_gated(
                policy,
                || self.ensure_closed(),
                || {
                    let fut = op(Arc::clone(&self.adapter));
                    async move {
                        let result = fut.await;
                        self.observe(&result);
                        result.map_err(CoreError::from)
                    }
                },
            )
            .await
    }

    pub async fn get_order_details(&self) -> CoreResult<Vec<BrokerOrder>> {
        self.call(&self.policies.data_fetch, |a| async move {
            a.get_order_details().await
        })
        .await
    }

    pub async fn get_positions(&self) -> CoreResult<Vec<Position>> {
        self.call(&self.policies.data_fetch, |a| async move { a.get_positions().await })
            .await
    }

    pub async fn get_balance(&self) -> CoreResult<Balance> {
        self.call(&self.policies.data_fetch, |a| async move { a.get_balance().await })
            .await
    }

    pub async fn get_profile(&self) -> CoreResult<Profile> {
        self.call(&self.policies.data_fetch, |a| async move { a.get_profile().await })
            .await
    }

    pub async fn place_order(&self, request: &OrderRequest) -> CoreResult<OrderAck> {
        debug!(broker = %self.broker, symbol = %request.symbol, qty = request.quantity, "placing order");
        self.call(&self.policies.critical, |a| {
            let request = request.clone();
            async move { a.place_order(&request).await }
        })
        .await
    }

    pub async fn cancel_order(&self, order_id: &str, product_type: Option<&str>) -> CoreResult<OrderAck> {
        let id = normalize_order_id(&self.broker, order_id, product_type).into_owned();
        let product = product_type.map(str::to_string);
        self.call(&self.policies.critical, |a| {
            let id = id.clone();
            let product = product.clone();
            async move { a.cancel_order(&id, product.as_deref()).await }
        })
        .await
    }

    pub async fn exit_order(&self, order_id: &str, product_type: Option<&str>) -> CoreResult<OrderAck> {
        let id = normalize_order_id(&self.broker, order_id, product_type).into_owned();
        let product = product_type.map(str::to_string);
        self.call(&self.policies.critical, |a| {
            let id = id.clone();
            let product = product.clone();
            async move { a.exit_order(&id, product.as_deref()).await }
        })
        .await
    }

    /// Live lookup of one order, bypassing any snapshot.
    ///
    /// Never returns `Stale`; that variant is produced by callers that fall
    /// back to a cached copy.
    pub async fn fetch_order(&self, order_id: &str, product_type: Option<&str>) -> OrderLookup {
        let id = normalize_order_id(&self.broker, order_id, product_type).into_owned();
        let result = self
            .call(&self.policies.data_fetch, |a| {
                let id = id.clone();
                async move { a.get_order(&id).await }
            })
            .await;

        match result {
            Ok(Some(order)) => OrderLookup::Found(order),
            Ok(None) => OrderLookup::NotFound,
            Err(err) if err.broker_kind() == Some(ErrorKind::NotFound) => OrderLookup::NotFound,
            Err(err) => {
                warn!(broker = %self.broker, order_id = %id, error = %err, "live order lookup failed");
                OrderLookup::AdapterError(into_broker_error(&self.broker, err))
            }
        }
    }
}

fn into_broker_error(broker: &BrokerId, err: CoreError) -> BrokerError {
    match err {
        CoreError::BrokerAdapter(e) => e,
        CoreError::RetryExhausted { source, .. } => into_broker_error(broker, *source),
        other => BrokerError::new(broker.clone(), ErrorKind::Api, other.to_string()),
    }
}
