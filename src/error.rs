//! Error taxonomy for the execution core
//!
//! Broker adapters report failures as [`BrokerError`], which carries an
//! [`ErrorKind`] so retry policies can decide by kind rather than by message.
//! Everything the core itself can fail with is a [`CoreError`].

use crate::types::BrokerId;
use std::fmt;
use thiserror::Error;

/// Coarse classification of a broker failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Connection reset, DNS failure, broken pipe
    Network,
    /// Request did not complete in time
    Timeout,
    /// Broker answered with HTTP 429 or an equivalent throttle code
    RateLimited,
    /// Session expired or credentials rejected
    Auth,
    /// Broker refused the request (margin, price band, invalid params)
    Rejected,
    /// Order or resource does not exist on the broker side
    NotFound,
    /// Anything else the adapter could not classify
    Api,
}

impl ErrorKind {
    /// Kinds that describe a broker outcome rather than a broker outage
    pub fn is_business_outcome(self) -> bool {
        matches!(self, ErrorKind::Rejected | ErrorKind::NotFound)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Auth => "auth",
            ErrorKind::Rejected => "rejected",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Api => "api",
        };
        f.write_str(s)
    }
}

/// Opaque failure passed through from a broker adapter
#[derive(Debug, Clone, Error)]
#[error("{broker} {kind} error: {message}")]
pub struct BrokerError {
    pub broker: BrokerId,
    pub kind: ErrorKind,
    pub message: String,
}

impl BrokerError {
    pub fn new(broker: impl Into<BrokerId>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn network(broker: impl Into<BrokerId>, message: impl Into<String>) -> Self {
        Self::new(broker, ErrorKind::Network, message)
    }

    pub fn timeout(broker: impl Into<BrokerId>, message: impl Into<String>) -> Self {
        Self::new(broker, ErrorKind::Timeout, message)
    }

    pub fn rejected(broker: impl Into<BrokerId>, message: impl Into<String>) -> Self {
        Self::new(broker, ErrorKind::Rejected, message)
    }

    pub fn not_found(broker: impl Into<BrokerId>, message: impl Into<String>) -> Self {
        Self::new(broker, ErrorKind::NotFound, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Errors raised by the execution core
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid rate, retry or cache parameters, rejected at setup time
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Retry policy spent; `source` is the last underlying failure
    #[error("retry exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<CoreError>,
    },

    #[error(transparent)]
    BrokerAdapter(#[from] BrokerError),

    #[error("order cache not initialized for broker {broker}")]
    CacheNotInitialized { broker: BrokerId },

    #[error(
        "ledger invariant violated for order {logical_order_id} on {broker}: exit quantity {exit_quantity} exceeds entry filled quantity {entry_quantity}"
    )]
    LedgerInvariantViolation {
        logical_order_id: i64,
        broker: BrokerId,
        entry_quantity: i64,
        exit_quantity: i64,
    },

    #[error("unknown status code {code:?} for broker {broker}")]
    UnknownStatusCode { broker: BrokerId, code: String },

    #[error("circuit breaker open for broker {broker}")]
    CircuitOpen { broker: BrokerId },

    #[error("ledger record {record_id} not found")]
    RecordNotFound { record_id: i64 },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage lock poisoned")]
    LockPoisoned,
}

impl CoreError {
    /// Kind of the underlying broker failure, looking through `RetryExhausted`
    pub fn broker_kind(&self) -> Option<ErrorKind> {
        match self {
            CoreError::BrokerAdapter(e) => Some(e.kind),
            CoreError::RetryExhausted { source, .. } => source.broker_kind(),
            _ => None,
        }
    }

    /// A write refused by a table constraint, e.g. a broker order id that is
    /// already recorded
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            CoreError::Storage(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }

    /// Strip a `RetryExhausted` wrapper, returning the original failure
    pub fn root_cause(&self) -> &CoreError {
        match self {
            CoreError::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
