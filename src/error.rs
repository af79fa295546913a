//! Error taxonomy for the trading engine
//!
//! Recoverable per-cycle failures (`DataUnavailable`, `OrderRejected`,
//! `AmbiguousFill`) are handled locally by the engine; only configuration
//! errors are fatal.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::Symbol;

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    MissingEnv { var: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Failures reported by (or while talking to) the exchange gateway
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("order rejected by venue: {0}")]
    Rejected(String),

    #[error("gateway call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(Symbol),

    #[error("unknown order: {0}")]
    UnknownOrder(String),
}

/// Reasons the risk manager declines a signal
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RiskRejection {
    #[error("circuit breaker active until {until}")]
    CircuitBreakerActive { until: DateTime<Utc> },

    #[error("capacity exceeded: {open} open positions, max {max}")]
    CapacityExceeded { open: usize, max: usize },

    #[error("position already open for {0}")]
    PositionExists(Symbol),

    #[error("no open position for {0}")]
    NoOpenPosition(Symbol),

    #[error("order already pending for {0}")]
    PendingOrder(Symbol),

    #[error("pyramid limit reached: {adds} adds, max {max}")]
    PyramidLimit { adds: u32, max: u32 },

    #[error("signal direction does not match the open position or its owner")]
    DirectionMismatch,

    #[error("order notional {notional:.2} below minimum {minimum:.2}")]
    BelowMinimumSize { notional: f64, minimum: f64 },

    #[error("invalid reference price {0}")]
    InvalidPrice(f64),

    #[error("signal is not actionable")]
    NotActionable,
}

/// Engine-level error taxonomy
#[derive(Debug, Error)]
pub enum EngineError {
    /// Market data missing for a cycle; affected symbols are skipped
    #[error("data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: Symbol, reason: String },

    /// Venue declined an order; no retry within the same cycle
    #[error("order {order_id} rejected for {symbol}: {reason}")]
    OrderRejected {
        order_id: String,
        symbol: Symbol,
        reason: String,
    },

    /// Submission outcome unknown; account state must be reconciled
    #[error("ambiguous fill for order {order_id} on {symbol}; reconciliation required")]
    AmbiguousFill { order_id: String, symbol: Symbol },

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("state persistence failed: {0}")]
    State(#[source] anyhow::Error),
}

impl EngineError {
    pub fn data_unavailable(symbol: &Symbol, reason: impl ToString) -> Self {
        EngineError::DataUnavailable {
            symbol: symbol.clone(),
            reason: reason.to_string(),
        }
    }

    /// Data failure not tied to one symbol (venue clock, account, listing)
    pub fn venue_unavailable(reason: impl ToString) -> Self {
        EngineError::DataUnavailable {
            symbol: Symbol::new("*"),
            reason: reason.to_string(),
        }
    }

    /// Only configuration errors stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Configuration(_))
    }
}
