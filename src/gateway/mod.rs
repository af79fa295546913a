//! Exchange Gateway interface
//!
//! The engine talks to a venue only through `ExchangeGateway`: market data,
//! account state, order submission and order status. Wire protocols and
//! authentication live behind implementations of this trait.
//!
//! `replay::ReplayGateway` is a simulated venue driven by historical candles.

pub mod replay;

pub use replay::ReplayGateway;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::{Candle, Direction, Money, OrderSide, Symbol};

/// 24h rolling statistics for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker24h {
    pub symbol: Symbol,
    pub last_price: f64,
    /// 24h notional volume in the quote currency (USDT)
    pub quote_volume: f64,
    pub timestamp: DateTime<Utc>,
}

/// Market order as sent to the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client order id, echoed back by the venue
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub quantity: f64,
    /// Protective stop, passed through when the venue supports it
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
}

/// Lifecycle state of a submitted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Filled { quantity: f64, avg_price: f64 },
    Rejected { reason: String },
}

/// Venue acknowledgement of a submission or status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub state: OrderState,
    pub timestamp: DateTime<Utc>,
}

/// Open position as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub symbol: Symbol,
    pub direction: Direction,
    pub quantity: f64,
    pub entry_price: f64,
}

/// Account snapshot used for restart and ambiguous-fill reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueAccount {
    pub equity: Money,
    pub positions: Vec<VenuePosition>,
}

/// Everything the engine needs from an exchange
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Venue clock; the engine's notion of "now"
    async fn server_time(&self) -> Result<DateTime<Utc>, GatewayError>;

    /// Tradable symbols
    async fn list_symbols(&self) -> Result<Vec<Symbol>, GatewayError>;

    /// Most recent `limit` closed candles, oldest first
    async fn fetch_candles(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError>;

    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<Ticker24h, GatewayError>;

    async fn fetch_account(&self) -> Result<VenueAccount, GatewayError>;

    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError>;

    async fn order_status(&self, symbol: &Symbol, order_id: &str)
        -> Result<OrderAck, GatewayError>;

    /// Venue name for logging
    fn name(&self) -> &'static str;
}

/// Bound a gateway call by `duration`
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(duration)),
    }
}
