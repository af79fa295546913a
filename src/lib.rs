//! Regime Trader
//!
//! A regime-aware crypto futures trading engine. A classifier labels the
//! market TRENDING, RANGING or DUMPING from the reference asset, a concurrent
//! scanner ranks liquid pairs, and one of three strategies (trend following
//! with pyramiding, mean-reversion scalping, short-or-flat protection)
//! proposes signals. Every signal passes a single risk gate that owns the
//! account: position capacity, compounding position sizing, per-strategy
//! stops and a daily-loss circuit breaker.
//!
//! The venue is reached only through [`gateway::ExchangeGateway`];
//! [`gateway::ReplayGateway`] replays historical CSV candles.
//!
//! ```no_run
//! use std::sync::Arc;
//! use regime_trader::{engine::TradingEngine, gateway::ReplayGateway, Config, Money, Symbol};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let symbols: Vec<Symbol> = config.trading.symbols();
//!     let gateway = ReplayGateway::from_data_dir("data", &symbols, &["5m", "1h"], Money::from_f64(10_000.0))?;
//!     let mut engine = TradingEngine::new(config, Arc::new(gateway));
//!     engine.recover().await?;
//!     engine.classify_regime().await?;
//!     let report = engine.run_cycle().await?;
//!     println!("{} signals approved", report.approved);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod data;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod indicators;
pub mod regime;
pub mod risk;
pub mod scanner;
pub mod state_manager;
pub mod strategies;
pub mod types;

pub use config::Config;
pub use error::{ConfigError, EngineError, GatewayError, RiskRejection};
pub use types::*;
