//! Trend Following Strategy
//!
//! Active while the market is TRENDING.
//!
//! ## Entry Logic (Long only)
//! 1. Price above the fast EMA, fast EMA above the slow EMA
//! 2. ADX at or above `min_adx` on the scan timeframe
//!
//! ## Pyramiding
//! While the regime is still TRENDING and the held long is at least
//! `pyramid_step_pct` in profit, an additive signal is emitted, up to
//! `max_adds` per position.
//!
//! ## Exit Logic
//! 1. Price closes below the slow EMA, or the EMAs cross down
//! 2. Fixed stop, take profit and a ratcheting trailing stop (risk manager)

mod config;
mod strategy;

pub use config::TrendConfig;
pub use strategy::TrendStrategy;
