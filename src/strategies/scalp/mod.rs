//! Scalp Strategy
//!
//! Mean reversion inside a range, active while the market is RANGING.
//!
//! ## Entry Logic
//! - Long: price at or below the lower Bollinger Band with RSI oversold
//! - Short: price at or above the upper Bollinger Band with RSI overbought
//! - Setup score 85, +10 when RSI is at an extreme; below `min_score` holds
//! - Deeply liquid pairs only
//!
//! ## Exit Logic
//! Price reverting through the middle band, or the tight stop/target/max
//! hold the risk manager attaches (minutes, not hours).

mod config;
mod strategy;

pub use config::ScalpConfig;
pub use strategy::ScalpStrategy;
