//! Protective Strategy
//!
//! Active while the market is DUMPING. Emits short or flat signals only: its
//! action type has no long variant, so a long cannot be constructed here.
//!
//! ## Entry Logic (Short)
//! 1. Price below the slow EMA, fast EMA below the slow EMA
//! 2. RSI at or above `rsi_floor` (no shorting into capitulation)
//!
//! ## Exit Logic
//! Price reclaims the fast EMA, or stop/target/max hold.

mod config;
mod strategy;

pub use config::ProtectiveConfig;
pub use strategy::ProtectiveStrategy;
