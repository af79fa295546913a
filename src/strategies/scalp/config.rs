//! Scalp Strategy Configuration

use serde::{Deserialize, Serialize};

/// Configuration for the Scalp strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalpConfig {
    /// RSI below this qualifies a long setup
    pub rsi_oversold: f64,
    /// RSI above this qualifies a short setup
    pub rsi_overbought: f64,
    /// RSI below this earns the extreme bonus on longs
    pub rsi_extreme_low: f64,
    /// RSI above this earns the extreme bonus on shorts
    pub rsi_extreme_high: f64,
    pub base_score: u32,
    pub extreme_bonus: u32,
    pub min_score: u32,
    pub size_fraction: f64,
    pub allow_short: bool,
    /// Only trade pairs flagged as deeply liquid
    pub require_liquid: bool,
    /// Multiplier on the base stop distance
    pub stop_multiplier: f64,
    pub take_profit_pct: f64,
    pub max_hold_minutes: i64,
}

impl Default for ScalpConfig {
    fn default() -> Self {
        ScalpConfig {
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            rsi_extreme_low: 25.0,
            rsi_extreme_high: 75.0,
            base_score: 85,
            extreme_bonus: 10,
            min_score: 85,
            size_fraction: 0.05,
            allow_short: true,
            require_liquid: true,
            stop_multiplier: 0.3,
            take_profit_pct: 0.6,
            max_hold_minutes: 15,
        }
    }
}
