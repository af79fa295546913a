//! Protective Strategy Configuration

use serde::{Deserialize, Serialize};

/// Configuration for the Protective strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectiveConfig {
    /// When false the strategy only ever stays flat
    pub allow_short: bool,
    pub size_fraction: f64,
    /// Skip new shorts once RSI is below this
    pub rsi_floor: f64,
    /// Multiplier on the base stop distance
    pub stop_multiplier: f64,
    pub take_profit_pct: f64,
    pub max_hold_minutes: i64,
}

impl Default for ProtectiveConfig {
    fn default() -> Self {
        ProtectiveConfig {
            allow_short: true,
            size_fraction: 0.05,
            rsi_floor: 25.0,
            stop_multiplier: 1.0,
            take_profit_pct: 3.0,
            max_hold_minutes: 240,
        }
    }
}
