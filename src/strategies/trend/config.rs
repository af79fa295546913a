//! Trend Strategy Configuration

use serde::{Deserialize, Serialize};

/// Configuration for the Trend strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendConfig {
    /// Minimum pair ADX for a fresh entry (default: 25)
    #[serde(default = "default_min_adx")]
    pub min_adx: f64,

    /// Equity fraction for the initial entry (default: 0.10)
    #[serde(default = "default_size_fraction")]
    pub size_fraction: f64,

    /// Equity fraction for each pyramid add (default: 0.05)
    #[serde(default = "default_add_fraction")]
    pub add_fraction: f64,

    /// Unrealized profit (percent) required before each add (default: 1.0)
    #[serde(default = "default_pyramid_step_pct")]
    pub pyramid_step_pct: f64,

    /// Maximum adds per position (default: 2)
    #[serde(default = "default_max_adds")]
    pub max_adds: u32,

    /// Multiplier on the base stop distance (default: 1.0)
    #[serde(default = "default_stop_multiplier")]
    pub stop_multiplier: f64,

    /// Take profit in percent (default: 4.5)
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    /// Trailing stop distance in percent (default: 2.0)
    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: f64,
}

fn default_min_adx() -> f64 { 25.0 }
fn default_size_fraction() -> f64 { 0.10 }
fn default_add_fraction() -> f64 { 0.05 }
fn default_pyramid_step_pct() -> f64 { 1.0 }
fn default_max_adds() -> u32 { 2 }
fn default_stop_multiplier() -> f64 { 1.0 }
fn default_take_profit_pct() -> f64 { 4.5 }
fn default_trailing_stop_pct() -> f64 { 2.0 }

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            min_adx: default_min_adx(),
            size_fraction: default_size_fraction(),
            add_fraction: default_add_fraction(),
            pyramid_step_pct: default_pyramid_step_pct(),
            max_adds: default_max_adds(),
            stop_multiplier: default_stop_multiplier(),
            take_profit_pct: default_take_profit_pct(),
            trailing_stop_pct: default_trailing_stop_pct(),
        }
    }
}
