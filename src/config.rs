//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable support for API credentials and the dry-run flag.
//!
//! Every section carries defaults, so an absent file (or an absent section)
//! yields the stock parameters: 10 max open positions, 1.5% stop loss,
//! 3% daily profit target (reporting only) and a 50M USDT volume floor.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::indicators::{pair_warmup, regime_warmup};
use crate::strategies::{ProtectiveConfig, ScalpConfig, TrendConfig};
use crate::Symbol;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub trading: TradingConfig,
    pub regime: RegimeConfig,
    pub scanner: ScannerConfig,
    pub strategies: StrategiesConfig,
    pub state: StateConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref()).map_err(ConfigError::ReadFile)?;
        serde_json::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Load from an optional file, overlay the process environment, validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `API_KEY`, `API_SECRET` and `DRY_RUN` from the given lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(api_key) = lookup("API_KEY").filter(|v| !v.trim().is_empty()) {
            self.exchange.api_key = Some(api_key);
        }
        if let Some(api_secret) = lookup("API_SECRET").filter(|v| !v.trim().is_empty()) {
            self.exchange.api_secret = Some(api_secret);
        }
        if let Some(raw) = lookup("DRY_RUN") {
            self.exchange.dry_run = parse_bool_flag(&raw).ok_or(ConfigError::InvalidValue {
                field: "DRY_RUN",
                reason: format!("expected 'true' or 'false', got '{}'", raw),
            })?;
        }
        Ok(())
    }

    /// Reject parameter combinations the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.exchange.dry_run {
            if self.exchange.api_key.is_none() {
                return Err(ConfigError::MissingEnv { var: "API_KEY" });
            }
            if self.exchange.api_secret.is_none() {
                return Err(ConfigError::MissingEnv { var: "API_SECRET" });
            }
        }

        let t = &self.trading;
        if t.max_open_positions == 0 {
            return Err(invalid("MAX_OPEN_POSITIONS", "must be at least 1"));
        }
        positive("STOP_LOSS_PCT", t.stop_loss_pct)?;
        positive("DAILY_PROFIT_TARGET_PCT", t.daily_profit_target_pct)?;
        positive("daily_loss_limit_pct", t.daily_loss_limit_pct)?;
        positive("starting_equity", t.starting_equity)?;
        positive("max_position_fraction", t.max_position_fraction)?;
        if t.min_volume.is_nan() || t.min_volume < 0.0 {
            return Err(invalid("MIN_VOLUME", "must be >= 0"));
        }
        if t.leverage < 1.0 {
            return Err(invalid("leverage", "must be >= 1"));
        }
        if t.circuit_breaker_hours <= 0 {
            return Err(invalid("circuit_breaker_hours", "must be positive"));
        }

        let r = &self.regime;
        if r.reference_symbol.trim().is_empty() {
            return Err(invalid("regime.reference_symbol", "must not be empty"));
        }
        if r.ranging_adx > r.trending_adx {
            return Err(invalid(
                "regime.ranging_adx",
                "must not exceed regime.trending_adx",
            ));
        }
        if r.interval_secs == 0 || r.ema_period == 0 || r.adx_period == 0 || r.volume_window < 2
        {
            return Err(invalid("regime", "periods and interval must be positive"));
        }
        let warmup = regime_warmup(r);
        if r.lookback < warmup {
            return Err(ConfigError::InvalidValue {
                field: "regime.lookback",
                reason: format!("{} candles cannot cover the {}-candle warmup", r.lookback, warmup),
            });
        }

        let s = &self.scanner;
        if s.interval_secs == 0 || s.max_workers == 0 {
            return Err(invalid("scanner", "interval and max_workers must be positive"));
        }
        if s.symbol_timeout_ms == 0 || s.cycle_budget_ms == 0 {
            return Err(invalid("scanner", "timeouts must be positive"));
        }
        if [s.ema_fast, s.adx_period, s.rsi_period, s.bb_period, s.atr_period].contains(&0) {
            return Err(invalid("scanner", "indicator periods must be positive"));
        }
        positive("scanner.bb_std", s.bb_std)?;
        if s.ema_fast >= s.ema_slow {
            return Err(invalid("scanner.ema_fast", "must be shorter than ema_slow"));
        }
        let warmup = pair_warmup(s);
        if s.lookback < warmup {
            return Err(ConfigError::InvalidValue {
                field: "scanner.lookback",
                reason: format!("{} candles cannot cover the {}-candle warmup", s.lookback, warmup),
            });
        }

        if self.exchange.request_timeout_secs == 0 || self.exchange.order_timeout_secs == 0 {
            return Err(invalid("exchange", "timeouts must be positive"));
        }

        Ok(())
    }

    pub fn regime_interval(&self) -> Duration {
        Duration::from_secs(self.regime.interval_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scanner.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange.request_timeout_secs)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange.order_timeout_secs)
    }
}

fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(invalid(field, "must be a positive number"))
    }
}

/// Exchange gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(skip_serializing)]
    pub api_secret: Option<String>,
    /// Simulate fills locally; orders never reach the gateway
    pub dry_run: bool,
    pub request_timeout_secs: u64,
    pub order_timeout_secs: u64,
    /// How many times a pending order ack is polled before it is treated as ambiguous
    pub order_status_polls: u32,
    pub taker_fee: f64,
    /// Directory with `{SYMBOL}_{interval}.csv` files for the replay venue
    pub data_dir: String,
    /// Replay clock speed relative to wall time
    pub replay_speed: f64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            api_key: None,
            api_secret: None,
            dry_run: true,
            request_timeout_secs: 10,
            order_timeout_secs: 15,
            order_status_polls: 3,
            taker_fee: 0.0004, // 0.04%
            data_dir: "data".to_string(),
            replay_speed: 60.0,
        }
    }
}

/// Trading and risk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Symbols to scan; empty means every symbol the gateway lists
    pub universe: Vec<String>,
    pub max_open_positions: usize,
    /// Reporting target only, never halts trading
    pub daily_profit_target_pct: f64,
    /// Base stop distance; strategies widen or narrow it
    pub stop_loss_pct: f64,
    /// Minimum 24h notional volume in USDT
    pub min_volume: f64,
    /// 24h notional volume above which a pair counts as deeply liquid
    pub liquid_volume: f64,
    pub daily_loss_limit_pct: f64,
    pub circuit_breaker_hours: i64,
    pub leverage: f64,
    pub max_position_fraction: f64,
    pub min_notional: f64,
    /// Equity used when neither a checkpoint nor the venue provides one
    pub starting_equity: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            universe: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
                "BNBUSDT".to_string(),
                "XRPUSDT".to_string(),
            ],
            max_open_positions: 10,
            daily_profit_target_pct: 3.0,
            stop_loss_pct: 1.5,
            min_volume: 50_000_000.0,
            liquid_volume: 100_000_000.0,
            daily_loss_limit_pct: 1.0,
            circuit_breaker_hours: 24,
            leverage: 1.0,
            max_position_fraction: 0.25,
            min_notional: 6.0,
            starting_equity: 10_000.0,
        }
    }
}

impl TradingConfig {
    pub fn symbols(&self) -> Vec<Symbol> {
        self.universe.iter().map(Symbol::new).collect()
    }
}

/// Regime classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Market proxy the regime is classified on
    pub reference_symbol: String,
    pub timeframe: String,
    /// Candles fetched per classification
    pub lookback: usize,
    pub adx_period: usize,
    pub ema_period: usize,
    /// ADX strictly above this (with price above the EMA) is TRENDING
    pub trending_adx: f64,
    /// ADX strictly below this is RANGING
    pub ranging_adx: f64,
    pub volume_window: usize,
    /// Volume coefficient of variation above which volume counts as choppy
    pub choppy_volume_cv: f64,
    /// Choppy volume also requires less than this net move over the window
    pub choppy_max_displacement_pct: f64,
    pub interval_secs: u64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        RegimeConfig {
            reference_symbol: "BTCUSDT".to_string(),
            timeframe: "1h".to_string(),
            lookback: 250,
            adx_period: 14,
            ema_period: 200,
            trending_adx: 25.0,
            ranging_adx: 20.0,
            volume_window: 20,
            choppy_volume_cv: 0.5,
            choppy_max_displacement_pct: 1.0,
            interval_secs: 300,
        }
    }
}

/// Pair scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub timeframe: String,
    pub lookback: usize,
    pub max_workers: usize,
    pub symbol_timeout_ms: u64,
    /// Time budget for the whole fan-out; laggards are abandoned
    pub cycle_budget_ms: u64,
    pub interval_secs: u64,
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub adx_period: usize,
    pub rsi_period: usize,
    pub bb_period: usize,
    pub bb_std: f64,
    pub atr_period: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            timeframe: "5m".to_string(),
            lookback: 120,
            max_workers: 64,
            symbol_timeout_ms: 5_000,
            cycle_budget_ms: 20_000,
            interval_secs: 60,
            ema_fast: 20,
            ema_slow: 50,
            adx_period: 14,
            rsi_period: 14,
            bb_period: 20,
            bb_std: 2.0,
            atr_period: 14,
        }
    }
}

impl ScannerConfig {
    pub fn symbol_timeout(&self) -> Duration {
        Duration::from_millis(self.symbol_timeout_ms)
    }

    pub fn cycle_budget(&self) -> Duration {
        Duration::from_millis(self.cycle_budget_ms)
    }
}

/// Per-strategy parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategiesConfig {
    pub trend: TrendConfig,
    pub scalp: ScalpConfig,
    pub protective: ProtectiveConfig,
}

/// State persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub enabled: bool,
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            enabled: true,
            db_path: "state/trader.db".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_documented_parameters() {
        let config = Config::default();
        assert_eq!(config.trading.max_open_positions, 10);
        assert_eq!(config.trading.daily_profit_target_pct, 3.0);
        assert_eq!(config.trading.stop_loss_pct, 1.5);
        assert_eq!(config.trading.min_volume, 50_000_000.0);
        assert!(config.exchange.dry_run);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let json = r#"{ "trading": { "max_open_positions": 4 }, "regime": { "interval_secs": 120 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.trading.max_open_positions, 4);
        assert_eq!(config.trading.stop_loss_pct, 1.5);
        assert_eq!(config.regime.interval_secs, 120);
        assert_eq!(config.regime.ema_period, 200);
    }

    #[test]
    fn test_env_overlay_sets_credentials_and_mode() {
        let mut config = Config::default();
        config
            .apply_env(lookup(&[
                ("API_KEY", "key"),
                ("API_SECRET", "secret"),
                ("DRY_RUN", "FALSE"),
            ]))
            .unwrap();

        assert_eq!(config.exchange.api_key.as_deref(), Some("key"));
        assert!(!config.exchange.dry_run);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_dry_run_value_is_rejected() {
        let mut config = Config::default();
        let err = config.apply_env(lookup(&[("DRY_RUN", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "DRY_RUN", .. }));
    }

    #[test]
    fn test_live_mode_requires_credentials() {
        let mut config = Config::default();
        config
            .apply_env(lookup(&[("DRY_RUN", "false"), ("API_KEY", "key")]))
            .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv { var: "API_SECRET" }));
    }

    #[test]
    fn test_validation_rejects_bad_parameters() {
        let mut config = Config::default();
        config.trading.max_open_positions = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.regime.ranging_adx = 30.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trading.stop_loss_pct = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_scanner_periods() {
        let zeroed: [fn(&mut ScannerConfig); 5] = [
            |s| s.ema_fast = 0,
            |s| s.adx_period = 0,
            |s| s.rsi_period = 0,
            |s| s.bb_period = 0,
            |s| s.atr_period = 0,
        ];
        for zero in zeroed {
            let mut config = Config::default();
            zero(&mut config.scanner);
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidValue { field: "scanner", .. })
            ));
        }
    }

    #[test]
    fn test_validation_requires_lookback_to_cover_warmup() {
        let mut config = Config::default();
        config.regime.lookback = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "regime.lookback", .. })
        ));

        let mut config = Config::default();
        config.scanner.lookback = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "scanner.lookback", .. })
        ));

        // Exactly the warmup is enough
        let mut config = Config::default();
        config.regime.lookback = regime_warmup(&config.regime);
        config.scanner.lookback = pair_warmup(&config.scanner);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_credentials_are_not_serialized() {
        let mut config = Config::default();
        config.exchange.api_secret = Some("secret".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("api_secret"));
    }
}
