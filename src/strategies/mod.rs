//! Trading Strategies Module
//!
//! Three interchangeable strategies, one per regime:
//! - `trend`: long-biased trend following with pyramiding (TRENDING)
//! - `scalp`: Bollinger/RSI mean reversion with a tight profile (RANGING)
//! - `protective`: short-or-flat only (DUMPING)
//!
//! All of them implement the same `Strategy` trait. `StrategySet` holds one
//! of each and hands out the one a `StrategyKind` names.

pub mod protective;
pub mod scalp;
pub mod trend;

pub use protective::{ProtectiveConfig, ProtectiveStrategy};
pub use scalp::{ScalpConfig, ScalpStrategy};
pub use trend::{TrendConfig, TrendStrategy};

use chrono::Duration;

use crate::config::StrategiesConfig;
use crate::{AccountState, PairMetrics, Regime, Signal, StrategyKind};

// =============================================================================
// Strategy Trait - The contract all strategies must implement
// =============================================================================

/// Trading strategy trait.
///
/// `decide` is a pure function of its inputs and is called concurrently
/// across pairs, so implementations hold configuration only.
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Produce a signal for one pair.
    ///
    /// Called for pairs without a position while this strategy is active, and
    /// for pairs whose open position this strategy owns regardless of regime.
    fn decide(&self, regime: Regime, pair: &PairMetrics, account: &AccountState) -> Signal;

    /// Stop/target/hold parameters the risk manager attaches to this
    /// strategy's positions, derived from the configured base stop distance
    fn risk_profile(&self, base_stop_pct: f64) -> RiskProfile;

    fn name(&self) -> &'static str {
        self.kind().as_str()
    }
}

/// Exit parameters for positions opened by one strategy
#[derive(Debug, Clone, PartialEq)]
pub struct RiskProfile {
    pub stop_loss_pct: f64,
    pub take_profit_pct: Option<f64>,
    pub trailing_stop_pct: Option<f64>,
    pub max_hold: Option<Duration>,
    /// Pyramid adds allowed on top of the initial entry
    pub max_adds: u32,
}

impl RiskProfile {
    /// Plain fixed stop, nothing else
    pub fn stop_only(stop_loss_pct: f64) -> Self {
        RiskProfile {
            stop_loss_pct,
            take_profit_pct: None,
            trailing_stop_pct: None,
            max_hold: None,
            max_adds: 0,
        }
    }
}

// =============================================================================
// Strategy Set
// =============================================================================

/// One instance of each strategy, selected by tag
pub struct StrategySet {
    trend: TrendStrategy,
    scalp: ScalpStrategy,
    protective: ProtectiveStrategy,
}

impl StrategySet {
    pub fn new(config: &StrategiesConfig) -> Self {
        Self {
            trend: TrendStrategy::new(config.trend.clone()),
            scalp: ScalpStrategy::new(config.scalp.clone()),
            protective: ProtectiveStrategy::new(config.protective.clone()),
        }
    }

    pub fn get(&self, kind: StrategyKind) -> &dyn Strategy {
        match kind {
            StrategyKind::Trend => &self.trend,
            StrategyKind::Scalp => &self.scalp,
            StrategyKind::Protective => &self.protective,
        }
    }

    /// Strategy that is live while `regime` holds
    pub fn for_regime(&self, regime: Regime) -> &dyn Strategy {
        self.get(StrategyKind::for_regime(regime))
    }

    /// Risk profiles for every strategy, in `StrategyKind::ALL` order
    pub fn risk_profiles(&self, base_stop_pct: f64) -> Vec<(StrategyKind, RiskProfile)> {
        StrategyKind::ALL
            .iter()
            .map(|&kind| (kind, self.get(kind).risk_profile(base_stop_pct)))
            .collect()
    }
}

impl Default for StrategySet {
    fn default() -> Self {
        Self::new(&StrategiesConfig::default())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::{
        AccountState, Direction, Money, PairIndicators, PairMetrics, Position, StrategyKind,
        Symbol,
    };
    use chrono::{DateTime, TimeZone, Utc};

    pub fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    pub fn pair(symbol: &str, price: f64, indicators: PairIndicators) -> PairMetrics {
        PairMetrics {
            symbol: Symbol::new(symbol),
            quote_volume_24h: 150_000_000.0,
            volatility: 1.2,
            liquid: true,
            price,
            indicators,
            timestamp: now(),
        }
    }

    pub fn flat_account() -> AccountState {
        AccountState::new(Money::from_f64(10_000.0), now())
    }

    pub fn account_with(
        symbol: &str,
        direction: Direction,
        entry_price: f64,
        strategy: StrategyKind,
        adds: u32,
    ) -> AccountState {
        let mut account = flat_account();
        account.open_positions.insert(
            Symbol::new(symbol),
            Position {
                symbol: Symbol::new(symbol),
                direction,
                entry_price,
                quantity: 1.0,
                opened_at: now(),
                strategy,
                stop_price: entry_price * 0.985,
                target_price: None,
                trailing_stop_pct: None,
                best_price: entry_price,
                adds,
                max_hold_until: None,
            },
        );
        account
    }
}
