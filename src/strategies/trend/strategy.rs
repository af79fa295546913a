//! Trend Following Strategy Implementation

use crate::strategies::{RiskProfile, Strategy};
use crate::{AccountState, Direction, PairMetrics, Regime, Signal, StrategyKind};

use super::config::TrendConfig;

/// Long-biased trend follower with pyramiding
pub struct TrendStrategy {
    config: TrendConfig,
}

impl TrendStrategy {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    /// Price above fast EMA above slow EMA, with enough directional strength
    fn is_bullish_trend(&self, pair: &PairMetrics) -> bool {
        let ind = &pair.indicators;
        pair.price > ind.ema_fast && ind.ema_fast > ind.ema_slow && ind.adx >= self.config.min_adx
    }

    /// Trend broken: price lost the slow EMA or the averages crossed down
    fn is_trend_broken(&self, pair: &PairMetrics) -> bool {
        let ind = &pair.indicators;
        pair.price < ind.ema_slow || ind.ema_fast < ind.ema_slow
    }
}

impl Strategy for TrendStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Trend
    }

    fn decide(&self, regime: Regime, pair: &PairMetrics, account: &AccountState) -> Signal {
        let kind = self.kind();

        match account.position(&pair.symbol) {
            Some(position) if position.strategy == kind => {
                if self.is_trend_broken(pair) {
                    return Signal::close(pair, kind);
                }

                // Adds are fresh exposure: only while our regime is live
                let can_add = regime == Regime::Trending
                    && position.direction == Direction::Long
                    && position.adds < self.config.max_adds
                    && position.return_pct(pair.price) >= self.config.pyramid_step_pct
                    && self.is_bullish_trend(pair);

                if can_add {
                    Signal::add(pair, Direction::Long, self.config.add_fraction, kind)
                } else {
                    Signal::hold(pair, kind)
                }
            }
            Some(_) => Signal::hold(pair, kind),
            None => {
                if regime == Regime::Trending && self.is_bullish_trend(pair) {
                    Signal::open(pair, Direction::Long, self.config.size_fraction, kind)
                } else {
                    Signal::hold(pair, kind)
                }
            }
        }
    }

    fn risk_profile(&self, base_stop_pct: f64) -> RiskProfile {
        RiskProfile {
            stop_loss_pct: base_stop_pct * self.config.stop_multiplier,
            take_profit_pct: Some(self.config.take_profit_pct),
            trailing_stop_pct: Some(self.config.trailing_stop_pct),
            max_hold: None,
            max_adds: self.config.max_adds,
        }
    }
}
