//! Scalp Strategy Implementation

use chrono::Duration;

use crate::strategies::{RiskProfile, Strategy};
use crate::{AccountState, Direction, PairMetrics, Position, Regime, Signal, StrategyKind};

use super::config::ScalpConfig;

/// Candidate mean-reversion entry with its quality score
#[derive(Debug, Clone, Copy, PartialEq)]
struct Setup {
    direction: Direction,
    score: u32,
}

/// Bollinger Band + RSI mean reversion scalper
pub struct ScalpStrategy {
    config: ScalpConfig,
}

impl ScalpStrategy {
    pub fn new(config: ScalpConfig) -> Self {
        Self { config }
    }

    fn find_setup(&self, pair: &PairMetrics) -> Option<Setup> {
        let ind = &pair.indicators;
        let cfg = &self.config;

        if pair.price <= ind.bb_lower && ind.rsi < cfg.rsi_oversold {
            let bonus = if ind.rsi < cfg.rsi_extreme_low { cfg.extreme_bonus } else { 0 };
            return Some(Setup {
                direction: Direction::Long,
                score: cfg.base_score + bonus,
            });
        }

        if cfg.allow_short && pair.price >= ind.bb_upper && ind.rsi > cfg.rsi_overbought {
            let bonus = if ind.rsi > cfg.rsi_extreme_high { cfg.extreme_bonus } else { 0 };
            return Some(Setup {
                direction: Direction::Short,
                score: cfg.base_score + bonus,
            });
        }

        None
    }

    /// Price reverted through the middle band
    fn has_reverted(&self, position: &Position, pair: &PairMetrics) -> bool {
        let middle = pair.indicators.bb_middle;
        match position.direction {
            Direction::Long => pair.price >= middle,
            Direction::Short => pair.price <= middle,
            Direction::Flat => false,
        }
    }
}

impl Strategy for ScalpStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Scalp
    }

    fn decide(&self, regime: Regime, pair: &PairMetrics, account: &AccountState) -> Signal {
        let kind = self.kind();

        match account.position(&pair.symbol) {
            Some(position) if position.strategy == kind => {
                if self.has_reverted(position, pair) {
                    Signal::close(pair, kind)
                } else {
                    Signal::hold(pair, kind)
                }
            }
            Some(_) => Signal::hold(pair, kind),
            None => {
                if regime != Regime::Ranging || (self.config.require_liquid && !pair.liquid) {
                    return Signal::hold(pair, kind);
                }

                match self.find_setup(pair) {
                    Some(setup) if setup.score >= self.config.min_score => {
                        tracing::debug!(
                            symbol = %pair.symbol,
                            direction = %setup.direction,
                            score = setup.score,
                            rsi = format!("{:.1}", pair.indicators.rsi),
                            "Scalp setup"
                        );
                        Signal::open(pair, setup.direction, self.config.size_fraction, kind)
                    }
                    _ => Signal::hold(pair, kind),
                }
            }
        }
    }

    fn risk_profile(&self, base_stop_pct: f64) -> RiskProfile {
        RiskProfile {
            stop_loss_pct: base_stop_pct * self.config.stop_multiplier,
            take_profit_pct: Some(self.config.take_profit_pct),
            trailing_stop_pct: None,
            max_hold: Some(Duration::minutes(self.config.max_hold_minutes)),
            max_adds: 0,
        }
    }
}
