//! Protective Strategy Implementation

use chrono::Duration;

use crate::strategies::{RiskProfile, Strategy};
use crate::{AccountState, Direction, PairMetrics, Regime, Signal, StrategyKind};

use super::config::ProtectiveConfig;

/// Everything this strategy can ask for. There is no long variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtectiveAction {
    Short,
    Close,
    Stay,
}

/// Short-or-flat strategy for falling markets
pub struct ProtectiveStrategy {
    config: ProtectiveConfig,
}

impl ProtectiveStrategy {
    pub fn new(config: ProtectiveConfig) -> Self {
        Self { config }
    }

    fn action(&self, regime: Regime, pair: &PairMetrics, account: &AccountState) -> ProtectiveAction {
        let ind = &pair.indicators;

        match account.position(&pair.symbol) {
            Some(position) if position.strategy == StrategyKind::Protective => {
                if position.direction == Direction::Short && pair.price > ind.ema_fast {
                    ProtectiveAction::Close
                } else {
                    ProtectiveAction::Stay
                }
            }
            Some(_) => ProtectiveAction::Stay,
            None => {
                let breakdown = pair.price < ind.ema_slow
                    && ind.ema_fast < ind.ema_slow
                    && ind.rsi >= self.config.rsi_floor;

                if regime == Regime::Dumping && self.config.allow_short && breakdown {
                    ProtectiveAction::Short
                } else {
                    ProtectiveAction::Stay
                }
            }
        }
    }
}

impl Strategy for ProtectiveStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Protective
    }

    fn decide(&self, regime: Regime, pair: &PairMetrics, account: &AccountState) -> Signal {
        let kind = self.kind();
        match self.action(regime, pair, account) {
            ProtectiveAction::Short => {
                Signal::open(pair, Direction::Short, self.config.size_fraction, kind)
            }
            ProtectiveAction::Close => Signal::close(pair, kind),
            ProtectiveAction::Stay => Signal::hold(pair, kind),
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
