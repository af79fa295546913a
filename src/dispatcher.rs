//! Strategy Dispatcher
//!
//! State machine mirroring the regime. Regime changes do not force-close
//! anything: a symbol with an open position keeps being managed by the
//! strategy that opened it, while fresh exposure only ever comes from the
//! strategy of the active regime.

use chrono::{DateTime, Utc};
use rayon::prelude::*;

use crate::regime::RegimeTransition;
use crate::strategies::StrategySet;
use crate::{AccountState, PairMetrics, Regime, Signal, StrategyKind};

/// Regime change as seen by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTransition {
    pub from: Option<Regime>,
    pub to: Regime,
    pub at: DateTime<Utc>,
}

pub struct StrategyDispatcher {
    strategies: StrategySet,
    regime: Option<Regime>,
}

impl StrategyDispatcher {
    pub fn new(strategies: StrategySet) -> Self {
        Self {
            strategies,
            regime: None,
        }
    }

    pub fn regime(&self) -> Option<Regime> {
        self.regime
    }

    /// Strategy allowed to open fresh exposure right now
    pub fn active(&self) -> Option<StrategyKind> {
        self.regime.map(StrategyKind::for_regime)
    }

    pub fn strategies(&self) -> &StrategySet {
        &self.strategies
    }

    /// The only state mutation. Returns the transition when the label changes.
    pub fn on_regime(&mut self, regime: Regime, at: DateTime<Utc>) -> Option<DispatchTransition> {
        if self.regime == Some(regime) {
            return None;
        }
        let transition = DispatchTransition {
            from: self.regime,
            to: regime,
            at,
        };
        self.regime = Some(regime);

        tracing::info!(
            from = ?transition.from,
            to = %regime,
            active = %StrategyKind::for_regime(regime),
            "Dispatcher switched active strategy"
        );
        Some(transition)
    }

    pub fn on_transition(&mut self, transition: &RegimeTransition) -> Option<DispatchTransition> {
        self.on_regime(transition.to, transition.at)
    }

    /// Route one pair to the right strategy. `None` before the first regime.
    pub fn dispatch(&self, pair: &PairMetrics, account: &AccountState) -> Option<Signal> {
        let regime = self.regime?;
        let active = StrategyKind::for_regime(regime);

        let owner = account
            .position(&pair.symbol)
            .map(|p| p.strategy)
            .unwrap_or(active);

        let signal = self.strategies.get(owner).decide(regime, pair, account);

        if signal.is_new_exposure() && signal.source != active {
            tracing::debug!(
                symbol = %signal.symbol,
                source = %signal.source,
                active = %active,
                "Fresh exposure from inactive strategy downgraded to hold"
            );
            return Some(signal.into_hold());
        }

        Some(signal)
    }

    /// Evaluate every candidate against one account snapshot, in parallel.
    /// Output order matches `pairs`.
    pub fn dispatch_all(&self, pairs: &[PairMetrics], account: &AccountState) -> Vec<Signal> {
        pairs
            .par_iter()
            .filter_map(|pair| self.dispatch(pair, account))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::{account_with, flat_account, now, pair};
    use crate::{Direction, PairIndicators, SignalIntent};

    fn bullish() -> PairIndicators {
        PairIndicators {
            ema_fast: 101.0,
            ema_slow: 99.0,
            adx: 32.0,
            rsi: 60.0,
            bb_upper: 110.0,
            bb_middle: 100.0,
            bb_lower: 90.0,
            atr_pct: 1.0,
        }
    }

    fn dispatcher() -> StrategyDispatcher {
        StrategyDispatcher::new(StrategySet::default())
    }

    #[test]
    fn test_no_signals_before_first_regime() {
        let d = dispatcher();
        assert!(d.dispatch(&pair("ETHUSDT", 102.0, bullish()), &flat_account()).is_none());
        assert!(d.active().is_none());
    }

    #[test]
    fn test_transitions_only_on_change() {
        let mut d = dispatcher();
        let first = d.on_regime(Regime::Trending, now()).unwrap();
        assert_eq!(first.from, None);
        assert!(d.on_regime(Regime::Trending, now()).is_none());

        let second = d.on_regime(Regime::Dumping, now()).unwrap();
        assert_eq!(second.from, Some(Regime::Trending));
        assert_eq!(d.active(), Some(StrategyKind::Protective));
    }

    #[test]
    fn test_new_symbols_go_to_active_strategy() {
        let mut d = dispatcher();
        d.on_regime(Regime::Trending, now());
        let signal = d.dispatch(&pair("ETHUSDT", 102.0, bullish()), &flat_account()).unwrap();
        assert_eq!(signal.source, StrategyKind::Trend);
        assert_eq!(signal.intent, SignalIntent::Open);
    }

    #[test]
    fn test_held_position_stays_with_owner_after_transition() {
        let mut d = dispatcher();
        d.on_regime(Regime::Dumping, now());

        // Trend opened ETH earlier; the trend then breaks
        let account = account_with("ETHUSDT", Direction::Long, 100.0, StrategyKind::Trend, 0);
        let broken = PairIndicators {
            ema_fast: 97.0,
            ..bullish()
        };
        let signal = d.dispatch(&pair("ETHUSDT", 96.0, broken), &account).unwrap();
        assert_eq!(signal.source, StrategyKind::Trend);
        assert_eq!(signal.intent, SignalIntent::Close);
    }

    #[test]
    fn test_inactive_owner_cannot_add() {
        let mut d = dispatcher();
        d.on_regime(Regime::Ranging, now());

        let account = account_with("ETHUSDT", Direction::Long, 98.0, StrategyKind::Trend, 0);
        let signal = d.dispatch(&pair("ETHUSDT", 102.0, bullish()), &account).unwrap();
        assert!(!signal.is_new_exposure());
    }

    #[test]
    fn test_dispatch_all_preserves_candidate_order() {
        let mut d = dispatcher();
        d.on_regime(Regime::Trending, now());
        let pairs: Vec<_> = ["AUSDT", "BUSDT", "CUSDT", "DUSDT", "EUSDT"]
            .iter()
            .map(|s| pair(s, 102.0, bullish()))
            .collect();

        let signals = d.dispatch_all(&pairs, &flat_account());
        let symbols: Vec<_> = signals.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AUSDT", "BUSDT", "CUSDT", "DUSDT", "EUSDT"]);
    }
}
