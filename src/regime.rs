//! Regime Classifier
//!
//! Labels the market TRENDING, RANGING or DUMPING from an indicator snapshot
//! of the reference asset. Rules are evaluated in precedence order, first
//! match wins:
//!
//! 1. price below EMA200 -> DUMPING
//! 2. ADX above the trending threshold (price above EMA200) -> TRENDING
//! 3. ADX below the ranging threshold, or choppy volume -> RANGING
//! 4. otherwise hold the previous regime (ADX hysteresis band)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::RegimeConfig;
use crate::{IndicatorSnapshot, Regime};

/// Pure, deterministic classifier
#[derive(Debug, Clone)]
pub struct RegimeClassifier {
    trending_adx: f64,
    ranging_adx: f64,
    choppy_volume_cv: f64,
    choppy_max_displacement_pct: f64,
}

impl RegimeClassifier {
    pub fn new(config: &RegimeConfig) -> Self {
        Self {
            trending_adx: config.trending_adx,
            ranging_adx: config.ranging_adx,
            choppy_volume_cv: config.choppy_volume_cv,
            choppy_max_displacement_pct: config.choppy_max_displacement_pct,
        }
    }

    /// Classify one snapshot. `previous` is only consulted inside the
    /// hysteresis band; with no previous regime the band resolves to RANGING.
    pub fn classify(&self, snapshot: &IndicatorSnapshot, previous: Option<Regime>) -> Regime {
        if snapshot.price < snapshot.ema200 {
            return Regime::Dumping;
        }

        if snapshot.adx > self.trending_adx && snapshot.price > snapshot.ema200 {
            return Regime::Trending;
        }

        if snapshot.adx < self.ranging_adx || self.is_choppy(snapshot) {
            return Regime::Ranging;
        }

        previous.unwrap_or(Regime::Ranging)
    }

    /// Volume oscillating without directional bias
    pub fn is_choppy(&self, snapshot: &IndicatorSnapshot) -> bool {
        snapshot.volume_cv > self.choppy_volume_cv
            && snapshot.net_displacement_pct < self.choppy_max_displacement_pct
    }
}

/// Published whenever a classification changes the regime label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeTransition {
    pub from: Option<Regime>,
    pub to: Regime,
    pub at: DateTime<Utc>,
    pub snapshot: IndicatorSnapshot,
}

/// Holds the current regime and publishes it on a watch channel
pub struct RegimeTracker {
    classifier: RegimeClassifier,
    current: Option<Regime>,
    tx: watch::Sender<Option<Regime>>,
}

impl RegimeTracker {
    pub fn new(classifier: RegimeClassifier) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            classifier,
            current: None,
            tx,
        }
    }

    /// Start from a regime restored from a checkpoint
    pub fn with_initial(classifier: RegimeClassifier, initial: Option<Regime>) -> Self {
        let mut tracker = Self::new(classifier);
        tracker.current = initial;
        tracker.tx.send_replace(initial);
        tracker
    }

    pub fn current(&self) -> Option<Regime> {
        self.current
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Regime>> {
        self.tx.subscribe()
    }

    /// Classify and record. Every change is returned; none are coalesced.
    pub fn update(&mut self, snapshot: &IndicatorSnapshot) -> Option<RegimeTransition> {
        let next = self.classifier.classify(snapshot, self.current);
        if self.current == Some(next) {
            return None;
        }

        let transition = RegimeTransition {
            from: self.current,
            to: next,
            at: snapshot.timestamp,
            snapshot: snapshot.clone(),
        };
        self.current = Some(next);
        self.tx.send_replace(Some(next));

        tracing::info!(
            from = ?transition.from,
            to = %next,
            adx = format!("{:.1}", snapshot.adx),
            price = snapshot.price,
            ema200 = format!("{:.2}", snapshot.ema200),
            "Regime transition"
        );

        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Symbol;
    use chrono::TimeZone;

    fn snapshot(adx: f64, price: f64, ema200: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            asset: Symbol::new("BTCUSDT"),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            adx,
            ema200,
            price,
            volume: 1_000.0,
            volume_cv: 0.2,
            net_displacement_pct: 3.0,
        }
    }

    fn classifier() -> RegimeClassifier {
        RegimeClassifier::new(&RegimeConfig::default())
    }

    const PREVIOUS: [Option<Regime>; 4] = [
        None,
        Some(Regime::Trending),
        Some(Regime::Ranging),
        Some(Regime::Dumping),
    ];

    #[test]
    fn test_price_below_ema_is_always_dumping() {
        let c = classifier();
        for adx in (0..=100).map(|a| a as f64) {
            for gap in [0.01, 1.0, 50.0, 5_000.0] {
                for prev in PREVIOUS {
                    let s = snapshot(adx, 60_000.0 - gap, 60_000.0);
                    assert_eq!(c.classify(&s, prev), Regime::Dumping, "adx={adx} gap={gap}");
                }
            }
        }
    }

    #[test]
    fn test_strong_adx_above_ema_is_trending() {
        let c = classifier();
        for adx in [25.01, 26.0, 40.0, 99.0] {
            for prev in PREVIOUS {
                for cv in [0.0, 0.9] {
                    let mut s = snapshot(adx, 61_000.0, 60_000.0);
                    s.volume_cv = cv;
                    s.net_displacement_pct = 0.1;
                    assert_eq!(c.classify(&s, prev), Regime::Trending);
                }
            }
        }
    }

    #[test]
    fn test_weak_adx_is_ranging() {
        let c = classifier();
        for adx in [0.0, 10.0, 19.99] {
            for prev in PREVIOUS {
                assert_eq!(
                    c.classify(&snapshot(adx, 61_000.0, 60_000.0), prev),
                    Regime::Ranging
                );
            }
        }
    }

    #[test]
    fn test_hysteresis_band_holds_previous() {
        let c = classifier();
        for adx in [20.0, 22.5, 25.0] {
            let s = snapshot(adx, 61_000.0, 60_000.0);
            assert_eq!(c.classify(&s, Some(Regime::Trending)), Regime::Trending);
            assert_eq!(c.classify(&s, Some(Regime::Dumping)), Regime::Dumping);
            assert_eq!(c.classify(&s, None), Regime::Ranging);
        }
    }

    #[test]
    fn test_choppy_volume_is_ranging_inside_band() {
        let c = classifier();
        let mut s = snapshot(22.0, 61_000.0, 60_000.0);
        s.volume_cv = 0.8;
        s.net_displacement_pct = 0.4;
        assert_eq!(c.classify(&s, Some(Regime::Trending)), Regime::Ranging);

        // Volume swings with a real move are not choppy
        s.net_displacement_pct = 4.0;
        assert_eq!(c.classify(&s, Some(Regime::Trending)), Regime::Trending);
    }

    #[test]
    fn test_price_equal_to_ema_is_not_dumping_or_trending() {
        let c = classifier();
        let s = snapshot(40.0, 60_000.0, 60_000.0);
        assert_eq!(c.classify(&s, Some(Regime::Dumping)), Regime::Dumping);
        assert_eq!(c.classify(&s, None), Regime::Ranging);
    }

    #[test]
    fn test_tracker_reports_every_change() {
        let mut tracker = RegimeTracker::new(classifier());
        let rx = tracker.subscribe();

        let first = tracker.update(&snapshot(30.0, 61_000.0, 60_000.0)).unwrap();
        assert_eq!(first.from, None);
        assert_eq!(first.to, Regime::Trending);
        assert_eq!(*rx.borrow(), Some(Regime::Trending));

        // Same label again: no transition
        assert!(tracker.update(&snapshot(35.0, 62_000.0, 60_000.0)).is_none());

        let dump = tracker.update(&snapshot(35.0, 59_000.0, 60_000.0)).unwrap();
        assert_eq!(dump.from, Some(Regime::Trending));
        assert_eq!(dump.to, Regime::Dumping);

        // Back up through the band: hold DUMPING
        assert!(tracker.update(&snapshot(22.0, 61_000.0, 60_000.0)).is_none());
        assert_eq!(tracker.current(), Some(Regime::Dumping));

        let ranging = tracker.update(&snapshot(15.0, 61_000.0, 60_000.0)).unwrap();
        assert_eq!(ranging.to, Regime::Ranging);
        assert_eq!(*rx.borrow(), Some(Regime::Ranging));
    }

    #[test]
    fn test_tracker_restored_regime_is_published() {
        let tracker = RegimeTracker::with_initial(classifier(), Some(Regime::Dumping));
        assert_eq!(*tracker.subscribe().borrow(), Some(Regime::Dumping));
    }
}
