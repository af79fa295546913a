//! Technical indicators powered by the `ta` crate
//!
//! Pure functions of their input series. Moving averages, RSI and Bollinger
//! Bands wrap the `ta` crate; ATR, DMI and ADX use Wilder's smoothing; volume
//! statistics use `statrs`.
//!
//! The snapshot builders at the bottom turn a candle series into the values
//! the regime classifier and the strategies consume.

use statrs::statistics::Statistics;
use ta::indicators::{
    BollingerBands as TaBB, ExponentialMovingAverage, RelativeStrengthIndex, SimpleMovingAverage,
};
use ta::Next;

use crate::config::{RegimeConfig, ScannerConfig};
use crate::{Candle, IndicatorSnapshot, PairIndicators, Symbol};

// =============================================================================
// Type Aliases for Complex Return Types
// =============================================================================

/// Type alias for band indicators (upper, middle, lower)
pub type BandOutput = (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>);

// =============================================================================
// Moving Averages
// =============================================================================

/// Calculate Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match SimpleMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    values
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let sma_val = indicator.next(value);
            (i + 1 >= period).then_some(sma_val)
        })
        .collect()
}

/// Calculate Exponential Moving Average
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match ExponentialMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    values
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let ema_val = indicator.next(value);
            (i + 1 >= period).then_some(ema_val)
        })
        .collect()
}

// =============================================================================
// Volatility Indicators
// =============================================================================

/// Calculate True Range
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        let tr_value = if i == 0 {
            high[i] - low[i]
        } else {
            let hl = high[i] - low[i];
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            hl.max(hc).max(lc)
        };
        tr.push(tr_value);
    }

    tr
}

/// Calculate Average True Range (ATR) using Wilder's smoothing
///
/// ATR = (prev_ATR * (period - 1) + current_TR) / period, seeded with the SMA
/// of the first `period` true ranges.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    if high.is_empty() || period == 0 || high.len() != low.len() || high.len() != close.len() {
        return vec![];
    }

    wilders_smooth(&true_range(high, low, close), period)
}

/// Calculate ATR as percentage of price
pub fn atr_percent(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    atr(high, low, close, period)
        .iter()
        .zip(close.iter())
        .map(|(atr_opt, &price)| {
            atr_opt.map(|atr_val| {
                if price > 0.0 {
                    (atr_val / price) * 100.0
                } else {
                    0.0
                }
            })
        })
        .collect()
}

/// Calculate Bollinger Bands using ta crate
pub fn bollinger_bands(values: &[f64], period: usize, num_std: f64) -> BandOutput {
    if values.is_empty() || period == 0 {
        return (vec![], vec![], vec![]);
    }

    let mut indicator = match TaBB::new(period, num_std) {
        Ok(i) => i,
        Err(_) => {
            return (
                vec![None; values.len()],
                vec![None; values.len()],
                vec![None; values.len()],
            )
        }
    };

    let mut upper = Vec::with_capacity(values.len());
    let mut middle = Vec::with_capacity(values.len());
    let mut lower = Vec::with_capacity(values.len());

    for (i, &value) in values.iter().enumerate() {
        let bb = indicator.next(value);
        if i + 1 >= period {
            upper.push(Some(bb.upper));
            middle.push(Some(bb.average));
            lower.push(Some(bb.lower));
        } else {
            upper.push(None);
            middle.push(None);
            lower.push(None);
        }
    }

    (upper, middle, lower)
}

// =============================================================================
// Momentum Indicators
// =============================================================================

/// Calculate RSI (Relative Strength Index) using ta crate
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match RelativeStrengthIndex::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    values
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let rsi_val = indicator.next(value);
            (i + 1 >= period).then_some(rsi_val)
        })
        .collect()
}

// =============================================================================
// Trend Indicators
// =============================================================================

/// Apply Wilder's smoothing to a series
/// Wilder's smoothing: new_value = (prev_value * (period - 1) + current) / period
fn wilders_smooth(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut result = Vec::with_capacity(values.len());
    let mut smoothed: Option<f64> = None;

    for i in 0..values.len() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            // First value is SMA
            let sum: f64 = values[0..period].iter().sum();
            smoothed = Some(sum / period as f64);
            result.push(smoothed);
        } else if let Some(prev) = smoothed {
            let new_val = (prev * (period - 1) as f64 + values[i]) / period as f64;
            smoothed = Some(new_val);
            result.push(smoothed);
        } else {
            result.push(None);
        }
    }

    result
}

/// Calculate Directional Movement Index (DMI) components using Wilder's smoothing
/// Returns (+DI, -DI)
pub fn dmi(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    period: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    if high.is_empty() || period == 0 {
        return (vec![], vec![]);
    }

    let mut plus_dm = vec![0.0; high.len()];
    let mut minus_dm = vec![0.0; high.len()];

    for i in 1..high.len() {
        let up_move = high[i] - high[i - 1];
        let down_move = low[i - 1] - low[i];

        if up_move > down_move && up_move > 0.0 {
            plus_dm[i] = up_move;
        }
        if down_move > up_move && down_move > 0.0 {
            minus_dm[i] = down_move;
        }
    }

    let smoothed_plus_dm = wilders_smooth(&plus_dm, period);
    let smoothed_minus_dm = wilders_smooth(&minus_dm, period);
    let atr_values = atr(high, low, close, period);

    let mut plus_di = Vec::with_capacity(high.len());
    let mut minus_di = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        match (
            smoothed_plus_dm.get(i),
            smoothed_minus_dm.get(i),
            atr_values.get(i),
        ) {
            (Some(Some(pdm)), Some(Some(mdm)), Some(Some(atr_val))) if *atr_val > 0.0 => {
                plus_di.push(Some(pdm / atr_val * 100.0));
                minus_di.push(Some(mdm / atr_val * 100.0));
            }
            _ => {
                plus_di.push(None);
                minus_di.push(None);
            }
        }
    }

    (plus_di, minus_di)
}

/// Calculate Average Directional Index (ADX) using Wilder's smoothing
///
/// ADX requires 2*period - 1 warmup bars:
/// - First period for DI values to become valid
/// - Second period for ADX smoothing of DX values
pub fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    if high.is_empty() || period == 0 {
        return vec![];
    }

    let (plus_di, minus_di) = dmi(high, low, close, period);

    // DI values become valid at index (period - 1)
    let di_start = period - 1;
    let mut result = vec![None; high.len()];

    let dx_values: Vec<f64> = (di_start..high.len())
        .map(|i| {
            match (
                plus_di.get(i).and_then(|x| *x),
                minus_di.get(i).and_then(|x| *x),
            ) {
                (Some(pdi), Some(mdi)) if pdi + mdi > 0.0 => (pdi - mdi).abs() / (pdi + mdi) * 100.0,
                _ => 0.0,
            }
        })
        .collect();

    // ADX first valid at bar (di_start + period - 1) = (2*period - 2)
    for (j, smoothed) in wilders_smooth(&dx_values, period).into_iter().enumerate() {
        result[di_start + j] = smoothed;
    }

    result
}

// =============================================================================
// Volume Statistics
// =============================================================================

/// Sample standard deviation divided by mean. `None` for fewer than two
/// values or a non-positive mean.
pub fn coefficient_of_variation(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = values.iter().mean();
    if mean.is_nan() || mean <= 0.0 {
        return None;
    }
    let std_dev = values.iter().std_dev();
    std_dev.is_finite().then(|| std_dev / mean)
}

/// Absolute percentage move from the first to the last value
pub fn net_displacement_pct(closes: &[f64]) -> Option<f64> {
    let first = *closes.first()?;
    let last = *closes.last()?;
    if first <= 0.0 {
        return None;
    }
    Some(((last - first) / first).abs() * 100.0)
}

// =============================================================================
// Snapshot Builders
// =============================================================================

/// Bars needed before `regime_snapshot` can produce a value
pub fn regime_warmup(config: &RegimeConfig) -> usize {
    config
        .ema_period
        .max((2 * config.adx_period).saturating_sub(1))
        .max(config.volume_window)
}

/// Build the regime classifier input from reference-asset candles.
/// Returns `None` when the series is too short for EMA/ADX warmup.
pub fn regime_snapshot(
    asset: &Symbol,
    candles: &[Candle],
    config: &RegimeConfig,
) -> Option<IndicatorSnapshot> {
    if candles.len() < regime_warmup(config) {
        return None;
    }

    let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let close: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let adx_value = last_value(&adx(&high, &low, &close, config.adx_period))?;
    let ema_value = last_value(&ema(&close, config.ema_period))?;
    let last = candles.last()?;

    let window = &candles[candles.len() - config.volume_window..];
    let volumes: Vec<f64> = window.iter().map(|c| c.volume).collect();
    let window_closes: Vec<f64> = window.iter().map(|c| c.close).collect();

    Some(IndicatorSnapshot {
        asset: asset.clone(),
        timestamp: last.datetime,
        adx: adx_value,
        ema200: ema_value,
        price: last.close,
        volume: last.volume,
        volume_cv: coefficient_of_variation(&volumes).unwrap_or(0.0),
        net_displacement_pct: net_displacement_pct(&window_closes).unwrap_or(0.0),
    })
}

/// Bars needed before `pair_indicators` can produce a value
pub fn pair_warmup(config: &ScannerConfig) -> usize {
    config
        .ema_slow
        .max((2 * config.adx_period).saturating_sub(1))
        .max(config.rsi_period + 1)
        .max(config.bb_period)
        .max(config.atr_period)
}

/// Compute the short-timeframe indicator set for one pair
pub fn pair_indicators(candles: &[Candle], config: &ScannerConfig) -> Option<PairIndicators> {
    if candles.len() < pair_warmup(config) {
        return None;
    }

    let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let close: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let (upper, middle, lower) = bollinger_bands(&close, config.bb_period, config.bb_std);

    Some(PairIndicators {
        ema_fast: last_value(&ema(&close, config.ema_fast))?,
        ema_slow: last_value(&ema(&close, config.ema_slow))?,
        adx: last_value(&adx(&high, &low, &close, config.adx_period))?,
        rsi: last_value(&rsi(&close, config.rsi_period))?,
        bb_upper: last_value(&upper)?,
        bb_middle: last_value(&middle)?,
        bb_lower: last_value(&lower)?,
        atr_pct: last_value(&atr_percent(&high, &low, &close, config.atr_period))?,
    })
}

fn last_value(series: &[Option<f64>]) -> Option<f64> {
    series.last().copied().flatten().filter(|v| v.is_finite())
}

// =============================================================================
// Tests
// =============================================================================
