//! Data loading
//!
//! OHLCV candles from CSV files laid out as `{data_dir}/{SYMBOL}_{interval}.csv`
//! with a `datetime,open,high,low,close,volume` header. These files back the
//! replay venue.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::{Candle, Symbol};

/// Valid intervals
pub const INTERVALS: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d",
];

/// Length of one bar for an interval string
pub fn interval_duration(interval: &str) -> Option<Duration> {
    if !INTERVALS.contains(&interval) {
        return None;
    }
    let (value, unit) = interval.split_at(interval.len() - 1);
    let value: i64 = value.parse().ok()?;
    match unit {
        "m" => Some(Duration::minutes(value)),
        "h" => Some(Duration::hours(value)),
        "d" => Some(Duration::days(value)),
        _ => None,
    }
}

/// Path of the CSV file for a symbol and interval
pub fn candle_path(data_dir: impl AsRef<Path>, symbol: &Symbol, interval: &str) -> PathBuf {
    data_dir
        .as_ref()
        .join(format!("{}_{}.csv", symbol.as_str(), interval))
}

/// Parse `2024-01-01T00:00:00Z` or `2024-01-01 00:00:00` (assumed UTC)
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .with_context(|| format!("Failed to parse datetime: {}", s))
}

/// Load OHLCV data from CSV file with validation.
/// Invalid candles are skipped with a warning; output is sorted by time.
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    let mut candles = Vec::new();
    let mut invalid_count = 0;

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;

        let field = |idx: usize, name: &str| -> Result<f64> {
            record
                .get(idx)
                .with_context(|| format!("Missing {} column", name))?
                .trim()
                .parse::<f64>()
                .with_context(|| format!("Failed to parse {} at row {}", name, row_idx + 1))
        };

        let datetime = parse_datetime(record.get(0).context("Missing datetime column")?.trim())?;
        let open = field(1, "open")?;
        let high = field(2, "high")?;
        let low = field(3, "low")?;
        let close = field(4, "close")?;
        let volume = field(5, "volume")?;

        match Candle::new(datetime, open, high, low, close, volume) {
            Ok(candle) => candles.push(candle),
            Err(e) => {
                invalid_count += 1;
                warn!(
                    "Skipping invalid candle at row {} in {:?}: {}",
                    row_idx + 2, // +2 for 1-indexed and header row
                    path.file_name().unwrap_or_default(),
                    e
                );
            }
        }
    }

    if invalid_count > 0 {
        warn!(
            "Skipped {} invalid candles out of {} in {:?}",
            invalid_count,
            invalid_count + candles.len(),
            path.file_name().unwrap_or_default()
        );
    }

    candles.sort_by_key(|c| c.datetime);
    Ok(candles)
}

/// Write candles in the format `load_csv` reads
pub fn save_csv(path: impl AsRef<Path>, candles: &[Candle]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV file {}", path.display()))?;
    writer.write_record(["datetime", "open", "high", "low", "close", "volume"])?;
    for c in candles {
        writer.write_record([
            c.datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
            c.open.to_string(),
            c.high.to_string(),
            c.low.to_string(),
            c.close.to_string(),
            c.volume.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Load data for multiple symbols. Missing files are skipped with a warning.
pub fn load_symbols(
    data_dir: impl AsRef<Path>,
    symbols: &[Symbol],
    interval: &str,
) -> Result<BTreeMap<Symbol, Vec<Candle>>> {
    let mut data = BTreeMap::new();

    for symbol in symbols {
        let path = candle_path(&data_dir, symbol, interval);
        if !path.exists() {
            warn!("Data file not found: {}", path.display());
            continue;
        }

        let candles = load_csv(&path).with_context(|| format!("Failed to load data for {}", symbol))?;
        info!("Loaded {} {} candles for {}", candles.len(), interval, symbol);
        data.insert(symbol.clone(), candles);
    }

    Ok(data)
}

/// Symbols that have a CSV file for `interval` in `data_dir`
pub fn discover_symbols(data_dir: impl AsRef<Path>, interval: &str) -> Result<Vec<Symbol>> {
    let suffix = format!("_{}.csv", interval);
    let dir = data_dir.as_ref();
    let mut symbols: Vec<Symbol> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read data directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_suffix(&suffix).map(Symbol::new)
        })
        .collect();
    symbols.sort();
    Ok(symbols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    #[test]
    fn test_interval_duration() {
        assert_eq!(interval_duration("5m"), Some(Duration::minutes(5)));
        assert_eq!(interval_duration("1h"), Some(Duration::hours(1)));
        assert_eq!(interval_duration("1d"), Some(Duration::days(1)));
        assert_eq!(interval_duration("7x"), None);
    }

    #[test]
    fn test_load_csv_skips_invalid_rows_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ETHUSDT_1h.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "datetime,open,high,low,close,volume").unwrap();
        writeln!(file, "2024-01-01 01:00:00,101,102,100,101.5,20").unwrap();
        writeln!(file, "2024-01-01 00:00:00,100,101,99,100.5,10").unwrap();
        writeln!(file, "2024-01-01 02:00:00,100,99,101,100,10").unwrap();
        drop(file);

        let candles = load_csv(&path).unwrap();
        assert_eq!(candles.len(), 2);
        assert!(candles[0].datetime < candles[1].datetime);
    }

    #[test]
    fn test_save_then_discover() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles = vec![Candle::new(t0, 10.0, 11.0, 9.0, 10.5, 3.0).unwrap()];

        for symbol in ["SOLUSDT", "BTCUSDT"] {
            save_csv(candle_path(dir.path(), &Symbol::new(symbol), "5m"), &candles).unwrap();
        }
        save_csv(candle_path(dir.path(), &Symbol::new("XRPUSDT"), "1h"), &candles).unwrap();

        let found = discover_symbols(dir.path(), "5m").unwrap();
        assert_eq!(found, vec![Symbol::new("BTCUSDT"), Symbol::new("SOLUSDT")]);

        let loaded = load_symbols(dir.path(), &found, "5m").unwrap();
        assert_eq!(loaded[&Symbol::new("SOLUSDT")][0].close, 10.5);
    }
}
