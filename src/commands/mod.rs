//! Subcommand implementations

pub mod replay;
pub mod run;
pub mod scan;

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use regime_trader::data::{discover_symbols, interval_duration};
use regime_trader::gateway::ReplayGateway;
use regime_trader::{Config, Money, Symbol};

/// Load `.env`, the optional config file and CLI overrides, then validate
pub fn load_config(
    config_path: Option<&Path>,
    data_dir: Option<String>,
    state_db: Option<String>,
) -> Result<Config> {
    dotenv::dotenv().ok();

    let mut config = match config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;

    if let Some(dir) = data_dir {
        config.exchange.data_dir = dir;
    }
    if let Some(db) = state_db {
        config.state.enabled = true;
        config.state.db_path = db;
    }

    config.validate()?;
    Ok(config)
}

pub fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}

/// Replay venue over the configured data directory, with the clock placed
/// after enough history for the regime indicators to warm up
pub fn replay_gateway(config: &Config) -> Result<ReplayGateway> {
    let data_dir = &config.exchange.data_dir;

    let mut symbols = if config.trading.universe.is_empty() {
        discover_symbols(data_dir, &config.scanner.timeframe)?
    } else {
        config.trading.symbols()
    };
    let reference = Symbol::new(&config.regime.reference_symbol);
    if !symbols.contains(&reference) {
        symbols.push(reference);
    }

    let mut intervals = vec![config.scanner.timeframe.as_str(), config.regime.timeframe.as_str()];
    intervals.dedup();

    let gateway = ReplayGateway::from_data_dir(
        data_dir,
        &symbols,
        &intervals,
        Money::from_f64(config.trading.starting_equity),
    )?
    .with_taker_fee(config.exchange.taker_fee);

    let (start, end) = gateway
        .time_range()
        .with_context(|| format!("No candle data found in {}", data_dir))?;

    let bar = interval_duration(&config.regime.timeframe)
        .with_context(|| format!("Unsupported regime timeframe {}", config.regime.timeframe))?;
    let warm = start + bar * config.regime.lookback as i32;
    gateway.set_time(warm.min(end));

    info!(
        "Replay venue: {} symbols, data {} -> {}, clock at {}",
        symbols.len(),
        start,
        end,
        gateway.now()
    );
    Ok(gateway)
}

pub fn print_header(title: &str) {
    println!("\n{}", "=".repeat(60));
    println!("{}", title);
    println!("{}", "=".repeat(60));
}
