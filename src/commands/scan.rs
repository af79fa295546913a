//! One-shot scan command
//!
//! Classifies the current regime and prints the ranked candidate table as
//! of the latest candle in the data directory.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use regime_trader::engine::TradingEngine;
use regime_trader::gateway::ExchangeGateway;
use regime_trader::scanner::PairScanner;
use regime_trader::{Config, StrategyKind};

pub fn run(config_path: Option<PathBuf>, data_dir: Option<String>) -> Result<()> {
    let config = super::load_config(config_path.as_deref(), data_dir, None)?;
    super::build_runtime()?.block_on(run_async(config))
}

async fn run_async(config: Config) -> Result<()> {
    let gateway = super::replay_gateway(&config)?;
    if let Some((_, end)) = gateway.time_range() {
        gateway.set_time(end);
    }
    let as_of = gateway.now();
    let gateway: Arc<dyn ExchangeGateway> = Arc::new(gateway);

    let scanner = PairScanner::new(Arc::clone(&gateway), &config);
    let min_volume = scanner.min_volume();

    let mut engine = TradingEngine::new(config, Arc::clone(&gateway));
    let regime = match engine.classify_regime().await {
        Ok(_) => engine.regime(),
        Err(e) => {
            println!("Regime unavailable: {}", e);
            None
        }
    };

    let universe = scanner.universe().await?;
    let report = scanner.scan(&universe).await;

    super::print_header(&format!("SCAN @ {}", as_of.format("%Y-%m-%d %H:%M UTC")));
    match regime {
        Some(r) => println!("Regime: {} -> active strategy: {}", r, StrategyKind::for_regime(r)),
        None => println!("Regime: UNKNOWN (no new exposure)"),
    }
    println!(
        "Universe: {} | Evaluated: {} | Below {:.0}M: {} | Unavailable: {} | Abandoned: {}",
        universe.len(),
        report.evaluated,
        min_volume / 1e6,
        report.below_volume,
        report.unavailable.len(),
        report.abandoned.len()
    );
    println!("{}", "-".repeat(60));
    println!(
        "{:>3}  {:<12} {:>10} {:>12} {:>7} {:>6} {:>6}  {}",
        "#", "SYMBOL", "VOL (M)", "PRICE", "ATR %", "RSI", "ADX", "LIQUID"
    );
    for (rank, pair) in report.candidates.iter().enumerate() {
        println!(
            "{:>3}  {:<12} {:>10.1} {:>12.4} {:>7.2} {:>6.1} {:>6.1}  {}",
            rank + 1,
            pair.symbol.as_str(),
            pair.quote_volume_24h / 1e6,
            pair.price,
            pair.volatility,
            pair.indicators.rsi,
            pair.indicators.adx,
            if pair.liquid { "yes" } else { "no" }
        );
    }
    println!("{}", "=".repeat(60));
    Ok(())
}
