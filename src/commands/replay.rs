//! Stepped replay command
//!
//! Drives the engine over historical CSV data one scan interval at a time,
//! reclassifying the regime whenever a regime interval of simulated time has
//! passed, then prints a summary.

use anyhow::Result;
use chrono::Duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use regime_trader::engine::TradingEngine;
use regime_trader::gateway::ExchangeGateway;
use regime_trader::state_manager::SqliteStateManager;
use regime_trader::{Config, Money, Regime};

#[derive(Debug, Default)]
struct ReplayTotals {
    cycles: usize,
    transitions: usize,
    approved: usize,
    rejected: usize,
    exits: usize,
    order_failures: usize,
    skipped: usize,
    target_days: usize,
}

pub fn run(
    config_path: Option<PathBuf>,
    data_dir: Option<String>,
    state_db: Option<String>,
    cycles: Option<usize>,
) -> Result<()> {
    let config = super::load_config(config_path.as_deref(), data_dir, state_db.clone())?;
    super::build_runtime()?.block_on(run_async(config, state_db.is_some(), cycles))
}

async fn run_async(config: Config, persist: bool, cycles: Option<usize>) -> Result<()> {
    let gateway = Arc::new(super::replay_gateway(&config)?);
    let end = gateway.time_range().map(|(_, end)| end).unwrap_or_else(|| gateway.now());

    let state = if persist {
        SqliteStateManager::new(&config.state.db_path)?
    } else {
        SqliteStateManager::in_memory()?
    };

    let step = Duration::seconds(config.scanner.interval_secs as i64);
    let regime_period = Duration::seconds(config.regime.interval_secs as i64);
    let available = ((end - gateway.now()).num_seconds() / step.num_seconds().max(1)).max(0) as usize + 1;
    let total = cycles.map_or(available, |c| c.min(available));
    let starting_equity = Money::from_f64(config.trading.starting_equity);

    super::print_header("REPLAY");
    println!("  Data dir:      {}", config.exchange.data_dir);
    println!("  Start:         {}", gateway.now());
    println!("  End:           {}", end);
    println!("  Cycles:        {} x {}s", total, config.scanner.interval_secs);
    println!("  Fills:         {}", if config.exchange.dry_run { "simulated" } else { "replay venue" });
    println!("{}\n", "=".repeat(60));

    let venue: Arc<dyn ExchangeGateway> = gateway.clone();
    let mut engine = TradingEngine::new(config, venue).with_state(state.clone());
    engine.recover().await?;

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}] {msg}")?
            .progress_chars("█░ "),
    );

    let mut totals = ReplayTotals::default();
    let mut last_regime_at = None;
    let mut last_target_day = None;

    for _ in 0..total {
        let now = gateway.now();
        let due = last_regime_at.map_or(true, |at| now - at >= regime_period);
        if due {
            match engine.classify_regime().await {
                Ok(Some(_)) => totals.transitions += 1,
                Ok(None) => {}
                Err(e) => warn!("Regime classification failed: {}", e),
            }
            last_regime_at = Some(now);
        }

        match engine.run_cycle().await {
            Ok(report) => {
                totals.cycles += 1;
                totals.approved += report.approved;
                totals.rejected += report.rejected;
                totals.exits += report.exits;
                totals.order_failures += report.order_failures;
                totals.skipped += usize::from(report.skipped.is_some());
                if report.daily.target_reached && last_target_day != Some(now.date_naive()) {
                    totals.target_days += 1;
                    last_target_day = Some(now.date_naive());
                }
                pb.set_message(format!(
                    "{} | equity {} | open {}",
                    regime_label(report.regime),
                    report.daily.equity.round_dp(2),
                    report.daily.open_positions
                ));
            }
            Err(e) => warn!("Cycle failed: {}", e),
        }

        pb.inc(1);
        gateway.advance(step);
        if gateway.now() > end {
            break;
        }
    }
    pb.finish_and_clear();

    let risk = engine.risk();
    let account = risk.lock().await.snapshot();
    let stats = state.trade_stats()?;
    let return_pct = if starting_equity.is_positive() {
        ((account.equity - starting_equity) / starting_equity).to_f64() * 100.0
    } else {
        0.0
    };

    super::print_header("REPLAY RESULTS");
    println!("Cycles run:         {}", totals.cycles);
    println!("Final regime:       {}", regime_label(engine.regime()));
    println!("Regime changes:     {}", totals.transitions);
    println!("Orders approved:    {}", totals.approved);
    println!("Signals rejected:   {}", totals.rejected);
    println!("Risk exits:         {}", totals.exits);
    println!("Order failures:     {}", totals.order_failures);
    println!("Cycles skipped:     {}", totals.skipped);
    println!("{}", "-".repeat(60));
    println!("Closed trades:      {}", stats.trades);
    println!("Win rate:           {:.2}%", stats.win_rate());
    println!("Net P&L:            {}", stats.net_pnl.round_dp(2));
    println!("Fees:               {}", stats.fees.round_dp(2));
    println!("Open positions:     {}", account.open_count());
    println!("Days at target:     {}", totals.target_days);
    println!("{}", "-".repeat(60));
    println!("Starting equity:    {}", starting_equity.round_dp(2));
    println!("Final equity:       {}", account.equity.round_dp(2));
    println!("Total return:       {:+.2}%", return_pct);
    println!("{}", "=".repeat(60));

    info!("Replay completed: {} cycles", totals.cycles);
    Ok(())
}

fn regime_label(regime: Option<Regime>) -> String {
    regime.map(|r| r.to_string()).unwrap_or_else(|| "UNKNOWN".to_string())
}
