//! Continuous trading command
//!
//! Runs the engine against the replay venue with its clock following wall
//! time. Ctrl+C stops the loop after the current step and writes a final
//! checkpoint.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use regime_trader::engine::TradingEngine;
use regime_trader::state_manager::SqliteStateManager;
use regime_trader::Config;

pub fn run(config_path: Option<PathBuf>, data_dir: Option<String>, state_db: Option<String>) -> Result<()> {
    let config = super::load_config(config_path.as_deref(), data_dir, state_db)?;
    super::build_runtime()?.block_on(run_async(config))
}

async fn run_async(config: Config) -> Result<()> {
    let mode = if config.exchange.dry_run { "DRY RUN" } else { "LIVE" };

    info!("{}", "=".repeat(62));
    info!("  REGIME TRADER - {} MODE", mode);
    info!("{}", "-".repeat(62));
    info!("  Reference:      {} ({})", config.regime.reference_symbol, config.regime.timeframe);
    info!("  Universe:       {}", universe_label(&config));
    info!("  Max positions:  {}", config.trading.max_open_positions);
    info!("  Stop loss:      {:.2}%", config.trading.stop_loss_pct);
    info!("  Daily target:   {:.2}%", config.trading.daily_profit_target_pct);
    info!(
        "  Cadence:        regime {}s / scan {}s",
        config.regime.interval_secs, config.scanner.interval_secs
    );
    info!("{}", "=".repeat(62));

    if !config.exchange.dry_run {
        warn!("LIVE ORDER SUBMISSION ENABLED");
        warn!("Press Ctrl+C within 10 seconds to abort...");
        for i in (1..=10).rev() {
            info!("Starting in {} seconds...", i);
            sleep(Duration::from_secs(1)).await;
        }
    }

    let gateway = super::replay_gateway(&config)?.with_realtime(config.exchange.replay_speed);

    let state = if config.state.enabled {
        Some(SqliteStateManager::new(&config.state.db_path)?)
    } else {
        None
    };

    let mut engine = TradingEngine::new(config, Arc::new(gateway));
    if let Some(state) = state {
        engine = engine.with_state(state);
    }
    engine.recover().await?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown...");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => error!("Error setting up signal handler: {}", e),
        }
    });

    info!("Starting trading loop...");
    engine.run(shutdown_rx).await?;
    info!("Trading session ended.");
    Ok(())
}

fn universe_label(config: &Config) -> String {
    if config.trading.universe.is_empty() {
        "all listed symbols".to_string()
    } else {
        config.trading.universe.join(", ")
    }
}
