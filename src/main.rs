//! Regime trader - main entry point
//!
//! This binary provides three subcommands:
//! - run: continuous trading loop (dry-run unless DRY_RUN=false)
//! - replay: stepped replay over historical CSV data
//! - scan: one-shot regime and ranked candidate table

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "regime-trader")]
#[command(about = "Regime-aware crypto futures trading engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the trading loop
    Run {
        /// Path to configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory with {SYMBOL}_{interval}.csv candle files
        #[arg(long)]
        data_dir: Option<String>,

        /// State database path
        #[arg(long)]
        state_db: Option<String>,
    },

    /// Replay historical data through the engine
    Replay {
        /// Path to configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory with {SYMBOL}_{interval}.csv candle files
        #[arg(long)]
        data_dir: Option<String>,

        /// Persist checkpoints, journal and trades to this database
        #[arg(long)]
        state_db: Option<String>,

        /// Stop after this many scan cycles
        #[arg(long)]
        cycles: Option<usize>,
    },

    /// Classify the regime and print ranked candidates
    Scan {
        /// Path to configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory with {SYMBOL}_{interval}.csv candle files
        #[arg(long)]
        data_dir: Option<String>,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);
    if file_only {
        // Keep the console clean for the progress bar
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Run { .. } => ("run", false),
        Commands::Replay { .. } => ("replay", true),
        Commands::Scan { .. } => ("scan", true),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    match cli.command {
        Commands::Run {
            config,
            data_dir,
            state_db,
        } => commands::run::run(config, data_dir, state_db),

        Commands::Replay {
            config,
            data_dir,
            state_db,
            cycles,
        } => commands::replay::run(config, data_dir, state_db, cycles),

        Commands::Scan { config, data_dir } => commands::scan::run(config, data_dir),
    }
}
