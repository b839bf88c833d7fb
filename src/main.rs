//! Broker sync - main entry point
//!
//! This binary provides four subcommands:
//! - limits: Show effective per-broker rate limits
//! - status: Resolve a logical order from the execution ledger
//! - cleanup: Remove old terminal records from the ledger
//! - simulate: Run a bracket order end to end against the paper broker

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "broker-sync")]
#[command(about = "Multi-broker execution core: rate limits, order snapshots, execution ledger and reconciliation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "configs/broker_sync.json")]
    config: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print effective per-broker rate limits
    Limits,

    /// Show status, VWAPs and realized P&L of a logical order
    Status {
        /// Logical order id
        #[arg(short, long)]
        order: i64,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove terminal logical orders older than the retention window
    Cleanup {
        /// Retention in days (overrides config)
        #[arg(short, long)]
        days: Option<u32>,

        /// Export the ledger to this JSON file before deleting anything
        #[arg(long)]
        backup: Option<String>,
    },

    /// Run a bracket order scenario against the paper broker
    Simulate {
        /// Broker to simulate
        #[arg(short, long, default_value = "fyers")]
        broker: String,

        /// Symbol to trade
        #[arg(short, long, default_value = "NIFTY24OCTFUT")]
        symbol: String,

        /// Entry quantity
        #[arg(short, long, default_value = "75")]
        quantity: i64,
    },
}

/// Filter used when RUST_LOG is unset. Verbose raises everything to debug
/// except tokio internals.
fn default_filter(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("{level},tokio=warn,runtime=warn")
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    // Create logs directory
    std::fs::create_dir_all("logs")?;

    // Create log file with naming pattern: {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let filter_str = default_filter(verbose);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    // File layer - same format but without ANSI colors
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

    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Limits => "limits",
        Commands::Status { .. } => "status",
        Commands::Cleanup { .. } => "cleanup",
        Commands::Simulate { .. } => "simulate",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Limits => commands::limits::run(cli.config),

        Commands::Status { order, json } => commands::status::run(cli.config, order, json),

        Commands::Cleanup { days, backup } => commands::cleanup::run(cli.config, days, backup),

        Commands::Simulate {
            broker,
            symbol,
            quantity,
        } => commands::simulate::run(cli.config, broker, symbol, quantity),
    }
}
