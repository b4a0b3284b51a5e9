//! Volatility breakout trader - main entry point
//!
//! This binary provides four subcommands:
//! - run: Run the trading loop (paper account)
//! - backtest: Backtest the breakout rule over a candle history
//! - target: Print today's target price
//! - status: Print the persisted trading state

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "vbs-trader")]
#[command(about = "Volatility breakout trading with backtesting and crash-safe live state", long_about = None)]
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
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/krw-btc.json")]
        config: String,

        /// State file path (overrides config file)
        #[arg(long)]
        state_file: Option<String>,
    },

    /// Run strategy backtest
    Backtest {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/krw-btc.json")]
        config: String,

        /// Ticker (overrides config file). E.g., "KRW-ETH"
        #[arg(short, long)]
        ticker: Option<String>,

        /// Start time, exchange-local (YYYY-MM-DD HH:MM:SS)
        #[arg(long)]
        start: Option<String>,

        /// End time, exchange-local (YYYY-MM-DD HH:MM:SS)
        #[arg(long)]
        end: Option<String>,

        /// Candle interval (day, week, minute1, minute3, minute5, minute30, minute60, minute240)
        #[arg(short, long)]
        interval: Option<String>,

        /// Indicator lookback window
        #[arg(long)]
        scope: Option<usize>,

        /// Read candles from a CSV file instead of the API (bare file names resolve under backtest.data_dir)
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Write the candles used to a CSV file (bare file names resolve under backtest.data_dir)
        #[arg(long)]
        save_candles: Option<PathBuf>,
    },

    /// Print today's target price
    Target {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/krw-btc.json")]
        config: String,

        /// Ticker (overrides config file)
        #[arg(short, long)]
        ticker: Option<String>,
    },

    /// Print the persisted trading state
    Status {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/krw-btc.json")]
        config: String,

        /// State file path (overrides config file)
        #[arg(long)]
        state_file: Option<String>,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // Rotated at midnight: logs/{command}.log.YYYY-MM-DD
    let log_filename = format!("{}.log", command_name);

    // Set log level - filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::daily("logs", &log_filename);

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
    info!("Log file: logs/{}", log_filename);

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Backtest { .. } => "backtest",
        Commands::Target { .. } => "target",
        Commands::Status { .. } => "status",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run { config, state_file } => commands::run::run(config, state_file),

        Commands::Backtest {
            config,
            ticker,
            start,
            end,
            interval,
            scope,
            csv,
            save_candles,
        } => commands::backtest::run(commands::backtest::BacktestArgs {
            config,
            ticker,
            start,
            end,
            interval,
            scope,
            csv,
            save_candles,
        }),

        Commands::Target { config, ticker } => commands::target::run(config, ticker),

        Commands::Status { config, state_file } => commands::status::run(config, state_file),
    }
}
