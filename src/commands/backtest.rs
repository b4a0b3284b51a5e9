//! Backtest command implementation

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use vbs_trader::backtest::{BacktestResult, Backtester};
use vbs_trader::clock::DailyReset;
use vbs_trader::data::{save_csv, CandleStore, IndicatorParams};
use vbs_trader::Config;

/// History length when no start date is given
const DEFAULT_LOOKBACK_DAYS: i64 = 365;

pub struct BacktestArgs {
    pub config: String,
    pub ticker: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub interval: Option<String>,
    pub scope: Option<usize>,
    pub csv: Option<PathBuf>,
    pub save_candles: Option<PathBuf>,
}

pub fn run(args: BacktestArgs) -> Result<()> {
    super::runtime()?.block_on(run_async(args))
}

async fn run_async(args: BacktestArgs) -> Result<()> {
    info!("Starting backtest");

    let mut config = super::load_config(&args.config)?;
    info!("Loaded configuration from: {}", args.config);

    if let Some(ticker) = args.ticker {
        info!("Overriding ticker to: {}", ticker);
        config.trading.ticker = ticker;
    }
    if let Some(interval) = args.interval {
        config.trading.interval = interval.parse()?;
    }
    if let Some(scope) = args.scope {
        config.trading.scope = scope;
    }
    config.validate()?;

    let reset = config.daily_reset()?;
    let store = match args.csv {
        Some(path) => {
            let path = config.backtest.candle_path(&path);
            info!("Loading candles from: {}", path.display());
            CandleStore::from_csv(
                &path,
                config.trading.ticker.clone(),
                config.trading.interval,
                config.trading.scope,
            )?
        }
        None => {
            let params = window(
                &config,
                &reset,
                args.start.as_deref(),
                args.end.as_deref(),
                Utc::now(),
            )?;
            fetch_with_spinner(&config, params).await?
        }
    };

    if let Some(path) = &args.save_candles {
        let path = config.backtest.candle_path(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        save_csv(&path, store.candles())?;
        info!("Candles written to: {}", path.display());
    }

    info!(
        "Running backtest for {} from {} to {}",
        store.ticker(),
        reset.format(store.params().start_time),
        reset.format(store.params().end_time)
    );
    let backtester = Backtester::new(&store).with_fee_factor(config.backtest.fee_factor);
    let result = backtester.run()?;
    let buy_and_hold = backtester.buy_and_hold();

    print_summary(&store, &result, &buy_and_hold);

    let curve_path = write_curves(&config.backtest.results_dir, &store, &result, &buy_and_hold)?;
    info!("Yield curve written to: {}", curve_path.display());
    info!("Backtest completed successfully");
    Ok(())
}

/// Backtest window from optional exchange-local datestrings. The end
/// defaults to the latest daily reset, the start to a year before it.
fn window(
    config: &Config,
    reset: &DailyReset,
    start: Option<&str>,
    end: Option<&str>,
    now: DateTime<Utc>,
) -> Result<IndicatorParams> {
    let end_time = match end {
        Some(text) => reset.parse(text)?,
        None => reset.latest_at_or_before(now),
    };
    let start_time = match start {
        Some(text) => reset.parse(text)?,
        None => end_time - ChronoDuration::days(DEFAULT_LOOKBACK_DAYS),
    };
    Ok(IndicatorParams::new(
        config.trading.ticker.clone(),
        start_time,
        end_time,
        config.trading.interval,
        config.trading.scope,
        now,
    )?)
}

async fn fetch_with_spinner(config: &Config, params: IndicatorParams) -> Result<CandleStore> {
    let market = super::market_client(config)?;
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {msg} [{elapsed}]")?,
    );
    spinner.set_message(format!("Fetching {} {} candles", params.ticker, params.interval));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let page_delay = Duration::from_millis(config.exchange.page_delay_ms);
    let store = CandleStore::fetch(params, &market, page_delay).await;
    spinner.finish_and_clear();

    let store = store.context("Failed to fetch candle history")?;
    debug!("Fetched {} candles", store.len());
    Ok(store)
}

fn print_summary(store: &CandleStore, result: &BacktestResult, buy_and_hold: &[(DateTime<Utc>, f64)]) {
    let hold_return = buy_and_hold.last().map(|&(_, v)| v - 100.0).unwrap_or(0.0);

    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS - {}", store.ticker());
    println!("{}", "=".repeat(60));
    println!("Candles:            {}", store.len());
    println!("Simulated Days:     {}", result.curve.len());
    println!("Total Return:       {:.2}%", result.total_return());
    println!("Buy & Hold Return:  {:.2}%", hold_return);
    println!("Max Drawdown:       {:.2}%", result.max_drawdown * 100.0);
    println!("Win Rate:           {:.2}%", result.win_rate());
    println!("Total Trades:       {}", result.total_trades());
    println!("Winning Trades:     {}", result.winning_trades());
    println!("Holding At End:     {}", if result.holding { "yes" } else { "no" });
    println!("{}", "=".repeat(60));
}

/// One row per candle: strategy curve next to buy-and-hold
fn write_curves(
    results_dir: &str,
    store: &CandleStore,
    result: &BacktestResult,
    buy_and_hold: &[(DateTime<Utc>, f64)],
) -> Result<PathBuf> {
    std::fs::create_dir_all(results_dir)
        .with_context(|| format!("Failed to create {}", results_dir))?;
    let path = Path::new(results_dir).join(format!(
        "{}_{}_curve.csv",
        store.ticker(),
        store.params().interval
    ));

    let mut writer = csv::Writer::from_path(&path).context("Failed to create curve file")?;
    writer.write_record(["datetime", "strategy", "buy_and_hold"])?;
    let mut strategy = result.curve.iter().peekable();
    for &(datetime, hold) in buy_and_hold {
        let value = match strategy.peek() {
            Some(&&(ts, v)) if ts == datetime => {
                strategy.next();
                v.to_string()
            }
            _ => String::new(),
        };
        writer.write_record([
            datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
            value,
            hold.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(path)
}
