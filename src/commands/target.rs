//! Today's target price command

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use vbs_trader::trader::build_window;

pub fn run(config_path: String, ticker: Option<String>) -> Result<()> {
    super::runtime()?.block_on(run_async(config_path, ticker))
}

async fn run_async(config_path: String, ticker: Option<String>) -> Result<()> {
    let mut config = super::load_config(&config_path)?;
    if let Some(ticker) = ticker {
        config.trading.ticker = ticker;
    }
    config.validate()?;

    let settings = config.trader_settings()?;
    let market = super::market_client(&config)?;
    let store = build_window(&settings, &market, Utc::now())
        .await
        .context("Failed to build today's candle window")?;

    let target = store.target_price(None)?;
    let k_value = store.k_value(None)?;
    let ma_score = store.moving_average_score(target, None)?;
    info!(
        "{} window {} .. {}",
        settings.ticker,
        settings.reset.format(store.params().start_time),
        settings.reset.format(store.params().end_time)
    );

    println!("Today's {} target price = {}", settings.ticker, target);
    println!("K value:               {:.4}", k_value);
    println!("Moving average score:  {:.2}", ma_score);
    Ok(())
}
