//! Subcommand implementations

pub mod backtest;
pub mod run;
pub mod status;
pub mod target;

use anyhow::{Context, Result};
use vbs_trader::clock::DailyReset;
use vbs_trader::exchange::UpbitClient;
use vbs_trader::notify::{LogNotifier, Notifier, WebhookNotifier};
use vbs_trader::Config;

/// Load and validate the configuration, applying `.env` first
pub fn load_config(config_path: &str) -> Result<Config> {
    dotenv::dotenv().ok();
    let config = Config::from_file(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

pub fn market_client(config: &Config) -> Result<UpbitClient> {
    let client = UpbitClient::with_policy(config.retry_policy())?;
    Ok(match &config.exchange.base_url {
        Some(url) => client.with_base_url(url.clone()),
        None => client,
    })
}

pub fn notifier(config: &Config, reset: DailyReset) -> Result<Box<dyn Notifier>> {
    Ok(match &config.notify.webhook_url {
        Some(url) => Box::new(WebhookNotifier::new(url.clone(), reset)?),
        None => Box::new(LogNotifier::new(reset)),
    })
}

pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}
