//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable overrides for deployment-specific values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clock::DailyReset;
use crate::common::RetryPolicy;
use crate::trader::{TraderSettings, DEFAULT_BUY_RATIO, DEFAULT_WATCH_LOG_EVERY};
use crate::Interval;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// `VBS_WEBHOOK_URL` and `VBS_STATE_FILE` take precedence over the file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("VBS_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
        }
        if let Ok(path) = std::env::var("VBS_STATE_FILE") {
            self.trading.state_file = path;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.trading;
        if t.scope <= 3 {
            bail!("trading.scope must be greater than 3, got {}", t.scope);
        }
        if !(t.buy_ratio > 0.0 && t.buy_ratio <= 1.0) {
            bail!("trading.buy_ratio must be in (0, 1], got {}", t.buy_ratio);
        }
        if t.tick_seconds == 0 {
            bail!("trading.tick_seconds must be positive");
        }
        if !t.ticker.starts_with(&format!("{}-", t.quote_currency)) {
            bail!(
                "trading.ticker {} is not quoted in {}",
                t.ticker,
                t.quote_currency
            );
        }
        self.daily_reset()?;
        if !(0.0..1.0).contains(&self.exchange.fee_rate) {
            bail!("exchange.fee_rate must be in [0, 1), got {}", self.exchange.fee_rate);
        }
        Ok(())
    }

    pub fn daily_reset(&self) -> Result<DailyReset> {
        match DailyReset::new(self.trading.reset_hour, self.trading.utc_offset_hours * 3600) {
            Some(reset) => Ok(reset),
            None => bail!(
                "invalid daily reset {}:00 at UTC{:+}",
                self.trading.reset_hour,
                self.trading.utc_offset_hours
            ),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(self.exchange.max_retries)
            .with_base_delay(Duration::from_millis(self.exchange.retry_base_delay_ms))
            .with_timeout(Duration::from_secs(self.exchange.timeout_secs))
    }

    pub fn trader_settings(&self) -> Result<TraderSettings> {
        Ok(TraderSettings {
            ticker: self.trading.ticker.clone(),
            quote_currency: self.trading.quote_currency.clone(),
            interval: self.trading.interval,
            scope: self.trading.scope,
            buy_ratio: self.trading.buy_ratio,
            watch_log_every: self.trading.watch_log_every,
            page_delay: Duration::from_millis(self.exchange.page_delay_ms),
            reset: self.daily_reset()?,
            retry: self.retry_policy(),
        })
    }
}

/// Trading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub ticker: String,
    pub quote_currency: String,
    pub interval: Interval,
    /// Lookback window for the K-value and moving-average score
    pub scope: usize,
    pub buy_ratio: f64,
    pub tick_seconds: u64,
    pub watch_log_every: u64,
    pub state_file: String,
    /// Exchange-local hour at which the trading day rolls over
    pub reset_hour: u32,
    pub utc_offset_hours: i32,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            ticker: "KRW-BTC".to_string(),
            quote_currency: "KRW".to_string(),
            interval: Interval::Day,
            scope: 20,
            buy_ratio: DEFAULT_BUY_RATIO,
            tick_seconds: 1,
            watch_log_every: DEFAULT_WATCH_LOG_EVERY,
            state_file: "core.json".to_string(),
            reset_hour: 9,
            utc_offset_hours: 9,
        }
    }
}

/// Exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Quote balance the paper account starts with
    pub paper_capital: f64,
    pub fee_rate: f64,
    pub page_delay_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            base_url: None,
            paper_capital: 1_000_000.0,
            fee_rate: 0.0005, // 0.05%
            page_delay_ms: 100,
            max_retries: 3,
            retry_base_delay_ms: 500,
            timeout_secs: 10,
        }
    }
}

/// Backtest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub data_dir: String,
    pub results_dir: String,
    pub fee_factor: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            data_dir: "data".to_string(),
            results_dir: "results".to_string(),
            fee_factor: crate::backtest::FEE_FACTOR,
        }
    }
}

impl BacktestConfig {
    /// Resolve a candle CSV path: bare file names live under `data_dir`,
    /// anything with a directory component is used as given.
    pub fn candle_path(&self, path: &Path) -> PathBuf {
        let bare = path.is_relative()
            && path
                .parent()
                .map_or(true, |parent| parent.as_os_str().is_empty());
        if bare {
            Path::new(&self.data_dir).join(path)
        } else {
            path.to_path_buf()
        }
    }
}

/// Notification configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        let settings = config.trader_settings().unwrap();
        assert_eq!(settings.ticker, "KRW-BTC");
        assert_eq!(settings.page_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"trading": {{"ticker": "KRW-ETH", "interval": "minute60", "scope": 10}}}}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.trading.ticker, "KRW-ETH");
        assert_eq!(config.trading.interval, Interval::Minute60);
        assert_eq!(config.trading.scope, 10);
        assert_eq!(config.trading.reset_hour, 9);
        assert_eq!(config.backtest.results_dir, "results");
    }

    #[test]
    fn test_rejects_bad_interval() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"trading": {{"interval": "hour"}}}}"#).unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.trading.scope = 3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trading.reset_hour = 24;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trading.ticker = "BTC-ETH".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trading.buy_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_candle_path_defaults_to_data_dir() {
        let backtest = BacktestConfig::default();
        assert_eq!(
            backtest.candle_path(Path::new("KRW-BTC_day.csv")),
            PathBuf::from("data/KRW-BTC_day.csv")
        );
        assert_eq!(
            backtest.candle_path(Path::new("other/KRW-BTC_day.csv")),
            PathBuf::from("other/KRW-BTC_day.csv")
        );
        assert_eq!(
            backtest.candle_path(Path::new("/tmp/KRW-BTC_day.csv")),
            PathBuf::from("/tmp/KRW-BTC_day.csv")
        );
    }

    #[test]
    fn test_sample_config_parses() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/configs/krw-btc.json");
        let config = Config::from_file(path).unwrap();
        config.validate().unwrap();
    }
}
