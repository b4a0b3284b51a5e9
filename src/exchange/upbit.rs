//! Upbit quotation API client
//!
//! Public market data endpoints only (candles and ticker); no API key is
//! required. Every request is bounded by a timeout and retried with backoff.
//!
//! # Example
//! ```no_run
//! use vbs_trader::exchange::{MarketData, UpbitClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = UpbitClient::new()?;
//!     let price = client.get_current_price("KRW-BTC").await?;
//!     println!("KRW-BTC: {}", price);
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::MarketData;
use crate::common::{with_retry, RetryPolicy};
use crate::{Candle, Interval};

/// Base URL for the Upbit REST API
pub const API_BASE_URL: &str = "https://api.upbit.com/v1";

/// Maximum candles per request (Upbit limit)
pub const MAX_CANDLES_PER_REQUEST: usize = 200;

/// Candle row as returned by `/candles/*`
#[derive(Debug, Deserialize)]
struct UpbitCandle {
    candle_date_time_utc: String,
    opening_price: f64,
    high_price: f64,
    low_price: f64,
    trade_price: f64,
    candle_acc_trade_volume: f64,
}

impl UpbitCandle {
    fn into_candle(self) -> Result<Candle> {
        let naive = NaiveDateTime::parse_from_str(&self.candle_date_time_utc, "%Y-%m-%dT%H:%M:%S")
            .with_context(|| format!("Bad candle timestamp {}", self.candle_date_time_utc))?;
        Ok(Candle {
            datetime: naive.and_utc(),
            open: self.opening_price,
            high: self.high_price,
            low: self.low_price,
            close: self.trade_price,
            volume: self.candle_acc_trade_volume,
        })
    }
}

#[derive(Debug, Deserialize)]
struct UpbitTicker {
    market: String,
    trade_price: f64,
}

/// Upbit public API client
#[derive(Debug, Clone)]
pub struct UpbitClient {
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl UpbitClient {
    pub fn new() -> Result<Self> {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(retry.timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(UpbitClient {
            client,
            base_url: API_BASE_URL.to_string(),
            retry,
        })
    }

    /// Point the client at another host (mock servers, proxies)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn candles_url(&self, interval: Interval) -> String {
        match (interval, interval.minutes()) {
            (Interval::Day, _) => format!("{}/candles/days", self.base_url),
            (Interval::Week, _) => format!("{}/candles/weeks", self.base_url),
            (_, Some(unit)) => format!("{}/candles/minutes/{}", self.base_url, unit),
            (_, None) => format!("{}/candles/days", self.base_url),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .context("Failed to send request to Upbit")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Upbit API error {}: {}", status, body);
        }

        response
            .json()
            .await
            .context("Failed to parse Upbit response")
    }
}

#[async_trait]
impl MarketData for UpbitClient {
    async fn get_candles(
        &self,
        ticker: &str,
        interval: Interval,
        count: usize,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let url = self.candles_url(interval);
        let count = count.min(MAX_CANDLES_PER_REQUEST);
        let params = [
            ("market", ticker.to_string()),
            ("count", count.to_string()),
            ("to", to.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        ];

        debug!(
            "Fetching candles: ticker={}, interval={}, count={}, to={}",
            ticker, interval, count, to
        );

        let rows: Vec<UpbitCandle> =
            with_retry("get_candles", &self.retry, || {
                self.get_json::<Vec<UpbitCandle>>(&url, &params)
            })
            .await?;

        // Upbit returns newest first
        let mut candles = rows
            .into_iter()
            .map(UpbitCandle::into_candle)
            .collect::<Result<Vec<_>>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn get_current_price(&self, ticker: &str) -> Result<f64> {
        let url = format!("{}/ticker", self.base_url);
        let params = [("markets", ticker.to_string())];

        let tickers: Vec<UpbitTicker> =
            with_retry("get_current_price", &self.retry, || {
                self.get_json::<Vec<UpbitTicker>>(&url, &params)
            })
            .await?;

        tickers
            .into_iter()
            .find(|t| t.market == ticker)
            .map(|t| t.trade_price)
            .with_context(|| format!("Ticker not found for {}", ticker))
    }
}
