//! Exchange and market data collaborators
//!
//! The trader talks to the outside world only through these traits:
//! - [`MarketData`]: candles and last traded price (public quotation API)
//! - [`Exchange`]: balances, order placement and order lookup
//!
//! [`UpbitClient`] implements `MarketData` against the public REST API and
//! [`PaperExchange`] simulates order fills against it.

pub mod paper;
pub mod upbit;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Candle, Interval, Order, OrderAck};

pub use paper::PaperExchange;
pub use upbit::UpbitClient;

/// Historical candles and live price for a ticker
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Fetch up to `count` candles strictly before `to`, oldest first.
    async fn get_candles(
        &self,
        ticker: &str,
        interval: Interval,
        count: usize,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;

    async fn get_current_price(&self, ticker: &str) -> Result<f64>;
}

/// Order placement and account queries
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Free balance of `asset`, either a currency ("KRW") or a ticker ("KRW-BTC")
    async fn get_balance(&self, asset: &str) -> Result<f64>;

    async fn place_limit_buy(&self, ticker: &str, price: f64, volume: f64) -> Result<OrderAck>;

    async fn place_market_sell(&self, ticker: &str, volume: f64) -> Result<OrderAck>;

    async fn get_order(&self, uuid: &str) -> Result<Order>;
}

/// Currency part of a ticker: "KRW-BTC" -> "BTC"
pub fn base_currency(asset: &str) -> &str {
    asset.split_once('-').map(|(_, base)| base).unwrap_or(asset)
}

#[async_trait]
impl<T: MarketData + ?Sized> MarketData for std::sync::Arc<T> {
    async fn get_candles(
        &self,
        ticker: &str,
        interval: Interval,
        count: usize,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        (**self).get_candles(ticker, interval, count, to).await
    }

    async fn get_current_price(&self, ticker: &str) -> Result<f64> {
        (**self).get_current_price(ticker).await
    }
}

#[async_trait]
impl<T: Exchange + ?Sized> Exchange for std::sync::Arc<T> {
    async fn get_balance(&self, asset: &str) -> Result<f64> {
        (**self).get_balance(asset).await
    }

    async fn place_limit_buy(&self, ticker: &str, price: f64, volume: f64) -> Result<OrderAck> {
        (**self).place_limit_buy(ticker, price, volume).await
    }

    async fn place_market_sell(&self, ticker: &str, volume: f64) -> Result<OrderAck> {
        (**self).place_market_sell(ticker, volume).await
    }

    async fn get_order(&self, uuid: &str) -> Result<Order> {
        (**self).get_order(uuid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_currency() {
        assert_eq!(base_currency("KRW-BTC"), "BTC");
        assert_eq!(base_currency("KRW"), "KRW");
    }
}
