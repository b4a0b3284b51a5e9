//! Paper trading exchange
//!
//! Simulates a KRW spot account against live quotations: limit buys fill
//! once the market trades at or below the limit, market sells fill at the
//! current price. Fees are charged on both sides.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;

use super::{base_currency, Exchange, MarketData};
use crate::{Order, OrderAck, OrderState, Side};

#[derive(Debug, Clone)]
struct PaperOrder {
    order: Order,
    ticker: String,
}

#[derive(Debug, Default)]
struct Account {
    balances: HashMap<String, f64>,
    orders: HashMap<String, PaperOrder>,
}

/// Simulated exchange account
pub struct PaperExchange<M> {
    market: M,
    quote_currency: String,
    fee_rate: f64,
    account: Mutex<Account>,
    next_id: AtomicU64,
}

impl<M: MarketData> PaperExchange<M> {
    pub fn new(market: M, quote_currency: impl Into<String>, capital: f64, fee_rate: f64) -> Self {
        let quote_currency = quote_currency.into();
        let mut account = Account::default();
        account.balances.insert(quote_currency.clone(), capital);

        Self {
            market,
            quote_currency,
            fee_rate,
            account: Mutex::new(account),
            next_id: AtomicU64::new(1),
        }
    }

    fn account(&self) -> std::sync::MutexGuard<'_, Account> {
        self.account.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_uuid(&self) -> String {
        format!("paper-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn fill_buy(&self, uuid: &str) -> Option<Order> {
        let mut account = self.account();
        let paper = account.orders.get_mut(uuid)?;
        paper.order.state = Some(OrderState::Done);
        let filled = paper.clone();
        *account
            .balances
            .entry(base_currency(&filled.ticker).to_string())
            .or_insert(0.0) += filled.order.volume;
        Some(filled.order)
    }
}

#[async_trait]
impl<M: MarketData> Exchange for PaperExchange<M> {
    async fn get_balance(&self, asset: &str) -> Result<f64> {
        let account = self.account();
        Ok(account
            .balances
            .get(base_currency(asset))
            .copied()
            .unwrap_or(0.0))
    }

    async fn place_limit_buy(&self, ticker: &str, price: f64, volume: f64) -> Result<OrderAck> {
        if price <= 0.0 || volume <= 0.0 {
            return Ok(OrderAck::rejected(
                json!({"error": {"name": "invalid_order", "price": price, "volume": volume}}),
            ));
        }

        let cost = price * volume * (1.0 + self.fee_rate);
        let uuid = self.new_uuid();
        let mut account = self.account();
        let cash = account
            .balances
            .entry(self.quote_currency.clone())
            .or_insert(0.0);
        if *cash < cost {
            return Ok(OrderAck::rejected(
                json!({"error": {"name": "insufficient_funds_bid", "required": cost, "available": *cash}}),
            ));
        }
        *cash -= cost;

        let order = Order {
            uuid: uuid.clone(),
            market: ticker.to_string(),
            side: Side::Buy,
            price,
            volume,
            state: Some(OrderState::Wait),
        };
        account.orders.insert(
            uuid.clone(),
            PaperOrder {
                order,
                ticker: ticker.to_string(),
            },
        );

        info!("[PAPER] Limit buy {} {} @ {} ({})", volume, ticker, price, uuid);
        Ok(OrderAck::accepted(uuid))
    }

    async fn place_market_sell(&self, ticker: &str, volume: f64) -> Result<OrderAck> {
        let held = self.get_balance(ticker).await?;
        if volume <= 0.0 || volume > held {
            return Ok(OrderAck::rejected(
                json!({"error": {"name": "insufficient_funds_ask", "volume": volume, "held": held}}),
            ));
        }

        let price = self.market.get_current_price(ticker).await?;
        let proceeds = price * volume * (1.0 - self.fee_rate);
        let uuid = self.new_uuid();

        let mut account = self.account();
        *account
            .balances
            .entry(base_currency(ticker).to_string())
            .or_insert(0.0) -= volume;
        *account
            .balances
            .entry(self.quote_currency.clone())
            .or_insert(0.0) += proceeds;

        let order = Order {
            uuid: uuid.clone(),
            market: ticker.to_string(),
            side: Side::Sell,
            price,
            volume,
            state: Some(OrderState::Done),
        };
        account.orders.insert(
            uuid.clone(),
            PaperOrder {
                order,
                ticker: ticker.to_string(),
            },
        );

        info!("[PAPER] Market sell {} {} @ ~{} ({})", volume, ticker, price, uuid);
        Ok(OrderAck::accepted(uuid))
    }

    async fn get_order(&self, uuid: &str) -> Result<Order> {
        let pending = match self.account().orders.get(uuid) {
            Some(paper) => paper.clone(),
            None => bail!("order {} not found", uuid),
        };

        if pending.order.side == Side::Buy && !pending.order.is_done() {
            let price = self.market.get_current_price(&pending.ticker).await?;
            if price <= pending.order.price {
                if let Some(order) = self.fill_buy(uuid) {
                    info!("[PAPER] Limit buy {} filled @ {}", uuid, order.price);
                    return Ok(order);
                }
            }
        }

        Ok(pending.order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Candle, Interval};
    use chrono::{DateTime, Utc};

    struct FixedPrice(Mutex<f64>);

    #[async_trait]
    impl MarketData for FixedPrice {
        async fn get_candles(
            &self,
            _ticker: &str,
            _interval: Interval,
            _count: usize,
            _to: DateTime<Utc>,
        ) -> Result<Vec<Candle>> {
            Ok(Vec::new())
        }

        async fn get_current_price(&self, _ticker: &str) -> Result<f64> {
            Ok(*self.0.lock().unwrap())
        }
    }

    #[tokio::test]
    async fn test_limit_buy_waits_for_price() {
        let exchange = PaperExchange::new(FixedPrice(Mutex::new(105.0)), "KRW", 1_000.0, 0.0);
        let ack = exchange.place_limit_buy("KRW-BTC", 100.0, 5.0).await.unwrap();
        let uuid = ack.uuid.unwrap();
        assert_eq!(exchange.get_balance("KRW").await.unwrap(), 500.0);

        let order = exchange.get_order(&uuid).await.unwrap();
        assert_eq!(order.state, Some(OrderState::Wait));

        *exchange.market.0.lock().unwrap() = 99.0;
        let order = exchange.get_order(&uuid).await.unwrap();
        assert!(order.is_done());
        assert_eq!(exchange.get_balance("KRW-BTC").await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn test_market_sell_credits_quote() {
        let exchange = PaperExchange::new(FixedPrice(Mutex::new(100.0)), "KRW", 1_000.0, 0.001);
        let uuid = exchange
            .place_limit_buy("KRW-BTC", 100.0, 2.0)
            .await
            .unwrap()
            .uuid
            .unwrap();
        exchange.get_order(&uuid).await.unwrap();

        *exchange.market.0.lock().unwrap() = 110.0;
        let ack = exchange.place_market_sell("KRW-BTC", 2.0).await.unwrap();
        assert!(ack.uuid.is_some());
        assert_eq!(exchange.get_balance("BTC").await.unwrap(), 0.0);

        let krw = exchange.get_balance("KRW").await.unwrap();
        let expected = 1_000.0 - 200.0 * 1.001 + 220.0 * 0.999;
        assert!((krw - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejects_without_funds() {
        let exchange = PaperExchange::new(FixedPrice(Mutex::new(100.0)), "KRW", 10.0, 0.0);
        let ack = exchange.place_limit_buy("KRW-BTC", 100.0, 1.0).await.unwrap();
        assert!(ack.uuid.is_none());
        let ack = exchange.place_market_sell("KRW-BTC", 1.0).await.unwrap();
        assert!(ack.uuid.is_none());
    }
}
