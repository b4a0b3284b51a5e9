//! Trading state machine
//!
//! One [`Trader`] drives a single ticker through the daily cycle
//! `buy → confirm_buy → sleep → sell → confirm_sell → buy`. The driver calls
//! [`Trader::tick`] roughly once per second; every state mutation is flushed
//! to the [`StateStore`] before the tick returns so a crash at any point
//! resumes from the last completed step.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, DailyReset};
use crate::common::{with_retry, with_timeout, RetryPolicy};
use crate::data::{CandleStore, IndicatorParams, DEFAULT_PAGE_DELAY, DEFAULT_SCOPE};
use crate::error::{TradingError, TradingResult};
use crate::exchange::{Exchange, MarketData};
use crate::notify::format_krw;
use crate::state_manager::{Phase, StateStore, TradingState};
use crate::{Interval, Order, OrderState};

/// Fraction of the quote balance committed to a buy, leaving room for fees
pub const DEFAULT_BUY_RATIO: f64 = 0.9995;

/// Log the price gap once every this many unsuccessful buy checks
pub const DEFAULT_WATCH_LOG_EVERY: u64 = 300;

#[derive(Debug, Clone)]
pub struct TraderSettings {
    pub ticker: String,
    pub quote_currency: String,
    pub interval: Interval,
    pub scope: usize,
    pub buy_ratio: f64,
    pub watch_log_every: u64,
    pub page_delay: StdDuration,
    pub reset: DailyReset,
    /// Applied to exchange reads; placements only get the timeout
    pub retry: RetryPolicy,
}

impl Default for TraderSettings {
    fn default() -> Self {
        Self {
            ticker: "KRW-BTC".to_string(),
            quote_currency: "KRW".to_string(),
            interval: Interval::Day,
            scope: DEFAULT_SCOPE,
            buy_ratio: DEFAULT_BUY_RATIO,
            watch_log_every: DEFAULT_WATCH_LOG_EVERY,
            page_delay: DEFAULT_PAGE_DELAY,
            reset: DailyReset::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of a tick worth telling a human about
#[derive(Debug, Clone, PartialEq)]
pub enum TradeEvent {
    ConfirmBuy {
        order: Order,
    },
    /// Pending buy cancelled on the exchange; the trader keeps waiting on it
    BuyCancelled {
        order: Order,
    },
    ConfirmSell {
        order: Order,
        yield_rate: f64,
        acc_yield_rate: f64,
    },
}

impl TradeEvent {
    pub fn order(&self) -> &Order {
        match self {
            TradeEvent::ConfirmBuy { order }
            | TradeEvent::BuyCancelled { order }
            | TradeEvent::ConfirmSell { order, .. } => order,
        }
    }

    pub fn title(&self) -> String {
        match self {
            TradeEvent::ConfirmBuy { order } => format!("Purchased {}", order.market),
            TradeEvent::BuyCancelled { order } => {
                format!("Buy order {} cancelled on {}", order.uuid, order.market)
            }
            TradeEvent::ConfirmSell { order, .. } => format!("Sold {}", order.market),
        }
    }

    /// Plain-text rendering for chat sinks and logs
    pub fn summary(&self) -> String {
        let order = self.order();
        let mut lines = vec![
            self.title(),
            format!("Price: {}", format_krw(order.price)),
            format!("Volume: {}", order.volume),
            format!("Total: {}", format_krw(order.price * order.volume)),
        ];
        if let TradeEvent::ConfirmSell {
            yield_rate,
            acc_yield_rate,
            ..
        } = self
        {
            lines.push(format!(
                "Yield: {:.2}% ({:+.2}%)",
                acc_yield_rate * 100.0,
                (yield_rate - 1.0) * 100.0
            ));
        }
        lines.join("\n")
    }
}

/// Live trader for a single ticker
pub struct Trader<E, M, C, S> {
    settings: TraderSettings,
    exchange: E,
    market: M,
    clock: C,
    state_store: S,
    candles: Arc<CandleStore>,
    state: TradingState,
    watch_count: u64,
    /// Cancelled buy order already reported, so it is only announced once
    cancel_reported: Option<String>,
}

impl<E, M, C, S> Trader<E, M, C, S>
where
    E: Exchange,
    M: MarketData,
    C: Clock,
    S: StateStore,
{
    /// Restore the persisted state (or start fresh when there is none),
    /// build today's candle window and flush the state once.
    pub async fn new(
        settings: TraderSettings,
        exchange: E,
        market: M,
        clock: C,
        state_store: S,
    ) -> TradingResult<Self> {
        let now = clock.now();

        let state = match state_store.load() {
            Ok(state) => {
                info!(
                    "Restored trading state: phase={}, order_uuid={:?}, acc_yield_rate={:.4}, next_reset={}",
                    state.phase,
                    state.order_uuid,
                    state.acc_yield_rate,
                    settings.reset.format(state.next_reset)
                );
                if !state.is_consistent() {
                    warn!(
                        "Restored state has phase {} with order_uuid {:?}",
                        state.phase, state.order_uuid
                    );
                }
                state
            }
            Err(e) => {
                warn!("No usable trading state ({:#}), starting fresh", e);
                let quote = settings.quote_currency.clone();
                let balance = with_retry("get_balance", &settings.retry, || {
                    exchange.get_balance(&quote)
                })
                .await
                .map_err(TradingError::Exchange)?;
                TradingState::fresh(balance, settings.reset.next_after(now))
            }
        };

        let candles = Arc::new(build_window(&settings, &market, now).await?);

        let trader = Trader {
            settings,
            exchange,
            market,
            clock,
            state_store,
            candles,
            state,
            watch_count: 0,
            cancel_reported: None,
        };
        trader.persist()?;
        Ok(trader)
    }

    pub fn state(&self) -> &TradingState {
        &self.state
    }

    pub fn settings(&self) -> &TraderSettings {
        &self.settings
    }

    /// Candle window of the current trading day
    pub fn candles(&self) -> Arc<CandleStore> {
        Arc::clone(&self.candles)
    }

    pub fn persist(&self) -> TradingResult<()> {
        self.state_store
            .save(&self.state)
            .map_err(TradingError::Persistence)
    }

    /// Run one step of the state machine.
    pub async fn tick(&mut self) -> TradingResult<Option<TradeEvent>> {
        let now = self.clock.now();
        if now >= self.state.next_reset {
            if self.state.phase == Phase::Sleep {
                // Restarted after the reset the position was held for
                info!(
                    "SLEEP - reset {} already passed, selling",
                    self.settings.reset.format(self.state.next_reset)
                );
                self.state.phase = Phase::Sell;
                self.persist()?;
            }
            self.refresh(now).await?;
        }

        match self.state.phase {
            Phase::Buy => self.buy().await,
            Phase::ConfirmBuy => self.confirm_buy().await,
            Phase::Sleep => self.sleep().await,
            Phase::Sell => self.sell().await,
            Phase::ConfirmSell => self.confirm_sell().await,
        }
    }

    /// Swap in a new candle window for the trading day that started at the
    /// latest reset.
    async fn refresh(&mut self, now: DateTime<Utc>) -> TradingResult<()> {
        info!("Daily reset reached, rebuilding candle window");
        let candles = build_window(&self.settings, &self.market, now).await?;
        self.candles = Arc::new(candles);
        self.state.next_reset = self.settings.reset.next_after(now);
        self.persist()?;
        info!(
            "Next reset at {}",
            self.settings.reset.format(self.state.next_reset)
        );
        Ok(())
    }

    fn ensure_no_order(&self) -> TradingResult<()> {
        match &self.state.order_uuid {
            Some(uuid) => Err(TradingError::DuplicateOrder {
                phase: self.state.phase,
                uuid: uuid.clone(),
            }),
            None => Ok(()),
        }
    }

    fn pending_order(&self) -> TradingResult<String> {
        self.state
            .order_uuid
            .clone()
            .ok_or(TradingError::MissingOrder {
                phase: self.state.phase,
            })
    }

    async fn balance_of(&self, asset: &str) -> TradingResult<f64> {
        with_retry("get_balance", &self.settings.retry, || {
            self.exchange.get_balance(asset)
        })
        .await
        .map_err(TradingError::Exchange)
    }

    async fn fetch_order(&self, uuid: &str) -> TradingResult<Order> {
        with_retry("get_order", &self.settings.retry, || {
            self.exchange.get_order(uuid)
        })
        .await
        .map_err(TradingError::Exchange)
    }

    async fn buy(&mut self) -> TradingResult<Option<TradeEvent>> {
        self.ensure_no_order()?;
        let ticker = self.settings.ticker.clone();

        let target_price = self.candles.target_price(None)?;
        let current_price = self
            .market
            .get_current_price(&ticker)
            .await
            .map_err(TradingError::Market)?;

        if current_price < target_price {
            self.watch_count += 1;
            if self.watch_count % self.settings.watch_log_every.max(1) == 0 {
                info!(
                    "WATCH - {} current={} target={} gap={:.2}%",
                    ticker,
                    current_price,
                    target_price,
                    (target_price - current_price) / target_price * 100.0
                );
            }
            return Ok(None);
        }

        let krw = self.balance_of(&self.settings.quote_currency).await?;
        let volume = self.settings.buy_ratio * krw / target_price;
        let ack = with_timeout(
            "place_limit_buy",
            self.settings.retry.timeout,
            self.exchange.place_limit_buy(&ticker, target_price, volume),
        )
        .await
        .map_err(TradingError::Exchange)?;

        match ack.uuid {
            Some(uuid) => {
                info!(
                    "BUY - limit order {} placed: {} {} @ {}",
                    uuid, volume, ticker, target_price
                );
                self.state.order_uuid = Some(uuid);
                self.state.phase = Phase::ConfirmBuy;
                self.watch_count = 0;
                self.persist()?;
            }
            None => warn!("BUY - order was not accepted: {}", ack.raw),
        }
        Ok(None)
    }

    async fn confirm_buy(&mut self) -> TradingResult<Option<TradeEvent>> {
        let uuid = self.pending_order()?;
        let order = self.fetch_order(&uuid).await?;

        match order.state {
            Some(OrderState::Done) => {
                info!("CONFIRM BUY - order {} has been filled", uuid);
                self.state.order_uuid = None;
                self.state.phase = Phase::Sleep;
                self.persist()?;
                Ok(Some(TradeEvent::ConfirmBuy { order }))
            }
            Some(OrderState::Cancel) => {
                if self.cancel_reported.as_deref() == Some(uuid.as_str()) {
                    debug!("CONFIRM BUY - order {} is still cancelled", uuid);
                    return Ok(None);
                }
                warn!("CONFIRM BUY - order {} was cancelled on the exchange", uuid);
                self.cancel_reported = Some(uuid);
                Ok(Some(TradeEvent::BuyCancelled { order }))
            }
            Some(state) => {
                debug!("CONFIRM BUY - order {} is {:?}", uuid, state);
                Ok(None)
            }
            None => {
                warn!("CONFIRM BUY - order {} has no state", uuid);
                Ok(None)
            }
        }
    }

    async fn sleep(&mut self) -> TradingResult<Option<TradeEvent>> {
        let now = self.clock.now();
        self.state.next_reset = self.settings.reset.next_after(now);
        self.persist()?;

        info!(
            "SLEEP - holding until {}",
            self.settings.reset.format(self.state.next_reset)
        );
        self.clock.sleep_until(self.state.next_reset).await;

        self.state.phase = Phase::Sell;
        self.persist()?;
        Ok(None)
    }

    async fn sell(&mut self) -> TradingResult<Option<TradeEvent>> {
        self.ensure_no_order()?;
        let ticker = self.settings.ticker.clone();

        let volume = self.balance_of(&ticker).await?;
        let ack = with_timeout(
            "place_market_sell",
            self.settings.retry.timeout,
            self.exchange.place_market_sell(&ticker, volume),
        )
        .await
        .map_err(TradingError::Exchange)?;

        match ack.uuid {
            Some(uuid) => {
                info!("SELL - market order {} placed: {} {}", uuid, volume, ticker);
                self.state.order_uuid = Some(uuid);
                self.state.phase = Phase::ConfirmSell;
                self.persist()?;
            }
            None => warn!("SELL - order was not accepted: {}", ack.raw),
        }
        Ok(None)
    }

    async fn confirm_sell(&mut self) -> TradingResult<Option<TradeEvent>> {
        let uuid = self.pending_order()?;
        let order = self.fetch_order(&uuid).await?;

        match order.state {
            Some(OrderState::Done) => {
                let new_balance = self.balance_of(&self.settings.quote_currency).await?;
                let yield_rate = if self.state.balance > 0.0 {
                    new_balance / self.state.balance
                } else {
                    warn!("CONFIRM SELL - previous balance is zero, yield not recorded");
                    1.0
                };
                self.state.acc_yield_rate *= yield_rate;
                self.state.balance = new_balance;
                self.state.order_uuid = None;
                self.state.phase = Phase::Buy;
                self.persist()?;

                info!(
                    "CONFIRM SELL - order {} has been closed, yield_rate:{:.2}%, acc_yield_rate:{:.2}%, balance:{}",
                    uuid,
                    (yield_rate - 1.0) * 100.0,
                    self.state.acc_yield_percent(),
                    format_krw(new_balance)
                );
                Ok(Some(TradeEvent::ConfirmSell {
                    order,
                    yield_rate,
                    acc_yield_rate: self.state.acc_yield_rate,
                }))
            }
            Some(state) => {
                debug!("CONFIRM SELL - order {} is {:?}", uuid, state);
                Ok(None)
            }
            None => {
                warn!("CONFIRM SELL - order {} has no state", uuid);
                Ok(None)
            }
        }
    }
}

/// Candle window for the trading day containing `now`
pub async fn build_window<M: MarketData + ?Sized>(
    settings: &TraderSettings,
    market: &M,
    now: DateTime<Utc>,
) -> TradingResult<CandleStore> {
    let params = IndicatorParams::latest(
        settings.ticker.clone(),
        settings.interval,
        settings.scope,
        &settings.reset,
        now,
    );
    Ok(CandleStore::fetch(params, market, settings.page_delay).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Side;

    fn order(market: &str, price: f64, volume: f64) -> Order {
        Order {
            uuid: "abc".to_string(),
            market: market.to_string(),
            side: Side::Buy,
            price,
            volume,
            state: Some(OrderState::Done),
        }
    }

    #[test]
    fn test_buy_summary() {
        let event = TradeEvent::ConfirmBuy {
            order: order("KRW-BTC", 68_500_000.0, 0.5),
        };
        assert_eq!(
            event.summary(),
            "Purchased KRW-BTC\nPrice: 68,500,000\nVolume: 0.5\nTotal: 34,250,000"
        );
    }

    #[test]
    fn test_sell_summary_has_yield() {
        let event = TradeEvent::ConfirmSell {
            order: order("KRW-ETH", 4_000_000.0, 2.0),
            yield_rate: 1.05,
            acc_yield_rate: 1.071,
        };
        let summary = event.summary();
        assert!(summary.starts_with("Sold KRW-ETH\n"));
        assert!(summary.ends_with("Yield: 107.10% (+5.00%)"));
    }

    #[test]
    fn test_default_settings() {
        let settings = TraderSettings::default();
        assert_eq!(settings.buy_ratio, 0.9995);
        assert_eq!(settings.watch_log_every, 300);
        assert_eq!(settings.scope, 20);
    }
}
