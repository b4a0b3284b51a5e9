//! Backtesting engine
//!
//! Replays the volatility-breakout rule over a [`CandleStore`]: buy at the
//! target price when the day's high breaks it, sell at the next day's open.
//! Pure computation, no I/O.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::data::CandleStore;
use crate::error::IndicatorResult;

/// Round-trip multiplier for trading fees (0.05% on each side)
pub const FEE_FACTOR: f64 = 0.999;

/// One completed buy/sell cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundTrip {
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    /// `exit / entry * fee_factor`
    pub yield_rate: f64,
}

impl RoundTrip {
    pub fn is_win(&self) -> bool {
        self.yield_rate > 1.0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BacktestResult {
    /// `(timestamp, accumulated yield × 100)` for every simulated candle
    pub curve: Vec<(DateTime<Utc>, f64)>,
    pub acc_yield_rate: f64,
    pub trades: Vec<RoundTrip>,
    /// Still holding after the last candle
    pub holding: bool,
    /// Largest peak-to-trough decline of the curve, as a fraction
    pub max_drawdown: f64,
}

impl BacktestResult {
    pub fn total_trades(&self) -> usize {
        self.trades.len()
    }

    pub fn winning_trades(&self) -> usize {
        self.trades.iter().filter(|t| t.is_win()).count()
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades.is_empty() {
            0.0
        } else {
            self.winning_trades() as f64 / self.trades.len() as f64 * 100.0
        }
    }

    /// Total return in percent
    pub fn total_return(&self) -> f64 {
        (self.acc_yield_rate - 1.0) * 100.0
    }
}

/// Backtest engine
pub struct Backtester<'a> {
    store: &'a CandleStore,
    fee_factor: f64,
}

impl<'a> Backtester<'a> {
    pub fn new(store: &'a CandleStore) -> Self {
        Backtester {
            store,
            fee_factor: FEE_FACTOR,
        }
    }

    pub fn with_fee_factor(mut self, fee_factor: f64) -> Self {
        self.fee_factor = fee_factor;
        self
    }

    /// Simulate every candle from `scope` onwards.
    ///
    /// A position opened on candle `i` is closed at the open of candle `i+1`
    /// before that candle's own breakout is evaluated. The breakout needs the
    /// high to exceed the target strictly: a limit resting at the exact high
    /// is not assumed to fill.
    pub fn run(&self) -> IndicatorResult<BacktestResult> {
        let candles = self.store.candles();
        let mut result = BacktestResult {
            acc_yield_rate: 1.0,
            ..Default::default()
        };
        let mut entry: Option<(DateTime<Utc>, f64)> = None;

        for idx in self.store.scope()..candles.len() {
            let today = &candles[idx];
            let target_price = self.store.target_price(Some(idx))?;

            if let Some((entry_time, entry_price)) = entry.take() {
                let yield_rate = today.open / entry_price * self.fee_factor;
                result.acc_yield_rate *= yield_rate;
                result.trades.push(RoundTrip {
                    entry_time,
                    exit_time: today.datetime,
                    entry_price,
                    exit_price: today.open,
                    yield_rate,
                });
            }

            if today.high > target_price {
                debug!(
                    "Breakout at {}: high {} > target {}",
                    today.datetime, today.high, target_price
                );
                entry = Some((today.datetime, target_price));
            }

            result
                .curve
                .push((today.datetime, result.acc_yield_rate * 100.0));
        }

        result.holding = entry.is_some();
        result.max_drawdown = max_drawdown(&result.curve);
        Ok(result)
    }

    /// Buy-and-hold comparison curve: `close / first close × 100`
    pub fn buy_and_hold(&self) -> Vec<(DateTime<Utc>, f64)> {
        let candles = self.store.candles();
        let Some(first) = candles.first() else {
            return Vec::new();
        };
        candles
            .iter()
            .map(|c| (c.datetime, c.close / first.close * 100.0))
            .collect()
    }
}

fn max_drawdown(curve: &[(DateTime<Utc>, f64)]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0;
    for &(_, value) in curve {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            let dd = (peak - value) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }
    max_dd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::IndicatorParams;
    use crate::{Candle, Interval};
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn store_from(bars: &[(f64, f64, f64, f64)], scope: usize) -> CandleStore {
        let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let candles: Vec<Candle> = bars
            .iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Candle {
                datetime: start + Duration::days(i as i64),
                open,
                high,
                low,
                close,
                volume: 1.0,
            })
            .collect();
        let end = candles.last().unwrap().datetime;
        let params =
            IndicatorParams::new("KRW-BTC", start, end, Interval::Day, scope, end).unwrap();
        CandleStore::from_candles(params, candles).unwrap()
    }

    #[test]
    fn test_flat_series_never_trades() {
        let store = store_from(&vec![(100.0, 100.0, 100.0, 100.0); 30], 20);
        let result = Backtester::new(&store).run().unwrap();

        assert_eq!(result.acc_yield_rate, 1.0);
        assert_eq!(result.total_trades(), 0);
        assert!(!result.holding);
        assert_eq!(result.curve.len(), 10);
        assert!(result.curve.iter().all(|&(_, v)| v == 100.0));
    }

    #[test]
    fn test_breakout_then_sell_at_next_open() {
        let store = store_from(
            &[
                (100.0, 120.0, 100.0, 110.0),
                (100.0, 120.0, 100.0, 110.0),
                (100.0, 120.0, 100.0, 110.0),
                // target 90 + 20 * 0.5 = 100, high 105 breaks it
                (90.0, 105.0, 85.0, 95.0),
                // target 102 + 20 * 0.5833 = 113, high 110 does not
                (102.0, 110.0, 100.0, 105.0),
            ],
            3,
        );
        assert_eq!(store.target_price(Some(3)).unwrap(), 100.0);

        let result = Backtester::new(&store).run().unwrap();
        assert_relative_eq!(result.acc_yield_rate, 102.0 / 100.0 * 0.999);
        assert_relative_eq!(result.acc_yield_rate, 1.0190, epsilon = 1e-4);
        assert!(!result.holding);
        assert_eq!(result.total_trades(), 1);
        assert_eq!(result.winning_trades(), 1);
        assert_eq!(result.trades[0].entry_price, 100.0);
        assert_eq!(result.trades[0].exit_price, 102.0);

        assert_eq!(result.curve.len(), 2);
        assert_relative_eq!(result.curve[0].1, 100.0);
        assert_relative_eq!(result.curve[1].1, 101.898, epsilon = 1e-9);
        assert_eq!(result.max_drawdown, 0.0);
    }

    #[test]
    fn test_open_position_at_end() {
        let store = store_from(
            &[
                (100.0, 120.0, 100.0, 110.0),
                (100.0, 120.0, 100.0, 110.0),
                (100.0, 120.0, 100.0, 110.0),
                (90.0, 105.0, 85.0, 95.0),
            ],
            3,
        );
        let result = Backtester::new(&store).run().unwrap();
        assert!(result.holding);
        assert_eq!(result.total_trades(), 0);
        assert_eq!(result.acc_yield_rate, 1.0);
    }

    #[test]
    fn test_losing_trade_drawdown() {
        let store = store_from(
            &[
                (100.0, 120.0, 100.0, 110.0),
                (100.0, 120.0, 100.0, 110.0),
                (100.0, 120.0, 100.0, 110.0),
                (90.0, 105.0, 85.0, 95.0),
                (80.0, 82.0, 79.0, 81.0),
            ],
            3,
        );
        let result = Backtester::new(&store).with_fee_factor(1.0).run().unwrap();
        assert_relative_eq!(result.acc_yield_rate, 0.8);
        assert_eq!(result.winning_trades(), 0);
        assert_relative_eq!(result.max_drawdown, 0.2, epsilon = 1e-9);
        assert_relative_eq!(result.total_return(), -20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_buy_and_hold() {
        let store = store_from(
            &[
                (100.0, 100.0, 100.0, 100.0),
                (100.0, 150.0, 100.0, 150.0),
                (150.0, 150.0, 50.0, 50.0),
            ],
            1,
        );
        let curve = Backtester::new(&store).buy_and_hold();
        let values: Vec<f64> = curve.iter().map(|&(_, v)| v).collect();
        assert_eq!(values, vec![100.0, 150.0, 50.0]);
    }
}
