//! Technical indicators
//!
//! Volatility-breakout indicators computed over a [`CandleStore`]. Every
//! indicator takes an optional candle index (`None` = last candle) and
//! rejects indices outside the store.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::data::CandleStore;
use crate::error::{IndicatorError, IndicatorResult};
use crate::Candle;

/// Daily volatility the position sizing aims for
pub const TARGET_VOLATILITY: f64 = 0.02;

/// Shortest moving average included in the moving-average score
pub const MIN_SCORE_INTERVAL: usize = 3;

/// Exchange price tick by price band, highest band first
const TICK_TABLE: [(Decimal, Decimal); 9] = [
    (dec!(2000000), dec!(1000)),
    (dec!(1000000), dec!(500)),
    (dec!(500000), dec!(100)),
    (dec!(100000), dec!(50)),
    (dec!(10000), dec!(10)),
    (dec!(1000), dec!(5)),
    (dec!(100), dec!(1)),
    (dec!(10), dec!(0.1)),
    (dec!(0), dec!(0.01)),
];

/// Tick size for a price. The band is chosen on the f64 itself, since
/// converting to decimal can round up onto the next band edge.
pub fn tick_size(price: f64) -> Decimal {
    TICK_TABLE
        .iter()
        .find(|(floor, _)| floor.to_f64().is_some_and(|floor| price >= floor))
        .map(|(_, tick)| *tick)
        .unwrap_or(dec!(0.01))
}

/// Floor a price onto the exchange's tick grid.
///
/// Works in decimal so the result is exactly on the grid, which makes the
/// correction idempotent and never larger than the input.
pub fn correct_price(price: f64) -> IndicatorResult<f64> {
    if !price.is_finite() || price < 0.0 {
        return Err(IndicatorError::InvalidPrice(price));
    }
    let exact = Decimal::from_f64(price).ok_or(IndicatorError::InvalidPrice(price))?;
    let tick = tick_size(price);
    let mut corrected = (exact / tick).floor() * tick;

    // Either conversion may round up; step down a tick if the result exceeds the input.
    let mut as_f64 = corrected.to_f64().ok_or(IndicatorError::InvalidPrice(price))?;
    if as_f64 > price {
        corrected -= tick;
        as_f64 = corrected
            .max(Decimal::ZERO)
            .to_f64()
            .ok_or(IndicatorError::InvalidPrice(price))?;
    }
    Ok(as_f64)
}

/// `1 - |open - close| / (high - low)`, or 1 for a degenerate candle
pub fn noise_ratio(candle: &Candle) -> f64 {
    let open_close = candle.open - candle.close;
    let high_low = candle.high - candle.low;
    if high_low == 0.0 || open_close == 0.0 {
        return 1.0;
    }
    1.0 - (open_close / high_low).abs()
}

fn average(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

impl CandleStore {
    /// Candles `idx-1 .. idx-window` (the `window` candles strictly before `idx`)
    fn preceding(&self, idx: usize, window: usize) -> IndicatorResult<&[Candle]> {
        if window == 0 || idx < window {
            return Err(IndicatorError::WindowTooLarge { window, idx });
        }
        Ok(&self.candles()[idx - window..idx])
    }

    /// Mean close of the `interval` candles preceding `idx`
    pub fn moving_average(&self, interval: usize, idx: Option<usize>) -> IndicatorResult<f64> {
        let idx = self.resolve(idx)?;
        let window = self.preceding(idx, interval)?;
        Ok(average(window.iter().map(|c| c.close)))
    }

    /// Fraction of moving averages (lengths 3..=scope) that `reference_price`
    /// is strictly above
    pub fn moving_average_score(
        &self,
        reference_price: f64,
        idx: Option<usize>,
    ) -> IndicatorResult<f64> {
        let idx = self.resolve(idx)?;
        let scope = self.scope();
        if scope <= MIN_SCORE_INTERVAL {
            return Err(IndicatorError::ScopeTooSmall(scope));
        }

        let averages = (MIN_SCORE_INTERVAL..=scope)
            .map(|interval| self.moving_average(interval, Some(idx)))
            .collect::<IndicatorResult<Vec<f64>>>()?;
        let above = averages.iter().filter(|ma| reference_price > **ma).count();
        Ok(above as f64 / averages.len() as f64)
    }

    /// Position size multiplier targeting [`TARGET_VOLATILITY`]:
    /// `0.02 / ((prev.high - prev.low) / curr.close) / portfolio_size`
    pub fn volatility_control_ratio(
        &self,
        portfolio_size: usize,
        idx: Option<usize>,
    ) -> IndicatorResult<f64> {
        let idx = self.resolve(idx)?;
        if idx == 0 {
            return Err(IndicatorError::WindowTooLarge { window: 1, idx });
        }
        if portfolio_size == 0 {
            return Err(IndicatorError::Degenerate("portfolio size must be positive"));
        }
        let prev = self.get(idx - 1)?;
        let curr = self.get(idx)?;
        let prev_volatility = prev.range() / curr.close;
        if prev_volatility == 0.0 {
            return Err(IndicatorError::Degenerate("previous candle has no range"));
        }
        Ok(TARGET_VOLATILITY / prev_volatility / portfolio_size as f64)
    }

    /// Noise ratio of the candle at `idx`
    pub fn noise_ratio(&self, idx: Option<usize>) -> IndicatorResult<f64> {
        let idx = self.resolve(idx)?;
        Ok(noise_ratio(self.get(idx)?))
    }

    /// Mean noise ratio of the `scope` candles preceding `idx`
    pub fn k_value(&self, idx: Option<usize>) -> IndicatorResult<f64> {
        let idx = self.resolve(idx)?;
        let window = self.preceding(idx, self.scope())?;
        Ok(average(window.iter().map(noise_ratio)))
    }

    /// Breakout price for the candle at `idx`:
    /// `open + previous range * k`, floored to the tick grid
    pub fn target_price(&self, idx: Option<usize>) -> IndicatorResult<f64> {
        let idx = self.resolve(idx)?;
        let k_value = self.k_value(Some(idx))?;
        let curr = self.get(idx)?;
        let prev = self.get(idx - 1)?;
        correct_price(curr.open + prev.range() * k_value)
    }
}
