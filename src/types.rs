//! Core data types used across the trading system

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::IndicatorError;

/// Validation errors for candle data
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV candlestick data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Create a new candle with validation
    pub fn new(
        datetime: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    /// Validate the candle data
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(CandleValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    /// Previous-candle range used by the breakout target
    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

/// Candle granularity supported by the quotation API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    Day,
    Week,
    Minute1,
    Minute3,
    Minute5,
    Minute30,
    Minute60,
    Minute240,
}

impl Interval {
    pub const ALL: [Interval; 8] = [
        Interval::Day,
        Interval::Week,
        Interval::Minute1,
        Interval::Minute3,
        Interval::Minute5,
        Interval::Minute30,
        Interval::Minute60,
        Interval::Minute240,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Day => "day",
            Interval::Week => "week",
            Interval::Minute1 => "minute1",
            Interval::Minute3 => "minute3",
            Interval::Minute5 => "minute5",
            Interval::Minute30 => "minute30",
            Interval::Minute60 => "minute60",
            Interval::Minute240 => "minute240",
        }
    }

    /// Length of one candle
    pub fn duration(&self) -> Duration {
        match self {
            Interval::Day => Duration::days(1),
            Interval::Week => Duration::weeks(1),
            Interval::Minute1 => Duration::minutes(1),
            Interval::Minute3 => Duration::minutes(3),
            Interval::Minute5 => Duration::minutes(5),
            Interval::Minute30 => Duration::minutes(30),
            Interval::Minute60 => Duration::minutes(60),
            Interval::Minute240 => Duration::minutes(240),
        }
    }

    /// Minute unit for intraday intervals, `None` for day and week
    pub fn minutes(&self) -> Option<u32> {
        match self {
            Interval::Day | Interval::Week => None,
            Interval::Minute1 => Some(1),
            Interval::Minute3 => Some(3),
            Interval::Minute5 => Some(5),
            Interval::Minute30 => Some(30),
            Interval::Minute60 => Some(60),
            Interval::Minute240 => Some(240),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = IndicatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| IndicatorError::InvalidInterval(s.to_string()))
    }
}

impl TryFrom<String> for Interval {
    type Error = IndicatorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.as_str().to_string()
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[serde(alias = "bid")]
    Buy,
    #[serde(alias = "ask")]
    Sell,
}

/// Lifecycle state reported by the exchange for an order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Wait,
    Watch,
    Done,
    Cancel,
    #[serde(other)]
    Unknown,
}

/// Order as reported by the exchange.
///
/// The state machine only looks at `uuid` and `state`; the rest is carried
/// through to notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub uuid: String,
    pub market: String,
    pub side: Side,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub state: Option<OrderState>,
}

impl Order {
    pub fn is_done(&self) -> bool {
        self.state == Some(OrderState::Done)
    }
}

/// Response to an order placement. A missing uuid means the exchange
/// rejected or did not acknowledge the order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub uuid: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl OrderAck {
    pub fn accepted(uuid: impl Into<String>) -> Self {
        Self {
            uuid: Some(uuid.into()),
            raw: serde_json::Value::Null,
        }
    }

    pub fn rejected(raw: serde_json::Value) -> Self {
        Self { uuid: None, raw }
    }
}
