//! Error types for the indicator engine and the trading state machine

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::state_manager::Phase;
use crate::types::CandleValidationError;

/// Validation failures raised while building a candle window or computing
/// indicators over it. These are never corrected silently.
#[derive(Debug, Error)]
pub enum IndicatorError {
    #[error("interval {0} is not a valid interval")]
    InvalidInterval(String),

    #[error("{0} is not a valid datestring (expected %Y-%m-%d %H:%M:%S)")]
    InvalidDatetime(String),

    #[error("start_time {start} is later than end_time {end}")]
    StartAfterEnd {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("end_time {end} cannot be later than {now}")]
    EndInFuture {
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("not enough market data for {ticker}: {got} < {required}")]
    InsufficientHistory {
        ticker: String,
        got: usize,
        required: usize,
    },

    #[error("invalid candle at {datetime}: {source}")]
    InvalidCandle {
        datetime: DateTime<Utc>,
        source: CandleValidationError,
    },

    #[error("idx {idx} is out of range for {len} candles")]
    IndexOutOfRange { idx: usize, len: usize },

    #[error("window of {window} candles does not fit before idx {idx}")]
    WindowTooLarge { window: usize, idx: usize },

    #[error("scope {0} is too small for moving average score calculation")]
    ScopeTooSmall(usize),

    #[error("no candle at {0}")]
    UnknownDatetime(DateTime<Utc>),

    #[error("invalid price {0}")]
    InvalidPrice(f64),

    #[error("{0}")]
    Degenerate(&'static str),

    #[error("market data provider failed: {0:#}")]
    Provider(#[from] anyhow::Error),
}

/// Failures of a single state-machine tick.
///
/// Invariant violations (`DuplicateOrder`, `MissingOrder`) indicate a logic
/// bug and are reported separately from transient collaborator failures.
#[derive(Debug, Error)]
pub enum TradingError {
    #[error("an order is already processing in phase {phase}: order_uuid {uuid}")]
    DuplicateOrder { phase: Phase, uuid: String },

    #[error("there is no order to confirm in phase {phase}")]
    MissingOrder { phase: Phase },

    #[error("exchange call failed: {0:#}")]
    Exchange(anyhow::Error),

    #[error("market data call failed: {0:#}")]
    Market(anyhow::Error),

    #[error(transparent)]
    Indicator(#[from] IndicatorError),

    #[error("failed to persist trading state: {0:#}")]
    Persistence(anyhow::Error),
}

impl TradingError {
    /// True when the error reflects a broken phase/order invariant rather
    /// than a transient provider or exchange hiccup.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            TradingError::DuplicateOrder { .. } | TradingError::MissingOrder { .. }
        )
    }
}

pub type IndicatorResult<T> = Result<T, IndicatorError>;
pub type TradingResult<T> = Result<T, TradingError>;
