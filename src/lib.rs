//! Volatility Breakout Trader
//!
//! Automated volatility-breakout trading for a KRW spot market: a daily
//! target price derived from recent range history, a limit buy when the live
//! price crosses it, liquidation at the daily reset, and crash-recoverable
//! state in between. Includes a backtesting engine over the same indicators.

pub mod backtest;
pub mod clock;
pub mod common;
pub mod config;
pub mod data;
pub mod error;
pub mod exchange;
pub mod indicators;
pub mod notify;
pub mod state_manager;
pub mod trader;
pub mod types;

pub use config::Config;
pub use error::{IndicatorError, TradingError};
pub use types::*;
