//! Common utilities shared across exchange clients
//!
//! - Per-call timeouts
//! - Retry logic with exponential backoff

pub mod retry;

pub use retry::{with_retry, with_timeout, RetryPolicy};
