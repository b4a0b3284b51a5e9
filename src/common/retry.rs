//! Bounded calls with exponential backoff
//!
//! Every exchange and quotation request goes through [`with_timeout`]; the
//! idempotent ones (reads) additionally go through [`with_retry`]. Order
//! placement is never retried because a timed-out request may still have
//! been accepted by the exchange.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, doubled on each subsequent one
    pub base_delay: Duration,
    /// Upper bound for a single attempt
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Run `operation` once, failing if it does not finish within `timeout`.
pub async fn with_timeout<Fut, T>(label: &str, timeout: Duration, operation: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{} timed out after {:?}", label, timeout)),
    }
}

/// Run `operation` with a per-attempt timeout, retrying failures with
/// exponential backoff. Returns the last error once retries are exhausted.
pub async fn with_retry<F, Fut, T>(label: &str, policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            tracing::debug!("Retrying {} after {}ms", label, delay.as_millis());
            sleep(delay).await;
        }

        match with_timeout(label, policy.timeout, operation()).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                tracing::warn!(
                    "{} failed (attempt {}/{}): {:#}",
                    label,
                    attempt + 1,
                    policy.max_retries + 1,
                    e
                );
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("{} failed", label)))
}
