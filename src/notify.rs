//! Notification sinks
//!
//! A [`Notifier`] receives trade events, invariant alerts and status
//! snapshots. Delivery is best-effort: sink failures are logged and never
//! reach the trading loop.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::clock::DailyReset;
use crate::state_manager::TradingState;
use crate::trader::TradeEvent;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &TradeEvent);

    /// Something is wrong and needs an operator
    async fn alert(&self, message: &str);

    async fn status(&self, state: &TradingState);
}

/// Whole-currency amount with thousands separators: `1050000.4` -> `1,050,000`
pub fn format_krw(amount: f64) -> String {
    let rounded = amount.round();
    let digits = format!("{:.0}", rounded.abs());
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if rounded < 0.0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Status report of the five persisted fields
pub fn status_report(state: &TradingState, reset: &DailyReset) -> String {
    [
        "Status Report".to_string(),
        format!("phase: {}", state.phase),
        format!(
            "order_uuid: {}",
            state.order_uuid.as_deref().unwrap_or("None")
        ),
        format!("acc_yield_rate: {}", state.acc_yield_rate),
        format!("balance: {}", format_krw(state.balance)),
        format!("next_reset: {}", reset.format(state.next_reset)),
    ]
    .join("\n")
}

/// Writes everything to the tracing log
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    reset: DailyReset,
}

impl LogNotifier {
    pub fn new(reset: DailyReset) -> Self {
        Self { reset }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &TradeEvent) {
        info!("{}", event.summary().replace('\n', " | "));
    }

    async fn alert(&self, message: &str) {
        error!("ALERT - {}", message);
    }

    async fn status(&self, state: &TradingState) {
        info!("{}", status_report(state, &self.reset).replace('\n', " | "));
    }
}

/// Posts `{"content": ...}` to a chat webhook and mirrors to the log
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
    log: LogNotifier,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, reset: DailyReset) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
            log: LogNotifier::new(reset),
        })
    }

    async fn post(&self, content: String) {
        let result = self
            .client
            .post(&self.url)
            .json(&json!({ "content": content }))
            .send()
            .await
            .and_then(|r| r.error_for_status());

        if let Err(e) = result {
            warn!("Webhook delivery failed: {}", e);
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &TradeEvent) {
        self.log.notify(event).await;
        self.post(event.summary()).await;
    }

    async fn alert(&self, message: &str) {
        self.log.alert(message).await;
        self.post(format!("ALERT\n{}", message)).await;
    }

    async fn status(&self, state: &TradingState) {
        self.log.status(state).await;
        self.post(status_report(state, &self.log.reset)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_manager::Phase;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_format_krw() {
        assert_eq!(format_krw(0.0), "0");
        assert_eq!(format_krw(999.0), "999");
        assert_eq!(format_krw(1_000.0), "1,000");
        assert_eq!(format_krw(1_050_000.4), "1,050,000");
        assert_eq!(format_krw(68_500_000.0), "68,500,000");
        assert_eq!(format_krw(-12_345.6), "-12,346");
    }

    #[test]
    fn test_status_report() {
        let state = TradingState {
            phase: Phase::ConfirmBuy,
            order_uuid: Some("abc".to_string()),
            acc_yield_rate: 1.02,
            balance: 1_000_000.0,
            next_reset: Utc.with_ymd_and_hms(2021, 3, 15, 0, 0, 0).unwrap(),
        };
        let report = status_report(&state, &DailyReset::default());
        assert!(report.contains("phase: confirm_buy"));
        assert!(report.contains("order_uuid: abc"));
        assert!(report.contains("balance: 1,000,000"));
        assert!(report.contains("next_reset: 2021-03-15 09:00:00"));
    }

    #[tokio::test]
    async fn test_webhook_failure_is_swallowed() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook", DailyReset::default()).unwrap();
        notifier.alert("unreachable sink").await;
    }
}
