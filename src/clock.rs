//! Wall clock and daily reset schedule
//!
//! The trader never calls `Utc::now()` or sleeps directly; it goes through a
//! [`Clock`] so tests can advance time without waiting.

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};

use crate::error::{IndicatorError, IndicatorResult};

/// Datestring format shared by config, CLI arguments and the state file
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller until `deadline` has passed.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

/// Real time, backed by tokio timers
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        // Sleep in bounded slices so a suspended host (laptop lid, VM pause)
        // does not overshoot the deadline by the suspended time.
        loop {
            let remaining = deadline - Utc::now();
            if remaining <= Duration::zero() {
                return;
            }
            let slice = remaining
                .min(Duration::minutes(1))
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(1));
            tokio::time::sleep(slice).await;
        }
    }
}

/// Manually driven clock for simulations and tests.
/// `sleep_until` jumps straight to the deadline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if *now < deadline {
            *now = deadline;
        }
    }
}

/// Fixed daily instant (09:00 KST by default) at which a trading day rolls over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyReset {
    hour: u32,
    offset: FixedOffset,
}

impl Default for DailyReset {
    fn default() -> Self {
        Self::new(9, 9 * 3600).expect("09:00 UTC+9 is a valid reset")
    }
}

impl DailyReset {
    /// `utc_offset_secs` is the exchange's local offset east of UTC.
    pub fn new(hour: u32, utc_offset_secs: i32) -> Option<Self> {
        if hour > 23 {
            return None;
        }
        Some(Self {
            hour,
            offset: FixedOffset::east_opt(utc_offset_secs)?,
        })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Most recent reset instant at or before `now`
    pub fn latest_at_or_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.offset);
        let today = local
            .date_naive()
            .and_hms_opt(self.hour, 0, 0)
            .expect("hour validated in constructor");
        let today = self.from_local(today);
        if today <= now {
            today
        } else {
            today - Duration::days(1)
        }
    }

    /// Next reset instant strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.latest_at_or_before(now) + Duration::days(1)
    }

    /// Render an instant as an exchange-local datestring
    pub fn format(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.offset)
            .format(DATETIME_FORMAT)
            .to_string()
    }

    /// Parse an exchange-local datestring
    pub fn parse(&self, text: &str) -> IndicatorResult<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
            .map_err(|_| IndicatorError::InvalidDatetime(text.to_string()))?;
        Ok(self.from_local(naive))
    }

    fn from_local(&self, naive: NaiveDateTime) -> DateTime<Utc> {
        let shift = Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&(naive - shift))
    }
}
