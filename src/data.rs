//! Candle window acquisition and storage
//!
//! A [`CandleStore`] is the bounded history the indicator engine reads from.
//! It is built once per trading day, either by paging backwards through the
//! quotation API or from a CSV file, and is never mutated afterwards.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration as StdDuration;
use tracing::{debug, info};

use crate::clock::DailyReset;
use crate::error::{IndicatorError, IndicatorResult};
use crate::exchange::MarketData;
use crate::{Candle, Interval};

/// Rows requested per page
pub const PAGE_SIZE: usize = 200;

/// Default lookback window for the indicators
pub const DEFAULT_SCOPE: usize = 20;

/// Delay between page requests to respect provider rate limits
pub const DEFAULT_PAGE_DELAY: StdDuration = StdDuration::from_millis(100);

// =============================================================================
// Parameters
// =============================================================================

/// What window of which market to load
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorParams {
    pub ticker: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub interval: Interval,
    pub scope: usize,
}

impl IndicatorParams {
    /// Validated constructor. `now` bounds `end_time`.
    pub fn new(
        ticker: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        interval: Interval,
        scope: usize,
        now: DateTime<Utc>,
    ) -> IndicatorResult<Self> {
        if start_time > end_time {
            return Err(IndicatorError::StartAfterEnd {
                start: start_time,
                end: end_time,
            });
        }
        if end_time > now {
            return Err(IndicatorError::EndInFuture { end: end_time, now });
        }

        Ok(Self {
            ticker: ticker.into(),
            start_time,
            end_time,
            interval,
            scope,
        })
    }

    /// Parse exchange-local datestrings and an interval name.
    pub fn parse(
        ticker: impl Into<String>,
        start_time: &str,
        end_time: &str,
        interval: &str,
        scope: usize,
        reset: &DailyReset,
        now: DateTime<Utc>,
    ) -> IndicatorResult<Self> {
        let start = reset.parse(start_time)?;
        let end = reset.parse(end_time)?;
        let interval: Interval = interval.parse()?;
        Self::new(ticker, start, end, interval, scope, now)
    }

    /// Window ending at the most recent daily reset, long enough for the
    /// indicators of the current trading day.
    pub fn latest(
        ticker: impl Into<String>,
        interval: Interval,
        scope: usize,
        reset: &DailyReset,
        now: DateTime<Utc>,
    ) -> Self {
        let end_time = reset.latest_at_or_before(now);
        let start_time = end_time - interval.duration() * (scope as i32 + 1);
        Self {
            ticker: ticker.into(),
            start_time,
            end_time,
            interval,
            scope,
        }
    }

    /// Minimum number of candles the indicators need
    pub fn required_len(&self) -> usize {
        self.scope + 1
    }
}

// =============================================================================
// Candle Store
// =============================================================================

/// Immutable, ascending, timestamp-unique candle window
#[derive(Debug, Clone)]
pub struct CandleStore {
    params: IndicatorParams,
    candles: Vec<Candle>,
}

impl CandleStore {
    /// Build a store from already-loaded candles: sorts, drops duplicates,
    /// trims to `[start_time, end_time]`, rejects malformed candles and checks
    /// there is enough history.
    pub fn from_candles(params: IndicatorParams, mut candles: Vec<Candle>) -> IndicatorResult<Self> {
        candles.sort_by_key(|c| c.datetime);
        candles.dedup_by_key(|c| c.datetime);
        candles.retain(|c| c.datetime >= params.start_time && c.datetime <= params.end_time);

        for candle in &candles {
            candle
                .validate()
                .map_err(|source| IndicatorError::InvalidCandle {
                    datetime: candle.datetime,
                    source,
                })?;
        }

        if candles.len() < params.required_len() {
            return Err(IndicatorError::InsufficientHistory {
                ticker: params.ticker.clone(),
                got: candles.len(),
                required: params.required_len(),
            });
        }

        Ok(Self { params, candles })
    }

    /// Page backwards from `end_time` until `start_time` is covered or the
    /// provider runs out of history.
    pub async fn fetch<M: MarketData + ?Sized>(
        params: IndicatorParams,
        market: &M,
        page_delay: StdDuration,
    ) -> IndicatorResult<Self> {
        let mut accumulated: Vec<Candle> = Vec::new();
        // The provider's upper bound is exclusive; include a candle opening at end_time.
        let mut to = params.end_time + chrono::Duration::seconds(1);

        loop {
            let mut page = market
                .get_candles(&params.ticker, params.interval, PAGE_SIZE, to)
                .await?;

            let Some(oldest) = page.first().map(|c| c.datetime) else {
                debug!("Empty page for {} before {}, history exhausted", params.ticker, to);
                break;
            };

            let reached_start = oldest <= params.start_time
                || page.iter().any(|c| c.datetime == params.start_time);
            let exhausted = page.len() < PAGE_SIZE;

            page.append(&mut accumulated);
            accumulated = page;
            to = oldest;

            if reached_start || exhausted {
                break;
            }

            tokio::time::sleep(page_delay).await;
        }

        let store = Self::from_candles(params, accumulated)?;
        info!(
            "Loaded {} {} candles for {} ({} .. {})",
            store.len(),
            store.params.interval,
            store.params.ticker,
            store.candles[0].datetime,
            store.candles[store.len() - 1].datetime
        );
        Ok(store)
    }

    /// Load a store from a CSV file written by [`save_csv`]. The window is
    /// the file's own time span.
    pub fn from_csv(
        path: impl AsRef<Path>,
        ticker: impl Into<String>,
        interval: Interval,
        scope: usize,
    ) -> Result<Self> {
        let candles = load_csv(path.as_ref())?;
        let (Some(first), Some(last)) = (candles.first(), candles.last()) else {
            anyhow::bail!("No candles in {}", path.as_ref().display());
        };
        let params = IndicatorParams::new(
            ticker,
            first.datetime,
            last.datetime,
            interval,
            scope,
            Utc::now(),
        )?;
        Ok(Self::from_candles(params, candles)?)
    }

    pub fn params(&self) -> &IndicatorParams {
        &self.params
    }

    pub fn ticker(&self) -> &str {
        &self.params.ticker
    }

    pub fn scope(&self) -> usize {
        self.params.scope
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Index of the last candle
    pub fn last_index(&self) -> usize {
        self.candles.len().saturating_sub(1)
    }

    /// Resolve an optional index (None = last candle) and bounds-check it.
    pub fn resolve(&self, idx: Option<usize>) -> IndicatorResult<usize> {
        let idx = idx.unwrap_or_else(|| self.last_index());
        if idx >= self.candles.len() {
            return Err(IndicatorError::IndexOutOfRange {
                idx,
                len: self.candles.len(),
            });
        }
        Ok(idx)
    }

    pub fn get(&self, idx: usize) -> IndicatorResult<&Candle> {
        self.candles.get(idx).ok_or(IndicatorError::IndexOutOfRange {
            idx,
            len: self.candles.len(),
        })
    }

    /// Position of the candle opening at `datetime`
    pub fn index_of(&self, datetime: DateTime<Utc>) -> IndicatorResult<usize> {
        self.candles
            .binary_search_by_key(&datetime, |c| c.datetime)
            .map_err(|_| IndicatorError::UnknownDatetime(datetime))
    }
}

// =============================================================================
// CSV Data Loading
// =============================================================================

/// Load OHLCV data from CSV file
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;

    let mut candles = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.context(format!("Failed to read row {}", row_idx + 1))?;

        let dt_str = record.get(0).context("Missing datetime column")?;
        let datetime = dt_str
            .parse::<DateTime<Utc>>()
            .or_else(|_| {
                chrono::NaiveDateTime::parse_from_str(dt_str, "%Y-%m-%d %H:%M:%S")
                    .map(|ndt| ndt.and_utc())
            })
            .context(format!("Failed to parse datetime: {}", dt_str))?;

        let field = |i: usize, name: &str| -> Result<f64> {
            record
                .get(i)
                .context(format!("Missing {} column", name))?
                .parse()
                .context(format!("Failed to parse {} on row {}", name, row_idx + 1))
        };

        candles.push(Candle {
            datetime,
            open: field(1, "open")?,
            high: field(2, "high")?,
            low: field(3, "low")?,
            close: field(4, "close")?,
            volume: field(5, "volume")?,
        });
    }

    Ok(candles)
}

/// Save candles to CSV file
pub fn save_csv(path: impl AsRef<Path>, candles: &[Candle]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path.as_ref()).context("Failed to create output file")?;
    writer.write_record(["datetime", "open", "high", "low", "close", "volume"])?;

    for candle in candles {
        writer.write_record([
            candle.datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
            candle.open.to_string(),
            candle.high.to_string(),
            candle.low.to_string(),
            candle.close.to_string(),
            candle.volume.to_string(),
        ])?;
    }

    writer.flush()?;
    info!("Saved {} rows to {}", candles.len(), path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CandleValidationError;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn candle(n: i64) -> Candle {
        Candle {
            datetime: day(n),
            open: 100.0,
            high: 110.0,
            low: 90.0,
            close: 105.0,
            volume: 1.0,
        }
    }

    /// Serves candles for days `0..days`, recording every request bound
    struct History {
        days: i64,
        requests: Mutex<Vec<DateTime<Utc>>>,
    }

    #[async_trait]
    impl MarketData for History {
        async fn get_candles(
            &self,
            _ticker: &str,
            _interval: Interval,
            count: usize,
            to: DateTime<Utc>,
        ) -> Result<Vec<Candle>> {
            self.requests.lock().unwrap().push(to);
            let mut page: Vec<Candle> = (0..self.days)
                .map(candle)
                .filter(|c| c.datetime < to)
                .collect();
            let skip = page.len().saturating_sub(count);
            Ok(page.split_off(skip))
        }

        async fn get_current_price(&self, _ticker: &str) -> Result<f64> {
            Ok(100.0)
        }
    }

    fn params(start: i64, end: i64) -> IndicatorParams {
        IndicatorParams::new("KRW-BTC", day(start), day(end), Interval::Day, 20, day(1000)).unwrap()
    }

    #[test]
    fn test_params_validation() {
        let now = day(10);
        assert!(matches!(
            IndicatorParams::new("KRW-BTC", day(5), day(4), Interval::Day, 20, now),
            Err(IndicatorError::StartAfterEnd { .. })
        ));
        assert!(matches!(
            IndicatorParams::new("KRW-BTC", day(1), day(11), Interval::Day, 20, now),
            Err(IndicatorError::EndInFuture { .. })
        ));

        let reset = DailyReset::default();
        assert!(matches!(
            IndicatorParams::parse("KRW-BTC", "2021-01-01", "2021-01-05 09:00:00", "day", 20, &reset, now),
            Err(IndicatorError::InvalidDatetime(_))
        ));
        assert!(matches!(
            IndicatorParams::parse(
                "KRW-BTC",
                "2021-01-01 09:00:00",
                "2021-01-05 09:00:00",
                "hour",
                20,
                &reset,
                now
            ),
            Err(IndicatorError::InvalidInterval(_))
        ));
    }

    #[test]
    fn test_latest_window() {
        let reset = DailyReset::default();
        let now = Utc.with_ymd_and_hms(2021, 3, 15, 3, 0, 0).unwrap();
        let params = IndicatorParams::latest("KRW-BTC", Interval::Day, 20, &reset, now);
        assert_eq!(params.end_time, Utc.with_ymd_and_hms(2021, 3, 15, 0, 0, 0).unwrap());
        assert_eq!(params.start_time, params.end_time - Duration::days(21));
    }

    #[test]
    fn test_from_candles_trims_and_sorts() {
        let mut candles: Vec<Candle> = (0..30).rev().map(candle).collect();
        candles.push(candle(12));
        let store = CandleStore::from_candles(params(5, 27), candles).unwrap();
        assert_eq!(store.len(), 23);
        assert_eq!(store.candles()[0].datetime, day(5));
        assert_eq!(store.candles()[store.last_index()].datetime, day(27));
        assert_eq!(store.index_of(day(12)).unwrap(), 7);
        assert!(store.index_of(day(40)).is_err());
    }

    #[test]
    fn test_insufficient_history_boundary() {
        let store = CandleStore::from_candles(params(0, 100), (0..19).map(candle).collect());
        assert!(matches!(
            store,
            Err(IndicatorError::InsufficientHistory { got: 19, required: 21, .. })
        ));

        let store = CandleStore::from_candles(params(0, 100), (0..21).map(candle).collect());
        assert_eq!(store.unwrap().len(), 21);
    }

    #[test]
    fn test_rejects_malformed_candle() {
        let mut candles: Vec<Candle> = (0..30).map(candle).collect();
        candles[25].high = 80.0;
        assert!(matches!(
            CandleStore::from_candles(params(0, 100), candles),
            Err(IndicatorError::InvalidCandle {
                source: CandleValidationError::HighLessThanLow { .. },
                ..
            })
        ));

        let mut candles: Vec<Candle> = (0..30).map(candle).collect();
        candles[3].low = 0.0;
        let err = CandleStore::from_candles(params(0, 100), candles).unwrap_err();
        assert!(matches!(err, IndicatorError::InvalidCandle { datetime, .. } if datetime == day(3)));

        // Outside the window, trimmed before validation
        let mut candles: Vec<Candle> = (0..30).map(candle).collect();
        candles[0].open = -1.0;
        assert_eq!(CandleStore::from_candles(params(1, 100), candles).unwrap().len(), 29);
    }

    #[tokio::test]
    async fn test_fetch_pages_back_to_start() {
        let market = History {
            days: 500,
            requests: Mutex::new(Vec::new()),
        };
        let store = CandleStore::fetch(params(50, 450), &market, StdDuration::ZERO)
            .await
            .unwrap();

        assert_eq!(store.len(), 401);
        assert_eq!(store.candles()[0].datetime, day(50));
        assert_eq!(store.candles()[400].datetime, day(450));

        let requests = market.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        // Each page's oldest candle bounds the next request
        assert_eq!(requests[1], day(251));
        assert_eq!(requests[2], day(51));
    }

    #[tokio::test]
    async fn test_fetch_stops_when_provider_exhausted() {
        let market = History {
            days: 21,
            requests: Mutex::new(Vec::new()),
        };
        let store = CandleStore::fetch(params(0, 20), &market, StdDuration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.len(), 21);
        assert_eq!(market.requests.lock().unwrap().len(), 1);

        let market = History {
            days: 19,
            requests: Mutex::new(Vec::new()),
        };
        let result = CandleStore::fetch(params(0, 20), &market, StdDuration::ZERO).await;
        assert!(matches!(
            result,
            Err(IndicatorError::InsufficientHistory { got: 19, .. })
        ));
    }

    #[test]
    fn test_csv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("KRW-BTC_day.csv");
        let candles: Vec<Candle> = (0..25).map(candle).collect();
        save_csv(&path, &candles).unwrap();

        let store = CandleStore::from_csv(&path, "KRW-BTC", Interval::Day, 20).unwrap();
        assert_eq!(store.candles(), candles.as_slice());
    }
}
