//! Adapter surface consumed by the pipeline.
//!
//! Each exchange provides a streaming, a REST, and an archive adapter. The
//! pipeline never sees vendor field names: adapters hand back canonical
//! [`Candle`] and [`MetricSample`] rows.

use crate::error::IngestResult;
use crate::interval::Interval;
use crate::models::{BanState, Candle, Dataset, MetricSample};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use futures_util::stream::BoxStream;

/// One decoded item from a bar subscription.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// Open or closed bar update
    Bar(Candle),
    /// Frame that could not be decoded (raw text kept for logging)
    Malformed(String),
}

/// Stream of frames; ends when the connection closes.
pub type FrameStream = BoxStream<'static, IngestResult<StreamFrame>>;

#[async_trait]
pub trait KlineStream: Send + Sync {
    /// Opens one subscription covering all `symbols` at `interval`.
    async fn subscribe(&self, symbols: &[String], interval: Interval) -> IngestResult<FrameStream>;

    /// Exchange identifier stamped on produced rows.
    fn exchange(&self) -> &str;
}

#[async_trait]
pub trait MarketDataRest: Send + Sync {
    /// Fetches up to `limit` bars with open time in `[start, end]`, ascending.
    async fn get_klines(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> IngestResult<Vec<Candle>>;

    /// Fetches up to `limit` metric samples with time in `[start, end]`, ascending.
    async fn get_metrics(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> IngestResult<Vec<MetricSample>>;

    /// Lists tradable symbols, used to validate the configured universe.
    async fn list_symbols(&self) -> IngestResult<Vec<String>>;

    /// Exchange identifier stamped on produced rows.
    fn exchange(&self) -> &str;
}

/// Granularity of a packaged archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchivePeriod {
    Daily(NaiveDate),
    Monthly { year: i32, month: u32 },
}

impl ArchivePeriod {
    /// Period label used in file names (`2026-01-30` or `2026-01`).
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            ArchivePeriod::Daily(date) => date.format("%Y-%m-%d").to_string(),
            ArchivePeriod::Monthly { year, month } => format!("{year:04}-{month:02}"),
        }
    }

    /// First instant of the period.
    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        let date = match self {
            ArchivePeriod::Daily(date) => *date,
            ArchivePeriod::Monthly { year, month } => {
                NaiveDate::from_ymd_opt(*year, *month, 1).unwrap_or(NaiveDate::MIN)
            }
        };
        Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
    }

    /// First instant after the period.
    #[must_use]
    pub fn end_exclusive(&self) -> DateTime<Utc> {
        match self {
            ArchivePeriod::Daily(_) => self.start() + Duration::days(1),
            ArchivePeriod::Monthly { year, month } => {
                let (y, m) = if *month == 12 {
                    (year + 1, 1)
                } else {
                    (*year, month + 1)
                };
                ArchivePeriod::Monthly { year: y, month: m }.start()
            }
        }
    }

    /// Daily periods making up this period.
    #[must_use]
    pub fn days(&self) -> Vec<ArchivePeriod> {
        match self {
            ArchivePeriod::Daily(_) => vec![*self],
            ArchivePeriod::Monthly { .. } => {
                let mut days = Vec::new();
                let mut day = self.start().date_naive();
                let end = self.end_exclusive().date_naive();
                while day < end {
                    days.push(ArchivePeriod::Daily(day));
                    day = day.succ_opt().unwrap_or(end);
                }
                days
            }
        }
    }
}

/// A downloadable archive file handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub symbol: String,
    pub interval: Interval,
    pub dataset: Dataset,
    pub period: ArchivePeriod,
    /// File name (e.g., `BTCUSDT-1m-2026-01-30.zip`)
    pub name: String,
    /// Absolute download URL
    pub url: String,
}

impl ArchiveFile {
    /// First open time the file should contain.
    #[must_use]
    pub fn first_open_time(&self) -> DateTime<Utc> {
        self.period.start()
    }

    /// Last open time the file should contain.
    #[must_use]
    pub fn last_open_time(&self) -> DateTime<Utc> {
        self.period.end_exclusive() - self.interval.step()
    }
}

/// Rows parsed out of one archive file.
#[derive(Debug, Clone, Default)]
pub struct ArchiveRows {
    pub candles: Vec<Candle>,
    pub metrics: Vec<MetricSample>,
    /// Rows skipped because they could not be parsed
    pub malformed: usize,
}

impl ArchiveRows {
    #[must_use]
    pub fn len(&self) -> usize {
        self.candles.len() + self.metrics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait ArchiveSource: Send + Sync {
    /// Lists the files covering `[start, end]`, oldest first.
    fn list_files(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<ArchiveFile>;

    /// Splits a file into finer-grained files (monthly into daily).
    fn split(&self, file: &ArchiveFile) -> Vec<ArchiveFile>;

    /// Downloads (or reads from cache), verifies, and parses a file.
    async fn load(&self, file: &ArchiveFile) -> IngestResult<ArchiveRows>;
}

/// Shared ban state for one outbound identity.
///
/// Implementations range from process memory to a row in the shared database;
/// every caller sharing an identity must observe the same state.
#[async_trait]
pub trait BanStore: Send + Sync {
    async fn load(&self, scope: &str) -> Result<Option<BanState>>;
    async fn save(&self, state: &BanState) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_labels() {
        let day = ArchivePeriod::Daily(NaiveDate::from_ymd_opt(2026, 1, 30).unwrap());
        let month = ArchivePeriod::Monthly {
            year: 2026,
            month: 1,
        };

        assert_eq!(day.label(), "2026-01-30");
        assert_eq!(month.label(), "2026-01");
    }

    #[test]
    fn test_period_bounds() {
        let december = ArchivePeriod::Monthly {
            year: 2025,
            month: 12,
        };
        assert_eq!(
            december.start(),
            Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            december.end_exclusive(),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_monthly_splits_into_days() {
        let february = ArchivePeriod::Monthly {
            year: 2026,
            month: 2,
        };
        let days = february.days();
        assert_eq!(days.len(), 28);
        assert_eq!(
            days[0],
            ArchivePeriod::Daily(NaiveDate::from_ymd_opt(2026, 2, 1).unwrap())
        );
    }

    #[test]
    fn test_archive_file_open_time_bounds() {
        let file = ArchiveFile {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::OneMinute,
            dataset: Dataset::Candle,
            period: ArchivePeriod::Daily(NaiveDate::from_ymd_opt(2026, 1, 30).unwrap()),
            name: "BTCUSDT-1m-2026-01-30.zip".to_string(),
            url: "https://example.invalid".to_string(),
        };

        assert_eq!(
            file.first_open_time(),
            Utc.with_ymd_and_hms(2026, 1, 30, 0, 0, 0).unwrap()
        );
        assert_eq!(
            file.last_open_time(),
            Utc.with_ymd_and_hms(2026, 1, 30, 23, 59, 0).unwrap()
        );
    }
}
