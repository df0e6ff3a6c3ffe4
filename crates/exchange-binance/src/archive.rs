//! Bulk archive adapter for `data.binance.vision`.
//!
//! Files are zipped CSVs published per day, and for klines also per month:
//!
//! ```text
//! /data/futures/um/monthly/klines/BTCUSDT/1m/BTCUSDT-1m-2026-01.zip
//! /data/futures/um/daily/klines/BTCUSDT/1m/BTCUSDT-1m-2026-01-30.zip
//! /data/futures/um/daily/metrics/BTCUSDT/BTCUSDT-metrics-2026-01-30.zip
//! ```
//!
//! Every file has a sibling `.CHECKSUM` holding its SHA-256. Downloaded files
//! are cached under `{data_dir}/downloads` and reused until the retention
//! window expires.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use marketfeed_core::{
    ArchiveFile, ArchivePeriod, ArchiveRows, ArchiveSource, Dataset, IngestError, IngestResult,
    Interval,
};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::common::{build_http_client, classify_response, classify_transport, BINANCE_ARCHIVE, EXCHANGE};
use crate::parse::{is_header, parse_kline_csv, parse_metrics_csv};

/// A completed month is fetched as one file once the range spans this many of its days.
pub const MONTHLY_MIN_DAYS: i64 = 7;

/// Archive adapter with a local download cache.
pub struct BinanceArchive {
    client: Client,
    base_url: String,
    cache_dir: PathBuf,
    verify_checksums: bool,
    cache_retention: ChronoDuration,
}

impl BinanceArchive {
    /// Creates an adapter caching under `{data_dir}/downloads`.
    ///
    /// # Errors
    /// Returns `FatalConfig` if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        data_dir: &Path,
        timeout: Duration,
        proxy: Option<&str>,
    ) -> IngestResult<Self> {
        Ok(Self {
            client: build_http_client(timeout, proxy)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache_dir: data_dir.join("downloads"),
            verify_checksums: true,
            cache_retention: ChronoDuration::days(7),
        })
    }

    /// Creates an adapter against the public archive host.
    ///
    /// # Errors
    /// Returns `FatalConfig` if the HTTP client cannot be built.
    pub fn public(data_dir: &Path) -> IngestResult<Self> {
        Self::new(BINANCE_ARCHIVE, data_dir, Duration::from_secs(60), None)
    }

    #[must_use]
    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    #[must_use]
    pub fn with_cache_retention_days(mut self, days: i64) -> Self {
        self.cache_retention = ChronoDuration::days(days.max(0));
        self
    }

    /// Cache location for one file.
    #[must_use]
    pub fn cache_path(&self, file: &ArchiveFile) -> PathBuf {
        self.cache_dir
            .join(dataset_dir(file.dataset))
            .join(EXCHANGE)
            .join(&file.symbol)
            .join(file.interval.as_str())
            .join(&file.name)
    }

    /// Deletes cached files older than the retention window.
    ///
    /// # Errors
    /// Returns `Storage` if the cache directory cannot be walked.
    pub async fn cleanup_cache(&self) -> IngestResult<usize> {
        let root = self.cache_dir.clone();
        let retention = self
            .cache_retention
            .to_std()
            .unwrap_or(Duration::ZERO);
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let removed = tokio::task::spawn_blocking(move || remove_older_than(&root, cutoff))
            .await
            .map_err(|e| IngestError::Storage(format!("Cache cleanup task failed: {e}")))?
            .map_err(|e| IngestError::Storage(format!("Cache cleanup failed: {e}")))?;

        if removed > 0 {
            info!(removed, cache_dir = %self.cache_dir.display(), "Removed expired archive files");
        }
        Ok(removed)
    }

    async fn fetch_bytes(&self, file: &ArchiveFile) -> IngestResult<Vec<u8>> {
        let response = self
            .client
            .get(&file.url)
            .send()
            .await
            .map_err(classify_transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(IngestError::ArchiveUnavailable(file.name.clone()));
        }

        let bytes = classify_response(response)
            .await?
            .bytes()
            .await
            .map_err(classify_transport)?;
        Ok(bytes.to_vec())
    }

    /// Fetches the published checksum. A missing checksum file yields None.
    async fn fetch_checksum(&self, file: &ArchiveFile) -> IngestResult<Option<String>> {
        let response = self
            .client
            .get(format!("{}.CHECKSUM", file.url))
            .send()
            .await
            .map_err(classify_transport)?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(file = %file.name, "No checksum published");
            return Ok(None);
        }

        let text = classify_response(response)
            .await?
            .text()
            .await
            .map_err(classify_transport)?;
        Ok(text.split_whitespace().next().map(str::to_lowercase))
    }

    async fn download(&self, file: &ArchiveFile, path: &Path) -> IngestResult<Vec<u8>> {
        let bytes = self.fetch_bytes(file).await?;

        if self.verify_checksums {
            if let Some(expected) = self.fetch_checksum(file).await? {
                let actual = hex::encode(Sha256::digest(&bytes));
                if actual != expected {
                    return Err(IngestError::corrupt(
                        &file.name,
                        format!("checksum mismatch: expected {expected}, got {actual}"),
                    ));
                }
            }
        }

        if let Err(e) = write_atomic(path, &bytes).await {
            warn!(file = %file.name, error = %e, "Failed to cache archive file");
        }

        debug!(file = %file.name, bytes = bytes.len(), "Downloaded archive file");
        Ok(bytes)
    }
}

fn dataset_dir(dataset: Dataset) -> &'static str {
    match dataset {
        Dataset::Candle => "klines",
        Dataset::Metric => "metrics",
    }
}

/// Builds the handle for one file.
#[must_use]
pub fn archive_file(
    base_url: &str,
    symbol: &str,
    interval: Interval,
    dataset: Dataset,
    period: ArchivePeriod,
) -> ArchiveFile {
    let symbol = symbol.to_uppercase();
    let label = period.label();
    let granularity = match period {
        ArchivePeriod::Daily(_) => "daily",
        ArchivePeriod::Monthly { .. } => "monthly",
    };

    let (name, url) = match dataset {
        Dataset::Candle => {
            let name = format!("{symbol}-{}-{label}.zip", interval.as_str());
            let url = format!(
                "{base_url}/data/futures/um/{granularity}/klines/{symbol}/{}/{name}",
                interval.as_str()
            );
            (name, url)
        }
        Dataset::Metric => {
            let name = format!("{symbol}-metrics-{label}.zip");
            let url = format!("{base_url}/data/futures/um/{granularity}/metrics/{symbol}/{name}");
            (name, url)
        }
    };

    ArchiveFile {
        symbol,
        interval,
        dataset,
        period,
        name,
        url,
    }
}

/// Plans the files covering `[start, end]`, oldest first.
///
/// Only days before `today` are published. A completed month spanned for at
/// least [`MONTHLY_MIN_DAYS`] days is one monthly file; everything else, and
/// every metrics range, is daily files.
#[must_use]
pub fn plan_files(
    base_url: &str,
    symbol: &str,
    interval: Interval,
    dataset: Dataset,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    today: NaiveDate,
) -> Vec<ArchiveFile> {
    let Some(yesterday) = today.pred_opt() else {
        return Vec::new();
    };
    let first_day = start.date_naive();
    let last_day = end.date_naive().min(yesterday);
    if start > end || first_day > last_day {
        return Vec::new();
    }

    let file = |period| archive_file(base_url, symbol, interval, dataset, period);
    let daily = |from: NaiveDate, to: NaiveDate| {
        from.iter_days()
            .take_while(move |d| *d <= to)
            .map(ArchivePeriod::Daily)
    };

    if dataset == Dataset::Metric {
        return daily(first_day, last_day).map(file).collect();
    }

    let mut files = Vec::new();
    let mut cursor = first_day;
    while cursor <= last_day {
        let month = ArchivePeriod::Monthly {
            year: cursor.year(),
            month: cursor.month(),
        };
        let month_last_day = month.end_exclusive().date_naive().pred_opt().unwrap_or(cursor);
        let span_end = month_last_day.min(last_day);
        let span_days = (span_end - cursor).num_days() + 1;
        let month_complete = month_last_day < today;

        if month_complete && span_days >= MONTHLY_MIN_DAYS {
            files.push(file(month));
        } else {
            files.extend(daily(cursor, span_end).map(file));
        }

        match span_end.succ_opt() {
            Some(next) => cursor = next,
            None => break,
        }
    }
    files
}

#[async_trait]
impl ArchiveSource for BinanceArchive {
    fn list_files(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<ArchiveFile> {
        plan_files(
            &self.base_url,
            symbol,
            interval,
            dataset,
            start,
            end,
            Utc::now().date_naive(),
        )
    }

    fn split(&self, file: &ArchiveFile) -> Vec<ArchiveFile> {
        match file.period {
            ArchivePeriod::Daily(_) => Vec::new(),
            ArchivePeriod::Monthly { .. } => file
                .period
                .days()
                .into_iter()
                .map(|day| archive_file(&self.base_url, &file.symbol, file.interval, file.dataset, day))
                .collect(),
        }
    }

    async fn load(&self, file: &ArchiveFile) -> IngestResult<ArchiveRows> {
        let path = self.cache_path(file);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!(file = %file.name, "Archive cache hit");
                bytes
            }
            Err(_) => self.download(file, &path).await?,
        };

        let handle = file.clone();
        let parsed = tokio::task::spawn_blocking(move || parse_archive(&bytes, &handle))
            .await
            .map_err(|e| IngestError::transient(format!("Archive parse task failed: {e}")))?;

        match parsed {
            Ok(rows) => {
                if rows.malformed > 0 {
                    warn!(file = %file.name, malformed = rows.malformed, "Skipped malformed archive rows");
                }
                Ok(rows)
            }
            Err(e) => {
                // A corrupt cached copy must not be served again
                let _ = tokio::fs::remove_file(&path).await;
                Err(e)
            }
        }
    }
}

/// Parses every CSV entry of a zipped archive.
fn parse_archive(bytes: &[u8], file: &ArchiveFile) -> IngestResult<ArchiveRows> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| IngestError::corrupt(&file.name, e.to_string()))?;

    let mut rows = ArchiveRows::default();
    let mut csv_entries = 0;

    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| IngestError::corrupt(&file.name, e.to_string()))?;
        if !entry.name().ends_with(".csv") {
            continue;
        }
        csv_entries += 1;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(entry);

        for record in reader.records() {
            let Ok(record) = record else {
                rows.malformed += 1;
                continue;
            };
            if is_header(&record) {
                continue;
            }

            match file.dataset {
                Dataset::Candle => {
                    match parse_kline_csv(&record, EXCHANGE, &file.symbol, file.interval)
                        .filter(|c| file.interval.is_aligned(c.open_time))
                    {
                        Some(candle) => rows.candles.push(candle),
                        None => rows.malformed += 1,
                    }
                }
                Dataset::Metric => {
                    match parse_metrics_csv(&record, EXCHANGE, &file.symbol, file.interval) {
                        Some(sample) => rows.metrics.push(sample),
                        None => rows.malformed += 1,
                    }
                }
            }
        }
    }

    if csv_entries == 0 {
        return Err(IngestError::corrupt(&file.name, "no CSV entry in archive"));
    }
    Ok(rows)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("zip.part");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

fn remove_older_than(dir: &Path, cutoff: SystemTime) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            removed += remove_older_than(&path, cutoff)?;
        } else if meta.modified()? <= cutoff {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use zip::write::SimpleFileOptions;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn zip_bytes(entry: &str, csv: &str) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file(
                    entry,
                    SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored),
                )
                .unwrap();
            writer.write_all(csv.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    const KLINE_CSV: &str = "open_time,open,high,low,close,volume,close_time,quote_volume,count,taker_buy_volume,taker_buy_quote_volume,ignore\n\
1769731200000,100,101,99,100.5,10,1769731259999,1005,7,5,502.5,0\n\
1769731260000,100.5,102,100,101,11,1769731319999,1111,8,6,606,0\n\
1769731320000,oops\n";

    // ============================================
    // Planning Tests
    // ============================================

    #[test]
    fn test_plan_uses_monthly_for_completed_month() {
        let files = plan_files(
            BINANCE_ARCHIVE,
            "btcusdt",
            Interval::OneMinute,
            Dataset::Candle,
            utc(2025, 12, 1),
            utc(2026, 1, 10),
            date(2026, 1, 30),
        );

        assert_eq!(files.len(), 11);
        assert_eq!(files[0].name, "BTCUSDT-1m-2025-12.zip");
        assert_eq!(
            files[0].url,
            "https://data.binance.vision/data/futures/um/monthly/klines/BTCUSDT/1m/BTCUSDT-1m-2025-12.zip"
        );
        assert_eq!(files[1].name, "BTCUSDT-1m-2026-01-01.zip");
        assert_eq!(files[10].name, "BTCUSDT-1m-2026-01-10.zip");
    }

    #[test]
    fn test_plan_short_span_of_past_month_is_daily() {
        let files = plan_files(
            BINANCE_ARCHIVE,
            "BTCUSDT",
            Interval::OneMinute,
            Dataset::Candle,
            utc(2025, 12, 29),
            utc(2025, 12, 31),
            date(2026, 1, 30),
        );

        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "BTCUSDT-1m-2025-12-29.zip",
                "BTCUSDT-1m-2025-12-30.zip",
                "BTCUSDT-1m-2025-12-31.zip"
            ]
        );
    }

    #[test]
    fn test_plan_stops_before_today() {
        let files = plan_files(
            BINANCE_ARCHIVE,
            "BTCUSDT",
            Interval::OneMinute,
            Dataset::Candle,
            utc(2026, 1, 28),
            utc(2026, 1, 30) + ChronoDuration::hours(12),
            date(2026, 1, 30),
        );
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].name, "BTCUSDT-1m-2026-01-29.zip");

        let nothing = plan_files(
            BINANCE_ARCHIVE,
            "BTCUSDT",
            Interval::OneMinute,
            Dataset::Candle,
            utc(2026, 1, 30),
            utc(2026, 1, 30) + ChronoDuration::hours(1),
            date(2026, 1, 30),
        );
        assert!(nothing.is_empty());
    }

    #[test]
    fn test_plan_metrics_always_daily() {
        let files = plan_files(
            BINANCE_ARCHIVE,
            "ETHUSDT",
            Interval::FiveMinutes,
            Dataset::Metric,
            utc(2025, 11, 1),
            utc(2025, 11, 30),
            date(2026, 1, 30),
        );

        assert_eq!(files.len(), 30);
        assert_eq!(files[0].name, "ETHUSDT-metrics-2025-11-01.zip");
        assert_eq!(
            files[0].url,
            "https://data.binance.vision/data/futures/um/daily/metrics/ETHUSDT/ETHUSDT-metrics-2025-11-01.zip"
        );
    }

    #[test]
    fn test_split_monthly_into_days() {
        let dir = tempfile::tempdir().unwrap();
        let archive = BinanceArchive::public(dir.path()).unwrap();
        let month = archive_file(
            BINANCE_ARCHIVE,
            "BTCUSDT",
            Interval::OneMinute,
            Dataset::Candle,
            ArchivePeriod::Monthly {
                year: 2026,
                month: 2,
            },
        );

        let days = archive.split(&month);
        assert_eq!(days.len(), 28);
        assert_eq!(days[0].name, "BTCUSDT-1m-2026-02-01.zip");
        assert!(days[0].url.contains("/daily/klines/"));
        assert!(archive.split(&days[0]).is_empty());
    }

    // ============================================
    // Load Tests
    // ============================================

    async fn setup(server: &MockServer, dir: &Path) -> (BinanceArchive, ArchiveFile) {
        let archive = BinanceArchive::new(&server.uri(), dir, Duration::from_secs(5), None).unwrap();
        let file = archive_file(
            &server.uri(),
            "BTCUSDT",
            Interval::OneMinute,
            Dataset::Candle,
            ArchivePeriod::Daily(date(2026, 1, 30)),
        );
        (archive, file)
    }

    const FILE_PATH: &str = "/data/futures/um/daily/klines/BTCUSDT/1m/BTCUSDT-1m-2026-01-30.zip";

    #[tokio::test]
    async fn test_load_verifies_parses_and_caches() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let bytes = zip_bytes("BTCUSDT-1m-2026-01-30.csv", KLINE_CSV);
        let checksum = format!("{}  BTCUSDT-1m-2026-01-30.zip", hex::encode(Sha256::digest(&bytes)));

        Mock::given(method("GET"))
            .and(path(FILE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{FILE_PATH}.CHECKSUM")))
            .respond_with(ResponseTemplate::new(200).set_body_string(checksum))
            .expect(1)
            .mount(&server)
            .await;

        let (archive, file) = setup(&server, dir.path()).await;
        let rows = archive.load(&file).await.unwrap();

        assert_eq!(rows.candles.len(), 2);
        assert_eq!(rows.malformed, 1);
        assert_eq!(rows.candles[0].open_time.timestamp_millis(), 1769731200000);
        assert_eq!(rows.candles[0].trade_count, Some(7));
        assert!(archive.cache_path(&file).exists());

        // Served from cache; the mocks expect a single hit each
        let again = archive.load(&file).await.unwrap();
        assert_eq!(again.candles.len(), 2);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_unavailable() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path(FILE_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (archive, file) = setup(&server, dir.path()).await;
        let err = archive.load(&file).await.unwrap_err();
        assert!(matches!(err, IngestError::ArchiveUnavailable(_)));
    }

    #[tokio::test]
    async fn test_load_checksum_mismatch_is_corrupt() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path(FILE_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(zip_bytes("a.csv", KLINE_CSV)),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{FILE_PATH}.CHECKSUM")))
            .respond_with(ResponseTemplate::new(200).set_body_string("deadbeef  x.zip"))
            .mount(&server)
            .await;

        let (archive, file) = setup(&server, dir.path()).await;
        let err = archive.load(&file).await.unwrap_err();
        assert!(matches!(err, IngestError::CorruptArchive { .. }));
        assert!(!archive.cache_path(&file).exists());
    }

    #[tokio::test]
    async fn test_load_garbage_zip_is_corrupt_and_evicted() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Mock::given(method("GET"))
            .and(path(FILE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not a zip".to_vec()))
            .mount(&server)
            .await;

        let (archive, file) = setup(&server, dir.path()).await;
        let archive = archive.with_verify_checksums(false);
        let err = archive.load(&file).await.unwrap_err();
        assert!(matches!(err, IngestError::CorruptArchive { .. }));
        assert!(!archive.cache_path(&file).exists());
    }

    #[tokio::test]
    async fn test_load_metrics_archive() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let csv = "create_time,symbol,sum_open_interest,sum_open_interest_value,sum_toptrader_long_short_ratio,count_toptrader_long_short_ratio,count_long_short_ratio,sum_taker_long_short_vol_ratio\n\
2026-01-30 12:00:00,BTCUSDT,80000.5,8000000000,1.8,1.2,1.1,0.95\n\
2026-01-30 12:05:00,BTCUSDT,80010.5,8001000000,1.7,1.3,1.0,1.05\n";
        Mock::given(method("GET"))
            .and(path("/data/futures/um/daily/metrics/BTCUSDT/BTCUSDT-metrics-2026-01-30.zip"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(zip_bytes("BTCUSDT-metrics-2026-01-30.csv", csv)),
            )
            .mount(&server)
            .await;

        let archive = BinanceArchive::new(&server.uri(), dir.path(), Duration::from_secs(5), None)
            .unwrap()
            .with_verify_checksums(false);
        let file = archive_file(
            &server.uri(),
            "BTCUSDT",
            Interval::FiveMinutes,
            Dataset::Metric,
            ArchivePeriod::Daily(date(2026, 1, 30)),
        );

        let rows = archive.load(&file).await.unwrap();
        assert_eq!(rows.metrics.len(), 2);
        assert_eq!(rows.malformed, 0);
        assert_eq!(rows.metrics[0].timestamp.timestamp_millis(), 1769774400000);
        assert_eq!(
            rows.metrics[0].top_trader_position_ratio,
            Some(rust_decimal_macros::dec!(1.8))
        );
        assert_eq!(
            rows.metrics[0].top_trader_account_ratio,
            Some(rust_decimal_macros::dec!(1.2))
        );
    }

    #[tokio::test]
    async fn test_cleanup_cache_removes_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = BinanceArchive::public(dir.path())
            .unwrap()
            .with_cache_retention_days(0);
        let cached = dir.path().join("downloads/klines/binance_futures_um/BTCUSDT/1m/old.zip");
        std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
        std::fs::write(&cached, b"x").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(archive.cleanup_cache().await.unwrap(), 1);
        assert!(!cached.exists());

        let empty = BinanceArchive::public(&dir.path().join("missing")).unwrap();
        assert_eq!(empty.cleanup_cache().await.unwrap(), 0);
    }
}
