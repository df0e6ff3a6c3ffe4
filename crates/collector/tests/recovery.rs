//! End-to-end gap recovery against the in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use marketfeed_collector::{
    stop_channel, ArchiveBackfiller, ArchiveBackfillerConfig, GapScanner, GapScannerConfig,
    IncrementalBackfiller, IncrementalBackfillerConfig, MemoryBanStore, RateGuard,
    RateGuardConfig, ScanReport,
};
use marketfeed_core::{
    AppConfig, ArchiveFile, ArchivePeriod, ArchiveRows, ArchiveSource, BackfillConfig, Candle,
    ClaimFilter, DataSource, Dataset, GapStatus, IngestError, IngestResult, Interval,
    MarketDataRest, MetricSample,
};
use marketfeed_data::{GapQueue, MarketStore, MemoryStore};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn sample_timestamp() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 30, 12, 0, 0).unwrap()
}

fn t(minute: i64) -> DateTime<Utc> {
    sample_timestamp() + ChronoDuration::minutes(minute)
}

fn candle(open_time: DateTime<Utc>, source: DataSource) -> Candle {
    Candle::new(
        "binance_futures_um",
        "BTCUSDT",
        Interval::OneMinute,
        open_time,
        dec!(100),
        dec!(101),
        dec!(99),
        dec!(100),
        dec!(2),
        source,
    )
}

async fn seed(store: &MemoryStore, minutes: impl IntoIterator<Item = i64>) {
    let rows: Vec<Candle> = minutes.into_iter().map(|m| candle(t(m), DataSource::Stream)).collect();
    store.upsert_candles(&rows).await.unwrap();
}

fn guard() -> Arc<RateGuard> {
    Arc::new(RateGuard::new(
        "binance_futures_um",
        RateGuardConfig::default().with_retries(0, Duration::from_millis(1)),
        Arc::new(MemoryBanStore::new()),
    ))
}

async fn scan(store: &Arc<MemoryStore>, start: i64, end: i64) -> ScanReport {
    let scanner = GapScanner::new(store.clone(), GapScannerConfig::from_config(&AppConfig::default()));
    let mut report = ScanReport::default();
    scanner
        .scan_range("BTCUSDT", Interval::OneMinute, Dataset::Candle, t(start), t(end), &mut report)
        .await
        .unwrap();
    report
}

/// Dense one-minute bars for any requested range.
struct DenseRest;

#[async_trait]
impl MarketDataRest for DenseRest {
    async fn get_klines(
        &self,
        _symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> IngestResult<Vec<Candle>> {
        let mut rows = Vec::new();
        let mut open_time = start;
        while open_time <= end && rows.len() < limit {
            rows.push(candle(open_time, DataSource::Poll));
            open_time += interval.step();
        }
        Ok(rows)
    }

    async fn get_metrics(
        &self,
        _symbol: &str,
        _interval: Interval,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _limit: usize,
    ) -> IngestResult<Vec<MetricSample>> {
        Ok(Vec::new())
    }

    async fn list_symbols(&self) -> IngestResult<Vec<String>> {
        Ok(vec!["BTCUSDT".to_string()])
    }

    fn exchange(&self) -> &str {
        "binance_futures_um"
    }
}

/// Daily one-minute archives, published up to and including `last_day`.
struct DailyArchive {
    last_day: NaiveDate,
}

#[async_trait]
impl ArchiveSource for DailyArchive {
    fn list_files(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<ArchiveFile> {
        let mut files = Vec::new();
        let mut day = start.date_naive();
        while day <= end.date_naive() {
            let period = ArchivePeriod::Daily(day);
            files.push(ArchiveFile {
                symbol: symbol.to_string(),
                interval,
                dataset,
                period,
                name: format!("{symbol}-1m-{}.zip", period.label()),
                url: format!("https://archive.test/{}", period.label()),
            });
            day = day.succ_opt().unwrap();
        }
        files
    }

    fn split(&self, _file: &ArchiveFile) -> Vec<ArchiveFile> {
        Vec::new()
    }

    async fn load(&self, file: &ArchiveFile) -> IngestResult<ArchiveRows> {
        if file.period.start().date_naive() > self.last_day {
            return Err(IngestError::ArchiveUnavailable(file.url.clone()));
        }
        let mut candles = Vec::new();
        let mut open_time = file.first_open_time();
        while open_time <= file.last_open_time() {
            candles.push(candle(open_time, DataSource::Archive));
            open_time += Interval::OneMinute.step();
        }
        Ok(ArchiveRows {
            candles,
            ..Default::default()
        })
    }
}

fn incremental(store: &Arc<MemoryStore>) -> IncrementalBackfiller {
    IncrementalBackfiller::new(
        Arc::new(DenseRest),
        store.clone(),
        guard(),
        IncrementalBackfillerConfig::new("incremental-0", &BackfillConfig::default()).claim_any(),
    )
}

// ============================================
// Detection
// ============================================

#[tokio::test]
async fn test_missing_pair_yields_one_descriptor() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, (0..10).filter(|m| *m != 4 && *m != 5)).await;

    let report = scan(&store, 0, 9).await;

    assert_eq!(report.enqueued.len(), 1);
    assert_eq!(report.enqueued[0].start_time, t(4));
    assert_eq!(report.enqueued[0].end_time, t(5));
}

#[tokio::test]
async fn test_interior_run_between_present_bars() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, [0, 1, 2, 5, 6]).await;

    let report = scan(&store, 0, 6).await;

    assert_eq!(report.enqueued.len(), 1);
    assert_eq!(report.enqueued[0].start_time, t(3));
    assert_eq!(report.enqueued[0].end_time, t(4));
}

#[tokio::test]
async fn test_dense_series_enqueues_nothing() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, 0..10).await;

    let report = scan(&store, 0, 9).await;

    assert!(report.enqueued.is_empty());
    assert!(store.all_gaps().is_empty());
}

// ============================================
// Recovery
// ============================================

#[tokio::test]
async fn test_scan_then_incremental_heals_series() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, (0..10).filter(|m| *m != 4 && *m != 5)).await;
    scan(&store, 0, 9).await;

    let (_tx, stop) = stop_channel();
    let mut worker = incremental(&store);
    while worker.run_once(&stop).await.unwrap() {}

    assert_eq!(store.candle_count(), 10);
    assert!(store.outstanding().await.unwrap().is_empty());
    assert!(scan(&store, 0, 9).await.enqueued.is_empty());
}

#[tokio::test]
async fn test_archive_hands_unpublished_tail_to_incremental() {
    let store = Arc::new(MemoryStore::new());
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2026, 1, 3, 0, 59, 0).unwrap();

    let scanner = GapScanner::new(store.clone(), GapScannerConfig::from_config(&AppConfig::default()));
    let mut report = ScanReport::default();
    scanner
        .scan_range("BTCUSDT", Interval::OneMinute, Dataset::Candle, start, end, &mut report)
        .await
        .unwrap();
    assert_eq!(report.enqueued.len(), 1);

    let mut backfill = BackfillConfig::default();
    backfill.archive_min_bars = 100;
    let mut archive = ArchiveBackfiller::new(
        Arc::new(DailyArchive {
            last_day: NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
        }),
        store.clone(),
        guard(),
        ArchiveBackfillerConfig::new("archive-0", &backfill),
    );
    let (_tx, stop) = stop_channel();
    assert!(archive.run_once(&stop).await.unwrap());

    // Two archived days; the third day's hour waits on the REST path
    assert_eq!(store.candle_count(), 2 * 1440);
    let handed = store.outstanding().await.unwrap();
    assert_eq!(handed.len(), 1);
    assert_eq!(handed[0].start_time, Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).unwrap());
    assert_eq!(handed[0].end_time, end);

    let mut worker = incremental(&store);
    while worker.run_once(&stop).await.unwrap() {}

    assert_eq!(store.candle_count(), 2 * 1440 + 60);
    assert!(store.outstanding().await.unwrap().is_empty());
    let sources: Vec<DataSource> = store.batches().iter().map(|b| b.source).collect();
    assert!(sources.contains(&DataSource::Archive));
    assert!(sources.contains(&DataSource::IncrementalRest));
}

#[tokio::test]
async fn test_claim_of_crashed_worker_is_resumed() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, (0..20).filter(|m| !(5..15).contains(m))).await;
    scan(&store, 0, 19).await;

    let orphan = store
        .claim(ClaimFilter::Any, "crashed-worker", Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    let (_tx, stop) = stop_channel();
    let mut worker = incremental(&store);
    assert!(!worker.run_once(&stop).await.unwrap());

    let released = store
        .release_expired_claims(Utc::now() + ChronoDuration::seconds(5))
        .await
        .unwrap();
    assert_eq!(released, 1);

    while worker.run_once(&stop).await.unwrap() {}

    assert_eq!(store.candle_count(), 20);
    let healed = store.get(orphan.id).await.unwrap().unwrap();
    assert_eq!(healed.status, GapStatus::Done);
}

// ============================================
// Shared ban state
// ============================================

#[tokio::test]
async fn test_ban_recorded_by_one_guard_blocks_the_other() {
    let bans = Arc::new(MemoryBanStore::new());
    let stream_guard = RateGuard::new("binance_futures_um", RateGuardConfig::default(), bans.clone());
    let backfill_guard = RateGuard::new("binance_futures_um", RateGuardConfig::default(), bans);

    stream_guard
        .record_ban(418, Some(Duration::from_secs(60)), "IP banned")
        .await;

    let blocked = backfill_guard.try_acquire(1).await;
    assert!(matches!(blocked, Err(IngestError::RateLimited { .. })));
    assert!(backfill_guard.current_ban().await.is_some());
}
