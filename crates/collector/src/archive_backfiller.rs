//! Bulk recovery from packaged historical archives.
//!
//! Claims large gaps, walks the archive files covering them, and commits each
//! file as one batch. Ranges the archive cannot serve (unpublished, corrupt,
//! or missing rows inside a file) are handed to the incremental path as new
//! descriptors instead of failing the whole gap.

use anyhow::Result;
use chrono::{DateTime, Utc};
use marketfeed_core::{
    ArchiveFile, ArchivePeriod, ArchiveRows, ArchiveSource, BackfillConfig, ClaimFilter, DataSource,
    Dataset, GapDescriptor, GapRoute, IngestError,
};
use std::collections::VecDeque;
use marketfeed_data::GapQueue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::gap_scanner::find_missing_runs;
use crate::rate_guard::RateGuard;
use crate::types::{
    retry_backoff, stop_requested, wait_for_stop, BackfillStats, StopSignal, ARCHIVE_FILE_WEIGHT,
};
use crate::{commit_candles, commit_metrics, SharedStore};

/// Archive worker settings.
#[derive(Debug, Clone)]
pub struct ArchiveBackfillerConfig {
    pub worker_id: String,
    /// Smallest auto-routed gap this worker claims
    pub min_bars: u64,
    pub claim_ttl: Duration,
    /// Sleep between empty claim attempts
    pub idle_poll: Duration,
}

impl ArchiveBackfillerConfig {
    #[must_use]
    pub fn new(worker_id: impl Into<String>, config: &BackfillConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            min_bars: config.archive_min_bars,
            claim_ttl: Duration::from_secs(config.claim_ttl_secs.max(1) as u64),
            idle_poll: Duration::from_secs(config.idle_poll_secs.max(1)),
        }
    }
}

/// What happened to one claimed descriptor.
enum ClaimOutcome {
    Completed,
    Failed,
    Interrupted,
}

/// Archive backfill worker.
pub struct ArchiveBackfiller {
    archive: Arc<dyn ArchiveSource>,
    store: SharedStore,
    guard: Arc<RateGuard>,
    config: ArchiveBackfillerConfig,
    stats: BackfillStats,
}

impl ArchiveBackfiller {
    #[must_use]
    pub fn new(
        archive: Arc<dyn ArchiveSource>,
        store: SharedStore,
        guard: Arc<RateGuard>,
        config: ArchiveBackfillerConfig,
    ) -> Self {
        Self {
            archive,
            store,
            guard,
            config,
            stats: BackfillStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &BackfillStats {
        &self.stats
    }

    /// Claims and processes one descriptor. Returns false if none was claimable.
    ///
    /// # Errors
    /// Returns an error if the gap queue cannot be read or written.
    pub async fn run_once(&mut self, stop: &StopSignal) -> Result<bool> {
        let filter = ClaimFilter::Archive {
            min_bars: self.config.min_bars,
        };
        let Some(gap) = self
            .store
            .claim(filter, &self.config.worker_id, self.config.claim_ttl)
            .await?
        else {
            return Ok(false);
        };

        self.stats.claims += 1;
        info!(
            component = "archive_backfiller",
            worker = %self.config.worker_id,
            gap_id = gap.id,
            symbol = %gap.symbol,
            interval = %gap.interval,
            dataset = %gap.dataset,
            start = %gap.start_time,
            end = %gap.end_time,
            bars = gap.bars(),
            "Claimed gap"
        );

        match self.process(&gap, stop).await? {
            ClaimOutcome::Completed => self.stats.completed += 1,
            ClaimOutcome::Failed => self.stats.failures += 1,
            ClaimOutcome::Interrupted => {
                warn!(
                    component = "archive_backfiller",
                    gap_id = gap.id,
                    "Shutdown during archive claim, leaving claim to expire"
                );
            }
        }
        Ok(true)
    }

    async fn process(&mut self, gap: &GapDescriptor, stop: &StopSignal) -> Result<ClaimOutcome> {
        let files = self.archive.list_files(
            &gap.symbol,
            gap.interval,
            gap.dataset,
            gap.start_time,
            gap.end_time,
        );

        let mut unresolved = uncovered_ranges(gap, &files);
        let mut queue: VecDeque<ArchiveFile> = files.into();

        while let Some(file) = queue.pop_front() {
            if stop_requested(stop) {
                return Ok(ClaimOutcome::Interrupted);
            }

            let range_start = file.first_open_time().max(gap.start_time);
            let range_end = file.last_open_time().min(gap.end_time);
            if range_start > range_end {
                continue;
            }

            let archive = self.archive.clone();
            let loaded = self
                .guard
                .execute(ARCHIVE_FILE_WEIGHT, || {
                    let archive = archive.clone();
                    let file = file.clone();
                    async move { archive.load(&file).await }
                })
                .await;

            match loaded {
                Ok(rows) => {
                    self.stats.units += 1;
                    let missing = self.commit(gap, &file, rows, range_start, range_end).await?;
                    unresolved.extend(missing);
                }
                Err(IngestError::ArchiveUnavailable(url))
                    if matches!(file.period, ArchivePeriod::Monthly { .. }) =>
                {
                    let days: Vec<ArchiveFile> = self
                        .archive
                        .split(&file)
                        .into_iter()
                        .filter(|day| {
                            day.last_open_time() >= gap.start_time && day.first_open_time() <= gap.end_time
                        })
                        .collect();
                    info!(
                        component = "archive_backfiller",
                        file = %file.name,
                        url = %url,
                        days = days.len(),
                        "Monthly archive unavailable, falling back to daily files"
                    );
                    for day in days.into_iter().rev() {
                        queue.push_front(day);
                    }
                }
                Err(e @ (IngestError::ArchiveUnavailable(_) | IngestError::CorruptArchive { .. })) => {
                    warn!(
                        component = "archive_backfiller",
                        file = %file.name,
                        start = %range_start,
                        end = %range_end,
                        error = %e,
                        "Archive file unusable, handing range to incremental backfill"
                    );
                    unresolved.push((range_start, range_end));
                }
                Err(e) => {
                    let retry_at = Utc::now() + retry_backoff(gap.attempts);
                    error!(
                        component = "archive_backfiller",
                        gap_id = gap.id,
                        file = %file.name,
                        attempts = gap.attempts + 1,
                        retry_at = %retry_at,
                        error = %e,
                        "Archive backfill attempt failed"
                    );
                    self.store.fail(gap.id, &e.to_string(), retry_at).await?;
                    return Ok(ClaimOutcome::Failed);
                }
            }
        }

        // The claim must be released before hand-downs can be enqueued over its range
        self.store.complete(gap.id).await?;

        let step = gap.interval.step();
        for (start, end) in merge_ranges(unresolved, step) {
            let handoff = GapDescriptor::new(&gap.symbol, gap.interval, gap.dataset, start, end)
                .with_priority(gap.priority)
                .with_route(GapRoute::Incremental);
            if self.store.enqueue(handoff).await?.is_some() {
                self.stats.handed_down += 1;
                debug!(
                    component = "archive_backfiller",
                    symbol = %gap.symbol,
                    interval = %gap.interval,
                    start = %start,
                    end = %end,
                    "Handed range to incremental backfill"
                );
            }
        }

        info!(
            component = "archive_backfiller",
            gap_id = gap.id,
            symbol = %gap.symbol,
            interval = %gap.interval,
            "Archive gap resolved"
        );
        Ok(ClaimOutcome::Completed)
    }

    /// Commits the rows of one file inside the gap and returns the sub-ranges
    /// the file did not contain.
    async fn commit(
        &mut self,
        gap: &GapDescriptor,
        file: &ArchiveFile,
        rows: ArchiveRows,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
        let in_range = |t: DateTime<Utc>| t >= range_start && t <= range_end;

        let (mut present, outcome) = match gap.dataset {
            Dataset::Candle => {
                let candles: Vec<_> = rows
                    .candles
                    .into_iter()
                    .filter(|c| c.symbol == gap.symbol && in_range(c.open_time))
                    .collect();
                let times: Vec<_> = candles.iter().map(|c| c.open_time).collect();
                (times, commit_candles(&*self.store, DataSource::Archive, &candles).await?)
            }
            Dataset::Metric => {
                let metrics: Vec<_> = rows
                    .metrics
                    .into_iter()
                    .filter(|m| m.symbol == gap.symbol && in_range(m.timestamp))
                    .collect();
                let times: Vec<_> = metrics.iter().map(|m| m.timestamp).collect();
                (times, commit_metrics(&*self.store, DataSource::Archive, &metrics).await?)
            }
        };

        self.stats.rows_written += outcome.written;
        self.stats.rows_superseded += outcome.superseded;

        present.sort();
        present.dedup();
        let missing = find_missing_runs(&present, range_start, range_end, gap.interval.step());

        info!(
            component = "archive_backfiller",
            file = %file.name,
            rows = present.len(),
            written = outcome.written,
            superseded = outcome.superseded,
            malformed = rows.malformed,
            missing_runs = missing.len(),
            "Archive file committed"
        );
        Ok(missing)
    }

    /// Works the queue until stopped.
    ///
    /// # Errors
    /// Never returns an error; queue failures are logged and retried after
    /// the idle poll.
    pub async fn run(mut self, mut stop: StopSignal) -> Result<BackfillStats> {
        info!(component = "archive_backfiller", worker = %self.config.worker_id, "Archive worker started");

        while !stop_requested(&stop) {
            let idle = match self.run_once(&stop).await {
                Ok(claimed) => !claimed,
                Err(e) => {
                    error!(component = "archive_backfiller", error = %e, "Archive worker iteration failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = wait_for_stop(&mut stop) => break,
                    _ = tokio::time::sleep(self.config.idle_poll) => {}
                }
            }
        }

        info!(
            component = "archive_backfiller",
            worker = %self.config.worker_id,
            summary = %self.stats.summary(),
            "Archive worker stopped"
        );
        Ok(self.stats)
    }
}

/// Parts of the gap no listed file covers (for example today, before any
/// archive is published).
fn uncovered_ranges(gap: &GapDescriptor, files: &[ArchiveFile]) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let step = gap.interval.step();
    let mut uncovered = Vec::new();
    let mut cursor = gap.start_time;

    let mut spans: Vec<_> = files
        .iter()
        .map(|f| (f.first_open_time(), f.last_open_time()))
        .collect();
    spans.sort();

    for (first, last) in spans {
        if cursor > gap.end_time {
            break;
        }
        if first > cursor {
            uncovered.push((cursor, (first - step).min(gap.end_time)));
        }
        cursor = cursor.max(last + step);
    }
    if cursor <= gap.end_time {
        uncovered.push((cursor, gap.end_time));
    }
    uncovered
}

/// Sorts ranges and joins the ones that overlap or touch.
fn merge_ranges(
    mut ranges: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    step: chrono::Duration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    ranges.sort();
    let mut merged: Vec<(DateTime<Utc>, DateTime<Utc>)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1 + step => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_guard::{MemoryBanStore, RateGuardConfig};
    use crate::types::stop_channel;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone};
    use marketfeed_core::{Candle, GapStatus, IngestResult, Interval};
    use marketfeed_data::MemoryStore;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
    }

    fn midnight(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, d, 0, 0, 0).unwrap()
    }

    fn file(period: ArchivePeriod) -> ArchiveFile {
        ArchiveFile {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::OneHour,
            dataset: Dataset::Candle,
            period,
            name: format!("BTCUSDT-1h-{}.zip", period.label()),
            url: format!("https://archive.test/{}", period.label()),
        }
    }

    fn hourly(start: DateTime<Utc>, hours: i64) -> Vec<Candle> {
        (0..hours)
            .map(|h| {
                Candle::new(
                    "binance_futures_um",
                    "BTCUSDT",
                    Interval::OneHour,
                    start + ChronoDuration::hours(h),
                    dec!(100),
                    dec!(101),
                    dec!(99),
                    dec!(100),
                    dec!(10),
                    DataSource::Archive,
                )
            })
            .collect()
    }

    /// Archive with a fixed file list and per-label load results.
    struct FakeArchive {
        files: Vec<ArchiveFile>,
        results: Mutex<HashMap<String, IngestResult<ArchiveRows>>>,
        loads: Mutex<Vec<String>>,
    }

    impl FakeArchive {
        fn new(files: Vec<ArchiveFile>) -> Self {
            Self {
                files,
                results: Mutex::new(HashMap::new()),
                loads: Mutex::new(Vec::new()),
            }
        }

        fn with(self, label: &str, result: IngestResult<ArchiveRows>) -> Self {
            self.results.lock().insert(label.to_string(), result);
            self
        }
    }

    #[async_trait]
    impl ArchiveSource for FakeArchive {
        fn list_files(
            &self,
            _symbol: &str,
            _interval: Interval,
            _dataset: Dataset,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Vec<ArchiveFile> {
            self.files
                .iter()
                .filter(|f| f.last_open_time() >= start && f.first_open_time() <= end)
                .cloned()
                .collect()
        }

        fn split(&self, file: &ArchiveFile) -> Vec<ArchiveFile> {
            match file.period {
                ArchivePeriod::Daily(_) => Vec::new(),
                ArchivePeriod::Monthly { .. } => file.period.days().into_iter().map(super::tests::file).collect(),
            }
        }

        async fn load(&self, file: &ArchiveFile) -> IngestResult<ArchiveRows> {
            let label = file.period.label();
            self.loads.lock().push(label.clone());
            match self.results.lock().remove(&label) {
                Some(result) => result,
                None => Err(IngestError::ArchiveUnavailable(file.url.clone())),
            }
        }
    }

    fn rows(candles: Vec<Candle>) -> IngestResult<ArchiveRows> {
        Ok(ArchiveRows {
            candles,
            ..Default::default()
        })
    }

    fn backfiller(archive: FakeArchive, store: Arc<MemoryStore>) -> ArchiveBackfiller {
        let guard = Arc::new(RateGuard::new(
            "test",
            RateGuardConfig::default().with_retries(0, Duration::from_millis(1)),
            Arc::new(MemoryBanStore::new()),
        ));
        let config = ArchiveBackfillerConfig {
            worker_id: "archive-0".to_string(),
            min_bars: 24,
            claim_ttl: Duration::from_secs(300),
            idle_poll: Duration::from_secs(5),
        };
        ArchiveBackfiller::new(Arc::new(archive), store, guard, config)
    }

    async fn enqueue(store: &MemoryStore, start: DateTime<Utc>, end: DateTime<Utc>) -> GapDescriptor {
        store
            .enqueue(GapDescriptor::new("BTCUSDT", Interval::OneHour, Dataset::Candle, start, end))
            .await
            .unwrap()
            .unwrap()
    }

    // ============================================
    // Range Helper Tests
    // ============================================

    #[test]
    fn test_uncovered_ranges_reports_tail() {
        let gap = GapDescriptor::new(
            "BTCUSDT",
            Interval::OneHour,
            Dataset::Candle,
            midnight(10),
            midnight(12) + ChronoDuration::hours(5),
        );
        let files = vec![file(ArchivePeriod::Daily(day(10))), file(ArchivePeriod::Daily(day(11)))];

        assert_eq!(
            uncovered_ranges(&gap, &files),
            vec![(midnight(12), midnight(12) + ChronoDuration::hours(5))]
        );
    }

    #[test]
    fn test_merge_ranges_joins_touching() {
        let step = ChronoDuration::hours(1);
        let h = |n: i64| midnight(10) + ChronoDuration::hours(n);
        let merged = merge_ranges(vec![(h(5), h(6)), (h(0), h(2)), (h(3), h(3))], step);
        assert_eq!(merged, vec![(h(0), h(3)), (h(5), h(6))]);
    }

    // ============================================
    // Backfill Tests
    // ============================================

    #[tokio::test]
    async fn test_archive_fills_gap_and_records_lineage() {
        let store = Arc::new(MemoryStore::new());
        let gap = enqueue(&store, midnight(10), midnight(11) + ChronoDuration::hours(23)).await;

        let archive = FakeArchive::new(vec![
            file(ArchivePeriod::Daily(day(10))),
            file(ArchivePeriod::Daily(day(11))),
        ])
        .with("2026-01-10", rows(hourly(midnight(10), 24)))
        .with("2026-01-11", rows(hourly(midnight(11), 24)));

        let mut worker = backfiller(archive, store.clone());
        let (_tx, stop) = stop_channel();
        assert!(worker.run_once(&stop).await.unwrap());

        assert_eq!(store.candle_count(), 48);
        assert_eq!(store.get(gap.id).await.unwrap().unwrap().status, GapStatus::Done);
        assert_eq!(worker.stats().units, 2);
        assert_eq!(worker.stats().handed_down, 0);
        assert_eq!(store.batches().len(), 2);
        assert!(store.batches().iter().all(|b| b.source == DataSource::Archive));
    }

    #[tokio::test]
    async fn test_unusable_files_hand_down_ranges() {
        let store = Arc::new(MemoryStore::new());
        let gap = enqueue(&store, midnight(10), midnight(12) + ChronoDuration::hours(23)).await;

        // Day 10 corrupt, day 11 missing two hours, day 12 unpublished
        let mut partial = hourly(midnight(11), 24);
        partial.retain(|c| c.open_time != midnight(11) + ChronoDuration::hours(3)
            && c.open_time != midnight(11) + ChronoDuration::hours(4));
        let archive = FakeArchive::new(vec![
            file(ArchivePeriod::Daily(day(10))),
            file(ArchivePeriod::Daily(day(11))),
            file(ArchivePeriod::Daily(day(12))),
        ])
        .with("2026-01-10", Err(IngestError::corrupt("2026-01-10", "bad zip")))
        .with("2026-01-11", rows(partial));

        let mut worker = backfiller(archive, store.clone());
        let (_tx, stop) = stop_channel();
        worker.run_once(&stop).await.unwrap();

        assert_eq!(store.get(gap.id).await.unwrap().unwrap().status, GapStatus::Done);

        let handed: Vec<_> = store.outstanding().await.unwrap();
        assert!(handed.iter().all(|g| g.route == GapRoute::Incremental));
        let ranges: Vec<_> = handed.iter().map(|g| (g.start_time, g.end_time)).collect();
        assert!(ranges.contains(&(midnight(10), midnight(10) + ChronoDuration::hours(23))));
        assert!(ranges.contains(&(
            midnight(11) + ChronoDuration::hours(3),
            midnight(11) + ChronoDuration::hours(4)
        )));
        assert!(ranges.contains(&(midnight(12), midnight(12) + ChronoDuration::hours(23))));
        assert_eq!(store.candle_count(), 22);
    }

    #[tokio::test]
    async fn test_unavailable_month_falls_back_to_days() {
        let store = Arc::new(MemoryStore::new());
        enqueue(&store, midnight(30), midnight(31) + ChronoDuration::hours(23)).await;

        let archive = FakeArchive::new(vec![file(ArchivePeriod::Monthly { year: 2026, month: 1 })])
            .with("2026-01-30", rows(hourly(midnight(30), 24)))
            .with("2026-01-31", rows(hourly(midnight(31), 24)));
        let mut worker = backfiller(archive, store.clone());
        let (_tx, stop) = stop_channel();
        worker.run_once(&stop).await.unwrap();

        assert_eq!(store.candle_count(), 48);
        assert!(store.outstanding().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_releases_with_backoff() {
        let store = Arc::new(MemoryStore::new());
        let gap = enqueue(&store, midnight(10), midnight(10) + ChronoDuration::hours(23)).await;

        let archive = FakeArchive::new(vec![file(ArchivePeriod::Daily(day(10)))])
            .with("2026-01-10", Err(IngestError::transient("timeout")));
        let mut worker = backfiller(archive, store.clone());
        let (_tx, stop) = stop_channel();
        worker.run_once(&stop).await.unwrap();

        let failed = store.get(gap.id).await.unwrap().unwrap();
        assert_eq!(failed.status, GapStatus::Open);
        assert_eq!(failed.attempts, 1);
        assert!(failed.claimed_by.is_none());
        assert!(failed.next_attempt_at.unwrap() > Utc::now());
        assert_eq!(worker.stats().failures, 1);

        // Not claimable until the backoff passes
        assert!(!worker.run_once(&stop).await.unwrap());
    }

    #[tokio::test]
    async fn test_small_gaps_left_for_incremental() {
        let store = Arc::new(MemoryStore::new());
        enqueue(&store, midnight(10), midnight(10) + ChronoDuration::hours(3)).await;

        let mut worker = backfiller(FakeArchive::new(Vec::new()), store.clone());
        let (_tx, stop) = stop_channel();
        assert!(!worker.run_once(&stop).await.unwrap());
        assert_eq!(store.outstanding().await.unwrap().len(), 1);
        assert_eq!(store.candle_count(), 0);
    }
}
