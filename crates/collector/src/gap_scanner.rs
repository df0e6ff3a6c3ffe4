//! Gap detection by dense-timestamp diffing.
//!
//! For every (symbol, interval) the scanner reads the present timestamps of a
//! window, walks the expected boundaries at the interval's step, and emits
//! one descriptor per contiguous missing run. The newest bars are left out of
//! the window so bars still in flight on the stream are never flagged.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use marketfeed_core::{AppConfig, Dataset, GapDescriptor, Interval};
use marketfeed_data::{GapQueue, MarketStore};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::types::{wait_for_stop, StopSignal};
use crate::SharedStore;

/// Priority of descriptors found by a periodic scan.
pub const SCAN_PRIORITY: i32 = 0;

/// Scanner settings.
#[derive(Debug, Clone)]
pub struct GapScannerConfig {
    pub exchange: String,
    pub symbols: Vec<String>,
    pub intervals: Vec<Interval>,
    /// Interval of the metrics series, None to skip metrics
    pub metric_interval: Option<Interval>,
    pub scan_interval: Duration,
    pub lookback: ChronoDuration,
    /// Window of the first scan after startup
    pub initial_lookback: ChronoDuration,
    /// Newest bars left out of every window
    pub settle_bars: i64,
    /// Open descriptors older than this are abandoned
    pub retention: ChronoDuration,
    /// Open descriptors with this many failed attempts are abandoned
    pub max_attempts: i32,
}

impl GapScannerConfig {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            exchange: config.exchange.name.clone(),
            symbols: config.universe.symbols.clone(),
            intervals: config.intervals(),
            metric_interval: config.metrics.enabled.then(|| config.metric_interval()),
            scan_interval: Duration::from_secs(config.scanner.interval_secs.max(1)),
            lookback: ChronoDuration::minutes(config.scanner.lookback_minutes),
            initial_lookback: ChronoDuration::days(config.backfill.days),
            settle_bars: config.scanner.settle_bars.max(1),
            retention: ChronoDuration::hours(config.scanner.retention_hours),
            max_attempts: config.backfill.max_attempts,
        }
    }

    /// Uses the same window for every scan, including the first.
    #[must_use]
    pub fn with_lookback(mut self, lookback: ChronoDuration) -> Self {
        self.lookback = lookback;
        self.initial_lookback = lookback;
        self
    }
}

/// Outcome of one scan pass.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub series_scanned: usize,
    pub runs_found: usize,
    /// Descriptors written (new or widened)
    pub enqueued: Vec<GapDescriptor>,
    /// Runs already covered by claimed, abandoned, or hole descriptors
    pub suppressed: usize,
    pub abandoned: usize,
}

/// Finds contiguous runs of missing boundaries in `[start, end]`.
///
/// `present` must be ascending. Values off the step grid or outside the
/// window are ignored. Returned runs are inclusive.
#[must_use]
pub fn find_missing_runs(
    present: &[DateTime<Utc>],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step: ChronoDuration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut runs = Vec::new();
    if start > end || step <= ChronoDuration::zero() {
        return runs;
    }

    let mut present = present.iter().copied().peekable();
    let mut run_start: Option<DateTime<Utc>> = None;
    let mut expected = start;

    while expected <= end {
        while present.next_if(|t| *t < expected).is_some() {}

        if present.next_if_eq(&expected).is_some() {
            if let Some(first) = run_start.take() {
                runs.push((first, expected - step));
            }
        } else if run_start.is_none() {
            run_start = Some(expected);
        }
        expected += step;
    }

    if let Some(first) = run_start {
        runs.push((first, expected - step));
    }
    runs
}

/// Removes the parts of `runs` covered by `holes` (inclusive ranges).
#[must_use]
pub fn subtract_ranges(
    runs: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    holes: &[(DateTime<Utc>, DateTime<Utc>)],
    step: ChronoDuration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut remaining = runs;
    for &(hole_start, hole_end) in holes {
        remaining = remaining
            .into_iter()
            .flat_map(|(start, end)| {
                if hole_end < start || hole_start > end {
                    return vec![(start, end)];
                }
                let mut pieces = Vec::new();
                if hole_start > start {
                    pieces.push((start, hole_start - step));
                }
                if hole_end < end {
                    pieces.push((hole_end + step, end));
                }
                pieces
            })
            .collect();
    }
    remaining
}

/// Detects missing ranges and feeds the gap queue.
pub struct GapScanner {
    store: SharedStore,
    config: GapScannerConfig,
    first_scan_done: bool,
}

impl GapScanner {
    #[must_use]
    pub fn new(store: SharedStore, config: GapScannerConfig) -> Self {
        Self {
            store,
            config,
            first_scan_done: false,
        }
    }

    /// Scan window ending just before the settling bars.
    #[must_use]
    pub fn window(
        interval: Interval,
        now: DateTime<Utc>,
        lookback: ChronoDuration,
        settle_bars: i64,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = interval.last_closed_open_time(now) - interval.step() * (settle_bars - 1) as i32;
        let start = interval.align_down(now - lookback);
        (start, end)
    }

    /// Runs one pass over every configured series, then expires stale work.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or written.
    pub async fn scan_once(&mut self) -> Result<ScanReport> {
        let now = Utc::now();
        let lookback = if self.first_scan_done {
            self.config.lookback
        } else {
            self.config.initial_lookback
        };

        let mut report = ScanReport::default();
        let mut series: Vec<(String, Interval, Dataset)> = Vec::new();
        for symbol in &self.config.symbols {
            for interval in &self.config.intervals {
                series.push((symbol.clone(), *interval, Dataset::Candle));
            }
            if let Some(interval) = self.config.metric_interval {
                series.push((symbol.clone(), interval, Dataset::Metric));
            }
        }

        for (symbol, interval, dataset) in series {
            if !interval.is_fixed_step() {
                debug!(symbol = %symbol, interval = %interval, "Skipping interval without a fixed step");
                continue;
            }
            let (start, end) = Self::window(interval, now, lookback, self.config.settle_bars);
            self.scan_range(&symbol, interval, dataset, start, end, &mut report)
                .await?;
        }

        report.abandoned = self.expire_stale(now).await?;
        self.first_scan_done = true;

        info!(
            component = "gap_scanner",
            series = report.series_scanned,
            runs = report.runs_found,
            enqueued = report.enqueued.len(),
            suppressed = report.suppressed,
            abandoned = report.abandoned,
            "Gap scan complete"
        );
        Ok(report)
    }

    /// Scans one series over an explicit window.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or written.
    pub async fn scan_range(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        report: &mut ScanReport,
    ) -> Result<()> {
        report.series_scanned += 1;
        if start > end {
            return Ok(());
        }

        let present = match dataset {
            Dataset::Candle => {
                self.store
                    .closed_open_times(&self.config.exchange, symbol, interval, start, end)
                    .await?
            }
            Dataset::Metric => {
                self.store
                    .metric_times(&self.config.exchange, symbol, interval, start, end)
                    .await?
            }
        };

        let step = interval.step();
        let runs = find_missing_runs(&present, start, end, step);
        if runs.is_empty() {
            return Ok(());
        }

        let settled: Vec<_> = self
            .store
            .unrecoverable(symbol, interval, dataset)
            .await?
            .into_iter()
            .map(|g| (g.start_time, g.end_time))
            .collect();
        let runs = subtract_ranges(runs, &settled, step);

        for (run_start, run_end) in runs {
            report.runs_found += 1;
            let gap = GapDescriptor::new(symbol, interval, dataset, run_start, run_end)
                .with_priority(SCAN_PRIORITY);

            match self.store.enqueue(gap).await? {
                Some(stored) => {
                    debug!(
                        symbol = %symbol,
                        interval = %interval,
                        dataset = %dataset,
                        start = %run_start,
                        end = %run_end,
                        bars = interval.bars_between(run_start, run_end),
                        gap_id = stored.id,
                        "Gap enqueued"
                    );
                    report.enqueued.push(stored);
                }
                None => report.suppressed += 1,
            }
        }
        Ok(())
    }

    /// Abandons open descriptors past retention or out of attempts.
    ///
    /// # Errors
    /// Returns an error if the gap queue cannot be read or written.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut abandoned = 0;

        for gap in self.store.outstanding().await? {
            let claimed = gap.claim_expiry.map_or(false, |expiry| expiry > now);
            if claimed {
                continue;
            }

            let reason = if now - gap.discovered_at > self.config.retention {
                format!("retention of {}h exceeded", self.config.retention.num_hours())
            } else if gap.attempts >= self.config.max_attempts {
                format!("{} failed attempts", gap.attempts)
            } else {
                continue;
            };

            warn!(
                gap_id = gap.id,
                symbol = %gap.symbol,
                interval = %gap.interval,
                dataset = %gap.dataset,
                start = %gap.start_time,
                end = %gap.end_time,
                attempts = gap.attempts,
                last_error = gap.last_error.as_deref().unwrap_or(""),
                reason = %reason,
                "Abandoning gap descriptor"
            );
            self.store.abandon(gap.id, &reason).await?;
            abandoned += 1;
        }
        Ok(abandoned)
    }

    /// Scans on every tick and on every trigger until stopped.
    ///
    /// # Errors
    /// Never returns an error; scan failures are logged and retried on the
    /// next tick.
    pub async fn run(mut self, mut trigger: mpsc::Receiver<()>, mut stop: StopSignal) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        if self.first_scan_done {
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                biased;
                _ = wait_for_stop(&mut stop) => break,
                _ = ticker.tick() => {}
                Some(()) = trigger.recv() => {
                    debug!(component = "gap_scanner", "Triggered scan");
                }
            }

            if let Err(e) = self.scan_once().await {
                error!(component = "gap_scanner", error = %e, "Gap scan failed");
            }
        }

        info!(component = "gap_scanner", "Gap scanner stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use marketfeed_core::{Candle, DataSource, GapStatus};
    use marketfeed_data::MemoryStore;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn sample_timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 30, 12, 0, 0).unwrap()
    }

    fn t(minute: i64) -> DateTime<Utc> {
        sample_timestamp() + ChronoDuration::minutes(minute)
    }

    fn minutes(values: &[i64]) -> Vec<DateTime<Utc>> {
        values.iter().map(|m| t(*m)).collect()
    }

    fn candle(minute: i64) -> Candle {
        Candle::new(
            "binance_futures_um",
            "BTCUSDT",
            Interval::OneMinute,
            t(minute),
            dec!(100),
            dec!(101),
            dec!(99),
            dec!(100.5),
            dec!(1),
            DataSource::Stream,
        )
    }

    fn scanner(store: Arc<MemoryStore>) -> GapScanner {
        let config = GapScannerConfig::from_config(&AppConfig::default());
        GapScanner::new(store, config)
    }

    // ============================================
    // Diffing Tests
    // ============================================

    #[test]
    fn test_single_interior_run() {
        let step = ChronoDuration::minutes(1);
        let runs = find_missing_runs(&minutes(&[0, 1, 2, 5, 6]), t(0), t(6), step);
        assert_eq!(runs, vec![(t(3), t(4))]);
    }

    #[test]
    fn test_dense_series_has_no_runs() {
        let step = ChronoDuration::minutes(1);
        let present: Vec<i64> = (0..60).collect();
        assert!(find_missing_runs(&minutes(&present), t(0), t(59), step).is_empty());
    }

    #[test]
    fn test_leading_trailing_and_empty() {
        let step = ChronoDuration::minutes(1);
        assert_eq!(
            find_missing_runs(&minutes(&[2, 3]), t(0), t(5), step),
            vec![(t(0), t(1)), (t(4), t(5))]
        );
        assert_eq!(find_missing_runs(&[], t(0), t(9), step), vec![(t(0), t(9))]);
        assert!(find_missing_runs(&[], t(5), t(4), step).is_empty());
    }

    #[test]
    fn test_off_grid_and_duplicate_values_ignored() {
        let step = ChronoDuration::minutes(1);
        let mut present = minutes(&[0, 1, 1, 3]);
        present.insert(2, t(1) + ChronoDuration::seconds(30));
        assert_eq!(find_missing_runs(&present, t(0), t(3), step), vec![(t(2), t(2))]);
    }

    #[test]
    fn test_subtract_holes() {
        let step = ChronoDuration::minutes(1);
        let runs = vec![(t(0), t(9)), (t(20), t(21))];

        let result = subtract_ranges(runs, &[(t(3), t(4)), (t(20), t(21))], step);
        assert_eq!(result, vec![(t(0), t(2)), (t(5), t(9))]);
    }

    #[test]
    fn test_window_excludes_settling_bars() {
        let now = t(10) + ChronoDuration::seconds(30);
        let (start, end) =
            GapScanner::window(Interval::OneMinute, now, ChronoDuration::minutes(60), 2);
        // t(10) is still open and t(9) is settling
        assert_eq!(end, t(8));
        assert_eq!(start, t(-50));
    }

    // ============================================
    // Store Scan Tests
    // ============================================

    #[tokio::test]
    async fn test_scan_range_emits_one_descriptor_per_run() {
        let store = Arc::new(MemoryStore::new());
        let rows: Vec<Candle> = [0, 1, 2, 3, 6, 7, 8, 9].iter().map(|m| candle(*m)).collect();
        store.upsert_candles(&rows).await.unwrap();

        let scanner = scanner(store.clone());
        let mut report = ScanReport::default();
        scanner
            .scan_range("BTCUSDT", Interval::OneMinute, Dataset::Candle, t(0), t(9), &mut report)
            .await
            .unwrap();

        assert_eq!(report.enqueued.len(), 1);
        assert_eq!(report.enqueued[0].start_time, t(4));
        assert_eq!(report.enqueued[0].end_time, t(5));

        // Rescanning merges into the same descriptor
        let mut again = ScanReport::default();
        scanner
            .scan_range("BTCUSDT", Interval::OneMinute, Dataset::Candle, t(0), t(9), &mut again)
            .await
            .unwrap();
        assert_eq!(store.outstanding().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_bars_do_not_count_as_present() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_candles(&[candle(0), candle(1).with_closed(false), candle(2)])
            .await
            .unwrap();

        let mut report = ScanReport::default();
        scanner(store)
            .scan_range("BTCUSDT", Interval::OneMinute, Dataset::Candle, t(0), t(2), &mut report)
            .await
            .unwrap();

        assert_eq!(report.enqueued.len(), 1);
        assert_eq!(report.enqueued[0].start_time, t(1));
    }

    #[tokio::test]
    async fn test_recorded_holes_are_not_rescanned() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_candles(&[candle(0), candle(5)]).await.unwrap();
        store
            .record_hole(GapDescriptor::new(
                "BTCUSDT",
                Interval::OneMinute,
                Dataset::Candle,
                t(1),
                t(4),
            ))
            .await
            .unwrap();

        let mut report = ScanReport::default();
        scanner(store.clone())
            .scan_range("BTCUSDT", Interval::OneMinute, Dataset::Candle, t(0), t(5), &mut report)
            .await
            .unwrap();

        assert!(report.enqueued.is_empty());
        assert!(store.outstanding().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_stale_abandons_with_reason() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();

        let mut old = GapDescriptor::new("BTCUSDT", Interval::OneMinute, Dataset::Candle, t(0), t(1));
        old.discovered_at = now - ChronoDuration::hours(100);
        let old = store.enqueue(old).await.unwrap().unwrap();

        let fresh = store
            .enqueue(GapDescriptor::new("ETHUSDT", Interval::OneMinute, Dataset::Candle, t(0), t(1)))
            .await
            .unwrap()
            .unwrap();

        let abandoned = scanner(store.clone()).expire_stale(now).await.unwrap();
        assert_eq!(abandoned, 1);

        let old = store.get(old.id).await.unwrap().unwrap();
        assert_eq!(old.status, GapStatus::Abandoned);
        assert!(old.last_error.unwrap().contains("retention"));
        assert_eq!(store.get(fresh.id).await.unwrap().unwrap().status, GapStatus::Open);
    }

    #[tokio::test]
    async fn test_abandoned_range_is_not_rescanned() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_candles(&[candle(0), candle(5)]).await.unwrap();
        let scanner = scanner(store.clone());

        let mut report = ScanReport::default();
        scanner
            .scan_range("BTCUSDT", Interval::OneMinute, Dataset::Candle, t(0), t(5), &mut report)
            .await
            .unwrap();
        assert_eq!(report.enqueued.len(), 1);
        let gap = report.enqueued[0].clone();

        let now = Utc::now();
        for _ in 0..scanner.config.max_attempts {
            store.fail(gap.id, "upstream error", now).await.unwrap();
        }
        assert_eq!(scanner.expire_stale(now).await.unwrap(), 1);
        assert_eq!(store.get(gap.id).await.unwrap().unwrap().status, GapStatus::Abandoned);

        let mut again = ScanReport::default();
        scanner
            .scan_range("BTCUSDT", Interval::OneMinute, Dataset::Candle, t(0), t(5), &mut again)
            .await
            .unwrap();

        assert_eq!(again.runs_found, 0);
        assert!(again.enqueued.is_empty());
        assert!(store.outstanding().await.unwrap().is_empty());
    }
}
