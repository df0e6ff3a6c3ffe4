//! Paginated REST recovery for small gaps and archive hand-downs.
//!
//! Each page is committed before the next is requested and the descriptor's
//! start is advanced past it, so a crash resumes at the first uncommitted
//! page. Boundaries a page should have held but did not are recorded as
//! provider holes instead of being retried forever.

use anyhow::Result;
use chrono::{DateTime, Utc};
use marketfeed_core::{
    BackfillConfig, Candle, ClaimFilter, DataSource, Dataset, GapDescriptor, IngestError,
    IngestResult, Interval, MarketDataRest, MetricSample,
};
use marketfeed_data::GapQueue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::gap_scanner::find_missing_runs;
use crate::rate_guard::RateGuard;
use crate::types::{
    retry_backoff, stop_requested, wait_for_stop, BackfillStats, StopSignal, KLINE_PAGE_WEIGHT,
    METRICS_WEIGHT,
};
use crate::{commit_candles, commit_metrics, SharedStore};

/// Incremental worker settings.
#[derive(Debug, Clone)]
pub struct IncrementalBackfillerConfig {
    pub worker_id: String,
    /// Auto-routed gaps at or above this size belong to the archive path
    pub archive_min_bars: u64,
    pub claim_ttl: Duration,
    pub idle_poll: Duration,
    pub kline_page_limit: usize,
    pub metric_page_limit: usize,
    /// Pages fetched per claim before the remainder is requeued
    pub max_pages: usize,
}

impl IncrementalBackfillerConfig {
    #[must_use]
    pub fn new(worker_id: impl Into<String>, config: &BackfillConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            archive_min_bars: config.archive_min_bars,
            claim_ttl: Duration::from_secs(config.claim_ttl_secs.max(1) as u64),
            idle_poll: Duration::from_secs(config.idle_poll_secs.max(1)),
            kline_page_limit: config.kline_page_limit.max(1),
            metric_page_limit: config.metric_page_limit.max(1),
            max_pages: config.max_pages.max(1),
        }
    }

    /// Claims every open descriptor regardless of size or route.
    #[must_use]
    pub fn claim_any(mut self) -> Self {
        self.archive_min_bars = u64::MAX;
        self
    }
}

enum ClaimOutcome {
    Completed,
    Requeued,
    Failed,
    Interrupted,
}

/// Rows of one page, already filtered to the page window.
enum Page {
    Candles(Vec<Candle>),
    Metrics(Vec<MetricSample>),
}

/// Incremental backfill worker.
pub struct IncrementalBackfiller {
    rest: Arc<dyn MarketDataRest>,
    store: SharedStore,
    guard: Arc<RateGuard>,
    config: IncrementalBackfillerConfig,
    stats: BackfillStats,
}

impl IncrementalBackfiller {
    #[must_use]
    pub fn new(
        rest: Arc<dyn MarketDataRest>,
        store: SharedStore,
        guard: Arc<RateGuard>,
        config: IncrementalBackfillerConfig,
    ) -> Self {
        Self {
            rest,
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

    fn claim_filter(&self) -> ClaimFilter {
        if self.config.archive_min_bars == u64::MAX {
            ClaimFilter::Any
        } else {
            ClaimFilter::Incremental {
                archive_min_bars: self.config.archive_min_bars,
            }
        }
    }

    /// Claims and processes one descriptor. Returns false if none was claimable.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or written.
    pub async fn run_once(&mut self, stop: &StopSignal) -> Result<bool> {
        let Some(gap) = self
            .store
            .claim(self.claim_filter(), &self.config.worker_id, self.config.claim_ttl)
            .await?
        else {
            return Ok(false);
        };

        self.stats.claims += 1;
        debug!(
            component = "incremental_backfiller",
            worker = %self.config.worker_id,
            gap_id = gap.id,
            symbol = %gap.symbol,
            interval = %gap.interval,
            dataset = %gap.dataset,
            start = %gap.start_time,
            end = %gap.end_time,
            "Claimed gap"
        );

        match self.process(&gap, stop).await? {
            ClaimOutcome::Completed => self.stats.completed += 1,
            ClaimOutcome::Requeued => {}
            ClaimOutcome::Failed => self.stats.failures += 1,
            ClaimOutcome::Interrupted => {
                info!(
                    component = "incremental_backfiller",
                    gap_id = gap.id,
                    "Shutdown between pages, progress kept"
                );
            }
        }
        Ok(true)
    }

    async fn process(&mut self, gap: &GapDescriptor, stop: &StopSignal) -> Result<ClaimOutcome> {
        let step = gap.interval.step();
        let limit = match gap.dataset {
            Dataset::Candle => self.config.kline_page_limit,
            Dataset::Metric => self.config.metric_page_limit,
        };
        let mut cursor = gap.start_time;
        let mut pages = 0usize;

        while cursor <= gap.end_time {
            if stop_requested(stop) {
                return Ok(ClaimOutcome::Interrupted);
            }

            if pages >= self.config.max_pages {
                return self.requeue_remainder(gap, cursor).await;
            }

            let page_end = (cursor + step * (limit as i32 - 1)).min(gap.end_time);
            let page = match self.fetch_page(gap, cursor, page_end, limit).await {
                Ok(page) => page,
                Err(e) => return self.record_failure(gap, cursor, e).await,
            };
            pages += 1;
            self.stats.units += 1;

            let mut present = self.commit(page).await?;
            present.sort();
            present.dedup();

            for (start, end) in find_missing_runs(&present, cursor, page_end, step) {
                self.record_hole(gap, start, end).await?;
            }

            cursor = page_end + step;
            if cursor <= gap.end_time {
                self.store.advance(gap.id, cursor).await?;
            }
        }

        self.store.complete(gap.id).await?;
        debug!(
            component = "incremental_backfiller",
            gap_id = gap.id,
            pages,
            "Incremental gap resolved"
        );
        Ok(ClaimOutcome::Completed)
    }

    async fn fetch_page(
        &self,
        gap: &GapDescriptor,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> IngestResult<Page> {
        let rest = self.rest.clone();
        let symbol = gap.symbol.clone();
        let interval = gap.interval;
        let in_page = move |t: DateTime<Utc>| t >= start && t <= end;

        match gap.dataset {
            Dataset::Candle => {
                let rows = self
                    .guard
                    .execute(KLINE_PAGE_WEIGHT, || {
                        fetch_klines(rest.clone(), symbol.clone(), interval, start, end, limit)
                    })
                    .await?;
                Ok(Page::Candles(
                    rows.into_iter()
                        .filter(|c| c.symbol == gap.symbol && in_page(c.open_time))
                        .map(|mut c| {
                            c.source = DataSource::IncrementalRest;
                            c
                        })
                        .collect(),
                ))
            }
            Dataset::Metric => {
                let rows = self
                    .guard
                    .execute(METRICS_WEIGHT, || {
                        fetch_metrics(rest.clone(), symbol.clone(), interval, start, end, limit)
                    })
                    .await?;
                Ok(Page::Metrics(
                    rows.into_iter()
                        .filter(|m| m.symbol == gap.symbol && in_page(m.timestamp))
                        .map(|mut m| {
                            m.source = DataSource::IncrementalRest;
                            m
                        })
                        .collect(),
                ))
            }
        }
    }

    /// Commits one page and returns the timestamps it held.
    async fn commit(&mut self, page: Page) -> Result<Vec<DateTime<Utc>>> {
        let (times, outcome) = match page {
            Page::Candles(rows) if rows.is_empty() => return Ok(Vec::new()),
            Page::Metrics(rows) if rows.is_empty() => return Ok(Vec::new()),
            Page::Candles(rows) => (
                rows.iter().map(|c| c.open_time).collect::<Vec<_>>(),
                commit_candles(&*self.store, DataSource::IncrementalRest, &rows).await?,
            ),
            Page::Metrics(rows) => (
                rows.iter().map(|m| m.timestamp).collect::<Vec<_>>(),
                commit_metrics(&*self.store, DataSource::IncrementalRest, &rows).await?,
            ),
        };

        self.stats.rows_written += outcome.written;
        self.stats.rows_superseded += outcome.superseded;
        Ok(times)
    }

    async fn record_hole(
        &mut self,
        gap: &GapDescriptor,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        let reason = IngestError::ProviderDataHole {
            symbol: gap.symbol.clone(),
            interval: gap.interval.to_string(),
            start,
            end,
        };
        warn!(
            component = "incremental_backfiller",
            gap_id = gap.id,
            dataset = %gap.dataset,
            bars = gap.interval.bars_between(start, end),
            error = %reason,
            "Provider returned a short page"
        );

        let mut hole = GapDescriptor::new(&gap.symbol, gap.interval, gap.dataset, start, end)
            .with_priority(gap.priority);
        hole.last_error = Some(reason.to_string());
        if self.store.record_hole(hole).await?.is_some() {
            self.stats.holes += 1;
        }
        Ok(())
    }

    /// Completes the claim and queues the unfetched rest as a fresh descriptor.
    async fn requeue_remainder(
        &mut self,
        gap: &GapDescriptor,
        cursor: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        self.store.complete(gap.id).await?;
        let remainder = GapDescriptor::new(&gap.symbol, gap.interval, gap.dataset, cursor, gap.end_time)
            .with_priority(gap.priority)
            .with_route(gap.route);
        self.store.enqueue(remainder).await?;

        info!(
            component = "incremental_backfiller",
            gap_id = gap.id,
            remaining_from = %cursor,
            max_pages = self.config.max_pages,
            "Page budget reached, remainder requeued"
        );
        Ok(ClaimOutcome::Requeued)
    }

    async fn record_failure(
        &mut self,
        gap: &GapDescriptor,
        cursor: DateTime<Utc>,
        e: IngestError,
    ) -> Result<ClaimOutcome> {
        if matches!(e, IngestError::Client { .. }) {
            error!(
                component = "incremental_backfiller",
                gap_id = gap.id,
                symbol = %gap.symbol,
                error = %e,
                "Permanent client error, abandoning gap"
            );
            self.store.abandon(gap.id, &e.to_string()).await?;
            return Ok(ClaimOutcome::Failed);
        }

        let retry_at = Utc::now() + retry_backoff(gap.attempts);
        warn!(
            component = "incremental_backfiller",
            gap_id = gap.id,
            symbol = %gap.symbol,
            interval = %gap.interval,
            cursor = %cursor,
            attempts = gap.attempts + 1,
            retry_at = %retry_at,
            error = %e,
            "Incremental page failed"
        );
        self.store.fail(gap.id, &e.to_string(), retry_at).await?;
        Ok(ClaimOutcome::Failed)
    }

    /// Works the queue until stopped.
    ///
    /// # Errors
    /// Never returns an error; queue failures are logged and retried after
    /// the idle poll.
    pub async fn run(mut self, mut stop: StopSignal) -> Result<BackfillStats> {
        info!(
            component = "incremental_backfiller",
            worker = %self.config.worker_id,
            "Incremental worker started"
        );

        while !stop_requested(&stop) {
            let idle = match self.run_once(&stop).await {
                Ok(claimed) => !claimed,
                Err(e) => {
                    error!(component = "incremental_backfiller", error = %e, "Incremental worker iteration failed");
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
            component = "incremental_backfiller",
            worker = %self.config.worker_id,
            summary = %self.stats.summary(),
            "Incremental worker stopped"
        );
        Ok(self.stats)
    }
}

async fn fetch_klines(
    rest: Arc<dyn MarketDataRest>,
    symbol: String,
    interval: Interval,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: usize,
) -> IngestResult<Vec<Candle>> {
    rest.get_klines(&symbol, interval, start, end, limit).await
}

async fn fetch_metrics(
    rest: Arc<dyn MarketDataRest>,
    symbol: String,
    interval: Interval,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: usize,
) -> IngestResult<Vec<MetricSample>> {
    rest.get_metrics(&symbol, interval, start, end, limit).await
}
