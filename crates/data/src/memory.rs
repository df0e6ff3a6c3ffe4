//! In-memory store for single-process runs and tests.

use crate::store::{plan_enqueue, EnqueuePlan, GapQueue, MarketStore, UpsertOutcome};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketfeed_core::{
    Candle, ClaimFilter, DataSource, Dataset, GapDescriptor, GapStatus, IngestBatch, Interval,
    MetricSample,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

type SeriesKey = (String, String, Interval, DateTime<Utc>);

#[derive(Default)]
struct Inner {
    candles: BTreeMap<SeriesKey, Candle>,
    metrics: BTreeMap<SeriesKey, MetricSample>,
    gaps: BTreeMap<i64, GapDescriptor>,
    batches: Vec<IngestBatch>,
    next_gap_id: i64,
}

/// Store backed by ordered maps behind a mutex.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored candles across all series.
    #[must_use]
    pub fn candle_count(&self) -> usize {
        self.inner.lock().candles.len()
    }

    /// Total stored metric samples across all series.
    #[must_use]
    pub fn metric_count(&self) -> usize {
        self.inner.lock().metrics.len()
    }

    /// Snapshot of every descriptor regardless of status.
    #[must_use]
    pub fn all_gaps(&self) -> Vec<GapDescriptor> {
        self.inner.lock().gaps.values().cloned().collect()
    }

    /// Snapshot of lineage records.
    #[must_use]
    pub fn batches(&self) -> Vec<IngestBatch> {
        self.inner.lock().batches.clone()
    }

    fn series_with_status(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
        statuses: &[GapStatus],
    ) -> Vec<GapDescriptor> {
        let mut gaps: Vec<GapDescriptor> = self
            .inner
            .lock()
            .gaps
            .values()
            .filter(|g| {
                statuses.contains(&g.status)
                    && g.symbol == symbol.to_uppercase()
                    && g.interval == interval
                    && g.dataset == dataset
            })
            .cloned()
            .collect();
        gaps.sort_by_key(|g| g.start_time);
        gaps
    }

    fn key(exchange: &str, symbol: &str, interval: Interval, ts: DateTime<Utc>) -> SeriesKey {
        (exchange.to_string(), symbol.to_uppercase(), interval, ts)
    }

    fn update_gap<F>(&self, id: i64, f: F) -> Result<()>
    where
        F: FnOnce(&mut GapDescriptor),
    {
        let mut inner = self.inner.lock();
        let gap = inner
            .gaps
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Gap descriptor {} not found", id))?;
        f(gap);
        Ok(())
    }
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn upsert_candles(&self, rows: &[Candle]) -> Result<UpsertOutcome> {
        let mut inner = self.inner.lock();
        let mut outcome = UpsertOutcome::default();

        for row in rows {
            let key = Self::key(&row.exchange, &row.symbol, row.interval, row.open_time);
            match inner.candles.get(&key) {
                Some(stored) if !row.supersedes(stored) => outcome.superseded += 1,
                _ => {
                    inner.candles.insert(key, row.clone());
                    outcome.written += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn upsert_metrics(&self, rows: &[MetricSample]) -> Result<UpsertOutcome> {
        let mut inner = self.inner.lock();
        let mut outcome = UpsertOutcome::default();

        for row in rows {
            let key = Self::key(&row.exchange, &row.symbol, row.interval, row.timestamp);
            match inner.metrics.get(&key) {
                Some(stored) if !row.supersedes(stored) => outcome.superseded += 1,
                _ => {
                    inner.metrics.insert(key, row.clone());
                    outcome.written += 1;
                }
            }
        }

        Ok(outcome)
    }

    async fn closed_open_times(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let inner = self.inner.lock();
        let range = Self::key(exchange, symbol, interval, start)..=Self::key(exchange, symbol, interval, end);
        Ok(inner
            .candles
            .range(range)
            .filter(|(_, c)| c.is_closed)
            .map(|(_, c)| c.open_time)
            .collect())
    }

    async fn metric_times(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let inner = self.inner.lock();
        let range = Self::key(exchange, symbol, interval, start)..=Self::key(exchange, symbol, interval, end);
        Ok(inner.metrics.range(range).map(|(_, m)| m.timestamp).collect())
    }

    async fn candles_in_range(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let inner = self.inner.lock();
        let range = Self::key(exchange, symbol, interval, start)..=Self::key(exchange, symbol, interval, end);
        Ok(inner.candles.range(range).map(|(_, c)| c.clone()).collect())
    }

    async fn data_bounds(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let inner = self.inner.lock();
        let mut times = inner
            .candles
            .values()
            .filter(|c| c.exchange == exchange && c.symbol == symbol.to_uppercase() && c.interval == interval)
            .map(|c| c.open_time);
        let first = match times.next() {
            Some(first) => first,
            None => return Ok(None),
        };
        let last = times.last().unwrap_or(first);
        Ok(Some((first, last)))
    }

    async fn begin_batch(&self, source: DataSource) -> Result<i64> {
        let mut inner = self.inner.lock();
        let id = inner.batches.len() as i64 + 1;
        inner.batches.push(IngestBatch {
            id,
            source,
            row_count: 0,
            started_at: Utc::now(),
            finished_at: None,
        });
        Ok(id)
    }

    async fn finish_batch(&self, id: i64, row_count: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let batch = inner
            .batches
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| anyhow!("Ingest batch {} not found", id))?;
        batch.row_count = row_count;
        batch.finished_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl GapQueue for MemoryStore {
    async fn enqueue(&self, gap: GapDescriptor) -> Result<Option<GapDescriptor>> {
        let mut inner = self.inner.lock();
        let existing: Vec<GapDescriptor> = inner.gaps.values().cloned().collect();

        match plan_enqueue(gap, &existing, Utc::now()) {
            EnqueuePlan::Suppressed => Ok(None),
            EnqueuePlan::Insert(mut gap) => {
                inner.next_gap_id += 1;
                gap.id = inner.next_gap_id;
                inner.gaps.insert(gap.id, gap.clone());
                Ok(Some(gap))
            }
            EnqueuePlan::Merge { keep, absorb } => {
                for id in absorb {
                    inner.gaps.remove(&id);
                }
                inner.gaps.insert(keep.id, keep.clone());
                Ok(Some(keep))
            }
        }
    }

    async fn claim(
        &self,
        filter: ClaimFilter,
        worker: &str,
        ttl: Duration,
    ) -> Result<Option<GapDescriptor>> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let candidate = inner
            .gaps
            .values()
            .filter(|g| g.is_claimable(now) && filter.matches(g))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.discovered_at.cmp(&b.discovered_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|g| g.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let gap = inner
            .gaps
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Gap descriptor {} vanished during claim", id))?;
        gap.claimed_by = Some(worker.to_string());
        gap.claim_expiry = Some(now + chrono::Duration::from_std(ttl)?);
        Ok(Some(gap.clone()))
    }

    async fn advance(&self, id: i64, new_start: DateTime<Utc>) -> Result<()> {
        self.update_gap(id, |gap| {
            gap.start_time = gap.start_time.max(new_start);
        })
    }

    async fn complete(&self, id: i64) -> Result<()> {
        self.update_gap(id, |gap| {
            gap.status = GapStatus::Done;
            gap.claimed_by = None;
            gap.claim_expiry = None;
        })
    }

    async fn fail(&self, id: i64, error: &str, retry_at: DateTime<Utc>) -> Result<()> {
        self.update_gap(id, |gap| {
            gap.attempts += 1;
            gap.last_error = Some(error.to_string());
            gap.next_attempt_at = Some(retry_at);
            gap.claimed_by = None;
            gap.claim_expiry = None;
        })
    }

    async fn mark_incomplete(&self, id: i64, reason: &str) -> Result<()> {
        self.update_gap(id, |gap| {
            gap.status = GapStatus::Incomplete;
            gap.last_error = Some(reason.to_string());
            gap.claimed_by = None;
            gap.claim_expiry = None;
        })
    }

    async fn abandon(&self, id: i64, reason: &str) -> Result<()> {
        self.update_gap(id, |gap| {
            gap.status = GapStatus::Abandoned;
            gap.last_error = Some(reason.to_string());
            gap.claimed_by = None;
            gap.claim_expiry = None;
        })
    }

    async fn record_hole(&self, hole: GapDescriptor) -> Result<Option<GapDescriptor>> {
        let mut inner = self.inner.lock();
        let covered = inner.gaps.values().any(|g| {
            g.status == GapStatus::Incomplete
                && g.same_series(&hole)
                && g.covers(hole.start_time, hole.end_time)
        });
        if covered {
            return Ok(None);
        }

        let mut hole = hole;
        inner.next_gap_id += 1;
        hole.id = inner.next_gap_id;
        hole.status = GapStatus::Incomplete;
        hole.claimed_by = None;
        hole.claim_expiry = None;
        inner.gaps.insert(hole.id, hole.clone());
        Ok(Some(hole))
    }

    async fn holes(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
    ) -> Result<Vec<GapDescriptor>> {
        Ok(self.series_with_status(symbol, interval, dataset, &[GapStatus::Incomplete]))
    }

    async fn unrecoverable(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
    ) -> Result<Vec<GapDescriptor>> {
        Ok(self.series_with_status(
            symbol,
            interval,
            dataset,
            &[GapStatus::Incomplete, GapStatus::Abandoned],
        ))
    }

    async fn get(&self, id: i64) -> Result<Option<GapDescriptor>> {
        Ok(self.inner.lock().gaps.get(&id).cloned())
    }

    async fn outstanding(&self) -> Result<Vec<GapDescriptor>> {
        Ok(self
            .inner
            .lock()
            .gaps
            .values()
            .filter(|g| g.status == GapStatus::Open)
            .cloned()
            .collect())
    }

    async fn release_expired_claims(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut released = 0;
        for gap in inner.gaps.values_mut() {
            if gap.status == GapStatus::Open && gap.claim_expiry.map_or(false, |e| e <= now) {
                gap.claimed_by = None;
                gap.claim_expiry = None;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use marketfeed_core::GapRoute;
    use rust_decimal_macros::dec;

    fn sample_timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 30, 12, 0, 0).unwrap()
    }

    fn candle(minute: i64, source: DataSource, close: rust_decimal::Decimal) -> Candle {
        Candle::new(
            "binance_futures_um",
            "BTCUSDT",
            Interval::OneMinute,
            sample_timestamp() + chrono::Duration::minutes(minute),
            dec!(100),
            dec!(101),
            dec!(99),
            close,
            dec!(10),
            source,
        )
    }

    // ============================================
    // Upsert Tests
    // ============================================

    #[tokio::test]
    async fn test_repeated_upsert_converges_to_one_row() {
        let store = MemoryStore::new();
        let row = candle(0, DataSource::IncrementalRest, dec!(100.5));

        for _ in 0..5 {
            store.upsert_candles(&[row.clone()]).await.unwrap();
        }

        assert_eq!(store.candle_count(), 1);
    }

    #[tokio::test]
    async fn test_upsert_keeps_highest_precedence_source() {
        let store = MemoryStore::new();
        let stream = candle(0, DataSource::Stream, dec!(100.5));
        let archive = candle(0, DataSource::Archive, dec!(90)).with_ingested_at(Utc::now() + chrono::Duration::hours(1));
        let rest = candle(0, DataSource::IncrementalRest, dec!(80));

        store.upsert_candles(&[rest]).await.unwrap();
        store.upsert_candles(&[stream.clone()]).await.unwrap();
        let outcome = store.upsert_candles(&[archive]).await.unwrap();

        assert_eq!(outcome.superseded, 1);
        let rows = store
            .candles_in_range("binance_futures_um", "BTCUSDT", Interval::OneMinute, sample_timestamp(), sample_timestamp())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source, DataSource::Stream);
        assert_eq!(rows[0].close, dec!(100.5));
    }

    #[tokio::test]
    async fn test_closed_open_times_skips_open_bars() {
        let store = MemoryStore::new();
        let rows = vec![
            candle(0, DataSource::Stream, dec!(1)),
            candle(1, DataSource::Stream, dec!(1)).with_closed(false),
            candle(2, DataSource::Stream, dec!(1)),
        ];
        store.upsert_candles(&rows).await.unwrap();

        let times = store
            .closed_open_times(
                "binance_futures_um",
                "btcusdt",
                Interval::OneMinute,
                sample_timestamp(),
                sample_timestamp() + chrono::Duration::minutes(10),
            )
            .await
            .unwrap();
        assert_eq!(
            times,
            vec![sample_timestamp(), sample_timestamp() + chrono::Duration::minutes(2)]
        );
    }

    #[tokio::test]
    async fn test_data_bounds() {
        let store = MemoryStore::new();
        assert!(store
            .data_bounds("binance_futures_um", "BTCUSDT", Interval::OneMinute)
            .await
            .unwrap()
            .is_none());

        store
            .upsert_candles(&[candle(3, DataSource::Stream, dec!(1)), candle(7, DataSource::Stream, dec!(1))])
            .await
            .unwrap();
        let (first, last) = store
            .data_bounds("binance_futures_um", "BTCUSDT", Interval::OneMinute)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, sample_timestamp() + chrono::Duration::minutes(3));
        assert_eq!(last, sample_timestamp() + chrono::Duration::minutes(7));
    }

    // ============================================
    // Gap Queue Tests
    // ============================================

    fn gap(start: i64, end: i64) -> GapDescriptor {
        GapDescriptor::new(
            "BTCUSDT",
            Interval::OneMinute,
            Dataset::Candle,
            sample_timestamp() + chrono::Duration::minutes(start),
            sample_timestamp() + chrono::Duration::minutes(end),
        )
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        store.enqueue(gap(0, 5)).await.unwrap();

        let first = store
            .claim(ClaimFilter::Any, "worker-a", Duration::from_secs(60))
            .await
            .unwrap();
        let second = store
            .claim(ClaimFilter::Any, "worker-b", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(first.unwrap().claimed_by.as_deref(), Some("worker-a"));
        assert!(second.is_none());

        let released = store
            .release_expired_claims(Utc::now() + chrono::Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(released, 1);
        assert!(store
            .claim(ClaimFilter::Any, "worker-b", Duration::from_secs(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority() {
        let store = MemoryStore::new();
        store.enqueue(gap(0, 1)).await.unwrap();
        store.enqueue(gap(10, 11).with_priority(10)).await.unwrap();

        let claimed = store
            .claim(ClaimFilter::Any, "w", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.priority, 10);
    }

    #[tokio::test]
    async fn test_fail_releases_and_delays() {
        let store = MemoryStore::new();
        let g = store.enqueue(gap(0, 5)).await.unwrap().unwrap();
        store.claim(ClaimFilter::Any, "w", Duration::from_secs(60)).await.unwrap();

        store
            .fail(g.id, "timeout", Utc::now() + chrono::Duration::minutes(5))
            .await
            .unwrap();

        let stored = store.get(g.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert!(stored.claimed_by.is_none());
        assert!(store
            .claim(ClaimFilter::Any, "w", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_enqueue_merges_and_suppresses() {
        let store = MemoryStore::new();
        let a = store.enqueue(gap(0, 3)).await.unwrap().unwrap();
        let merged = store.enqueue(gap(4, 6)).await.unwrap().unwrap();
        assert_eq!(merged.id, a.id);
        assert_eq!(store.outstanding().await.unwrap().len(), 1);

        store.mark_incomplete(a.id, "provider hole").await.unwrap();
        assert!(store.enqueue(gap(1, 2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incremental_filter_claims_hand_downs() {
        let store = MemoryStore::new();
        store
            .enqueue(gap(0, 2000).with_route(GapRoute::Incremental))
            .await
            .unwrap();

        let filter = ClaimFilter::Archive { min_bars: 720 };
        assert!(store.claim(filter, "a", Duration::from_secs(60)).await.unwrap().is_none());

        let filter = ClaimFilter::Incremental { archive_min_bars: 720 };
        assert!(store.claim(filter, "i", Duration::from_secs(60)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_record_hole_is_terminal_and_deduplicated() {
        let store = MemoryStore::new();
        let hole = store.record_hole(gap(3, 4)).await.unwrap().unwrap();
        assert_eq!(hole.status, GapStatus::Incomplete);
        assert!(store.outstanding().await.unwrap().is_empty());

        assert!(store.record_hole(gap(3, 3)).await.unwrap().is_none());
        assert!(store.record_hole(gap(3, 5)).await.unwrap().is_some());

        let holes = store
            .holes("BTCUSDT", Interval::OneMinute, Dataset::Candle)
            .await
            .unwrap();
        assert_eq!(holes.len(), 2);
        assert!(store
            .holes("ETHUSDT", Interval::OneMinute, Dataset::Candle)
            .await
            .unwrap()
            .is_empty());
    }
}
