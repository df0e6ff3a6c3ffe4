//! PostgreSQL implementation of the storage traits.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketfeed_core::{
    Candle, ClaimFilter, DataSource, Dataset, GapDescriptor, GapStatus, Interval, MetricSample,
};
use sqlx::PgPool;
use std::time::Duration;

use crate::repositories::Repositories;
use crate::store::{GapQueue, MarketStore, UpsertOutcome};

/// Store shared by every process pointed at the same database.
#[derive(Debug, Clone)]
pub struct PgStore {
    repos: Repositories,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            repos: Repositories::new(pool),
        }
    }

    /// Typed table access for reporting.
    #[must_use]
    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }
}

#[async_trait]
impl MarketStore for PgStore {
    async fn upsert_candles(&self, rows: &[Candle]) -> Result<UpsertOutcome> {
        self.repos.candles.upsert_batch(rows).await
    }

    async fn upsert_metrics(&self, rows: &[MetricSample]) -> Result<UpsertOutcome> {
        self.repos.metrics.upsert_batch(rows).await
    }

    async fn closed_open_times(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        self.repos
            .candles
            .closed_open_times(exchange, symbol, interval, start, end)
            .await
    }

    async fn metric_times(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        self.repos
            .metrics
            .sample_times(exchange, symbol, interval, start, end)
            .await
    }

    async fn candles_in_range(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        self.repos
            .candles
            .query_by_time_range(exchange, symbol, interval, start, end)
            .await
    }

    async fn data_bounds(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        self.repos.candles.get_data_bounds(exchange, symbol, interval).await
    }

    async fn begin_batch(&self, source: DataSource) -> Result<i64> {
        self.repos.batches.begin(source).await
    }

    async fn finish_batch(&self, id: i64, row_count: i64) -> Result<()> {
        self.repos.batches.finish(id, row_count).await
    }
}

#[async_trait]
impl GapQueue for PgStore {
    async fn enqueue(&self, gap: GapDescriptor) -> Result<Option<GapDescriptor>> {
        self.repos.gaps.enqueue(gap).await
    }

    async fn claim(
        &self,
        filter: ClaimFilter,
        worker: &str,
        ttl: Duration,
    ) -> Result<Option<GapDescriptor>> {
        self.repos.gaps.claim(filter, worker, ttl).await
    }

    async fn advance(&self, id: i64, new_start: DateTime<Utc>) -> Result<()> {
        self.repos.gaps.advance(id, new_start).await
    }

    async fn complete(&self, id: i64) -> Result<()> {
        self.repos.gaps.finish(id, GapStatus::Done.as_str(), None).await
    }

    async fn fail(&self, id: i64, error: &str, retry_at: DateTime<Utc>) -> Result<()> {
        self.repos.gaps.fail(id, error, retry_at).await
    }

    async fn mark_incomplete(&self, id: i64, reason: &str) -> Result<()> {
        self.repos
            .gaps
            .finish(id, GapStatus::Incomplete.as_str(), Some(reason))
            .await
    }

    async fn abandon(&self, id: i64, reason: &str) -> Result<()> {
        self.repos
            .gaps
            .finish(id, GapStatus::Abandoned.as_str(), Some(reason))
            .await
    }

    async fn record_hole(&self, hole: GapDescriptor) -> Result<Option<GapDescriptor>> {
        self.repos.gaps.record_hole(hole).await
    }

    async fn holes(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
    ) -> Result<Vec<GapDescriptor>> {
        self.repos.gaps.holes(symbol, interval, dataset).await
    }

    async fn unrecoverable(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
    ) -> Result<Vec<GapDescriptor>> {
        self.repos.gaps.unrecoverable(symbol, interval, dataset).await
    }

    async fn get(&self, id: i64) -> Result<Option<GapDescriptor>> {
        self.repos.gaps.get(id).await
    }

    async fn outstanding(&self) -> Result<Vec<GapDescriptor>> {
        self.repos
            .gaps
            .list_by_status(GapStatus::Open.as_str(), i64::MAX)
            .await
    }

    async fn release_expired_claims(&self, now: DateTime<Utc>) -> Result<u64> {
        self.repos.gaps.release_expired_claims(now).await
    }
}
