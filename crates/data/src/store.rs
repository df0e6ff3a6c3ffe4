//! Storage traits shared by the PostgreSQL and in-memory backends.
//!
//! [`MarketStore`] is the idempotent write path for rows; [`GapQueue`] holds
//! the recovery work items. Both backends share [`plan_enqueue`] so merge and
//! suppression rules are identical everywhere.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketfeed_core::{
    Candle, ClaimFilter, DataSource, Dataset, GapDescriptor, GapRoute, GapStatus, Interval, MetricSample,
};
use std::time::Duration;

/// Result of an upsert call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Rows inserted or replaced
    pub written: u64,
    /// Rows that lost to a higher-precedence stored row
    pub superseded: u64,
}

impl UpsertOutcome {
    /// Accumulates another outcome.
    pub fn merge(&mut self, other: UpsertOutcome) {
        self.written += other.written;
        self.superseded += other.superseded;
    }
}

#[async_trait]
pub trait MarketStore: Send + Sync {
    /// Inserts or replaces candles according to the precedence rule.
    async fn upsert_candles(&self, rows: &[Candle]) -> Result<UpsertOutcome>;

    /// Inserts or replaces metric samples according to the precedence rule.
    async fn upsert_metrics(&self, rows: &[MetricSample]) -> Result<UpsertOutcome>;

    /// Open times of closed candles in `[start, end]`, ascending.
    async fn closed_open_times(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>>;

    /// Sample times of metrics in `[start, end]`, ascending.
    async fn metric_times(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>>;

    /// Candles in `[start, end]`, ascending.
    async fn candles_in_range(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;

    /// Earliest and latest candle open times, or None if the series is empty.
    async fn data_bounds(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>>;

    /// Opens a lineage record and returns its id.
    async fn begin_batch(&self, source: DataSource) -> Result<i64>;

    /// Closes a lineage record with the number of rows written.
    async fn finish_batch(&self, id: i64, row_count: i64) -> Result<()>;
}

#[async_trait]
pub trait GapQueue: Send + Sync {
    /// Adds a descriptor, merging with touching unclaimed ones.
    ///
    /// Returns None when the range is already covered by a claimed descriptor
    /// or a confirmed provider hole.
    async fn enqueue(&self, gap: GapDescriptor) -> Result<Option<GapDescriptor>>;

    /// Atomically claims the highest-priority claimable descriptor.
    async fn claim(
        &self,
        filter: ClaimFilter,
        worker: &str,
        ttl: Duration,
    ) -> Result<Option<GapDescriptor>>;

    /// Moves the start of a claimed descriptor forward after a committed page.
    async fn advance(&self, id: i64, new_start: DateTime<Utc>) -> Result<()>;

    /// Marks a descriptor recovered.
    async fn complete(&self, id: i64) -> Result<()>;

    /// Records a failed attempt, releases the claim, and delays the next one.
    async fn fail(&self, id: i64, error: &str, retry_at: DateTime<Utc>) -> Result<()>;

    /// Marks a descriptor as a confirmed provider-side hole.
    async fn mark_incomplete(&self, id: i64, reason: &str) -> Result<()>;

    /// Gives up on a descriptor.
    async fn abandon(&self, id: i64, reason: &str) -> Result<()>;

    /// Stores a confirmed provider hole directly as incomplete.
    ///
    /// Returns None when an existing hole already covers the range.
    async fn record_hole(&self, hole: GapDescriptor) -> Result<Option<GapDescriptor>>;

    /// Confirmed provider holes of one series, oldest first.
    async fn holes(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
    ) -> Result<Vec<GapDescriptor>>;

    /// Holes and abandoned descriptors of one series, oldest first.
    ///
    /// Neither is recovered again, so scans leave these ranges out.
    async fn unrecoverable(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
    ) -> Result<Vec<GapDescriptor>>;

    /// Looks up a descriptor by id.
    async fn get(&self, id: i64) -> Result<Option<GapDescriptor>>;

    /// All descriptors with status open (claimed or not).
    async fn outstanding(&self) -> Result<Vec<GapDescriptor>>;

    /// Clears claims whose expiry has passed. Returns how many were released.
    async fn release_expired_claims(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// What [`GapQueue::enqueue`] should do with a new descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueuePlan {
    /// Already covered; nothing to write
    Suppressed,
    /// Insert as a new row
    Insert(GapDescriptor),
    /// Widen descriptor `keep` to the merged range and delete `absorb`
    Merge {
        keep: GapDescriptor,
        absorb: Vec<i64>,
    },
}

/// Decides how a new descriptor combines with existing ones of the same series.
///
/// `existing` may contain descriptors of any status; open ones, confirmed
/// holes and abandoned ranges are considered.
#[must_use]
pub fn plan_enqueue(gap: GapDescriptor, existing: &[GapDescriptor], now: DateTime<Utc>) -> EnqueuePlan {
    let same_series = existing.iter().filter(|e| e.same_series(&gap));

    let mut touching: Vec<&GapDescriptor> = Vec::new();
    for other in same_series {
        match other.status {
            GapStatus::Incomplete | GapStatus::Abandoned
                if other.covers(gap.start_time, gap.end_time) =>
            {
                return EnqueuePlan::Suppressed;
            }
            GapStatus::Open => {
                let claimed = other.claimed_by.is_some()
                    && other.claim_expiry.map_or(false, |expiry| expiry > now);
                if claimed {
                    if other.covers(gap.start_time, gap.end_time) {
                        return EnqueuePlan::Suppressed;
                    }
                } else if other.touches(&gap) {
                    touching.push(other);
                }
            }
            _ => {}
        }
    }

    if touching.is_empty() {
        return EnqueuePlan::Insert(gap);
    }

    touching.sort_by_key(|g| g.id);
    let mut keep = touching[0].clone();
    for other in touching.iter().skip(1).copied().chain(std::iter::once(&gap)) {
        keep.start_time = keep.start_time.min(other.start_time);
        keep.end_time = keep.end_time.max(other.end_time);
        keep.priority = keep.priority.max(other.priority);
        keep.route = merge_route(keep.route, other.route);
    }
    let absorb = touching.iter().skip(1).map(|g| g.id).collect();

    EnqueuePlan::Merge { keep, absorb }
}

/// Hand-downs already failed the archive path, so incremental routing wins.
fn merge_route(a: GapRoute, b: GapRoute) -> GapRoute {
    match (a, b) {
        (GapRoute::Incremental, _) | (_, GapRoute::Incremental) => GapRoute::Incremental,
        (GapRoute::Archive, GapRoute::Archive) => GapRoute::Archive,
        _ => GapRoute::Auto,
    }
}
