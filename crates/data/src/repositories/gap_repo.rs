//! Gap descriptor repository.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers in any number of
//! processes never hold the same descriptor. Enqueue serializes per series with
//! a transaction-scoped advisory lock before applying the shared merge plan.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use marketfeed_core::{ClaimFilter, Dataset, GapDescriptor, GapStatus, Interval};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::debug;

use crate::store::{plan_enqueue, EnqueuePlan};

const GAP_COLUMNS: &str = "id, symbol, interval, dataset, start_time, end_time, priority, \
     discovered_at, attempts, claimed_by, claim_expiry, status, route, next_attempt_at, last_error";

/// Repository for recovery work items.
#[derive(Debug, Clone)]
pub struct GapRepository {
    pool: PgPool,
}

impl GapRepository {
    /// Creates a new repository instance.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts a descriptor or merges it into touching unclaimed ones.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn enqueue(&self, gap: GapDescriptor) -> Result<Option<GapDescriptor>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{}:{}", gap.symbol, gap.interval, gap.dataset))
            .execute(&mut *tx)
            .await
            .context("Failed to lock gap series")?;

        let existing = sqlx::query_as::<_, GapRow>(&format!(
            r#"
            SELECT {GAP_COLUMNS}
            FROM gap_descriptors
            WHERE symbol = $1 AND interval = $2 AND dataset = $3
              AND status IN ('open', 'incomplete', 'abandoned')
            "#
        ))
        .bind(&gap.symbol)
        .bind(gap.interval.as_str())
        .bind(gap.dataset.as_str())
        .fetch_all(&mut *tx)
        .await
        .context("Failed to load gap series")?
        .into_iter()
        .map(GapDescriptor::try_from)
        .collect::<Result<Vec<_>>>()?;

        let stored = match plan_enqueue(gap, &existing, Utc::now()) {
            EnqueuePlan::Suppressed => None,
            EnqueuePlan::Insert(gap) => Some(Self::insert(&mut tx, &gap).await?),
            EnqueuePlan::Merge { keep, absorb } => {
                if !absorb.is_empty() {
                    sqlx::query("DELETE FROM gap_descriptors WHERE id = ANY($1)")
                        .bind(&absorb)
                        .execute(&mut *tx)
                        .await
                        .context("Failed to delete merged gaps")?;
                }
                sqlx::query(
                    r#"
                    UPDATE gap_descriptors
                    SET start_time = $2, end_time = $3, priority = $4, route = $5
                    WHERE id = $1
                    "#,
                )
                .bind(keep.id)
                .bind(keep.start_time)
                .bind(keep.end_time)
                .bind(keep.priority)
                .bind(keep.route.as_str())
                .execute(&mut *tx)
                .await
                .context("Failed to widen gap")?;
                debug!(gap_id = keep.id, absorbed = absorb.len(), "Merged gap descriptors");
                Some(keep)
            }
        };

        tx.commit().await.context("Failed to commit transaction")?;
        Ok(stored)
    }

    /// Stores a confirmed provider hole unless one already covers the range.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn record_hole(&self, hole: GapDescriptor) -> Result<Option<GapDescriptor>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{}:{}", hole.symbol, hole.interval, hole.dataset))
            .execute(&mut *tx)
            .await
            .context("Failed to lock gap series")?;

        let (covered,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM gap_descriptors
                WHERE symbol = $1 AND interval = $2 AND dataset = $3
                  AND status = 'incomplete' AND start_time <= $4 AND end_time >= $5
            )
            "#,
        )
        .bind(&hole.symbol)
        .bind(hole.interval.as_str())
        .bind(hole.dataset.as_str())
        .bind(hole.start_time)
        .bind(hole.end_time)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to check recorded holes")?;

        let stored = if covered {
            None
        } else {
            let mut hole = hole;
            hole.status = GapStatus::Incomplete;
            Some(Self::insert(&mut tx, &hole).await?)
        };

        tx.commit().await.context("Failed to commit transaction")?;
        Ok(stored)
    }

    /// Confirmed provider holes of one series, oldest first.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn holes(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
    ) -> Result<Vec<GapDescriptor>> {
        self.series_with_status(symbol, interval, dataset, &[GapStatus::Incomplete])
            .await
    }

    /// Holes and abandoned descriptors of one series, oldest first.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn unrecoverable(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
    ) -> Result<Vec<GapDescriptor>> {
        self.series_with_status(
            symbol,
            interval,
            dataset,
            &[GapStatus::Incomplete, GapStatus::Abandoned],
        )
        .await
    }

    async fn series_with_status(
        &self,
        symbol: &str,
        interval: Interval,
        dataset: Dataset,
        statuses: &[GapStatus],
    ) -> Result<Vec<GapDescriptor>> {
        let statuses: Vec<&str> = statuses.iter().map(GapStatus::as_str).collect();
        let rows = sqlx::query_as::<_, GapRow>(&format!(
            r#"
            SELECT {GAP_COLUMNS}
            FROM gap_descriptors
            WHERE symbol = $1 AND interval = $2 AND dataset = $3 AND status = ANY($4)
            ORDER BY start_time ASC
            "#
        ))
        .bind(symbol)
        .bind(interval.as_str())
        .bind(dataset.as_str())
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list settled gaps")?;

        rows.into_iter().map(GapDescriptor::try_from).collect()
    }

    async fn insert(tx: &mut Transaction<'_, Postgres>, gap: &GapDescriptor) -> Result<GapDescriptor> {
        let row = sqlx::query_as::<_, GapRow>(&format!(
            r#"
            INSERT INTO gap_descriptors
                (symbol, interval, step_ms, dataset, start_time, end_time, priority,
                 discovered_at, status, route, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {GAP_COLUMNS}
            "#
        ))
        .bind(&gap.symbol)
        .bind(gap.interval.as_str())
        .bind(gap.interval.duration_ms())
        .bind(gap.dataset.as_str())
        .bind(gap.start_time)
        .bind(gap.end_time)
        .bind(gap.priority)
        .bind(gap.discovered_at)
        .bind(gap.status.as_str())
        .bind(gap.route.as_str())
        .bind(&gap.last_error)
        .fetch_one(&mut **tx)
        .await
        .context("Failed to insert gap")?;

        GapDescriptor::try_from(row)
    }

    /// Claims the highest-priority claimable descriptor matching `filter`.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn claim(
        &self,
        filter: ClaimFilter,
        worker: &str,
        ttl: Duration,
    ) -> Result<Option<GapDescriptor>> {
        let (mode, min_bars) = match filter {
            ClaimFilter::Archive { min_bars } => ("archive", min_bars),
            ClaimFilter::Incremental { archive_min_bars } => ("incremental", archive_min_bars),
            ClaimFilter::Any => ("any", 0),
        };
        let expiry = Utc::now() + chrono::Duration::from_std(ttl)?;

        let row = sqlx::query_as::<_, GapRow>(&format!(
            r#"
            UPDATE gap_descriptors
            SET claimed_by = $1, claim_expiry = $2
            WHERE id = (
                SELECT id FROM gap_descriptors
                WHERE status = 'open'
                  AND (claim_expiry IS NULL OR claim_expiry <= NOW())
                  AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
                  AND (
                      $3 = 'any'
                      OR ($3 = 'archive' AND (route = 'archive'
                          OR (route = 'auto' AND {BARS} >= $4)))
                      OR ($3 = 'incremental' AND (route = 'incremental'
                          OR (route = 'auto' AND {BARS} < $4)))
                  )
                ORDER BY priority DESC, discovered_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {GAP_COLUMNS}
            "#,
            BARS = "((EXTRACT(EPOCH FROM (end_time - start_time)) * 1000)::bigint / step_ms + 1)"
        ))
        .bind(worker)
        .bind(expiry)
        .bind(mode)
        .bind(min_bars as i64)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim gap")?;

        row.map(GapDescriptor::try_from).transpose()
    }

    /// Moves the start of a descriptor forward.
    ///
    /// # Errors
    /// Returns an error if the database update fails.
    pub async fn advance(&self, id: i64, new_start: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE gap_descriptors SET start_time = GREATEST(start_time, $2) WHERE id = $1",
        )
        .bind(id)
        .bind(new_start)
        .execute(&self.pool)
        .await
        .context("Failed to advance gap")?;
        Ok(())
    }

    /// Sets a terminal status and releases the claim.
    ///
    /// # Errors
    /// Returns an error if the database update fails.
    pub async fn finish(&self, id: i64, status: &str, reason: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE gap_descriptors
            SET status = $2, last_error = COALESCE($3, last_error),
                claimed_by = NULL, claim_expiry = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(reason)
        .execute(&self.pool)
        .await
        .context("Failed to finish gap")?;
        Ok(())
    }

    /// Records a failed attempt and schedules the next one.
    ///
    /// # Errors
    /// Returns an error if the database update fails.
    pub async fn fail(&self, id: i64, error: &str, retry_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE gap_descriptors
            SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3,
                claimed_by = NULL, claim_expiry = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(retry_at)
        .execute(&self.pool)
        .await
        .context("Failed to record gap failure")?;
        Ok(())
    }

    /// Looks up a descriptor by id.
    ///
    /// # Errors
    /// Returns an error if the query fails or the row cannot be decoded.
    pub async fn get(&self, id: i64) -> Result<Option<GapDescriptor>> {
        let row = sqlx::query_as::<_, GapRow>(&format!(
            "SELECT {GAP_COLUMNS} FROM gap_descriptors WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query gap")?;

        row.map(GapDescriptor::try_from).transpose()
    }

    /// Descriptors with a given status, highest priority first.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn list_by_status(&self, status: &str, limit: i64) -> Result<Vec<GapDescriptor>> {
        let rows = sqlx::query_as::<_, GapRow>(&format!(
            r#"
            SELECT {GAP_COLUMNS}
            FROM gap_descriptors
            WHERE status = $1
            ORDER BY priority DESC, discovered_at ASC
            LIMIT $2
            "#
        ))
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list gaps")?;

        rows.into_iter().map(GapDescriptor::try_from).collect()
    }

    /// Descriptor counts grouped by status.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn count_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM gap_descriptors GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count gaps")?;

        Ok(rows)
    }

    /// Clears expired claims on open descriptors.
    ///
    /// # Errors
    /// Returns an error if the database update fails.
    pub async fn release_expired_claims(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE gap_descriptors
            SET claimed_by = NULL, claim_expiry = NULL
            WHERE status = 'open' AND claim_expiry IS NOT NULL AND claim_expiry <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to release expired claims")?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct GapRow {
    id: i64,
    symbol: String,
    interval: String,
    dataset: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    priority: i32,
    discovered_at: DateTime<Utc>,
    attempts: i32,
    claimed_by: Option<String>,
    claim_expiry: Option<DateTime<Utc>>,
    status: String,
    route: String,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TryFrom<GapRow> for GapDescriptor {
    type Error = anyhow::Error;

    fn try_from(row: GapRow) -> Result<Self> {
        Ok(GapDescriptor {
            id: row.id,
            symbol: row.symbol,
            interval: row.interval.parse::<Interval>()?,
            dataset: row.dataset.parse()?,
            start_time: row.start_time,
            end_time: row.end_time,
            priority: row.priority,
            discovered_at: row.discovered_at,
            attempts: row.attempts,
            claimed_by: row.claimed_by,
            claim_expiry: row.claim_expiry,
            status: row.status.parse()?,
            route: row.route.parse()?,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
        })
    }
}
