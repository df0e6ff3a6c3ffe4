//! Ingest lineage repository.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use marketfeed_core::{DataSource, IngestBatch};
use sqlx::PgPool;

/// Repository for ingest batch records.
#[derive(Debug, Clone)]
pub struct BatchRepository {
    pool: PgPool,
}

impl BatchRepository {
    /// Creates a new repository instance.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a batch and returns its id.
    ///
    /// # Errors
    /// Returns an error if the database insert fails.
    pub async fn begin(&self, source: DataSource) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("INSERT INTO ingest_batches (source) VALUES ($1) RETURNING id")
                .bind(source.as_str())
                .fetch_one(&self.pool)
                .await
                .context("Failed to open ingest batch")?;
        Ok(row.0)
    }

    /// Closes a batch with its row count.
    ///
    /// # Errors
    /// Returns an error if the database update fails.
    pub async fn finish(&self, id: i64, row_count: i64) -> Result<()> {
        sqlx::query(
            "UPDATE ingest_batches SET row_count = $2, finished_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(row_count)
        .execute(&self.pool)
        .await
        .context("Failed to close ingest batch")?;
        Ok(())
    }

    /// Most recent batches, newest first.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn recent(&self, limit: i64) -> Result<Vec<IngestBatch>> {
        let rows: Vec<(i64, String, i64, DateTime<Utc>, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT id, source, row_count, started_at, finished_at
            FROM ingest_batches
            ORDER BY id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query ingest batches")?;

        rows.into_iter()
            .map(|(id, source, row_count, started_at, finished_at)| {
                Ok(IngestBatch {
                    id,
                    source: source.parse()?,
                    row_count,
                    started_at,
                    finished_at,
                })
            })
            .collect()
    }
}
