//! Derived futures metrics repository.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use marketfeed_core::{Interval, MetricSample};
use sqlx::PgPool;
use std::collections::HashMap;

use crate::store::UpsertOutcome;

/// Repository for metric samples.
#[derive(Debug, Clone)]
pub struct MetricRepository {
    pool: PgPool,
}

impl MetricRepository {
    /// Creates a new repository instance.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces metric samples.
    ///
    /// A stored sample is only replaced by a higher `(source_rank, ingested_at)`.
    /// Missing values in the incoming row keep the stored value.
    ///
    /// # Errors
    /// Returns an error if any chunk fails to write.
    pub async fn upsert_batch(&self, records: &[MetricSample]) -> Result<UpsertOutcome> {
        let records = collapse(records);
        let mut outcome = UpsertOutcome::default();

        for chunk in records.chunks(100) {
            let exchanges: Vec<_> = chunk.iter().map(|r| r.exchange.as_str()).collect();
            let symbols: Vec<_> = chunk.iter().map(|r| r.symbol.as_str()).collect();
            let intervals: Vec<_> = chunk.iter().map(|r| r.interval.as_str()).collect();
            let times: Vec<_> = chunk.iter().map(|r| r.timestamp).collect();
            let open_interest: Vec<_> = chunk.iter().map(|r| r.open_interest).collect();
            let open_interest_value: Vec<_> = chunk.iter().map(|r| r.open_interest_value).collect();
            let top_position: Vec<_> = chunk.iter().map(|r| r.top_trader_position_ratio).collect();
            let top_account: Vec<_> = chunk.iter().map(|r| r.top_trader_account_ratio).collect();
            let global_account: Vec<_> = chunk.iter().map(|r| r.global_account_ratio).collect();
            let taker_ratio: Vec<_> = chunk.iter().map(|r| r.taker_volume_ratio).collect();
            let sources: Vec<_> = chunk.iter().map(|r| r.source.as_str()).collect();
            let ranks: Vec<_> = chunk.iter().map(|r| r.source.rank()).collect();
            let ingested: Vec<_> = chunk.iter().map(|r| r.ingested_at).collect();

            let result = sqlx::query(
                r#"
                INSERT INTO metric_samples
                    (exchange, symbol, interval, sample_time,
                     open_interest, open_interest_value,
                     top_trader_position_ratio, top_trader_account_ratio,
                     global_account_ratio, taker_volume_ratio,
                     source, source_rank, ingested_at)
                SELECT * FROM UNNEST(
                    $1::text[], $2::text[], $3::text[], $4::timestamptz[],
                    $5::numeric[], $6::numeric[], $7::numeric[], $8::numeric[],
                    $9::numeric[], $10::numeric[],
                    $11::text[], $12::smallint[], $13::timestamptz[]
                )
                ON CONFLICT (exchange, symbol, interval, sample_time) DO UPDATE
                SET open_interest = COALESCE(EXCLUDED.open_interest, metric_samples.open_interest),
                    open_interest_value = COALESCE(EXCLUDED.open_interest_value, metric_samples.open_interest_value),
                    top_trader_position_ratio = COALESCE(EXCLUDED.top_trader_position_ratio, metric_samples.top_trader_position_ratio),
                    top_trader_account_ratio = COALESCE(EXCLUDED.top_trader_account_ratio, metric_samples.top_trader_account_ratio),
                    global_account_ratio = COALESCE(EXCLUDED.global_account_ratio, metric_samples.global_account_ratio),
                    taker_volume_ratio = COALESCE(EXCLUDED.taker_volume_ratio, metric_samples.taker_volume_ratio),
                    source = EXCLUDED.source,
                    source_rank = EXCLUDED.source_rank,
                    ingested_at = EXCLUDED.ingested_at
                WHERE (EXCLUDED.source_rank, EXCLUDED.ingested_at)
                    > (metric_samples.source_rank, metric_samples.ingested_at)
                "#,
            )
            .bind(&exchanges)
            .bind(&symbols)
            .bind(&intervals)
            .bind(&times)
            .bind(&open_interest)
            .bind(&open_interest_value)
            .bind(&top_position)
            .bind(&top_account)
            .bind(&global_account)
            .bind(&taker_ratio)
            .bind(&sources)
            .bind(&ranks)
            .bind(&ingested)
            .execute(&self.pool)
            .await
            .context("Failed to upsert metric samples")?;

            let written = result.rows_affected();
            outcome.merge(UpsertOutcome {
                written,
                superseded: (chunk.len() as u64).saturating_sub(written),
            });
        }

        Ok(outcome)
    }

    /// Sample times present in `[start, end]`.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn sample_times(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let rows: Vec<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT sample_time
            FROM metric_samples
            WHERE exchange = $1 AND symbol = $2 AND interval = $3
              AND sample_time >= $4 AND sample_time <= $5
            ORDER BY sample_time ASC
            "#,
        )
        .bind(exchange)
        .bind(symbol.to_uppercase())
        .bind(interval.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query metric sample times")?;

        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Latest sample time per symbol, used by the status report.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn latest_by_symbol(&self, exchange: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT symbol, MAX(sample_time)
            FROM metric_samples
            WHERE exchange = $1
            GROUP BY symbol
            ORDER BY symbol
            "#,
        )
        .bind(exchange)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query latest metric samples")?;

        Ok(rows)
    }
}

fn collapse(records: &[MetricSample]) -> Vec<MetricSample> {
    let mut best: HashMap<(&str, &str, Interval, DateTime<Utc>), &MetricSample> = HashMap::new();
    for record in records {
        let key = (
            record.exchange.as_str(),
            record.symbol.as_str(),
            record.interval,
            record.timestamp,
        );
        match best.get(&key) {
            Some(current) if !record.supersedes(current) => {}
            _ => {
                best.insert(key, record);
            }
        }
    }

    let mut rows: Vec<MetricSample> = best.into_values().cloned().collect();
    rows.sort_by_key(|r| r.timestamp);
    rows
}
