//! Candle repository.
//!
//! Upserts resolve conflicts inside PostgreSQL with the same precedence key
//! the in-memory store uses: `(is_closed, source_rank, ingested_at)`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use marketfeed_core::{Candle, DataSource, Interval};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::HashMap;

use crate::store::UpsertOutcome;

/// Repository for canonical bars.
#[derive(Debug, Clone)]
pub struct CandleRepository {
    pool: PgPool,
}

impl CandleRepository {
    /// Creates a new repository instance.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces candles in chunks of 100.
    ///
    /// Rows sharing a key within the same call are collapsed first, keeping
    /// the highest-precedence one.
    ///
    /// # Errors
    /// Returns an error if any chunk fails to write.
    pub async fn upsert_batch(&self, records: &[Candle]) -> Result<UpsertOutcome> {
        let records = collapse(records);
        let mut outcome = UpsertOutcome::default();

        for chunk in records.chunks(100) {
            let exchanges: Vec<_> = chunk.iter().map(|r| r.exchange.as_str()).collect();
            let symbols: Vec<_> = chunk.iter().map(|r| r.symbol.as_str()).collect();
            let intervals: Vec<_> = chunk.iter().map(|r| r.interval.as_str()).collect();
            let open_times: Vec<_> = chunk.iter().map(|r| r.open_time).collect();
            let opens: Vec<_> = chunk.iter().map(|r| r.open).collect();
            let highs: Vec<_> = chunk.iter().map(|r| r.high).collect();
            let lows: Vec<_> = chunk.iter().map(|r| r.low).collect();
            let closes: Vec<_> = chunk.iter().map(|r| r.close).collect();
            let volumes: Vec<_> = chunk.iter().map(|r| r.volume).collect();
            let quote_volumes: Vec<_> = chunk.iter().map(|r| r.quote_volume).collect();
            let trade_counts: Vec<_> = chunk.iter().map(|r| r.trade_count).collect();
            let taker_buy_volumes: Vec<_> = chunk.iter().map(|r| r.taker_buy_volume).collect();
            let taker_buy_quote_volumes: Vec<_> =
                chunk.iter().map(|r| r.taker_buy_quote_volume).collect();
            let closed: Vec<_> = chunk.iter().map(|r| r.is_closed).collect();
            let sources: Vec<_> = chunk.iter().map(|r| r.source.as_str()).collect();
            let ranks: Vec<_> = chunk.iter().map(|r| r.source.rank()).collect();
            let ingested: Vec<_> = chunk.iter().map(|r| r.ingested_at).collect();

            let result = sqlx::query(
                r#"
                INSERT INTO candles
                    (exchange, symbol, interval, open_time,
                     open, high, low, close, volume,
                     quote_volume, trade_count, taker_buy_volume, taker_buy_quote_volume,
                     is_closed, source, source_rank, ingested_at)
                SELECT * FROM UNNEST(
                    $1::text[], $2::text[], $3::text[], $4::timestamptz[],
                    $5::numeric[], $6::numeric[], $7::numeric[], $8::numeric[], $9::numeric[],
                    $10::numeric[], $11::bigint[], $12::numeric[], $13::numeric[],
                    $14::boolean[], $15::text[], $16::smallint[], $17::timestamptz[]
                )
                ON CONFLICT (exchange, symbol, interval, open_time) DO UPDATE
                SET open = EXCLUDED.open,
                    high = EXCLUDED.high,
                    low = EXCLUDED.low,
                    close = EXCLUDED.close,
                    volume = EXCLUDED.volume,
                    quote_volume = EXCLUDED.quote_volume,
                    trade_count = EXCLUDED.trade_count,
                    taker_buy_volume = EXCLUDED.taker_buy_volume,
                    taker_buy_quote_volume = EXCLUDED.taker_buy_quote_volume,
                    is_closed = EXCLUDED.is_closed,
                    source = EXCLUDED.source,
                    source_rank = EXCLUDED.source_rank,
                    ingested_at = EXCLUDED.ingested_at
                WHERE (EXCLUDED.is_closed, EXCLUDED.source_rank, EXCLUDED.ingested_at)
                    > (candles.is_closed, candles.source_rank, candles.ingested_at)
                "#,
            )
            .bind(&exchanges)
            .bind(&symbols)
            .bind(&intervals)
            .bind(&open_times)
            .bind(&opens)
            .bind(&highs)
            .bind(&lows)
            .bind(&closes)
            .bind(&volumes)
            .bind(&quote_volumes)
            .bind(&trade_counts)
            .bind(&taker_buy_volumes)
            .bind(&taker_buy_quote_volumes)
            .bind(&closed)
            .bind(&sources)
            .bind(&ranks)
            .bind(&ingested)
            .execute(&self.pool)
            .await
            .context("Failed to upsert candles")?;

            let written = result.rows_affected();
            outcome.merge(UpsertOutcome {
                written,
                superseded: (chunk.len() as u64).saturating_sub(written),
            });
        }

        Ok(outcome)
    }

    /// Open times of closed candles in `[start, end]`.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn closed_open_times(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let rows: Vec<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT open_time
            FROM candles
            WHERE exchange = $1 AND symbol = $2 AND interval = $3
              AND open_time >= $4 AND open_time <= $5
              AND is_closed
            ORDER BY open_time ASC
            "#,
        )
        .bind(exchange)
        .bind(symbol.to_uppercase())
        .bind(interval.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query candle open times")?;

        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Queries candles within a time range.
    ///
    /// # Errors
    /// Returns an error if the query fails or a stored row cannot be decoded.
    pub async fn query_by_time_range(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let rows = sqlx::query_as::<_, CandleRow>(
            r#"
            SELECT exchange, symbol, interval, open_time, open, high, low, close, volume,
                   quote_volume, trade_count, taker_buy_volume, taker_buy_quote_volume,
                   is_closed, source, ingested_at
            FROM candles
            WHERE exchange = $1 AND symbol = $2 AND interval = $3
              AND open_time >= $4 AND open_time <= $5
            ORDER BY open_time ASC
            "#,
        )
        .bind(exchange)
        .bind(symbol.to_uppercase())
        .bind(interval.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query candles")?;

        rows.into_iter().map(Candle::try_from).collect()
    }

    /// Gets the earliest and latest open times for a series.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    #[allow(clippy::type_complexity)]
    pub async fn get_data_bounds(
        &self,
        exchange: &str,
        symbol: &str,
        interval: Interval,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let row: Option<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT MIN(open_time), MAX(open_time)
            FROM candles
            WHERE exchange = $1 AND symbol = $2 AND interval = $3
            "#,
        )
        .bind(exchange)
        .bind(symbol.to_uppercase())
        .bind(interval.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query data bounds")?;

        match row {
            Some((Some(min), Some(max))) => Ok(Some((min, max))),
            _ => Ok(None),
        }
    }

    /// Row counts per (symbol, interval), used by the status report.
    ///
    /// # Errors
    /// Returns an error if the database query fails.
    pub async fn count_by_series(&self, exchange: &str) -> Result<Vec<(String, String, i64)>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT symbol, interval, COUNT(*)
            FROM candles
            WHERE exchange = $1
            GROUP BY symbol, interval
            ORDER BY symbol, interval
            "#,
        )
        .bind(exchange)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count candles")?;

        Ok(rows)
    }
}

/// Keeps one row per key, the one with the highest precedence.
fn collapse(records: &[Candle]) -> Vec<Candle> {
    let mut best: HashMap<(&str, &str, Interval, DateTime<Utc>), &Candle> = HashMap::new();
    for record in records {
        let key = (
            record.exchange.as_str(),
            record.symbol.as_str(),
            record.interval,
            record.open_time,
        );
        match best.get(&key) {
            Some(current) if !record.supersedes(current) => {}
            _ => {
                best.insert(key, record);
            }
        }
    }

    let mut rows: Vec<Candle> = best.into_values().cloned().collect();
    rows.sort_by_key(|r| r.open_time);
    rows
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CandleRow {
    exchange: String,
    symbol: String,
    interval: String,
    open_time: DateTime<Utc>,
    open: Decimal,
    high: Decimal,
    low: Decimal,
    close: Decimal,
    volume: Decimal,
    quote_volume: Option<Decimal>,
    trade_count: Option<i64>,
    taker_buy_volume: Option<Decimal>,
    taker_buy_quote_volume: Option<Decimal>,
    is_closed: bool,
    source: String,
    ingested_at: DateTime<Utc>,
}

impl TryFrom<CandleRow> for Candle {
    type Error = anyhow::Error;

    fn try_from(row: CandleRow) -> Result<Self> {
        Ok(Candle {
            exchange: row.exchange,
            symbol: row.symbol,
            interval: row.interval.parse::<Interval>()?,
            open_time: row.open_time,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            quote_volume: row.quote_volume,
            trade_count: row.trade_count,
            taker_buy_volume: row.taker_buy_volume,
            taker_buy_quote_volume: row.taker_buy_quote_volume,
            is_closed: row.is_closed,
            source: row.source.parse::<DataSource>()?,
            ingested_at: row.ingested_at,
        })
    }
}
