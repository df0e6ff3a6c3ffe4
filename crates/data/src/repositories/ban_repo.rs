//! Shared ban state persisted in PostgreSQL.
//!
//! Every process pointed at the same database observes one ban per scope.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketfeed_core::{BanState, BanStore};
use sqlx::PgPool;

/// Ban store backed by the `ban_state` table.
#[derive(Debug, Clone)]
pub struct PgBanStore {
    pool: PgPool,
}

impl PgBanStore {
    /// Creates a new store instance.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BanStore for PgBanStore {
    async fn load(&self, scope: &str) -> Result<Option<BanState>> {
        let row: Option<(String, DateTime<Utc>, String, i32)> = sqlx::query_as(
            "SELECT scope, banned_until, reason, ban_count FROM ban_state WHERE scope = $1",
        )
        .bind(scope)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load ban state")?;

        Ok(row.map(|(scope, banned_until, reason, ban_count)| BanState {
            scope,
            banned_until,
            reason,
            ban_count: ban_count.max(0) as u32,
        }))
    }

    /// Saves the ban, never moving `banned_until` backwards.
    async fn save(&self, state: &BanState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ban_state (scope, banned_until, reason, ban_count, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (scope) DO UPDATE
            SET banned_until = GREATEST(ban_state.banned_until, EXCLUDED.banned_until),
                reason = EXCLUDED.reason,
                ban_count = EXCLUDED.ban_count,
                updated_at = NOW()
            "#,
        )
        .bind(&state.scope)
        .bind(state.banned_until)
        .bind(&state.reason)
        .bind(state.ban_count as i32)
        .execute(&self.pool)
        .await
        .context("Failed to save ban state")?;

        Ok(())
    }
}
