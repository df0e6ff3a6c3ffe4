//! Shared request budget and exchange ban tracker.
//!
//! One [`RateGuard`] is created per outbound identity and handed to every
//! component that talks to the exchange. It combines three limits:
//!
//! - a per-minute weight budget (governor quota, burst equal to the budget)
//! - a cap on simultaneous in-flight calls
//! - the shared [`BanState`], loaded from an injected [`BanStore`] before
//!   every call so bans recorded by any process are honoured by all
//!
//! ```no_run
//! use marketfeed_collector::{MemoryBanStore, RateGuard, RateGuardConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> marketfeed_core::IngestResult<()> {
//! let guard = RateGuard::new("binance_futures_um", RateGuardConfig::default(), Arc::new(MemoryBanStore::new()));
//! let value = guard.execute(2, || async { Ok(42) }).await?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use marketfeed_core::{BanState, BanStore, IngestError, IngestResult, RateLimitConfig};
use parking_lot::Mutex;
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Ban applied to a 429 without `Retry-After`.
pub const DEFAULT_RATE_LIMIT_BAN: Duration = Duration::from_secs(60);

/// Ban applied to a 418 without a parseable expiry.
pub const DEFAULT_IP_BAN: Duration = Duration::from_secs(120);

/// Longest single retry delay for transient failures.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

// =============================================================================
// Configuration
// =============================================================================

/// Limits enforced by a [`RateGuard`].
#[derive(Debug, Clone)]
pub struct RateGuardConfig {
    /// Request weight allowed per minute
    pub weight_per_minute: NonZeroU32,
    /// Simultaneous in-flight calls
    pub max_concurrent: usize,
    /// Retries for retryable failures inside [`RateGuard::execute`]
    pub max_retries: u32,
    /// First retry delay; doubles per attempt
    pub retry_base: Duration,
    /// Minimum ban for the first ban of a streak
    pub ban_floor: Duration,
    /// Largest floor a ban streak can grow to
    pub ban_ceiling: Duration,
    /// Extra wait after a ban expires
    pub ban_margin: Duration,
    /// Upper bound of the random extra wait after a ban
    pub ban_jitter: Duration,
}

impl RateGuardConfig {
    /// Converts the loaded configuration section.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            weight_per_minute: NonZeroU32::new(config.weight_per_minute)
                .unwrap_or(nonzero_ext::nonzero!(1200u32)),
            max_concurrent: config.max_concurrent.max(1),
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
            ban_floor: Duration::from_secs(config.ban_floor_secs),
            ban_ceiling: Duration::from_secs(config.ban_ceiling_secs),
            ban_margin: Duration::from_millis(config.ban_margin_ms),
            ban_jitter: Duration::from_millis(config.ban_jitter_ms),
        }
    }

    /// Sets the ban jitter.
    #[must_use]
    pub fn with_ban_jitter(mut self, jitter: Duration) -> Self {
        self.ban_jitter = jitter;
        self
    }

    /// Sets the ban floor.
    #[must_use]
    pub fn with_ban_floor(mut self, floor: Duration) -> Self {
        self.ban_floor = floor;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, retry_base: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base = retry_base;
        self
    }

    /// Floor for the `streak`-th consecutive ban (1-based).
    #[must_use]
    pub fn floor_for_streak(&self, streak: u32) -> Duration {
        let doublings = streak.saturating_sub(1).min(16);
        self.ban_floor
            .saturating_mul(1u32 << doublings)
            .min(self.ban_ceiling.max(self.ban_floor))
    }
}

impl Default for RateGuardConfig {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

// =============================================================================
// Ban parsing
// =============================================================================

fn banned_until_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"banned until (\d+)").ok())
        .as_ref()
}

/// Extracts the epoch-millisecond expiry from a 418 body.
#[must_use]
pub fn parse_banned_until(message: &str) -> Option<DateTime<Utc>> {
    let captures = banned_until_pattern()?.captures(message)?;
    let ms = captures.get(1)?.as_str().parse::<i64>().ok()?;
    DateTime::from_timestamp_millis(ms)
}

/// Ban length requested by the exchange for one rate-limit response.
#[must_use]
pub fn requested_ban(
    status: u16,
    retry_after: Option<Duration>,
    message: &str,
    now: DateTime<Utc>,
) -> Duration {
    if status == 418 {
        if let Some(until) = parse_banned_until(message) {
            return (until - now).to_std().unwrap_or(Duration::ZERO);
        }
        return retry_after.unwrap_or(DEFAULT_IP_BAN);
    }
    retry_after.unwrap_or(DEFAULT_RATE_LIMIT_BAN)
}

// =============================================================================
// Rate Guard
// =============================================================================

type GovernorLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Concurrency slot held for the duration of one outbound call.
#[derive(Debug)]
pub struct RatePermit {
    _permit: OwnedSemaphorePermit,
}

/// Rate limiter and ban tracker for one outbound identity.
pub struct RateGuard {
    scope: String,
    config: RateGuardConfig,
    limiter: GovernorLimiter,
    concurrency: Arc<Semaphore>,
    bans: Arc<dyn BanStore>,
    last_seen: Mutex<Option<BanState>>,
}

impl RateGuard {
    /// Creates a guard for `scope` backed by `bans`.
    #[must_use]
    pub fn new(scope: impl Into<String>, config: RateGuardConfig, bans: Arc<dyn BanStore>) -> Self {
        let limiter = RateLimiter::direct(Quota::per_minute(config.weight_per_minute));
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent));

        Self {
            scope: scope.into(),
            config,
            limiter,
            concurrency,
            bans,
            last_seen: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[must_use]
    pub fn config(&self) -> &RateGuardConfig {
        &self.config
    }

    /// Loads the shared ban state, falling back to the last one seen.
    pub async fn current_ban(&self) -> Option<BanState> {
        match self.bans.load(&self.scope).await {
            Ok(state) => {
                *self.last_seen.lock() = state.clone();
                state
            }
            Err(e) => {
                warn!(scope = %self.scope, error = %e, "Failed to load ban state, using cached copy");
                self.last_seen.lock().clone()
            }
        }
    }

    /// Waits until no ban is in force, plus margin and jitter.
    pub async fn wait_for_ban(&self) {
        let mut waited_for: Option<DateTime<Utc>> = None;

        loop {
            let Some(ban) = self.current_ban().await else {
                return;
            };
            if waited_for == Some(ban.banned_until) {
                return;
            }
            let now = Utc::now();
            if !ban.is_active(now) {
                return;
            }

            let remaining = (ban.banned_until - now).to_std().unwrap_or(Duration::ZERO);
            let wait = remaining + self.config.ban_margin + self.jitter();
            info!(
                scope = %self.scope,
                banned_until = %ban.banned_until,
                wait_ms = wait.as_millis() as u64,
                "Waiting for ban to expire"
            );
            tokio::time::sleep(wait).await;
            waited_for = Some(ban.banned_until);
        }
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.config.ban_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    fn weight(weight: u32) -> NonZeroU32 {
        NonZeroU32::new(weight).unwrap_or(nonzero_ext::nonzero!(1u32))
    }

    /// Waits for capacity under the ban, the budget, and the concurrency cap.
    ///
    /// # Errors
    /// Returns `FatalConfig` if `weight` exceeds the whole per-minute budget.
    pub async fn acquire(&self, weight: u32) -> IngestResult<RatePermit> {
        self.wait_for_ban().await;

        let permit = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IngestError::transient("Rate guard closed"))?;

        self.limiter
            .until_n_ready(Self::weight(weight))
            .await
            .map_err(|_| {
                IngestError::fatal_config(format!(
                    "Request weight {weight} exceeds budget {}",
                    self.config.weight_per_minute
                ))
            })?;

        // A ban may have been recorded while this caller was queued
        self.wait_for_ban().await;

        Ok(RatePermit { _permit: permit })
    }

    /// Takes capacity only if it is available right now.
    ///
    /// # Errors
    /// Returns `RateLimited` while banned or out of budget, `TransientNetwork`
    /// when the concurrency cap is reached.
    pub async fn try_acquire(&self, weight: u32) -> IngestResult<RatePermit> {
        if let Some(ban) = self.current_ban().await {
            let now = Utc::now();
            if ban.is_active(now) {
                return Err(IngestError::rate_limited(
                    429,
                    (ban.banned_until - now).to_std().ok(),
                    format!("banned until {}", ban.banned_until.timestamp_millis()),
                ));
            }
        }

        let permit = self
            .concurrency
            .clone()
            .try_acquire_owned()
            .map_err(|_| IngestError::transient("Concurrency cap reached"))?;

        match self.limiter.check_n(Self::weight(weight)) {
            Ok(Ok(())) => Ok(RatePermit { _permit: permit }),
            Ok(Err(_)) => Err(IngestError::rate_limited(429, None, "Request budget exhausted")),
            Err(_) => Err(IngestError::fatal_config(format!(
                "Request weight {weight} exceeds budget {}",
                self.config.weight_per_minute
            ))),
        }
    }

    /// Records a rate-limit response as a shared ban.
    ///
    /// The ban lasts at least the streak floor and never shortens one
    /// already in force.
    pub async fn record_ban(&self, status: u16, retry_after: Option<Duration>, message: &str) -> BanState {
        let now = Utc::now();
        let previous = self.current_ban().await;

        // Responses to calls already in flight when the ban began do not grow the streak
        let streak = match &previous {
            Some(p) if p.is_active(now) && p.ban_count > 0 => p.ban_count,
            Some(p) if p.ban_count > 0 => p.ban_count + 1,
            _ => 1,
        };

        let duration = requested_ban(status, retry_after, message, now)
            .max(self.config.floor_for_streak(streak));
        let mut banned_until = now + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        if let Some(p) = &previous {
            banned_until = banned_until.max(p.banned_until);
        }

        let state = BanState {
            scope: self.scope.clone(),
            banned_until,
            reason: format!("HTTP {status}: {message}"),
            ban_count: streak,
        };

        if let Err(e) = self.bans.save(&state).await {
            warn!(scope = %self.scope, error = %e, "Failed to persist ban state");
        }
        *self.last_seen.lock() = Some(state.clone());

        warn!(
            scope = %self.scope,
            status,
            banned_until = %state.banned_until,
            streak,
            "Rate limit ban recorded"
        );
        state
    }

    /// Resets the ban streak after the first success past an expired ban.
    pub async fn record_success(&self) {
        let expired = {
            let seen = self.last_seen.lock();
            match seen.as_ref() {
                Some(ban) if ban.ban_count > 0 && !ban.is_active(Utc::now()) => Some(ban.clone()),
                _ => None,
            }
        };

        if let Some(mut state) = expired {
            state.ban_count = 0;
            if let Err(e) = self.bans.save(&state).await {
                warn!(scope = %self.scope, error = %e, "Failed to reset ban streak");
            }
            debug!(scope = %self.scope, "Ban streak reset");
            *self.last_seen.lock() = Some(state);
        }
    }

    /// Feeds a call result back into the ban state.
    ///
    /// The borrowed result is inspected before the returned future is built,
    /// so the future does not hold `&IngestResult<T>` across an await point
    /// (keeping it `Send` even when `T` is not `Sync`).
    pub fn observe<T>(
        &self,
        result: &IngestResult<T>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let outcome = match result {
            Ok(_) => Some(None),
            Err(IngestError::RateLimited {
                status,
                retry_after,
                message,
            }) => Some(Some((*status, *retry_after, message.clone()))),
            Err(_) => None,
        };
        async move {
            match outcome {
                Some(None) => self.record_success().await,
                Some(Some((status, retry_after, message))) => {
                    self.record_ban(status, retry_after, &message).await;
                }
                None => {}
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16);
        self.config
            .retry_base
            .saturating_mul(1u32 << doublings)
            .min(MAX_RETRY_DELAY)
    }

    /// Runs `call` under the guard, retrying retryable failures.
    ///
    /// Rate-limit responses become bans that the next attempt waits out;
    /// other retryable failures back off exponentially. Permanent errors
    /// return immediately.
    ///
    /// # Errors
    /// Returns the last error once retries are exhausted, or the first
    /// non-retryable error.
    pub async fn execute<T, F, Fut>(&self, weight: u32, mut call: F) -> IngestResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = IngestResult<T>>,
    {
        let mut attempt = 0u32;

        loop {
            let permit = self.acquire(weight).await?;
            let result = call().await;
            drop(permit);
            self.observe(&result).await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    if matches!(e, IngestError::RateLimited { .. }) {
                        warn!(scope = %self.scope, attempt, error = %e, "Rate limited, retrying after ban");
                    } else {
                        let delay = self.retry_delay(attempt);
                        warn!(
                            scope = %self.scope,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Retryable failure"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for RateGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGuard")
            .field("scope", &self.scope)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Ban stores
// =============================================================================

/// Ban store for a single process.
#[derive(Debug, Default)]
pub struct MemoryBanStore {
    states: Mutex<HashMap<String, BanState>>,
}

impl MemoryBanStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn merge_ban(existing: Option<&BanState>, incoming: &BanState) -> BanState {
    let mut merged = incoming.clone();
    if let Some(existing) = existing {
        merged.banned_until = merged.banned_until.max(existing.banned_until);
    }
    merged
}

#[async_trait]
impl BanStore for MemoryBanStore {
    async fn load(&self, scope: &str) -> Result<Option<BanState>> {
        Ok(self.states.lock().get(scope).cloned())
    }

    async fn save(&self, state: &BanState) -> Result<()> {
        let mut states = self.states.lock();
        let merged = merge_ban(states.get(&state.scope), state);
        states.insert(state.scope.clone(), merged);
        Ok(())
    }
}

/// Ban store shared by processes on one host through a JSON file.
#[derive(Debug, Clone)]
pub struct FileBanStore {
    path: PathBuf,
}

impl FileBanStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_all(&self) -> Result<HashMap<String, BanState>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse ban state file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read ban state file {}", self.path.display())),
        }
    }
}

#[async_trait]
impl BanStore for FileBanStore {
    async fn load(&self, scope: &str) -> Result<Option<BanState>> {
        Ok(self.read_all().await?.remove(scope))
    }

    async fn save(&self, state: &BanState) -> Result<()> {
        let mut states = self.read_all().await?;
        let merged = merge_ban(states.get(&state.scope), state);
        states.insert(state.scope.clone(), merged);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create ban state directory")?;
        }
        let tmp = self.path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(&states).context("Failed to serialize ban state")?;
        tokio::fs::write(&tmp, json)
            .await
            .context("Failed to write ban state")?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("Failed to replace ban state file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn sample_timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 30, 12, 0, 0).unwrap()
    }

    fn test_config() -> RateGuardConfig {
        RateGuardConfig::default()
            .with_ban_jitter(Duration::ZERO)
            .with_retries(3, Duration::from_millis(100))
    }

    fn guard_with(bans: Arc<dyn BanStore>, config: RateGuardConfig) -> RateGuard {
        RateGuard::new("binance_futures_um", config, bans)
    }

    // ============================================
    // Ban Parsing Tests
    // ============================================

    #[test]
    fn test_parse_banned_until() {
        let msg = r#"{"code":-1003,"msg":"Way too many requests; IP(1.2.3.4) banned until 1769774460000. Please use the websocket for live updates to avoid bans."}"#;
        let until = parse_banned_until(msg).unwrap();
        assert_eq!(until.timestamp_millis(), 1769774460000);
        assert!(parse_banned_until("Too many requests").is_none());
    }

    #[test]
    fn test_requested_ban_durations() {
        let now = sample_timestamp();

        assert_eq!(requested_ban(429, None, "", now), DEFAULT_RATE_LIMIT_BAN);
        assert_eq!(
            requested_ban(429, Some(Duration::from_secs(7)), "", now),
            Duration::from_secs(7)
        );

        let msg = "IP banned until 1769774460000.";
        assert_eq!(requested_ban(418, None, msg, now), Duration::from_secs(60));
        assert_eq!(
            requested_ban(418, Some(Duration::from_secs(30)), "banned", now),
            Duration::from_secs(30)
        );
        assert_eq!(requested_ban(418, None, "banned", now), DEFAULT_IP_BAN);
    }

    #[test]
    fn test_floor_doubles_and_caps() {
        let config = RateGuardConfig::default();
        assert_eq!(config.floor_for_streak(1), Duration::from_secs(5));
        assert_eq!(config.floor_for_streak(2), Duration::from_secs(10));
        assert_eq!(config.floor_for_streak(4), Duration::from_secs(40));
        assert_eq!(config.floor_for_streak(20), Duration::from_secs(600));
    }

    #[test]
    fn test_config_from_section() {
        let section = RateLimitConfig {
            weight_per_minute: 0,
            max_concurrent: 0,
            ..Default::default()
        };
        let config = RateGuardConfig::from_config(&section);
        assert_eq!(config.weight_per_minute.get(), 1200);
        assert_eq!(config.max_concurrent, 1);
    }

    // ============================================
    // Ban State Tests
    // ============================================

    #[tokio::test]
    async fn test_ban_only_extends() {
        let guard = guard_with(Arc::new(MemoryBanStore::new()), test_config());

        let long = guard.record_ban(429, Some(Duration::from_secs(300)), "slow down").await;
        let short = guard.record_ban(429, Some(Duration::from_secs(1)), "slow down").await;

        assert_eq!(short.banned_until, long.banned_until);
        // Still inside the first ban, so the streak does not grow
        assert_eq!(short.ban_count, 1);
    }

    #[tokio::test]
    async fn test_success_after_expiry_resets_streak() {
        let bans = Arc::new(MemoryBanStore::new());
        let guard = guard_with(bans.clone(), test_config().with_ban_floor(Duration::ZERO));

        let first = guard.record_ban(429, Some(Duration::ZERO), "slow down").await;
        assert_eq!(first.ban_count, 1);
        let second = guard.record_ban(429, Some(Duration::ZERO), "slow down").await;
        assert_eq!(second.ban_count, 2);

        guard.record_success().await;
        let stored = bans.load("binance_futures_um").await.unwrap().unwrap();
        assert_eq!(stored.ban_count, 0);

        let fresh = guard.record_ban(429, Some(Duration::ZERO), "slow down").await;
        assert_eq!(fresh.ban_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ban_blocks_acquire_across_components() {
        let bans: Arc<dyn BanStore> = Arc::new(MemoryBanStore::new());
        let stream_guard = guard_with(bans.clone(), test_config());
        let backfill_guard = guard_with(bans.clone(), test_config());

        stream_guard
            .record_ban(429, Some(Duration::from_secs(5)), "Too many requests")
            .await;

        let start = tokio::time::Instant::now();
        let _permit = backfill_guard.acquire(1).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));

        let err = stream_guard.try_acquire(1).await.unwrap_err();
        assert!(matches!(err, IngestError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_try_acquire_fails_fast_when_banned() {
        let guard = guard_with(Arc::new(MemoryBanStore::new()), test_config());
        assert!(guard.try_acquire(1).await.is_ok());

        guard.record_ban(429, Some(Duration::from_secs(60)), "slow down").await;
        let err = guard.try_acquire(1).await.unwrap_err();
        assert!(matches!(err, IngestError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_weight_above_budget_is_fatal() {
        let config = RateGuardConfig {
            weight_per_minute: nonzero_ext::nonzero!(10u32),
            ..test_config()
        };
        let guard = guard_with(Arc::new(MemoryBanStore::new()), config);
        let err = guard.acquire(11).await.unwrap_err();
        assert!(err.is_fatal());
    }

    // ============================================
    // Execute Tests
    // ============================================

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_transient_failures() {
        let guard = guard_with(Arc::new(MemoryBanStore::new()), test_config());
        let calls = AtomicU32::new(0);

        let value = guard
            .execute(1, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(IngestError::transient("connection reset"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_does_not_retry_client_errors() {
        let guard = guard_with(Arc::new(MemoryBanStore::new()), test_config());
        let calls = AtomicU32::new(0);

        let err = guard
            .execute(1, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(IngestError::client(400, "Invalid symbol.")) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Client { status: 400, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_waits_out_rate_limit() {
        let bans = Arc::new(MemoryBanStore::new());
        let guard = guard_with(bans.clone(), test_config());
        let calls = AtomicU32::new(0);

        let start = tokio::time::Instant::now();
        guard
            .execute(2, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(IngestError::rate_limited(429, Some(Duration::from_secs(5)), "slow down"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(bans.load("binance_futures_um").await.unwrap().is_some());
    }

    // ============================================
    // File Store Tests
    // ============================================

    #[tokio::test]
    async fn test_file_ban_store_shares_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/bans.json");
        let writer = FileBanStore::new(&path);
        let reader = FileBanStore::new(&path);

        assert!(reader.load("binance_futures_um").await.unwrap().is_none());

        let until = sample_timestamp();
        writer
            .save(&BanState::new("binance_futures_um", until, "HTTP 418"))
            .await
            .unwrap();
        writer
            .save(&BanState::new(
                "binance_futures_um",
                until - chrono::Duration::seconds(30),
                "HTTP 429",
            ))
            .await
            .unwrap();

        let loaded = reader.load("binance_futures_um").await.unwrap().unwrap();
        assert_eq!(loaded.banned_until, until);
        assert_eq!(loaded.reason, "HTTP 429");
    }
}
