//! Canonical row and work-item models.
//!
//! Adapters normalize vendor payloads into [`Candle`] and [`MetricSample`]
//! before anything reaches the pipeline. [`GapDescriptor`] is the unit of
//! recovery work and [`BanState`] is the only process-wide mutable state.

use crate::interval::Interval;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Sources and datasets
// ============================================================================

/// Pipeline that produced a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSource {
    /// Live WebSocket stream.
    #[serde(rename = "binance_ws")]
    Stream,
    /// Live REST polling (derived metrics).
    #[serde(rename = "rest_poll")]
    Poll,
    /// Bulk historical archive file.
    #[serde(rename = "binance_zip")]
    Archive,
    /// Paginated historical REST recovery.
    #[serde(rename = "rest_backfill")]
    IncrementalRest,
}

impl DataSource {
    /// Returns the stored tag.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Stream => "binance_ws",
            DataSource::Poll => "rest_poll",
            DataSource::Archive => "binance_zip",
            DataSource::IncrementalRest => "rest_backfill",
        }
    }

    /// Trust rank used by upsert conflict resolution. Higher wins.
    #[must_use]
    pub fn rank(&self) -> i16 {
        match self {
            DataSource::Stream | DataSource::Poll => 3,
            DataSource::Archive => 2,
            DataSource::IncrementalRest => 1,
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "binance_ws" => Ok(DataSource::Stream),
            "rest_poll" => Ok(DataSource::Poll),
            "binance_zip" => Ok(DataSource::Archive),
            "rest_backfill" => Ok(DataSource::IncrementalRest),
            _ => Err(anyhow!("Unknown data source: '{}'", s)),
        }
    }
}

/// Dataset a gap belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Candle,
    Metric,
}

impl Dataset {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Dataset::Candle => "candle",
            Dataset::Metric => "metric",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "candle" | "candles" | "klines" => Ok(Dataset::Candle),
            "metric" | "metrics" => Ok(Dataset::Metric),
            _ => Err(anyhow!("Invalid dataset: '{}'. Valid values: candle, metric", s)),
        }
    }
}

// ============================================================================
// Rows
// ============================================================================

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Exchange identifier (e.g., "binance_futures_um")
    pub exchange: String,
    /// Trading pair symbol, uppercase (e.g., "BTCUSDT")
    pub symbol: String,
    /// Bar interval
    pub interval: Interval,
    /// Bar open time (interval boundary)
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Base asset volume
    pub volume: Decimal,
    /// Quote asset volume
    pub quote_volume: Option<Decimal>,
    /// Number of trades
    pub trade_count: Option<i64>,
    /// Taker buy base asset volume
    pub taker_buy_volume: Option<Decimal>,
    /// Taker buy quote asset volume
    pub taker_buy_quote_volume: Option<Decimal>,
    /// Whether the bar is finalized
    pub is_closed: bool,
    /// Pipeline that produced this row
    pub source: DataSource,
    /// When the row entered the pipeline
    pub ingested_at: DateTime<Utc>,
}

impl Candle {
    /// Creates a closed candle with only OHLCV fields set.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        interval: Interval,
        open_time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        source: DataSource,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into().to_uppercase(),
            interval,
            open_time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume: None,
            trade_count: None,
            taker_buy_volume: None,
            taker_buy_quote_volume: None,
            is_closed: true,
            source,
            ingested_at: Utc::now(),
        }
    }

    /// Sets the closed flag.
    #[must_use]
    pub fn with_closed(mut self, is_closed: bool) -> Self {
        self.is_closed = is_closed;
        self
    }

    /// Sets the ingestion time.
    #[must_use]
    pub fn with_ingested_at(mut self, ingested_at: DateTime<Utc>) -> Self {
        self.ingested_at = ingested_at;
        self
    }

    /// Ordering key for conflict resolution: closed beats open, then source
    /// rank, then the newer ingestion.
    #[must_use]
    pub fn precedence(&self) -> (bool, i16, DateTime<Utc>) {
        (self.is_closed, self.source.rank(), self.ingested_at)
    }

    /// Returns true if this row should replace `stored` for the same key.
    #[must_use]
    pub fn supersedes(&self, stored: &Candle) -> bool {
        self.precedence() > stored.precedence()
    }
}

/// Derived futures metrics for one aligned sample time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Exchange identifier
    pub exchange: String,
    /// Trading pair symbol, uppercase
    pub symbol: String,
    /// Sample interval (5m for Binance futures data)
    pub interval: Interval,
    /// Aligned sample time
    pub timestamp: DateTime<Utc>,
    /// Sum of open interest in base asset
    pub open_interest: Option<Decimal>,
    /// Sum of open interest value in quote asset
    pub open_interest_value: Option<Decimal>,
    /// Top trader long/short ratio by positions
    pub top_trader_position_ratio: Option<Decimal>,
    /// Top trader long/short ratio by accounts
    pub top_trader_account_ratio: Option<Decimal>,
    /// Global long/short account ratio
    pub global_account_ratio: Option<Decimal>,
    /// Taker buy/sell volume ratio
    pub taker_volume_ratio: Option<Decimal>,
    /// Pipeline that produced this row
    pub source: DataSource,
    /// When the row entered the pipeline
    pub ingested_at: DateTime<Utc>,
}

impl MetricSample {
    /// Creates an empty sample; values are filled by the adapter.
    pub fn new(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        interval: Interval,
        timestamp: DateTime<Utc>,
        source: DataSource,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into().to_uppercase(),
            interval,
            timestamp,
            open_interest: None,
            open_interest_value: None,
            top_trader_position_ratio: None,
            top_trader_account_ratio: None,
            global_account_ratio: None,
            taker_volume_ratio: None,
            source,
            ingested_at: Utc::now(),
        }
    }

    /// Sets the ingestion time.
    #[must_use]
    pub fn with_ingested_at(mut self, ingested_at: DateTime<Utc>) -> Self {
        self.ingested_at = ingested_at;
        self
    }

    /// Returns true if no metric value is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open_interest.is_none()
            && self.open_interest_value.is_none()
            && self.top_trader_position_ratio.is_none()
            && self.top_trader_account_ratio.is_none()
            && self.global_account_ratio.is_none()
            && self.taker_volume_ratio.is_none()
    }

    /// Ordering key for conflict resolution.
    #[must_use]
    pub fn precedence(&self) -> (i16, DateTime<Utc>) {
        (self.source.rank(), self.ingested_at)
    }

    /// Returns true if this row should replace `stored` for the same key.
    #[must_use]
    pub fn supersedes(&self, stored: &MetricSample) -> bool {
        self.precedence() > stored.precedence()
    }
}

// ============================================================================
// Gap descriptors
// ============================================================================

/// Lifecycle of a gap descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    /// Waiting for (or held by) a backfiller
    Open,
    /// Recovered
    Done,
    /// Confirmed provider-side hole
    Incomplete,
    /// Gave up after retries or retention expiry
    Abandoned,
}

impl GapStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            GapStatus::Open => "open",
            GapStatus::Done => "done",
            GapStatus::Incomplete => "incomplete",
            GapStatus::Abandoned => "abandoned",
        }
    }
}

impl FromStr for GapStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(GapStatus::Open),
            "done" => Ok(GapStatus::Done),
            "incomplete" => Ok(GapStatus::Incomplete),
            "abandoned" => Ok(GapStatus::Abandoned),
            _ => Err(anyhow!("Unknown gap status: '{}'", s)),
        }
    }
}

/// Which backfill path may claim a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapRoute {
    /// Routed by size against the archive threshold
    Auto,
    /// Archive path only
    Archive,
    /// Incremental REST path only (hand-downs)
    Incremental,
}

impl GapRoute {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            GapRoute::Auto => "auto",
            GapRoute::Archive => "archive",
            GapRoute::Incremental => "incremental",
        }
    }
}

impl FromStr for GapRoute {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(GapRoute::Auto),
            "archive" => Ok(GapRoute::Archive),
            "incremental" => Ok(GapRoute::Incremental),
            _ => Err(anyhow!("Unknown gap route: '{}'", s)),
        }
    }
}

/// A missing contiguous run of interval boundaries.
///
/// `start_time` and `end_time` are both inclusive open times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapDescriptor {
    /// Store-assigned identifier (0 until enqueued)
    pub id: i64,
    pub symbol: String,
    pub interval: Interval,
    pub dataset: Dataset,
    /// First missing open time
    pub start_time: DateTime<Utc>,
    /// Last missing open time
    pub end_time: DateTime<Utc>,
    /// Higher is claimed first
    pub priority: i32,
    pub discovered_at: DateTime<Utc>,
    /// Failed recovery attempts so far
    pub attempts: i32,
    /// Worker currently holding the claim
    pub claimed_by: Option<String>,
    /// Claim is reclaimable after this instant
    pub claim_expiry: Option<DateTime<Utc>>,
    pub status: GapStatus,
    pub route: GapRoute,
    /// Not claimable before this instant (retry backoff)
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl GapDescriptor {
    /// Creates an open, unclaimed descriptor.
    pub fn new(
        symbol: impl Into<String>,
        interval: Interval,
        dataset: Dataset,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            symbol: symbol.into().to_uppercase(),
            interval,
            dataset,
            start_time,
            end_time,
            priority: 0,
            discovered_at: Utc::now(),
            attempts: 0,
            claimed_by: None,
            claim_expiry: None,
            status: GapStatus::Open,
            route: GapRoute::Auto,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the route.
    #[must_use]
    pub fn with_route(mut self, route: GapRoute) -> Self {
        self.route = route;
        self
    }

    /// Number of missing bars covered.
    #[must_use]
    pub fn bars(&self) -> u64 {
        self.interval.bars_between(self.start_time, self.end_time)
    }

    /// Returns true if both descriptors describe the same series.
    #[must_use]
    pub fn same_series(&self, other: &GapDescriptor) -> bool {
        self.symbol == other.symbol
            && self.interval == other.interval
            && self.dataset == other.dataset
    }

    /// Returns true if the ranges overlap or touch (no boundary in between).
    #[must_use]
    pub fn touches(&self, other: &GapDescriptor) -> bool {
        let step = self.interval.step();
        self.start_time <= other.end_time + step && other.start_time <= self.end_time + step
    }

    /// Returns true if this descriptor fully covers `[start, end]`.
    #[must_use]
    pub fn covers(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time <= start && self.end_time >= end
    }

    /// Returns true if a worker may claim this descriptor at `now`.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == GapStatus::Open
            && self.claim_expiry.map_or(true, |expiry| expiry <= now)
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Claim selection for backfill workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimFilter {
    /// Auto-routed gaps of at least `min_bars`, or archive-routed gaps
    Archive { min_bars: u64 },
    /// Auto-routed gaps below `archive_min_bars`, or incremental-routed gaps
    Incremental { archive_min_bars: u64 },
    /// Any open gap
    Any,
}

impl ClaimFilter {
    /// Returns true if the descriptor matches this filter.
    #[must_use]
    pub fn matches(&self, gap: &GapDescriptor) -> bool {
        match (self, gap.route) {
            (ClaimFilter::Any, _) => true,
            (ClaimFilter::Archive { .. }, GapRoute::Archive) => true,
            (ClaimFilter::Archive { min_bars }, GapRoute::Auto) => gap.bars() >= *min_bars,
            (ClaimFilter::Incremental { .. }, GapRoute::Incremental) => true,
            (ClaimFilter::Incremental { archive_min_bars }, GapRoute::Auto) => {
                gap.bars() < *archive_min_bars
            }
            _ => false,
        }
    }
}

// ============================================================================
// Ban state and lineage
// ============================================================================

/// Exchange-enforced request block for one outbound identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanState {
    /// Outbound identity (e.g., "binance_futures_um")
    pub scope: String,
    /// Requests are blocked until this instant
    pub banned_until: DateTime<Utc>,
    /// Why the ban was recorded
    pub reason: String,
    /// Consecutive bans without a successful call in between
    pub ban_count: u32,
}

impl BanState {
    pub fn new(
        scope: impl Into<String>,
        banned_until: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            banned_until,
            reason: reason.into(),
            ban_count: 1,
        }
    }

    /// Returns true if the ban is still in force at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.banned_until > now
    }
}

/// Lineage record for a unit of written rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestBatch {
    pub id: i64,
    pub source: DataSource,
    pub row_count: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
