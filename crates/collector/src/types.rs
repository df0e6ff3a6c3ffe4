//! Shared types for pipeline components.
//!
//! Monitoring events, per-component counters, the stop signal, and the
//! request weights charged against the rate guard.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Weight of one kline page request.
pub const KLINE_PAGE_WEIGHT: u32 = 2;

/// Weight of one archive file download.
pub const ARCHIVE_FILE_WEIGHT: u32 = 1;

/// Weight of one metrics fan-out (five endpoints).
pub const METRICS_WEIGHT: u32 = 5;

/// First retry delay of a failed gap descriptor.
pub const GAP_RETRY_BASE_SECS: i64 = 30;

/// Longest delay between retries of a gap descriptor.
pub const GAP_RETRY_MAX_SECS: i64 = 1800;

/// Delay before the next attempt at a descriptor that has failed `attempts` times.
#[must_use]
pub fn retry_backoff(attempts: i32) -> chrono::Duration {
    let doublings = attempts.clamp(0, 16) as u32;
    let secs = GAP_RETRY_BASE_SECS.saturating_mul(1i64 << doublings);
    chrono::Duration::seconds(secs.min(GAP_RETRY_MAX_SECS))
}

/// Receiving half of the shutdown signal; `true` means stop.
pub type StopSignal = watch::Receiver<bool>;

/// Creates a stop signal pair in the running state.
#[must_use]
pub fn stop_channel() -> (watch::Sender<bool>, StopSignal) {
    watch::channel(false)
}

/// Returns true once stop has been requested.
#[must_use]
pub fn stop_requested(stop: &StopSignal) -> bool {
    *stop.borrow()
}

/// Resolves when stop is requested or the sender is dropped.
pub async fn wait_for_stop(stop: &mut StopSignal) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Connection lifecycle of the stream collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
    Reconnecting,
}

/// Events emitted by components for monitoring.
#[derive(Debug, Clone)]
pub enum CollectorEvent {
    /// Successfully connected to data source
    Connected { source: String },
    /// Disconnected from data source
    Disconnected { source: String, reason: String },
    /// Error occurred during collection
    Error { source: String, error: String },
    /// Heartbeat for health monitoring
    Heartbeat {
        source: String,
        timestamp: DateTime<Utc>,
        records_collected: u64,
    },
    /// Reconnection attempt
    Reconnecting { source: String, attempt: u32 },
}

/// Counters for the stream collector.
#[derive(Debug, Clone, Default)]
pub struct CollectorStats {
    /// Frames decoded into bars
    pub frames_received: u64,
    /// Frames skipped because they could not be decoded
    pub malformed_frames: u64,
    /// Rows written by completed flushes
    pub rows_flushed: u64,
    /// Flushes that failed
    pub flush_errors: u64,
    /// Number of reconnections
    pub reconnections: u32,
    /// Gap descriptors emitted on reconnect or sequence anomaly
    pub gaps_emitted: u64,
    /// Monitoring events dropped because the event channel was full or closed
    pub events_dropped: u64,
    /// Time of last decoded frame
    pub last_frame_time: Option<DateTime<Utc>>,
}

impl CollectorStats {
    pub fn frame_received(&mut self) {
        self.frames_received += 1;
        self.last_frame_time = Some(Utc::now());
    }

    pub fn malformed(&mut self) {
        self.malformed_frames += 1;
    }

    pub fn reconnected(&mut self) {
        self.reconnections += 1;
    }
}

/// Counters for a backfill worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillStats {
    /// Descriptors claimed
    pub claims: u64,
    /// Descriptors resolved
    pub completed: u64,
    /// Rows written
    pub rows_written: u64,
    /// Rows that lost to higher-precedence stored rows
    pub rows_superseded: u64,
    /// REST pages or archive files processed
    pub units: u64,
    /// Sub-ranges handed to the incremental path
    pub handed_down: u64,
    /// Provider holes recorded
    pub holes: u64,
    /// Failed attempts
    pub failures: u64,
}

impl BackfillStats {
    /// Formats a summary report.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Claims: {}, Completed: {}, Rows: {} (+{} superseded), Units: {}, Handed down: {}, Holes: {}, Failures: {}",
            self.claims,
            self.completed,
            self.rows_written,
            self.rows_superseded,
            self.units,
            self.handed_down,
            self.holes,
            self.failures
        )
    }

    /// Accumulates another worker's counters.
    pub fn merge(&mut self, other: &BackfillStats) {
        self.claims += other.claims;
        self.completed += other.completed;
        self.rows_written += other.rows_written;
        self.rows_superseded += other.rows_superseded;
        self.units += other.units;
        self.handed_down += other.handed_down;
        self.holes += other.holes;
        self.failures += other.failures;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_stats_default() {
        let stats = CollectorStats::default();

        assert_eq!(stats.frames_received, 0);
        assert_eq!(stats.malformed_frames, 0);
        assert_eq!(stats.reconnections, 0);
        assert!(stats.last_frame_time.is_none());
    }

    #[test]
    fn test_collector_stats_counters() {
        let mut stats = CollectorStats::default();

        stats.frame_received();
        stats.frame_received();
        stats.malformed();
        stats.reconnected();

        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.malformed_frames, 1);
        assert_eq!(stats.reconnections, 1);
        assert!(stats.last_frame_time.is_some());
    }

    #[test]
    fn test_backfill_stats_merge_and_summary() {
        let mut total = BackfillStats::default();
        let worker = BackfillStats {
            claims: 2,
            completed: 1,
            rows_written: 1440,
            units: 1,
            ..Default::default()
        };

        total.merge(&worker);
        total.merge(&worker);

        assert_eq!(total.claims, 4);
        assert_eq!(total.rows_written, 2880);
        assert!(total.summary().starts_with("Claims: 4, Completed: 2, Rows: 2880"));
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(0), chrono::Duration::seconds(30));
        assert_eq!(retry_backoff(2), chrono::Duration::seconds(120));
        assert_eq!(retry_backoff(10), chrono::Duration::seconds(GAP_RETRY_MAX_SECS));
        assert_eq!(retry_backoff(-1), chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn test_stop_signal() {
        let (tx, mut rx) = stop_channel();
        assert!(!stop_requested(&rx));

        tx.send(true).unwrap();
        wait_for_stop(&mut rx).await;
        assert!(stop_requested(&rx));
    }

    #[tokio::test]
    async fn test_wait_for_stop_returns_when_sender_dropped() {
        let (tx, mut rx) = stop_channel();
        drop(tx);
        wait_for_stop(&mut rx).await;
    }
}
