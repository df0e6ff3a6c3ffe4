//! Ingestion and gap-healing pipeline.
//!
//! This crate provides:
//! - [`RateGuard`]: shared request budget and exchange-ban tracking
//! - [`StreamCollector`]: live kline subscription with buffered writes
//! - [`GapScanner`]: dense-timestamp diffing that feeds the gap queue
//! - [`ArchiveBackfiller`] and [`IncrementalBackfiller`]: the two recovery paths
//! - [`MetricsPoller`]: periodic derived-metrics collection
//! - [`Orchestrator`]: lifecycle, startup reconciliation, and graceful drain
//!
//! # Example
//!
//! ```no_run
//! use marketfeed_collector::Orchestrator;
//! use marketfeed_core::ConfigLoader;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load()?;
//!     let (stop_tx, stop_rx) = marketfeed_collector::stop_channel();
//!     let orchestrator = Orchestrator::connect(config).await?;
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         let _ = stop_tx.send(true);
//!     });
//!     orchestrator.run(stop_rx).await
//! }
//! ```

pub mod archive_backfiller;
pub mod gap_scanner;
pub mod incremental_backfiller;
pub mod metrics_poller;
pub mod orchestrator;
pub mod rate_guard;
pub mod stream_collector;
pub mod types;

use anyhow::Result;
use marketfeed_core::{Candle, DataSource, MetricSample};
use marketfeed_data::{GapQueue, MarketStore, UpsertOutcome};
use std::sync::Arc;

pub use archive_backfiller::{ArchiveBackfiller, ArchiveBackfillerConfig};
pub use gap_scanner::{find_missing_runs, GapScanner, GapScannerConfig, ScanReport};
pub use incremental_backfiller::{IncrementalBackfiller, IncrementalBackfillerConfig};
pub use metrics_poller::{MetricsPoller, MetricsPollerConfig};
pub use orchestrator::{Adapters, Orchestrator, StatusReport};
pub use rate_guard::{FileBanStore, MemoryBanStore, RateGuard, RateGuardConfig};
pub use stream_collector::{StreamCollector, StreamCollectorConfig};
pub use types::{
    stop_channel, BackfillStats, CollectorEvent, CollectorStats, StopSignal, StreamState,
};

/// Row store and gap queue behind one handle.
pub trait Store: MarketStore + GapQueue {}

impl<T: MarketStore + GapQueue + ?Sized> Store for T {}

/// Store handle shared by every pipeline component.
pub type SharedStore = Arc<dyn Store>;

/// Writes candles under one lineage batch.
pub(crate) async fn commit_candles(
    store: &dyn Store,
    source: DataSource,
    rows: &[Candle],
) -> Result<UpsertOutcome> {
    let batch = store.begin_batch(source).await?;
    let outcome = store.upsert_candles(rows).await?;
    store.finish_batch(batch, outcome.written as i64).await?;
    Ok(outcome)
}

/// Writes metric samples under one lineage batch.
pub(crate) async fn commit_metrics(
    store: &dyn Store,
    source: DataSource,
    rows: &[MetricSample],
) -> Result<UpsertOutcome> {
    let batch = store.begin_batch(source).await?;
    let outcome = store.upsert_metrics(rows).await?;
    store.finish_batch(batch, outcome.written as i64).await?;
    Ok(outcome)
}
