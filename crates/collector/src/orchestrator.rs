//! Pipeline lifecycle.
//!
//! Startup validates the symbol universe, releases claims left by crashed
//! workers, and runs the first scan over the backfill window before any
//! component starts. Shutdown broadcasts stop, waits for in-flight writes
//! within the drain window, then aborts and logs whatever is left.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use marketfeed_binance::{BinanceArchive, BinanceKlineStream, BinanceRestClient, WebSocketConfig};
use marketfeed_core::{
    AppConfig, ArchiveSource, BanState, BanStore, GapDescriptor, IngestError, Interval, KlineStream,
    MarketDataRest,
};
use marketfeed_data::{DatabaseClient, GapQueue, MarketStore, PgBanStore, PgStore};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::archive_backfiller::{ArchiveBackfiller, ArchiveBackfillerConfig};
use crate::gap_scanner::{GapScanner, GapScannerConfig, ScanReport};
use crate::incremental_backfiller::{IncrementalBackfiller, IncrementalBackfillerConfig};
use crate::metrics_poller::{MetricsPoller, MetricsPollerConfig};
use crate::rate_guard::{FileBanStore, RateGuard, RateGuardConfig};
use crate::stream_collector::{StreamCollector, StreamCollectorConfig};
use crate::types::{
    stop_channel, stop_requested, wait_for_stop, BackfillStats, CollectorEvent, StopSignal,
    StreamState,
};
use crate::SharedStore;

/// Exchange adapters used by the pipeline.
#[derive(Clone)]
pub struct Adapters {
    pub stream: Arc<dyn KlineStream>,
    pub rest: Arc<dyn MarketDataRest>,
    pub archive: Arc<dyn ArchiveSource>,
}

/// Snapshot for the status command.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub ban: Option<BanState>,
    pub outstanding: Vec<GapDescriptor>,
    /// (symbol, interval, earliest, latest) per configured series
    pub bounds: Vec<(String, Interval, Option<(DateTime<Utc>, DateTime<Utc>)>)>,
}

/// Owns the components and their lifecycle.
pub struct Orchestrator {
    config: AppConfig,
    store: SharedStore,
    adapters: Adapters,
    guard: Arc<RateGuard>,
    event_tx: Option<mpsc::Sender<CollectorEvent>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: AppConfig, store: SharedStore, adapters: Adapters, guard: Arc<RateGuard>) -> Self {
        Self {
            config,
            store,
            adapters,
            guard,
            event_tx: None,
        }
    }

    /// Builds the production pipeline: PostgreSQL store, Binance adapters,
    /// and the configured ban store.
    ///
    /// # Errors
    /// Returns `FatalConfig` for an invalid configuration, or an error if the
    /// database cannot be reached or migrated.
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let config = config.validate()?;

        let db = DatabaseClient::new(&config.database.url, config.database.max_connections)
            .await
            .context("Failed to connect to the market data store")?;
        db.migrate().await?;
        let store = Arc::new(PgStore::new(db.pool()));

        let bans: Arc<dyn BanStore> = match &config.rate_limit.ban_state_path {
            Some(path) => Arc::new(FileBanStore::new(path.clone())),
            None => Arc::new(PgBanStore::new(db.pool())),
        };
        let guard = Arc::new(RateGuard::new(
            config.exchange.name.clone(),
            RateGuardConfig::from_config(&config.rate_limit),
            bans,
        ));

        let proxy = config.exchange.proxy.as_deref();
        let rest = BinanceRestClient::with_config(&config.exchange.rest_url, config.request_timeout(), proxy)?;
        let archive = BinanceArchive::new(
            &config.exchange.archive_url,
            &config.backfill.data_dir,
            config.request_timeout(),
            proxy,
        )?
        .with_verify_checksums(config.backfill.verify_checksums)
        .with_cache_retention_days(config.backfill.cache_retention_days);

        match archive.cleanup_cache().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Purged stale archive downloads"),
            Err(e) => warn!(error = %e, "Archive cache cleanup failed"),
        }

        let stream = BinanceKlineStream::new(WebSocketConfig {
            url: config.exchange.ws_url.clone(),
            idle_timeout: std::time::Duration::from_secs(config.stream.idle_timeout_secs.max(1)),
            ..WebSocketConfig::default()
        });

        let adapters = Adapters {
            stream: Arc::new(stream),
            rest: Arc::new(rest),
            archive: Arc::new(archive),
        };

        Ok(Self::new(config, store, adapters, guard))
    }

    /// Sets the event channel for monitoring.
    #[must_use]
    pub fn with_event_channel(mut self, tx: mpsc::Sender<CollectorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    #[must_use]
    pub fn guard(&self) -> &Arc<RateGuard> {
        &self.guard
    }

    /// Checks the configured symbols against the exchange listing.
    ///
    /// A listing that cannot be fetched is logged and skipped.
    ///
    /// # Errors
    /// Returns `FatalConfig` if a configured symbol is not listed.
    pub async fn validate_universe(&self) -> Result<()> {
        let rest = self.adapters.rest.clone();
        let listed = self
            .guard
            .execute(1, || {
                let rest = rest.clone();
                async move { rest.list_symbols().await }
            })
            .await;
        let listed = match listed {
            Ok(listed) => listed,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Could not fetch exchange symbols, skipping universe check");
                return Ok(());
            }
        };

        let unknown: Vec<&String> = self
            .config
            .universe
            .symbols
            .iter()
            .filter(|s| !listed.iter().any(|l| l.eq_ignore_ascii_case(s)))
            .collect();
        if !unknown.is_empty() {
            return Err(IngestError::fatal_config(format!(
                "symbols not listed on {}: {:?}",
                self.config.exchange.name, unknown
            ))
            .into());
        }
        Ok(())
    }

    fn scanner_config(&self) -> GapScannerConfig {
        GapScannerConfig::from_config(&self.config)
    }

    /// Runs one scan pass outside the service loop.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or written.
    pub async fn scan_once(&self, lookback_minutes: Option<i64>) -> Result<ScanReport> {
        let mut config = self.scanner_config();
        if let Some(minutes) = lookback_minutes {
            config = config.with_lookback(ChronoDuration::minutes(minutes));
        }
        GapScanner::new(self.store.clone(), config).scan_once().await
    }

    /// Reads ban state, open descriptors, and per-series bounds.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn status(&self) -> Result<StatusReport> {
        let ban = self.guard.current_ban().await;
        let outstanding = self.store.outstanding().await?;

        let mut bounds = Vec::new();
        for symbol in &self.config.universe.symbols {
            for interval in self.config.intervals() {
                let range = self
                    .store
                    .data_bounds(&self.config.exchange.name, symbol, interval)
                    .await?;
                bounds.push((symbol.clone(), interval, range));
            }
        }

        Ok(StatusReport {
            ban,
            outstanding,
            bounds,
        })
    }

    /// Enqueues one range and works both backfill paths until nothing
    /// claimable is left.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or written.
    pub async fn backfill(&self, gap: GapDescriptor, stop: StopSignal) -> Result<BackfillStats> {
        let (symbol, interval, dataset) = (gap.symbol.clone(), gap.interval, gap.dataset);
        match self.store.enqueue(gap).await? {
            Some(stored) => info!(
                gap_id = stored.id,
                symbol = %stored.symbol,
                interval = %stored.interval,
                bars = stored.bars(),
                "Backfill range enqueued"
            ),
            None => info!("Range already covered by a claimed, abandoned, or hole descriptor"),
        }

        let backfill = &self.config.backfill;
        let mut archive = ArchiveBackfiller::new(
            self.adapters.archive.clone(),
            self.store.clone(),
            self.guard.clone(),
            ArchiveBackfillerConfig::new("cli-archive", backfill),
        );
        let mut incremental = IncrementalBackfiller::new(
            self.adapters.rest.clone(),
            self.store.clone(),
            self.guard.clone(),
            IncrementalBackfillerConfig::new("cli-incremental", backfill),
        );

        while !stop_requested(&stop) {
            let archived = archive.run_once(&stop).await?;
            let fetched = incremental.run_once(&stop).await?;
            if !archived && !fetched {
                break;
            }
        }

        let remaining = self
            .store
            .outstanding()
            .await?
            .into_iter()
            .filter(|g| g.symbol == symbol && g.interval == interval && g.dataset == dataset)
            .count();
        if remaining > 0 {
            warn!(remaining, "Descriptors still open for this series (waiting on retry backoff)");
        }

        let mut total = archive.stats().clone();
        total.merge(incremental.stats());
        Ok(total)
    }

    /// Starts every component and runs until `stop` fires or a component fails.
    ///
    /// # Errors
    /// Returns `FatalConfig` for an invalid universe, or the first component
    /// failure after the drain completes.
    pub async fn run(self, mut stop: StopSignal) -> Result<()> {
        self.validate_universe().await?;

        let released = self.store.release_expired_claims(Utc::now()).await?;
        if released > 0 {
            info!(released, "Released expired claims from a previous run");
        }

        let mut scanner = GapScanner::new(self.store.clone(), self.scanner_config());
        let report = scanner.scan_once().await.context("Startup scan failed")?;
        info!(
            enqueued = report.enqueued.len(),
            suppressed = report.suppressed,
            "Startup reconciliation complete"
        );

        let (internal_tx, internal_rx) = stop_channel();
        let (trigger_tx, trigger_rx) = mpsc::channel::<()>(8);
        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();

        if self.config.stream.enabled {
            for interval in self.config.intervals() {
                let config = StreamCollectorConfig::new(
                    self.config.universe.symbols.clone(),
                    interval,
                    &self.config.stream,
                );
                let mut collector = StreamCollector::new(
                    self.adapters.stream.clone(),
                    self.store.clone(),
                    self.guard.clone(),
                    config,
                );
                if let Some(tx) = &self.event_tx {
                    collector = collector.with_event_channel(tx.clone());
                }

                tasks.spawn(scan_on_reconnect(collector.state(), trigger_tx.clone(), internal_rx.clone()));

                let component_stop = internal_rx.clone();
                tasks.spawn(async move {
                    let name = format!("stream:{interval}");
                    (name, collector.run(component_stop).await.map(|_| ()))
                });
            }
        }

        let component_stop = internal_rx.clone();
        tasks.spawn(async move { ("gap_scanner".to_string(), scanner.run(trigger_rx, component_stop).await) });

        for n in 0..self.config.backfill.archive_workers {
            let worker = ArchiveBackfiller::new(
                self.adapters.archive.clone(),
                self.store.clone(),
                self.guard.clone(),
                ArchiveBackfillerConfig::new(format!("archive-{n}"), &self.config.backfill),
            );
            let component_stop = internal_rx.clone();
            tasks.spawn(async move { (format!("archive-{n}"), worker.run(component_stop).await.map(|_| ())) });
        }

        for n in 0..self.config.backfill.incremental_workers {
            let worker = IncrementalBackfiller::new(
                self.adapters.rest.clone(),
                self.store.clone(),
                self.guard.clone(),
                IncrementalBackfillerConfig::new(format!("incremental-{n}"), &self.config.backfill),
            );
            let component_stop = internal_rx.clone();
            tasks.spawn(async move { (format!("incremental-{n}"), worker.run(component_stop).await.map(|_| ())) });
        }

        if self.config.metrics.enabled {
            let poller = MetricsPoller::new(
                self.adapters.rest.clone(),
                self.store.clone(),
                self.guard.clone(),
                MetricsPollerConfig::from_config(&self.config),
            );
            let component_stop = internal_rx.clone();
            tasks.spawn(async move { ("metrics_poller".to_string(), poller.run(component_stop).await) });
        }
        drop(trigger_tx);

        info!(components = tasks.len(), "Pipeline started");

        let mut failure: Option<anyhow::Error> = None;
        loop {
            tokio::select! {
                _ = wait_for_stop(&mut stop) => {
                    info!("Stop requested, draining");
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((name, Err(e)))) => {
                        error!(component = %name, error = %e, "Component failed, shutting down");
                        failure = Some(e.context(format!("{name} failed")));
                        break;
                    }
                    Some(Ok((name, Ok(())))) => info!(component = %name, "Component finished"),
                    Some(Err(e)) => {
                        error!(error = %e, "Component task panicked, shutting down");
                        failure = Some(anyhow::anyhow!("component task panicked: {e}"));
                        break;
                    }
                    None => break,
                },
            }
        }

        let _ = internal_tx.send(true);
        self.drain(tasks).await;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn drain(&self, mut tasks: JoinSet<(String, Result<()>)>) {
        let window = self.config.drain_window();
        let drained = tokio::time::timeout(window, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => info!(component = %name, "Component stopped"),
                    Ok((name, Err(e))) => warn!(component = %name, error = %e, "Component stopped with error"),
                    Err(e) => warn!(error = %e, "Component task ended abnormally"),
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                still_running = tasks.len(),
                drain_secs = window.as_secs(),
                "Drain window elapsed, aborting remaining components"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        match self.store.outstanding().await {
            Ok(open) if !open.is_empty() => {
                info!(open = open.len(), "Gap descriptors left open for the next run");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not list outstanding descriptors at shutdown"),
        }
        info!("Pipeline stopped");
    }
}

/// Triggers a scan whenever a stream comes back after a reconnect.
async fn scan_on_reconnect(
    mut state: watch::Receiver<StreamState>,
    trigger: mpsc::Sender<()>,
    mut stop: StopSignal,
) -> (String, Result<()>) {
    let mut was_reconnecting = false;
    loop {
        tokio::select! {
            _ = wait_for_stop(&mut stop) => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                match current {
                    StreamState::Reconnecting => was_reconnecting = true,
                    StreamState::Streaming if was_reconnecting => {
                        was_reconnecting = false;
                        let _ = trigger.try_send(());
                    }
                    _ => {}
                }
            }
        }
    }
    ("scan_trigger".to_string(), Ok(()))
}
