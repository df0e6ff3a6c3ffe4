//! Periodic derived-metrics polling.
//!
//! Each cycle fans out one request per symbol under a local concurrency cap
//! that is separate from the rate guard's budget, aligns every sample to its
//! interval boundary, and upserts the results.

use anyhow::Result;
use chrono::{DateTime, Utc};
use marketfeed_core::{
    AppConfig, DataSource, IngestError, IngestResult, Interval, MarketDataRest, MetricSample,
};
use marketfeed_data::MarketStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::rate_guard::RateGuard;
use crate::types::{wait_for_stop, StopSignal, METRICS_WEIGHT};
use crate::SharedStore;

/// Metrics poller settings.
#[derive(Debug, Clone)]
pub struct MetricsPollerConfig {
    pub symbols: Vec<String>,
    pub interval: Interval,
    pub poll_interval: Duration,
    /// Symbols in flight at once
    pub concurrency: usize,
    pub request_timeout: Duration,
    /// Most recent samples requested per symbol each cycle
    pub lookback_samples: i32,
}

impl MetricsPollerConfig {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            symbols: config.universe.symbols.clone(),
            interval: config.metric_interval(),
            poll_interval: Duration::from_secs(config.metrics.poll_interval_secs.max(1)),
            concurrency: config.metrics.concurrency.max(1),
            request_timeout: Duration::from_secs(config.metrics.request_timeout_secs.max(1)),
            lookback_samples: 3,
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub symbols_ok: usize,
    pub symbols_failed: usize,
    pub samples: u64,
    pub written: u64,
}

/// Polls derived futures metrics for the symbol universe.
pub struct MetricsPoller {
    rest: Arc<dyn MarketDataRest>,
    store: SharedStore,
    guard: Arc<RateGuard>,
    config: MetricsPollerConfig,
    slots: Arc<Semaphore>,
}

impl MetricsPoller {
    #[must_use]
    pub fn new(
        rest: Arc<dyn MarketDataRest>,
        store: SharedStore,
        guard: Arc<RateGuard>,
        config: MetricsPollerConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            rest,
            store,
            guard,
            config,
            slots,
        }
    }

    /// Runs one cycle across every symbol.
    ///
    /// # Errors
    /// Returns an error only if the concurrency limiter has been closed.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollReport> {
        let step = self.config.interval.step();
        let end = now;
        let start = self.config.interval.align_down(now) - step * (self.config.lookback_samples - 1).max(0);
        let limit = self.config.lookback_samples.max(1) as usize;

        let mut tasks = JoinSet::new();
        for symbol in &self.config.symbols {
            let permit = self.slots.clone().acquire_owned().await?;
            let rest = self.rest.clone();
            let store = self.store.clone();
            let guard = self.guard.clone();
            let symbol = symbol.clone();
            let interval = self.config.interval;
            let timeout = self.config.request_timeout;

            tasks.spawn(async move {
                let _permit = permit;
                let fetched = guard
                    .execute(METRICS_WEIGHT, || {
                        fetch_with_timeout(rest.clone(), symbol.clone(), interval, start, end, limit, timeout)
                    })
                    .await;
                (symbol, persist(&*store, interval, fetched).await)
            });
        }

        let mut report = PollReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((symbol, Ok((samples, written)))) => {
                    report.symbols_ok += 1;
                    report.samples += samples;
                    report.written += written;
                    debug!(component = "metrics_poller", symbol = %symbol, samples, written, "Metrics polled");
                }
                Ok((symbol, Err(e))) => {
                    report.symbols_failed += 1;
                    warn!(component = "metrics_poller", symbol = %symbol, error = %e, "Metrics poll failed");
                }
                Err(e) => {
                    report.symbols_failed += 1;
                    error!(component = "metrics_poller", error = %e, "Metrics task panicked");
                }
            }
        }
        Ok(report)
    }

    /// Polls on every tick until stopped.
    ///
    /// # Errors
    /// Returns an error if the concurrency limiter has been closed.
    pub async fn run(self, mut stop: StopSignal) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = wait_for_stop(&mut stop) => break,
                _ = ticker.tick() => {}
            }

            let report = self.poll_once(Utc::now()).await?;
            info!(
                component = "metrics_poller",
                ok = report.symbols_ok,
                failed = report.symbols_failed,
                rows = report.written,
                "Metrics poll complete"
            );
        }

        info!(component = "metrics_poller", "Metrics poller stopped");
        Ok(())
    }
}

async fn fetch_with_timeout(
    rest: Arc<dyn MarketDataRest>,
    symbol: String,
    interval: Interval,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    limit: usize,
    timeout: Duration,
) -> IngestResult<Vec<MetricSample>> {
    match tokio::time::timeout(timeout, rest.get_metrics(&symbol, interval, start, end, limit)).await {
        Ok(result) => result,
        Err(_) => Err(IngestError::transient(format!(
            "metrics request for {symbol} timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

/// Aligns, tags, and writes fetched samples. Returns (samples, written).
async fn persist(
    store: &dyn crate::Store,
    interval: Interval,
    fetched: IngestResult<Vec<MetricSample>>,
) -> Result<(u64, u64)> {
    let samples: Vec<MetricSample> = fetched?
        .into_iter()
        .filter(|s| !s.is_empty())
        .map(|mut s| {
            s.timestamp = interval.align_nearest(s.timestamp);
            s.source = DataSource::Poll;
            s
        })
        .collect();

    if samples.is_empty() {
        return Ok((0, 0));
    }
    let outcome = store.upsert_metrics(&samples).await?;
    Ok((samples.len() as u64, outcome.written))
}
