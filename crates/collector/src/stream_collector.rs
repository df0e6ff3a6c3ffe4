//! Live kline collector for one interval across the symbol universe.
//!
//! Holds one combined subscription, buffers closed bars per symbol, and
//! hands buffers to the store in the background so writes never stall frame
//! receipt. Holes observed on the wire (a reconnect or a skipped bar) become
//! gap descriptors; the collector never backfills on its own.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use marketfeed_core::{
    Candle, Dataset, FrameStream, GapDescriptor, Interval, KlineStream, StreamConfig, StreamFrame,
};
use marketfeed_data::{GapQueue, MarketStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::rate_guard::RateGuard;
use crate::types::{
    stop_requested, wait_for_stop, CollectorEvent, CollectorStats, StopSignal, StreamState,
};
use crate::SharedStore;

/// Priority of descriptors emitted by the stream; ahead of scanner finds.
pub const STREAM_GAP_PRIORITY: i32 = 10;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Stream collector settings.
#[derive(Debug, Clone)]
pub struct StreamCollectorConfig {
    pub symbols: Vec<String>,
    pub interval: Interval,
    pub flush_rows: usize,
    pub flush_window: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// 0 retries forever
    pub max_reconnect_attempts: u32,
    /// A session with no frame for this long is torn down and reconnected
    pub idle_timeout: Duration,
}

impl StreamCollectorConfig {
    #[must_use]
    pub fn new(symbols: Vec<String>, interval: Interval, config: &StreamConfig) -> Self {
        Self {
            symbols,
            interval,
            flush_rows: config.flush_rows.max(1),
            flush_window: Duration::from_millis(config.flush_window_ms.max(1)),
            initial_reconnect_delay: Duration::from_millis(config.initial_reconnect_delay_ms),
            max_reconnect_delay: Duration::from_millis(config.max_reconnect_delay_ms),
            max_reconnect_attempts: config.max_reconnect_attempts,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs.max(1)),
        }
    }
}

/// How a streaming session ended.
enum SessionEnd {
    Stopped,
    Closed(String),
}

/// Background write finished by the collector.
enum Pending {
    Flush { rows: usize, result: Result<u64> },
    Gap { result: Result<Option<GapDescriptor>> },
}

/// Streaming collector for one interval.
pub struct StreamCollector {
    stream: Arc<dyn KlineStream>,
    store: SharedStore,
    guard: Arc<RateGuard>,
    config: StreamCollectorConfig,
    event_tx: Option<mpsc::Sender<CollectorEvent>>,
    state: watch::Sender<StreamState>,
    stats: CollectorStats,
    buffers: HashMap<String, Vec<Candle>>,
    last_closed: HashMap<String, DateTime<Utc>>,
    pending: JoinSet<Pending>,
}

impl StreamCollector {
    #[must_use]
    pub fn new(
        stream: Arc<dyn KlineStream>,
        store: SharedStore,
        guard: Arc<RateGuard>,
        config: StreamCollectorConfig,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Disconnected);
        Self {
            stream,
            store,
            guard,
            config,
            event_tx: None,
            state,
            stats: CollectorStats::default(),
            buffers: HashMap::new(),
            last_closed: HashMap::new(),
            pending: JoinSet::new(),
        }
    }

    /// Sets the event channel for monitoring.
    #[must_use]
    pub fn with_event_channel(mut self, tx: mpsc::Sender<CollectorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Watches the connection state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    /// Returns a reference to the current statistics.
    #[must_use]
    pub fn stats(&self) -> &CollectorStats {
        &self.stats
    }

    /// Runs until stopped, reconnecting with exponential backoff.
    ///
    /// Buffered rows are flushed before returning.
    ///
    /// # Errors
    /// Returns an error on a fatal subscription error or when the reconnect
    /// attempt limit is reached.
    pub async fn run(mut self, mut stop: StopSignal) -> Result<CollectorStats> {
        let mut attempts = 0u32;
        let mut delay = self.config.initial_reconnect_delay;
        let mut connected_before = false;

        let outcome = loop {
            if stop_requested(&stop) {
                break Ok(());
            }

            self.set_state(StreamState::Connecting);
            self.emit_event(CollectorEvent::Reconnecting {
                source: self.source_name(),
                attempt: attempts,
            });

            tokio::select! {
                _ = wait_for_stop(&mut stop) => break Ok(()),
                _ = self.guard.wait_for_ban() => {}
            }

            let subscribed = self
                .stream
                .subscribe(&self.config.symbols, self.config.interval)
                .await;
            self.guard.observe(&subscribed).await;

            match subscribed {
                Ok(frames) => {
                    self.set_state(StreamState::Subscribed);
                    self.emit_event(CollectorEvent::Connected {
                        source: self.source_name(),
                    });
                    info!(
                        component = "stream_collector",
                        interval = %self.config.interval,
                        symbols = self.config.symbols.len(),
                        "Subscribed to kline stream"
                    );

                    if connected_before {
                        self.stats.reconnected();
                        self.enqueue_reconnect_gaps(Utc::now());
                    }
                    connected_before = true;

                    let frames_before = self.stats.frames_received;
                    match self.consume(frames, &mut stop).await {
                        SessionEnd::Stopped => break Ok(()),
                        SessionEnd::Closed(reason) => {
                            warn!(
                                component = "stream_collector",
                                interval = %self.config.interval,
                                reason = %reason,
                                "Kline stream disconnected"
                            );
                            self.emit_event(CollectorEvent::Disconnected {
                                source: self.source_name(),
                                reason,
                            });
                        }
                    }

                    if self.stats.frames_received > frames_before {
                        attempts = 0;
                        delay = self.config.initial_reconnect_delay;
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(component = "stream_collector", error = %e, "Subscription rejected");
                    break Err(anyhow!(e));
                }
                Err(e) => {
                    error!(
                        component = "stream_collector",
                        interval = %self.config.interval,
                        error = %e,
                        "Kline stream connect failed"
                    );
                    self.emit_event(CollectorEvent::Error {
                        source: self.source_name(),
                        error: e.to_string(),
                    });
                }
            }

            attempts += 1;
            if self.config.max_reconnect_attempts > 0
                && attempts >= self.config.max_reconnect_attempts
            {
                break Err(anyhow!("Max reconnect attempts reached"));
            }

            self.set_state(StreamState::Reconnecting);
            debug!(
                component = "stream_collector",
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after delay"
            );
            tokio::select! {
                _ = wait_for_stop(&mut stop) => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.config.max_reconnect_delay);
        };

        self.drain().await;
        self.set_state(StreamState::Disconnected);
        info!(
            component = "stream_collector",
            interval = %self.config.interval,
            frames = self.stats.frames_received,
            malformed = self.stats.malformed_frames,
            rows = self.stats.rows_flushed,
            reconnections = self.stats.reconnections,
            "Stream collector stopped"
        );

        outcome.map(|()| self.stats)
    }

    async fn consume(&mut self, mut frames: FrameStream, stop: &mut StopSignal) -> SessionEnd {
        let mut flush_tick = tokio::time::interval(self.config.flush_window);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        flush_tick.tick().await;
        let mut last_heartbeat = Instant::now();
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = wait_for_stop(stop) => return SessionEnd::Stopped,
                Some(joined) = self.pending.join_next(), if !self.pending.is_empty() => {
                    match joined {
                        Ok(done) => self.on_pending(done),
                        Err(e) => error!(component = "stream_collector", error = %e, "Background write panicked"),
                    }
                }
                _ = flush_tick.tick() => self.flush_all(),
                frame = frames.next() => match frame {
                    Some(Ok(StreamFrame::Bar(candle))) => {
                        last_frame = Instant::now();
                        if *self.state.borrow() != StreamState::Streaming {
                            self.set_state(StreamState::Streaming);
                        }
                        self.stats.frame_received();
                        self.on_bar(candle);
                    }
                    Some(Ok(StreamFrame::Malformed(raw))) => {
                        last_frame = Instant::now();
                        self.stats.malformed();
                        debug!(
                            component = "stream_collector",
                            frame = %raw.chars().take(120).collect::<String>(),
                            "Skipping malformed frame"
                        );
                    }
                    Some(Err(e)) => return SessionEnd::Closed(e.to_string()),
                    None => return SessionEnd::Closed("Stream ended".to_string()),
                },
                () = tokio::time::sleep_until(last_frame + self.config.idle_timeout) => {
                    return SessionEnd::Closed("stream idle".to_string());
                }
            }

            if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                self.emit_event(CollectorEvent::Heartbeat {
                    source: self.source_name(),
                    timestamp: Utc::now(),
                    records_collected: self.stats.rows_flushed,
                });
                last_heartbeat = Instant::now();
            }
        }
    }

    fn on_bar(&mut self, candle: Candle) {
        if !candle.is_closed {
            return;
        }

        let step = self.config.interval.step();
        let symbol = candle.symbol.clone();
        let open_time = candle.open_time;

        if let Some(&last) = self.last_closed.get(&symbol) {
            if open_time > last + step {
                warn!(
                    component = "stream_collector",
                    symbol = %symbol,
                    interval = %self.config.interval,
                    last = %last,
                    received = %open_time,
                    "Sequence anomaly, bars skipped"
                );
                self.enqueue_gap(&symbol, last + step, open_time - step);
            }
        }
        let latest = self
            .last_closed
            .get(&symbol)
            .map_or(open_time, |last| (*last).max(open_time));
        self.last_closed.insert(symbol.clone(), latest);

        let buffer = self.buffers.entry(symbol.clone()).or_default();
        buffer.push(candle);
        if buffer.len() >= self.config.flush_rows {
            self.flush(&symbol);
        }
    }

    /// Emits a descriptor for each symbol whose last closed bar is behind the clock.
    fn enqueue_reconnect_gaps(&mut self, now: DateTime<Utc>) {
        let expected = self.config.interval.last_closed_open_time(now);
        let step = self.config.interval.step();

        let behind: Vec<(String, DateTime<Utc>)> = self
            .last_closed
            .iter()
            .filter(|(_, last)| **last < expected)
            .map(|(symbol, last)| (symbol.clone(), *last + step))
            .collect();

        for (symbol, start) in behind {
            info!(
                component = "stream_collector",
                symbol = %symbol,
                interval = %self.config.interval,
                start = %start,
                end = %expected,
                "Suspected hole across reconnect"
            );
            self.enqueue_gap(&symbol, start, expected);
        }
    }

    fn enqueue_gap(&mut self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) {
        let gap = GapDescriptor::new(symbol, self.config.interval, Dataset::Candle, start, end)
            .with_priority(STREAM_GAP_PRIORITY);
        let store = self.store.clone();
        self.stats.gaps_emitted += 1;
        self.pending.spawn(async move {
            Pending::Gap {
                result: store.enqueue(gap).await,
            }
        });
    }

    fn flush(&mut self, symbol: &str) {
        let Some(rows) = self.buffers.get_mut(symbol).map(std::mem::take) else {
            return;
        };
        if rows.is_empty() {
            return;
        }

        let store = self.store.clone();
        let count = rows.len();
        self.pending.spawn(async move {
            let result = store.upsert_candles(&rows).await.map(|o| o.written);
            Pending::Flush {
                rows: count,
                result,
            }
        });
    }

    fn flush_all(&mut self) {
        let symbols: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(s, _)| s.clone())
            .collect();
        for symbol in symbols {
            self.flush(&symbol);
        }
    }

    fn on_pending(&mut self, done: Pending) {
        match done {
            Pending::Flush { rows, result } => match result {
                Ok(written) => {
                    self.stats.rows_flushed += rows as u64;
                    debug!(component = "stream_collector", rows, written, "Flushed stream buffer");
                }
                Err(e) => {
                    self.stats.flush_errors += 1;
                    error!(component = "stream_collector", rows, error = %e, "Stream flush failed");
                }
            },
            Pending::Gap { result } => match result {
                Ok(Some(gap)) => debug!(gap_id = gap.id, "Stream gap enqueued"),
                Ok(None) => debug!("Stream gap already covered"),
                Err(e) => error!(component = "stream_collector", error = %e, "Failed to enqueue stream gap"),
            },
        }
    }

    /// Flushes every buffer and waits for background writes.
    async fn drain(&mut self) {
        self.flush_all();
        while let Some(joined) = self.pending.join_next().await {
            match joined {
                Ok(done) => self.on_pending(done),
                Err(e) => error!(component = "stream_collector", error = %e, "Background write panicked"),
            }
        }
    }

    fn set_state(&self, state: StreamState) {
        self.state.send_replace(state);
    }

    /// Never waits on the monitor; a full or closed channel drops the event.
    fn emit_event(&mut self, event: CollectorEvent) {
        let Some(ref tx) = self.event_tx else {
            return;
        };
        if let Err(e) = tx.try_send(event) {
            self.stats.events_dropped += 1;
            debug!(component = "stream_collector", error = %e, "Dropped collector event");
        }
    }

    fn source_name(&self) -> String {
        format!("stream:{}", self.config.interval)
    }
}
