//! WebSocket kline subscription for Binance USD-M futures.
//!
//! One connection carries every symbol of one interval through the combined
//! stream endpoint:
//!
//! ```text
//! wss://fstream.binance.com/stream?streams=btcusdt@kline_1m/ethusdt@kline_1m
//! ```
//!
//! Each connection is served by a spawned reader task that decodes frames
//! and forwards them over a channel; the returned [`FrameStream`] ends when
//! the connection closes or stays silent past `idle_timeout`. Reconnecting is
//! the caller's job.
//!
//! ## Kline Event
//! ```json
//! {
//!   "stream": "btcusdt@kline_1m",
//!   "data": {
//!     "e": "kline", "E": 1769774460001, "s": "BTCUSDT",
//!     "k": {"t": 1769774400000, "i": "1m", "o": "100", "c": "100.5",
//!           "h": "101", "l": "99", "v": "3", "n": 12, "x": true,
//!           "q": "301.5", "V": "1.5", "Q": "150.75"}
//!   }
//! }
//! ```

use async_trait::async_trait;
use futures_util::{stream, SinkExt, StreamExt};
use marketfeed_core::{FrameStream, IngestError, IngestResult, Interval, KlineStream, StreamFrame};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::common::{BINANCE_FUTURES_WS, EXCHANGE};
use crate::parse::parse_ws_frame;

/// Frames buffered between the reader task and the consumer.
const FRAME_CHANNEL_CAPACITY: usize = 4096;

/// Configuration for the kline WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Base URL (without `/stream`)
    pub url: String,
    /// Interval between client pings
    pub ping_interval: Duration,
    /// Hard timeout for the opening handshake
    pub connect_timeout: Duration,
    /// Maximum silence before the connection is treated as dead
    pub idle_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: BINANCE_FUTURES_WS.to_string(),
            ping_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Kline stream adapter.
pub struct BinanceKlineStream {
    config: WebSocketConfig,
}

impl BinanceKlineStream {
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// Builds the combined-stream URL for a symbol set.
    #[must_use]
    pub fn stream_url(&self, symbols: &[String], interval: Interval) -> String {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@kline_{}", s.to_lowercase(), interval.as_str()))
            .collect();
        format!(
            "{}/stream?streams={}",
            self.config.url.trim_end_matches('/'),
            streams.join("/")
        )
    }
}

/// Maps handshake failures; an HTTP 429/418 on upgrade is a rate limit.
fn classify_ws_error(error: tungstenite::Error) -> IngestError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if status == 429 || status == 418 {
                IngestError::rate_limited(status, None, "WebSocket handshake refused")
            } else if response.status().is_client_error() {
                IngestError::client(status, "WebSocket handshake rejected")
            } else {
                IngestError::transient(format!("WebSocket handshake failed: HTTP {status}"))
            }
        }
        other => IngestError::transient(format!("WebSocket error: {other}")),
    }
}

#[async_trait]
impl KlineStream for BinanceKlineStream {
    async fn subscribe(&self, symbols: &[String], interval: Interval) -> IngestResult<FrameStream> {
        if symbols.is_empty() {
            return Err(IngestError::fatal_config("No symbols to subscribe"));
        }

        let url = self.stream_url(symbols, interval);
        info!(url = %url, "Connecting to Binance kline stream");

        let (ws_stream, _response) = tokio::time::timeout(self.config.connect_timeout, connect_async(&url))
            .await
            .map_err(|_| IngestError::transient("WebSocket connect timed out"))?
            .map_err(classify_ws_error)?;

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        tokio::spawn(run_reader(ws_stream, tx, self.config.ping_interval, self.config.idle_timeout));

        let frames = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        Ok(frames.boxed())
    }

    fn exchange(&self) -> &str {
        EXCHANGE
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Reads frames until the connection ends or the consumer goes away.
async fn run_reader(
    ws_stream: WsStream,
    tx: mpsc::Sender<IngestResult<StreamFrame>>,
    ping_every: Duration,
    idle_timeout: Duration,
) {
    let (mut write, mut read) = ws_stream.split();

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    let mut ping_interval = tokio::time::interval(ping_every);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // First tick completes immediately
    ping_interval.tick().await;

    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!("Frame consumer dropped, closing WebSocket");
                let _ = write.close().await;
                return;
            }

            _ = ping_interval.tick() => {
                if let Err(e) = write.send(Message::Ping(vec![])).await {
                    warn!(error = %e, "Failed to send ping");
                    let _ = tx.send(Err(IngestError::transient(format!("Ping failed: {e}")))).await;
                    return;
                }
            }

            () = &mut idle => {
                warn!(idle_secs = idle_timeout.as_secs_f64(), "No frames received, dropping WebSocket");
                let _ = tx.send(Err(IngestError::transient("stream idle"))).await;
                return;
            }

            msg = read.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => parse_ws_frame(&text, EXCHANGE),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => parse_ws_frame(&text, EXCHANGE),
                        Err(e) => Some(StreamFrame::Malformed(format!("Non-UTF8 binary frame: {e}"))),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            let _ = tx.send(Err(IngestError::transient(format!("Pong failed: {e}")))).await;
                            return;
                        }
                        None
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => None,
                    Some(Ok(Message::Close(frame))) => {
                        info!(frame = ?frame, "Received close frame");
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "Connection closed".to_string());
                        let _ = tx.send(Err(IngestError::transient(reason))).await;
                        return;
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(classify_ws_error(e))).await;
                        return;
                    }
                    None => {
                        let _ = tx.send(Err(IngestError::transient("Stream ended"))).await;
                        return;
                    }
                };

                if let Some(frame) = frame {
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
