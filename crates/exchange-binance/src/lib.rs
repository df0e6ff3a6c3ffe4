//! Binance USD-M futures adapters.
//!
//! This crate provides:
//! - A combined-stream WebSocket subscription for live klines
//! - A REST client for kline pages, derived futures metrics, and the symbol list
//! - A bulk archive reader for `data.binance.vision` with a local download cache
//!
//! # Example
//!
//! ```no_run
//! use marketfeed_binance::BinanceRestClient;
//! use marketfeed_core::{Interval, MarketDataRest};
//! use chrono::{Duration, Utc};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = BinanceRestClient::new()?;
//!     let end = Utc::now();
//!     let candles = client
//!         .get_klines("BTCUSDT", Interval::OneMinute, end - Duration::hours(1), end, 60)
//!         .await?;
//!     println!("Fetched {} candles", candles.len());
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod common;
pub mod parse;
pub mod rest;
pub mod websocket;

// Re-export main types
pub use archive::{archive_file, plan_files, BinanceArchive, MONTHLY_MIN_DAYS};
pub use common::{build_http_client, BINANCE_ARCHIVE, BINANCE_FUTURES_API, BINANCE_FUTURES_WS, EXCHANGE};
pub use rest::{BinanceRestClient, MAX_CANDLES_PER_REQUEST, MAX_METRICS_PER_REQUEST};
pub use websocket::{BinanceKlineStream, WebSocketConfig};
