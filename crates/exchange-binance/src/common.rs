//! Shared HTTP plumbing and response classification.

use marketfeed_core::{IngestError, IngestResult};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use std::time::Duration;

/// Exchange identifier stamped on every produced row.
pub const EXCHANGE: &str = "binance_futures_um";

/// Binance USD-M futures REST base URL
pub const BINANCE_FUTURES_API: &str = "https://fapi.binance.com";

/// Binance USD-M futures WebSocket base URL
pub const BINANCE_FUTURES_WS: &str = "wss://fstream.binance.com";

/// Public archive host
pub const BINANCE_ARCHIVE: &str = "https://data.binance.vision";

/// Builds an HTTP client with a hard timeout and an optional proxy.
///
/// # Errors
/// Returns `FatalConfig` if the proxy URL is invalid or the client cannot be built.
pub fn build_http_client(timeout: Duration, proxy: Option<&str>) -> IngestResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);

    if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| IngestError::fatal_config(format!("Invalid proxy URL: {e}")))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| IngestError::fatal_config(format!("Failed to build HTTP client: {e}")))
}

/// Maps a non-success response to the error taxonomy; passes success through.
///
/// 429 and 418 become `RateLimited`, 5xx becomes `TransientNetwork`, any
/// other status is a permanent `Client` error.
///
/// # Errors
/// Returns the classified error for any non-2xx status.
pub async fn classify_response(response: Response) -> IngestResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, retry_after, body))
}

/// Classifies a status code and body into an error.
#[must_use]
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> IngestError {
    match status.as_u16() {
        429 | 418 => IngestError::rate_limited(status.as_u16(), retry_after, body),
        code if status.is_server_error() => {
            IngestError::transient(format!("HTTP {code}: {body}"))
        }
        code => IngestError::client(code, body),
    }
}

/// Maps a transport failure. Timeouts and connection errors are retryable.
#[must_use]
pub fn classify_transport(error: reqwest::Error) -> IngestError {
    if error.is_decode() {
        IngestError::MalformedRow(format!("Failed to decode response: {error}"))
    } else {
        IngestError::transient(format!("Request failed: {error}"))
    }
}

/// Parses `Retry-After` given in whole seconds.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
