//! Error taxonomy for the ingestion pipeline.
//!
//! Adapters classify every failure into one of these variants so that the
//! rate guard and the backfill workers can decide between retrying, backing
//! off, handing work down, or giving up.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by exchange adapters and pipeline components.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Connection, timeout, or 5xx failure. Retried with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The exchange refused the request because of rate limits or an IP ban.
    #[error("rate limited (HTTP {status}): {message}")]
    RateLimited {
        /// HTTP status code (429 or 418).
        status: u16,
        /// Parsed `Retry-After` header, if present.
        retry_after: Option<Duration>,
        /// Response body, which may carry the ban expiry.
        message: String,
    },

    /// The provider has no data for a range it should cover.
    #[error("provider data hole for {symbol} {interval}: {start} .. {end}")]
    ProviderDataHole {
        /// Symbol with the hole.
        symbol: String,
        /// Interval string.
        interval: String,
        /// First missing open time.
        start: DateTime<Utc>,
        /// Last missing open time.
        end: DateTime<Utc>,
    },

    /// A row or frame could not be parsed.
    #[error("malformed row: {0}")]
    MalformedRow(String),

    /// A write lost to a higher-precedence row. Never fatal.
    #[error("storage conflict: {0}")]
    StorageConflict(String),

    /// Invalid configuration, credentials, or symbol universe.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    /// Permanent client error such as an unknown symbol. Never retried.
    #[error("client error (HTTP {status}): {message}")]
    Client {
        /// HTTP status code.
        status: u16,
        /// Error message from the exchange.
        message: String,
    },

    /// The archive file has not been published.
    #[error("archive not available: {0}")]
    ArchiveUnavailable(String),

    /// The archive file failed integrity or parsing checks.
    #[error("corrupt archive {file}: {reason}")]
    CorruptArchive {
        /// File name.
        file: String,
        /// What failed.
        reason: String,
    },

    /// The store could not be reached.
    #[error("storage error: {0}")]
    Storage(String),
}

impl IngestError {
    /// Creates a transient network error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientNetwork(message.into())
    }

    /// Creates a rate limit error.
    pub fn rate_limited(status: u16, retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        Self::RateLimited {
            status,
            retry_after,
            message: message.into(),
        }
    }

    /// Creates a permanent client error.
    pub fn client(status: u16, message: impl Into<String>) -> Self {
        Self::Client {
            status,
            message: message.into(),
        }
    }

    /// Creates a corrupt archive error.
    pub fn corrupt(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptArchive {
            file: file.into(),
            reason: reason.into(),
        }
    }

    /// Creates a fatal configuration error.
    pub fn fatal_config(message: impl Into<String>) -> Self {
        Self::FatalConfig(message.into())
    }

    /// Returns true when repeating the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::RateLimited { .. } | Self::Storage(_)
        )
    }

    /// Returns true when the process cannot continue.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalConfig(_))
    }
}

/// Result alias for adapter calls.
pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(IngestError::transient("timeout").is_retryable());
        assert!(IngestError::rate_limited(429, None, "slow down").is_retryable());
        assert!(!IngestError::client(400, "Invalid symbol.").is_retryable());
        assert!(!IngestError::MalformedRow("bad".to_string()).is_retryable());
        assert!(!IngestError::corrupt("a.zip", "checksum").is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(IngestError::fatal_config("no symbols").is_fatal());
        assert!(!IngestError::transient("reset").is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = IngestError::rate_limited(418, Some(Duration::from_secs(120)), "banned");
        assert_eq!(err.to_string(), "rate limited (HTTP 418): banned");

        let err = IngestError::client(400, "Invalid symbol.");
        assert_eq!(err.to_string(), "client error (HTTP 400): Invalid symbol.");
    }
}
