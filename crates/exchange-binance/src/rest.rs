//! REST adapter for Binance USD-M futures klines and derived metrics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use marketfeed_core::{
    from_millis, Candle, DataSource, IngestError, IngestResult, Interval, MarketDataRest, MetricSample,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::common::{
    build_http_client, classify_response, classify_transport, BINANCE_FUTURES_API, EXCHANGE,
};
use crate::parse::{parse_decimal_from_json, parse_rest_kline};

/// Maximum candles per request (Binance limit is 1500)
pub const MAX_CANDLES_PER_REQUEST: usize = 1500;

/// Maximum rows per futures-data request (Binance limit is 500)
pub const MAX_METRICS_PER_REQUEST: usize = 500;

/// The five futures-data endpoints merged into one [`MetricSample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricEndpoint {
    OpenInterest,
    TopPositionRatio,
    TopAccountRatio,
    GlobalAccountRatio,
    TakerVolumeRatio,
}

impl MetricEndpoint {
    const ALL: [MetricEndpoint; 5] = [
        MetricEndpoint::OpenInterest,
        MetricEndpoint::TopPositionRatio,
        MetricEndpoint::TopAccountRatio,
        MetricEndpoint::GlobalAccountRatio,
        MetricEndpoint::TakerVolumeRatio,
    ];

    fn path(&self) -> &'static str {
        match self {
            MetricEndpoint::OpenInterest => "/futures/data/openInterestHist",
            MetricEndpoint::TopPositionRatio => "/futures/data/topLongShortPositionRatio",
            MetricEndpoint::TopAccountRatio => "/futures/data/topLongShortAccountRatio",
            MetricEndpoint::GlobalAccountRatio => "/futures/data/globalLongShortAccountRatio",
            MetricEndpoint::TakerVolumeRatio => "/futures/data/takerlongshortRatio",
        }
    }

    /// Copies this endpoint's values from one response row into the sample.
    fn apply(&self, row: &serde_json::Value, sample: &mut MetricSample) {
        let field = |name: &str| row.get(name).and_then(parse_decimal_from_json);
        match self {
            MetricEndpoint::OpenInterest => {
                sample.open_interest = field("sumOpenInterest");
                sample.open_interest_value = field("sumOpenInterestValue");
            }
            MetricEndpoint::TopPositionRatio => {
                sample.top_trader_position_ratio = field("longShortRatio");
            }
            MetricEndpoint::TopAccountRatio => {
                sample.top_trader_account_ratio = field("longShortRatio");
            }
            MetricEndpoint::GlobalAccountRatio => {
                sample.global_account_ratio = field("longShortRatio");
            }
            MetricEndpoint::TakerVolumeRatio => {
                sample.taker_volume_ratio = field("buySellRatio");
            }
        }
    }
}

/// REST client for Binance USD-M futures market data.
pub struct BinanceRestClient {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceRestClient {
    /// Creates a client against the production API.
    ///
    /// # Errors
    /// Returns `FatalConfig` if the HTTP client cannot be built.
    pub fn new() -> IngestResult<Self> {
        Self::with_config(BINANCE_FUTURES_API, Duration::from_secs(30), None)
    }

    /// Creates a client with a custom base URL, timeout, and proxy.
    ///
    /// # Errors
    /// Returns `FatalConfig` if the proxy is invalid.
    pub fn with_config(base_url: &str, timeout: Duration, proxy: Option<&str>) -> IngestResult<Self> {
        Ok(Self {
            client: build_http_client(timeout, proxy)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> IngestResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(classify_transport)?;

        classify_response(response)
            .await?
            .json()
            .await
            .map_err(classify_transport)
    }

    async fn fetch_endpoint(
        &self,
        endpoint: MetricEndpoint,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> IngestResult<Vec<serde_json::Value>> {
        let query = [
            ("symbol", symbol.to_string()),
            ("period", interval.as_str().to_string()),
            ("startTime", start.timestamp_millis().to_string()),
            ("endTime", end.timestamp_millis().to_string()),
            ("limit", limit.min(MAX_METRICS_PER_REQUEST).to_string()),
        ];

        match self.get_json(endpoint.path(), &query).await? {
            serde_json::Value::Array(rows) => Ok(rows),
            other => Err(IngestError::MalformedRow(format!(
                "Expected array from {}, got {}",
                endpoint.path(),
                other
            ))),
        }
    }
}

#[async_trait]
impl MarketDataRest for BinanceRestClient {
    async fn get_klines(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> IngestResult<Vec<Candle>> {
        let query = [
            ("symbol", symbol.to_uppercase()),
            ("interval", interval.as_str().to_string()),
            ("startTime", start.timestamp_millis().to_string()),
            ("endTime", end.timestamp_millis().to_string()),
            ("limit", limit.clamp(1, MAX_CANDLES_PER_REQUEST).to_string()),
        ];

        let data = self.get_json("/fapi/v1/klines", &query).await?;
        let rows = data.as_array().ok_or_else(|| {
            IngestError::MalformedRow(format!("Expected kline array, got {data}"))
        })?;

        let now = Utc::now();
        let mut candles = Vec::with_capacity(rows.len());
        let mut malformed = 0usize;
        for row in rows {
            match row
                .as_array()
                .and_then(|kline| parse_rest_kline(kline, EXCHANGE, symbol, interval, now))
            {
                Some(candle) => candles.push(candle),
                None => malformed += 1,
            }
        }
        if malformed > 0 {
            warn!(symbol = symbol, interval = %interval, malformed, "Skipped malformed kline rows");
        }

        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }

    async fn get_metrics(
        &self,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> IngestResult<Vec<MetricSample>> {
        let symbol = symbol.to_uppercase();
        let responses = join_all(MetricEndpoint::ALL.iter().map(|endpoint| {
            self.fetch_endpoint(*endpoint, &symbol, interval, start, end, limit)
        }))
        .await;

        let mut samples: BTreeMap<DateTime<Utc>, MetricSample> = BTreeMap::new();
        let mut client_errors = Vec::new();

        for (endpoint, response) in MetricEndpoint::ALL.iter().zip(responses) {
            let rows = match response {
                Ok(rows) => rows,
                // One endpoint refusing the range leaves its columns empty
                Err(IngestError::Client { status, message }) => {
                    warn!(
                        symbol = %symbol,
                        endpoint = endpoint.path(),
                        status,
                        error = %message,
                        "Metric endpoint rejected request"
                    );
                    client_errors.push(IngestError::client(status, message));
                    continue;
                }
                Err(e) => return Err(e),
            };

            for row in &rows {
                let Some(ts) = row.get("timestamp").and_then(|v| {
                    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                }) else {
                    continue;
                };
                let timestamp = interval.align_nearest(from_millis(ts));
                let sample = samples.entry(timestamp).or_insert_with(|| {
                    MetricSample::new(EXCHANGE, &symbol, interval, timestamp, DataSource::Poll)
                });
                endpoint.apply(row, sample);
            }
        }

        if client_errors.len() == MetricEndpoint::ALL.len() {
            if let Some(err) = client_errors.pop() {
                return Err(err);
            }
        }

        debug!(symbol = %symbol, samples = samples.len(), "Fetched metrics");
        Ok(samples
            .into_values()
            .filter(|s| !s.is_empty() && s.timestamp >= start && s.timestamp <= end)
            .collect())
    }

    async fn list_symbols(&self) -> IngestResult<Vec<String>> {
        let info = self.get_json("/fapi/v1/exchangeInfo", &[]).await?;
        let symbols = info
            .get("symbols")
            .and_then(|s| s.as_array())
            .ok_or_else(|| IngestError::MalformedRow("exchangeInfo has no symbols".to_string()))?;

        Ok(symbols
            .iter()
            .filter(|s| s.get("status").and_then(|v| v.as_str()) == Some("TRADING"))
            .filter_map(|s| s.get("symbol").and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect())
    }

    fn exchange(&self) -> &str {
        EXCHANGE
    }
}
