//! Normalization of Binance payloads into canonical rows.
//!
//! Three shapes arrive from Binance: REST kline arrays, WebSocket kline
//! events, and archive CSV rows. All of them end up as [`Candle`] or
//! [`MetricSample`] here so nothing downstream sees vendor field names.

use chrono::{DateTime, NaiveDateTime, Utc};
use marketfeed_core::{from_millis, Candle, DataSource, Interval, MetricSample, StreamFrame};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

/// Parses a Decimal from a JSON value (handles both string and number formats).
pub fn parse_decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => Decimal::from_str(s).ok(),
        serde_json::Value::Number(n) => {
            // Convert number to string first to preserve precision
            Decimal::from_str(&n.to_string()).ok()
        }
        _ => None,
    }
}

fn parse_decimal_field(s: &str) -> Option<Decimal> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

/// Parses a single kline from the REST API response.
///
/// Binance kline format:
/// ```text
/// [
///   1499040000000,      // 0: Open time
///   "0.01634000",       // 1: Open
///   "0.80000000",       // 2: High
///   "0.01575800",       // 3: Low
///   "0.01577100",       // 4: Close
///   "148976.11427815",  // 5: Volume
///   1499644799999,      // 6: Close time
///   "2434.19055334",    // 7: Quote asset volume
///   308,                // 8: Number of trades
///   "1756.87402397",    // 9: Taker buy base asset volume
///   "28.46694368",      // 10: Taker buy quote asset volume
///   "17928899.62484339" // 11: Ignore
/// ]
/// ```
///
/// The bar counts as closed once its full step has elapsed at `now`.
pub fn parse_rest_kline(
    kline: &[serde_json::Value],
    exchange: &str,
    symbol: &str,
    interval: Interval,
    now: DateTime<Utc>,
) -> Option<Candle> {
    if kline.len() < 6 {
        return None;
    }

    let open_time = from_millis(kline[0].as_i64()?);
    let mut candle = Candle::new(
        exchange,
        symbol,
        interval,
        open_time,
        parse_decimal_from_json(&kline[1])?,
        parse_decimal_from_json(&kline[2])?,
        parse_decimal_from_json(&kline[3])?,
        parse_decimal_from_json(&kline[4])?,
        parse_decimal_from_json(&kline[5])?,
        DataSource::IncrementalRest,
    )
    .with_closed(open_time + interval.step() <= now);

    candle.quote_volume = kline.get(7).and_then(parse_decimal_from_json);
    candle.trade_count = kline.get(8).and_then(serde_json::Value::as_i64);
    candle.taker_buy_volume = kline.get(9).and_then(parse_decimal_from_json);
    candle.taker_buy_quote_volume = kline.get(10).and_then(parse_decimal_from_json);

    Some(candle)
}

/// Parses one kline row from an archive CSV.
///
/// Returns None for header rows and rows with fewer than six columns.
pub fn parse_kline_csv(
    record: &csv::StringRecord,
    exchange: &str,
    symbol: &str,
    interval: Interval,
) -> Option<Candle> {
    if record.len() < 6 {
        return None;
    }

    let open_ms = record.get(0)?.trim().parse::<i64>().ok()?;
    let field = |i: usize| record.get(i).and_then(parse_decimal_field);

    let mut candle = Candle::new(
        exchange,
        symbol,
        interval,
        from_millis(open_ms),
        field(1)?,
        field(2)?,
        field(3)?,
        field(4)?,
        field(5)?,
        DataSource::Archive,
    );
    candle.quote_volume = field(7);
    candle.trade_count = record.get(8).and_then(|s| s.trim().parse::<i64>().ok());
    candle.taker_buy_volume = field(9);
    candle.taker_buy_quote_volume = field(10);

    Some(candle)
}

/// Returns true if a CSV row looks like a header rather than a malformed row.
pub fn is_header(record: &csv::StringRecord) -> bool {
    record
        .get(0)
        .map(|first| first.trim().chars().next().map_or(false, char::is_alphabetic))
        .unwrap_or(false)
}

/// Parses a metrics CSV timestamp given as epoch millis or an ISO datetime.
pub fn parse_metric_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ms) = value.parse::<i64>() {
        return Some(from_millis(ms));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parses one row of the daily metrics archive.
///
/// ```text
/// create_time, symbol, sum_open_interest, sum_open_interest_value,
/// sum_toptrader_long_short_ratio, count_toptrader_long_short_ratio,
/// count_long_short_ratio, sum_taker_long_short_vol_ratio
/// ```
pub fn parse_metrics_csv(
    record: &csv::StringRecord,
    exchange: &str,
    symbol: &str,
    interval: Interval,
) -> Option<MetricSample> {
    if record.len() < 4 {
        return None;
    }

    let timestamp = interval.align_down(parse_metric_time(record.get(0)?)?);
    let field = |i: usize| record.get(i).and_then(parse_decimal_field);

    let mut sample = MetricSample::new(exchange, symbol, interval, timestamp, DataSource::Archive);
    sample.open_interest = field(2);
    sample.open_interest_value = field(3);
    sample.top_trader_position_ratio = field(4);
    sample.top_trader_account_ratio = field(5);
    sample.global_account_ratio = field(6);
    sample.taker_volume_ratio = field(7);

    Some(sample)
}

// ============================================================================
// WebSocket frames
// ============================================================================

/// Combined-stream envelope: `{"stream": "btcusdt@kline_1m", "data": {...}}`.
#[derive(Debug, Deserialize)]
struct CombinedFrame {
    #[allow(dead_code)]
    stream: String,
    data: KlineEvent,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "q", default)]
    quote_volume: Option<String>,
    #[serde(rename = "n", default)]
    trade_count: Option<i64>,
    #[serde(rename = "V", default)]
    taker_buy_volume: Option<String>,
    #[serde(rename = "Q", default)]
    taker_buy_quote_volume: Option<String>,
    #[serde(rename = "x")]
    is_closed: bool,
}

/// Decodes one WebSocket text frame.
///
/// Returns None for control replies such as `{"result":null,"id":1}`.
pub fn parse_ws_frame(text: &str, exchange: &str) -> Option<StreamFrame> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Some(StreamFrame::Malformed(text.to_string())),
    };

    if value.get("result").is_some() && value.get("id").is_some() {
        return None;
    }

    let event = if value.get("data").is_some() {
        serde_json::from_value::<CombinedFrame>(value).map(|f| f.data)
    } else {
        serde_json::from_value::<KlineEvent>(value)
    };

    match event.ok().and_then(|e| kline_event_to_candle(e, exchange)) {
        Some(candle) => Some(StreamFrame::Bar(candle)),
        None => Some(StreamFrame::Malformed(text.to_string())),
    }
}

fn kline_event_to_candle(event: KlineEvent, exchange: &str) -> Option<Candle> {
    if event.event_type != "kline" {
        return None;
    }
    let k = event.kline;
    let interval = Interval::from_str(&k.interval).ok()?;

    let mut candle = Candle::new(
        exchange,
        event.symbol,
        interval,
        from_millis(k.open_time),
        parse_decimal_field(&k.open)?,
        parse_decimal_field(&k.high)?,
        parse_decimal_field(&k.low)?,
        parse_decimal_field(&k.close)?,
        parse_decimal_field(&k.volume)?,
        DataSource::Stream,
    )
    .with_closed(k.is_closed);
    candle.quote_volume = k.quote_volume.as_deref().and_then(parse_decimal_field);
    candle.trade_count = k.trade_count;
    candle.taker_buy_volume = k.taker_buy_volume.as_deref().and_then(parse_decimal_field);
    candle.taker_buy_quote_volume = k.taker_buy_quote_volume.as_deref().and_then(parse_decimal_field);

    Some(candle)
}
