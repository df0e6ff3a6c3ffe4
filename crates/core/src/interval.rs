//! Bar intervals and grid alignment.
//!
//! Every stored timestamp is an interval boundary: candles are keyed by their
//! open time and metric samples by their aligned sample time. The helpers here
//! are the single source of truth for step sizes and boundary alignment.

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Weekly bars open on Monday 00:00 UTC, four days after the Unix epoch.
const WEEK_OFFSET_MS: i64 = 4 * 86_400_000;

/// Bar interval for candles and metric samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interval {
    OneMinute,
    ThreeMinutes,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FourHours,
    SixHours,
    EightHours,
    TwelveHours,
    OneDay,
    ThreeDays,
    OneWeek,
    OneMonth,
}

impl Interval {
    /// Returns the exchange string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::ThreeMinutes => "3m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::TwoHours => "2h",
            Interval::FourHours => "4h",
            Interval::SixHours => "6h",
            Interval::EightHours => "8h",
            Interval::TwelveHours => "12h",
            Interval::OneDay => "1d",
            Interval::ThreeDays => "3d",
            Interval::OneWeek => "1w",
            Interval::OneMonth => "1M",
        }
    }

    /// Returns the interval duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        match self {
            Interval::OneMinute => 60_000,
            Interval::ThreeMinutes => 180_000,
            Interval::FiveMinutes => 300_000,
            Interval::FifteenMinutes => 900_000,
            Interval::ThirtyMinutes => 1_800_000,
            Interval::OneHour => 3_600_000,
            Interval::TwoHours => 7_200_000,
            Interval::FourHours => 14_400_000,
            Interval::SixHours => 21_600_000,
            Interval::EightHours => 28_800_000,
            Interval::TwelveHours => 43_200_000,
            Interval::OneDay => 86_400_000,
            Interval::ThreeDays => 259_200_000,
            Interval::OneWeek => 604_800_000,
            Interval::OneMonth => 2_592_000_000, // ~30 days
        }
    }

    /// Returns the step as a chrono duration.
    #[must_use]
    pub fn step(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.duration_ms())
    }

    /// Returns false for calendar intervals whose length varies (1M).
    ///
    /// Gap scanning and paginated recovery only operate on fixed steps.
    #[must_use]
    pub fn is_fixed_step(&self) -> bool {
        !matches!(self, Interval::OneMonth)
    }

    /// Aligns a millisecond timestamp down to the boundary at or before it.
    #[must_use]
    pub fn align_down_ms(&self, ts_ms: i64) -> i64 {
        let step = self.duration_ms();
        match self {
            Interval::OneWeek => {
                (ts_ms - WEEK_OFFSET_MS).div_euclid(step) * step + WEEK_OFFSET_MS
            }
            _ => ts_ms.div_euclid(step) * step,
        }
    }

    /// Aligns a timestamp down to the boundary at or before it.
    #[must_use]
    pub fn align_down(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        from_millis(self.align_down_ms(ts.timestamp_millis()))
    }

    /// Aligns a timestamp to the nearest boundary (ties round up).
    #[must_use]
    pub fn align_nearest(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let ms = ts.timestamp_millis();
        let down = self.align_down_ms(ms);
        if ms - down >= self.duration_ms() / 2 {
            from_millis(down + self.duration_ms())
        } else {
            from_millis(down)
        }
    }

    /// Returns true when the timestamp sits exactly on a boundary.
    #[must_use]
    pub fn is_aligned(&self, ts: DateTime<Utc>) -> bool {
        self.align_down(ts) == ts
    }

    /// Number of boundaries in the inclusive range `[start, end]`.
    #[must_use]
    pub fn bars_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
        if end < start {
            return 0;
        }
        let span = (end - start).num_milliseconds();
        (span / self.duration_ms()) as u64 + 1
    }

    /// Open time of the most recent bar that has fully closed at `now`.
    #[must_use]
    pub fn last_closed_open_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.align_down(now) - self.step()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // "1M" is case-sensitive to distinguish month from minute
        if s == "1M" {
            return Ok(Interval::OneMonth);
        }

        match s.to_lowercase().as_str() {
            "1m" => Ok(Interval::OneMinute),
            "3m" => Ok(Interval::ThreeMinutes),
            "5m" => Ok(Interval::FiveMinutes),
            "15m" => Ok(Interval::FifteenMinutes),
            "30m" => Ok(Interval::ThirtyMinutes),
            "1h" => Ok(Interval::OneHour),
            "2h" => Ok(Interval::TwoHours),
            "4h" => Ok(Interval::FourHours),
            "6h" => Ok(Interval::SixHours),
            "8h" => Ok(Interval::EightHours),
            "12h" => Ok(Interval::TwelveHours),
            "1d" => Ok(Interval::OneDay),
            "3d" => Ok(Interval::ThreeDays),
            "1w" => Ok(Interval::OneWeek),
            _ => Err(anyhow!(
                "Invalid interval: '{}'. Valid values: 1m, 3m, 5m, 15m, 30m, 1h, 2h, 4h, 6h, 8h, 12h, 1d, 3d, 1w, 1M",
                s
            )),
        }
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Interval::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

/// Converts epoch milliseconds into a UTC timestamp, clamping unrepresentable values to the epoch.
#[must_use]
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
