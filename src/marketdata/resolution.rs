//! Time resolutions and bucket arithmetic.
//!
//! Every persisted bar is keyed by the start of the bucket containing it, so
//! flooring must be exact and stable: the same raw exchange timestamp must
//! always land on the same bucket start, across restarts and across callers.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

const MS_PER_SEC: i64 = 1_000;
const MS_PER_MIN: i64 = 60 * MS_PER_SEC;
const MS_PER_HOUR: i64 = 60 * MS_PER_MIN;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;
const MS_PER_WEEK: i64 = 7 * MS_PER_DAY;

/// Unix epoch (1970-01-01) fell on a Thursday; the preceding Monday is
/// 1969-12-29, three days earlier. Weekly buckets are aligned to Mondays.
const MONDAY_EPOCH_OFFSET_MS: i64 = 3 * MS_PER_DAY;

/// Supported bar widths, ordered from finest to coarsest.
///
/// All variants except [`TimeResolution::W1`] and [`TimeResolution::Mn1`]
/// have a fixed millisecond width; weeks and months are calendar-length and
/// must be stepped with [`TimeResolution::next_bucket`] rather than added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimeResolution {
    #[serde(rename = "1s")]
    S1,
    #[serde(rename = "2s")]
    S2,
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mn1,
}

impl TimeResolution {
    pub const ALL: [TimeResolution; 13] = [
        TimeResolution::S1,
        TimeResolution::S2,
        TimeResolution::M1,
        TimeResolution::M5,
        TimeResolution::M15,
        TimeResolution::H1,
        TimeResolution::H2,
        TimeResolution::H4,
        TimeResolution::H6,
        TimeResolution::H12,
        TimeResolution::D1,
        TimeResolution::W1,
        TimeResolution::Mn1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeResolution::S1 => "1s",
            TimeResolution::S2 => "2s",
            TimeResolution::M1 => "1m",
            TimeResolution::M5 => "5m",
            TimeResolution::M15 => "15m",
            TimeResolution::H1 => "1h",
            TimeResolution::H2 => "2h",
            TimeResolution::H4 => "4h",
            TimeResolution::H6 => "6h",
            TimeResolution::H12 => "12h",
            TimeResolution::D1 => "1d",
            TimeResolution::W1 => "1w",
            TimeResolution::Mn1 => "1M",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        TimeResolution::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| anyhow!("unknown time resolution: {s:?}"))
    }

    /// Fixed bucket width in milliseconds, or `None` for calendar-length
    /// resolutions (weeks and months).
    pub fn fixed_duration_ms(&self) -> Option<i64> {
        match self {
            TimeResolution::S1 => Some(MS_PER_SEC),
            TimeResolution::S2 => Some(2 * MS_PER_SEC),
            TimeResolution::M1 => Some(MS_PER_MIN),
            TimeResolution::M5 => Some(5 * MS_PER_MIN),
            TimeResolution::M15 => Some(15 * MS_PER_MIN),
            TimeResolution::H1 => Some(MS_PER_HOUR),
            TimeResolution::H2 => Some(2 * MS_PER_HOUR),
            TimeResolution::H4 => Some(4 * MS_PER_HOUR),
            TimeResolution::H6 => Some(6 * MS_PER_HOUR),
            TimeResolution::H12 => Some(12 * MS_PER_HOUR),
            TimeResolution::D1 => Some(MS_PER_DAY),
            TimeResolution::W1 | TimeResolution::Mn1 => None,
        }
    }

    /// Fixed width, or an error for callers that cannot handle
    /// calendar-length buckets.
    pub fn duration_ms(&self) -> Result<i64> {
        self.fixed_duration_ms()
            .ok_or_else(|| anyhow!("{} has no fixed duration (calendar-length bucket)", self.as_str()))
    }

    /// Floor a millisecond timestamp to the start of its containing bucket.
    ///
    /// Seconds, minutes, hours and days floor the corresponding UTC field to
    /// the nearest lower multiple of the resolution's width ("2s" floors to
    /// even seconds, "4h" to hours 0/4/8/..). Weeks floor to Monday 00:00
    /// UTC, months to the first of the month 00:00 UTC.
    pub fn bucket_start(&self, ts_ms: i64) -> i64 {
        match self {
            // UTC field flooring coincides with flooring the epoch offset for
            // every fixed-width resolution: the epoch starts at second 0,
            // minute 0, hour 0 of a UTC day.
            TimeResolution::S1
            | TimeResolution::S2
            | TimeResolution::M1
            | TimeResolution::M5
            | TimeResolution::M15
            | TimeResolution::H1
            | TimeResolution::H2
            | TimeResolution::H4
            | TimeResolution::H6
            | TimeResolution::H12
            | TimeResolution::D1 => {
                let width = match self.fixed_duration_ms() {
                    Some(w) => w,
                    None => unreachable!("fixed-width arm"),
                };
                ts_ms.div_euclid(width) * width
            }
            TimeResolution::W1 => {
                (ts_ms + MONDAY_EPOCH_OFFSET_MS).div_euclid(MS_PER_WEEK) * MS_PER_WEEK
                    - MONDAY_EPOCH_OFFSET_MS
            }
            TimeResolution::Mn1 => {
                let dt = utc_from_ms(ts_ms);
                Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
                    .single()
                    .map(|d| d.timestamp_millis())
                    .unwrap_or_else(|| panic!("invalid month floor for timestamp {ts_ms}"))
            }
        }
    }

    /// Start of the bucket immediately after the bucket containing `ts_ms`.
    ///
    /// Calendar-aware: stepping a month bucket lands on the first of the
    /// next month whatever its length.
    pub fn next_bucket(&self, ts_ms: i64) -> i64 {
        let start = self.bucket_start(ts_ms);
        match self {
            TimeResolution::Mn1 => {
                let dt = utc_from_ms(start);
                dt.checked_add_months(Months::new(1))
                    .map(|d| d.timestamp_millis())
                    .unwrap_or_else(|| panic!("month overflow stepping from {start}"))
            }
            TimeResolution::W1 => start + MS_PER_WEEK,
            _ => match self.fixed_duration_ms() {
                Some(w) => start + w,
                None => unreachable!("fixed-width arm"),
            },
        }
    }
}

impl std::fmt::Display for TimeResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn utc_from_ms(ts_ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .unwrap_or_else(|| panic!("timestamp out of range: {ts_ms}"))
}

/// Convenience for tests and config parsing: RFC3339 to epoch millis.
pub fn parse_utc_ms(s: &str) -> Result<i64> {
    let dt = DateTime::parse_from_rfc3339(s)?;
    Ok(dt.with_timezone(&Utc).timestamp_millis())
}
