//! Permissive timestamp parsing.
//!
//! Accepted, in order: RFC 3339, RFC 2822, `YYYY-MM-DD HH:MM:SS±ZZZZ`, naive
//! date-times (`-` or `/` separated, `T` or space, optional fraction), bare dates,
//! `YYYYMMDD`, and Unix epochs in seconds or milliseconds (strings or numbers).
//! Naive values are taken as UTC unless a zone is supplied. Anything else is
//! absent, never an error.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;

use crate::tz::{DstPolicy, from_local_naive};

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y"];

// Epoch values at or above this are milliseconds (year 5138 in seconds).
const MILLIS_CUTOFF: i64 = 100_000_000_000;

pub fn normalize_datetime(raw: &Value) -> Option<DateTime<Utc>> {
    parse_value(raw, None)
}

/// Like [`normalize_datetime`], but naive wall-clock values are interpreted in `zone`.
/// DST ambiguity resolves to the earlier instant; DST gaps shift forward.
pub fn normalize_datetime_in(raw: &Value, zone: Tz) -> Option<DateTime<Utc>> {
    parse_value(raw, Some(zone))
}

fn parse_value(raw: &Value, zone: Option<Tz>) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => parse_str(s.trim(), zone),
        Value::Number(n) => n.as_i64().and_then(from_epoch),
        _ => None,
    }
}

fn parse_str(s: &str, zone: Option<Tz>) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        if s.len() == 8 {
            if let Ok(d) = NaiveDate::parse_from_str(s, "%Y%m%d") {
                return local(d.and_hms_opt(0, 0, 0)?, zone);
            }
        }
        return s.parse::<i64>().ok().and_then(from_epoch);
    }
    for f in NAIVE_DATETIME_FORMATS {
        if let Ok(n) = NaiveDateTime::parse_from_str(s, f) {
            return local(n, zone);
        }
    }
    for f in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, f) {
            return local(d.and_hms_opt(0, 0, 0)?, zone);
        }
    }
    None
}

fn local(naive: NaiveDateTime, zone: Option<Tz>) -> Option<DateTime<Utc>> {
    match zone {
        None => Some(Utc.from_utc_datetime(&naive)),
        Some(tz) => from_local_naive(naive, tz, DstPolicy::Lenient).ok(),
    }
}

fn from_epoch(v: i64) -> Option<DateTime<Utc>> {
    if v.abs() >= MILLIS_CUTOFF {
        DateTime::from_timestamp_millis(v)
    } else {
        DateTime::from_timestamp(v, 0)
    }
}
