//! Timestamp helpers.
//!
//! All database columns hold RFC 3339 UTC strings with millisecond precision, so
//! lexical comparison in SQL matches chronological order. Local times are only
//! accepted at the edges (feeds that report naive wall-clock values) and are
//! resolved through an IANA zone with an explicit [`DstPolicy`].

use anyhow::{Context, anyhow};
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;

/// Canonical storage format: `2024-03-10T14:30:00.000Z`.
pub fn to_rfc3339_millis(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in storage format.
pub fn now_string() -> String {
    to_rfc3339_millis(Utc::now())
}

/// RFC 3339 with offset -> UTC.
///
/// Example: `"2024-03-10T09:30:00-05:00"` -> `2024-03-10T14:30:00Z`
pub fn parse_ts_to_utc(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(s).with_context(|| format!("bad rfc3339: {s}"))?;
    Ok(dt.with_timezone(&Utc))
}

/// Whole hours elapsed between a stored timestamp and `now`, as a fraction.
///
/// Returns `None` when `stored` does not parse.
pub fn hours_since(stored: &str, now: DateTime<Utc>) -> Option<f64> {
    let then = parse_ts_to_utc(stored).ok()?;
    Some((now - then).num_seconds() as f64 / 3600.0)
}

/// How to resolve wall-clock times that DST makes ambiguous or nonexistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstPolicy {
    /// Error on either case.
    Strict,
    /// Ambiguous (fall-back): earlier instant. Nonexistent (spring-forward): shift
    /// forward minute by minute, at most two hours.
    Lenient,
}

/// Converts a naive local timestamp in `tz` to UTC.
pub fn from_local_naive(
    naive: NaiveDateTime,
    tz: Tz,
    policy: DstPolicy,
) -> anyhow::Result<DateTime<Utc>> {
    use chrono::offset::LocalResult::*;
    match (tz.from_local_datetime(&naive), policy) {
        (Single(dt), _) => Ok(dt.with_timezone(&Utc)),
        (Ambiguous(earliest, _), DstPolicy::Lenient) => Ok(earliest.with_timezone(&Utc)),
        (Ambiguous(..), DstPolicy::Strict) => Err(anyhow!("ambiguous local time {naive} in {tz}")),
        (None, DstPolicy::Lenient) => {
            for step in 1..=120 {
                if let Single(dt) = tz.from_local_datetime(&(naive + Duration::minutes(step))) {
                    return Ok(dt.with_timezone(&Utc));
                }
            }
            Err(anyhow!("nonexistent local time {naive} in {tz}"))
        }
        (None, DstPolicy::Strict) => Err(anyhow!("nonexistent local time {naive} in {tz}")),
    }
}
