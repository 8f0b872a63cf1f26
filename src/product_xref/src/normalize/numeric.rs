//! Locale-tolerant number parsing.
//!
//! Feeds disagree on separators: `1,234.56`, `1.234,56`, `1 234,56` and `1234.56`
//! all mean the same price. The rules, applied after stripping spaces, apostrophes,
//! underscores and surrounding currency symbols:
//! - both `,` and `.` present: the one appearing last is the decimal separator;
//! - only `,`: a single comma followed by exactly three digits is a thousands
//!   separator (`1,234`), otherwise it is the decimal separator (`12,5`); several
//!   commas are always thousands separators;
//! - only `.`: several dots are thousands separators (`1.234.567`).
//!
//! Integral results classify as [`Number::Integer`], everything else as
//! [`Number::Decimal`].

use serde::Serialize;
use serde_json::Value;

use super::NormalizeError;

const CURRENCY: &[char] = &['$', '€', '£', '¥', '₹'];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Number {
    Integer(i64),
    Decimal(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Integer(i) => i as f64,
            Number::Decimal(d) => d,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Number::Integer(_))
    }
}

/// `Ok(None)` for null and blank strings; `Err` for anything else that is not a number.
pub fn normalize_numeric(raw: &Value) -> Result<Option<Number>, NormalizeError> {
    match raw {
        Value::Null => Ok(None),
        Value::Number(n) => from_json_number(n)
            .map(Some)
            .ok_or_else(|| NormalizeError::NotNumeric(n.to_string())),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => parse_number_str(s)
            .map(Some)
            .ok_or_else(|| NormalizeError::NotNumeric(s.clone())),
        other => Err(NormalizeError::NotNumeric(other.to_string())),
    }
}

pub(crate) fn from_json_number(n: &serde_json::Number) -> Option<Number> {
    if let Some(i) = n.as_i64() {
        return Some(Number::Integer(i));
    }
    n.as_f64().and_then(classify)
}

fn classify(f: f64) -> Option<Number> {
    if !f.is_finite() {
        return None;
    }
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Some(Number::Integer(f as i64))
    } else {
        Some(Number::Decimal(f))
    }
}

/// Parses a human-formatted number. See the module docs for separator rules.
pub fn parse_number_str(raw: &str) -> Option<Number> {
    let trimmed = raw.trim().trim_matches(|c| CURRENCY.contains(&c)).trim();
    let mut s: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\u{202f}' | '\'' | '_'))
        .collect();

    let commas = s.matches(',').count();
    let dots = s.matches('.').count();
    match (commas, dots) {
        (0, 0) => {}
        (_, 0) => {
            let after = s.rsplit(',').next().map_or(0, str::len);
            if commas == 1 && after != 3 {
                s = s.replace(',', ".");
            } else {
                s = s.replace(',', "");
            }
        }
        (0, d) if d > 1 => s = s.replace('.', ""),
        (0, _) => {}
        _ => {
            let last_comma = s.rfind(',')?;
            let last_dot = s.rfind('.')?;
            if last_comma > last_dot {
                s = s.replace('.', "").replace(',', ".");
            } else {
                s = s.replace(',', "");
            }
        }
    }

    if !s.chars().any(|c| c.is_ascii_digit())
        || !s
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
    {
        return None;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::Integer(i));
    }
    s.parse::<f64>().ok().and_then(classify)
}
