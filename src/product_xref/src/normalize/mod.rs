//! Type normalization for values arriving from heterogeneous feeds.
//!
//! Every function here is pure. Raw values are `serde_json::Value`s because that
//! is what the feeds hand us: the same identifier may be a JSON number in one feed
//! and a string in another, prices come with locale-specific separators, and
//! timestamps come in whatever format the upstream team picked.
//!
//! Entry points:
//! - per class: [`normalize_identifier`], [`normalize_text`], [`numeric::normalize_numeric`],
//!   [`datetime::normalize_datetime`], [`normalize_bool`]
//! - by declared class: [`normalize`]
//! - comparison across representations: [`safe_eq`]
//! - whole records: [`validate::normalize_record`], [`validate::validate_record`]

pub mod datetime;
pub mod numeric;
pub mod validate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use datetime::{normalize_datetime, normalize_datetime_in};
pub use numeric::{Number, normalize_numeric};
pub use validate::{FieldRule, NormalizedRecord, RecordSchema, Violation, normalize_record, validate_record};

/// Semantic class a field is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldClass {
    Identifier,
    Text,
    Numeric,
    DateTime,
    Boolean,
}

/// Canonical typed value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NormalizedValue {
    Identifier(String),
    Text(String),
    Integer(i64),
    Decimal(f64),
    Timestamp(DateTime<Utc>),
    Boolean(bool),
}

impl NormalizedValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            NormalizedValue::Identifier(s) | NormalizedValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Number> for NormalizedValue {
    fn from(n: Number) -> Self {
        match n {
            Number::Integer(i) => NormalizedValue::Integer(i),
            Number::Decimal(d) => NormalizedValue::Decimal(d),
        }
    }
}

/// Raised only for numerics that are present but not numbers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("not a number: {0:?}")]
    NotNumeric(String),
}

/// Normalizes `raw` according to `class`.
///
/// `Ok(None)` means absent (null, blank, the `"0"` identifier, an unparsable
/// timestamp). Only numerics can fail.
pub fn normalize(raw: &Value, class: FieldClass) -> Result<Option<NormalizedValue>, NormalizeError> {
    Ok(match class {
        FieldClass::Identifier => normalize_identifier(raw).map(NormalizedValue::Identifier),
        FieldClass::Text => normalize_text(raw).map(NormalizedValue::Text),
        FieldClass::Numeric => normalize_numeric(raw)?.map(NormalizedValue::from),
        FieldClass::DateTime => normalize_datetime(raw).map(NormalizedValue::Timestamp),
        FieldClass::Boolean => Some(NormalizedValue::Boolean(normalize_bool(raw))),
    })
}

/// Trimmed, non-empty identifier. `""` and `"0"` are treated as absent.
///
/// Integral JSON numbers (including `42.0`) render without a fractional part so
/// that `42`, `42.0` and `"42"` all normalize to `"42"`. Integers keep every
/// digit, including ones past `i64::MAX`.
pub fn normalize_identifier(raw: &Value) -> Option<String> {
    let s = match raw {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) if n.is_u64() || n.is_i64() => n.to_string(),
        Value::Number(n) => match numeric::from_json_number(n) {
            Some(Number::Integer(i)) => i.to_string(),
            Some(Number::Decimal(d)) => d.to_string(),
            None => return None,
        },
        _ => return None,
    };
    valid_identifier(s)
}

/// String form of [`normalize_identifier`], for identifiers already typed as text.
pub fn normalize_identifier_str(raw: &str) -> Option<String> {
    valid_identifier(raw.trim().to_string())
}

fn valid_identifier(s: String) -> Option<String> {
    if s.is_empty() || s == "0" { None } else { Some(s) }
}

/// Trims and collapses internal whitespace runs to a single space.
pub fn normalize_text(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => normalize_text_str(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// String form of [`normalize_text`].
pub fn normalize_text_str(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() { None } else { Some(collapsed) }
}

/// Truthy tokens are `true`, `yes`, `1`, `on` (any case); non-zero numbers are true.
/// Everything else is false.
pub fn normalize_bool(raw: &Value) -> bool {
    match raw {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "1" | "on"
        ),
        _ => false,
    }
}

/// Normalizes both sides to `class` and compares. Absent or invalid on either
/// side compares unequal.
pub fn safe_eq(a: &Value, b: &Value, class: FieldClass) -> bool {
    match (normalize(a, class), normalize(b, class)) {
        (Ok(Some(x)), Ok(Some(y))) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifiers_coerce_numbers_and_reject_zero() {
        assert_eq!(normalize_identifier(&json!(" AB-12 ")), Some("AB-12".into()));
        assert_eq!(normalize_identifier(&json!(42)), Some("42".into()));
        assert_eq!(normalize_identifier(&json!(42.0)), Some("42".into()));
        assert_eq!(normalize_identifier(&json!("0")), None);
        assert_eq!(normalize_identifier(&json!(0)), None);
        assert_eq!(normalize_identifier(&json!("   ")), None);
        assert_eq!(normalize_identifier(&json!(null)), None);
        assert_eq!(normalize_identifier(&json!(true)), None);
        assert_eq!(normalize_identifier_str(" 0 "), None);
    }

    #[test]
    fn identifiers_past_i64_keep_every_digit() {
        let max = normalize_identifier(&json!(18446744073709551615u64));
        let near = normalize_identifier(&json!(18446744073709551000u64));
        assert_eq!(max.as_deref(), Some("18446744073709551615"));
        assert_eq!(near.as_deref(), Some("18446744073709551000"));
        assert_ne!(max, near);
        assert!(safe_eq(
            &json!(18446744073709551615u64),
            &json!("18446744073709551615"),
            FieldClass::Identifier
        ));
    }

    #[test]
    fn text_collapses_whitespace() {
        assert_eq!(
            normalize_text(&json!("  Acme \t Rocket\n\nSkates ")),
            Some("Acme Rocket Skates".into())
        );
        assert_eq!(normalize_text(&json!(" \n ")), None);
        assert_eq!(normalize_text(&json!(12)), Some("12".into()));
    }

    #[test]
    fn booleans_match_truthy_tokens() {
        for v in [json!(true), json!("TRUE"), json!(" yes "), json!("1"), json!("On"), json!(1), json!(2.5)] {
            assert!(normalize_bool(&v), "{v} should be true");
        }
        for v in [json!(false), json!("no"), json!("y"), json!(0), json!(null), json!("enabled"), json!([1])] {
            assert!(!normalize_bool(&v), "{v} should be false");
        }
    }

    #[test]
    fn safe_eq_crosses_representations() {
        assert!(safe_eq(&json!(42), &json!("42"), FieldClass::Identifier));
        assert!(safe_eq(&json!(" 42 "), &json!(42.0), FieldClass::Identifier));
        assert!(!safe_eq(&json!("42"), &json!("042"), FieldClass::Identifier));
        assert!(!safe_eq(&json!("0"), &json!(0), FieldClass::Identifier));
        assert!(safe_eq(&json!("1,250.00"), &json!(1250), FieldClass::Numeric));
        assert!(safe_eq(
            &json!("2024-03-10T09:30:00-05:00"),
            &json!("2024-03-10 14:30:00"),
            FieldClass::DateTime
        ));
        assert!(!safe_eq(&json!("abc"), &json!("abc"), FieldClass::Numeric));
        assert!(safe_eq(&json!("yes"), &json!(1), FieldClass::Boolean));
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn identifier_normalization_is_idempotent(raw in "\\PC{0,24}") {
            if let Some(once) = normalize_identifier(&json!(raw)) {
                let twice = normalize_identifier(&json!(once.clone()));
                prop_assert_eq!(twice, Some(once.clone()));
                prop_assert_eq!(once.trim(), once.as_str());
                prop_assert_ne!(once.as_str(), "0");
            }
        }

        #[test]
        fn integer_ids_compare_equal_across_types(n in 1i64..i64::MAX) {
            prop_assert!(safe_eq(&json!(n), &json!(n.to_string()), FieldClass::Identifier));
        }

        #[test]
        fn text_never_has_double_spaces(raw in "[ a-z\\t\\n]{0,40}") {
            if let Some(t) = normalize_text(&json!(raw)) {
                prop_assert!(!t.contains("  "));
                prop_assert_eq!(t.trim(), t.as_str());
            }
        }
    }
}
