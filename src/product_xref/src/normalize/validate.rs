//! Record-level normalization and validation.
//!
//! [`normalize_record`] runs each declared field of a raw JSON object through its
//! class; [`validate_record`] then checks required fields, identifier format,
//! length ceilings and numeric kind. Both return violations as data and never fail.

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{FieldClass, NormalizedValue, normalize};

/// Field name -> canonical value, in schema order.
pub type NormalizedRecord = IndexMap<String, NormalizedValue>;

const MAX_IDENTIFIER_LEN: usize = 64;

/// Declared shape of one field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldRule {
    pub name: String,
    pub class: FieldClass,
    pub required: bool,
    /// Ceiling in characters for identifiers and text.
    pub max_len: Option<usize>,
    /// Numerics only: reject fractional values.
    pub integer_only: bool,
}

impl FieldRule {
    pub fn new(name: &str, class: FieldClass) -> Self {
        Self {
            name: name.to_string(),
            class,
            required: false,
            max_len: None,
            integer_only: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn max_len(mut self, n: usize) -> Self {
        self.max_len = Some(n);
        self
    }

    pub fn integer(mut self) -> Self {
        self.integer_only = true;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordSchema {
    pub fields: Vec<FieldRule>,
    /// At least one of these must be present (e.g. any foreign identifier).
    pub require_any_of: Vec<String>,
}

impl RecordSchema {
    /// Product payload as delivered by the inventory, marketplace and analytics feeds.
    pub fn product() -> Self {
        let ids = ["inventory_id", "marketplace_id", "analytics_id", "marketplace_sku"];
        let mut fields: Vec<FieldRule> = ids
            .iter()
            .map(|n| FieldRule::new(n, FieldClass::Identifier).max_len(MAX_IDENTIFIER_LEN))
            .collect();
        fields.extend([
            FieldRule::new("name", FieldClass::Text).max_len(255),
            FieldRule::new("brand", FieldClass::Text).max_len(100),
            FieldRule::new("price", FieldClass::Numeric),
            FieldRule::new("quantity", FieldClass::Numeric).integer(),
            FieldRule::new("updated_at", FieldClass::DateTime),
            FieldRule::new("active", FieldClass::Boolean),
        ]);
        Self {
            fields,
            require_any_of: ids.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    MissingField { field: String },
    MissingIdentifier { candidates: Vec<String> },
    BadIdentifier { field: String, value: String },
    TooLong { field: String, len: usize, max: usize },
    WrongType { field: String, expected: FieldClass },
    NotInteger { field: String },
    Unparsable { field: String, reason: String },
}

/// Normalizes every field declared in `schema`; undeclared keys are dropped.
pub fn normalize_record(
    raw: &Map<String, Value>,
    schema: &RecordSchema,
) -> (NormalizedRecord, Vec<Violation>) {
    let mut record = NormalizedRecord::new();
    let mut violations = Vec::new();

    for rule in &schema.fields {
        let Some(value) = raw.get(&rule.name) else {
            continue;
        };
        match normalize(value, rule.class) {
            Ok(Some(v)) => {
                record.insert(rule.name.clone(), v);
            }
            Ok(None) => {}
            Err(e) => violations.push(Violation::Unparsable {
                field: rule.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    violations.extend(validate_record(&record, schema));
    (record, violations)
}

/// Checks an already normalized record against `schema`.
pub fn validate_record(record: &NormalizedRecord, schema: &RecordSchema) -> Vec<Violation> {
    let mut out = Vec::new();

    if !schema.require_any_of.is_empty()
        && !schema.require_any_of.iter().any(|k| record.contains_key(k))
    {
        out.push(Violation::MissingIdentifier {
            candidates: schema.require_any_of.clone(),
        });
    }

    for rule in &schema.fields {
        let Some(value) = record.get(&rule.name) else {
            if rule.required {
                out.push(Violation::MissingField {
                    field: rule.name.clone(),
                });
            }
            continue;
        };

        if !class_matches(value, rule.class) {
            out.push(Violation::WrongType {
                field: rule.name.clone(),
                expected: rule.class,
            });
            continue;
        }

        if let (Some(s), Some(max)) = (value.as_str(), rule.max_len) {
            let len = s.chars().count();
            if len > max {
                out.push(Violation::TooLong {
                    field: rule.name.clone(),
                    len,
                    max,
                });
            }
        }

        match value {
            NormalizedValue::Identifier(id) if !identifier_format_ok(id) => {
                out.push(Violation::BadIdentifier {
                    field: rule.name.clone(),
                    value: id.clone(),
                })
            }
            NormalizedValue::Decimal(_) if rule.integer_only => out.push(Violation::NotInteger {
                field: rule.name.clone(),
            }),
            _ => {}
        }
    }

    out
}

fn class_matches(value: &NormalizedValue, class: FieldClass) -> bool {
    matches!(
        (value, class),
        (NormalizedValue::Identifier(_), FieldClass::Identifier)
            | (NormalizedValue::Text(_), FieldClass::Text)
            | (NormalizedValue::Integer(_) | NormalizedValue::Decimal(_), FieldClass::Numeric)
            | (NormalizedValue::Timestamp(_), FieldClass::DateTime)
            | (NormalizedValue::Boolean(_), FieldClass::Boolean)
    )
}

/// Printable ASCII without whitespace; the separators feeds actually use.
fn identifier_format_ok(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/' | '#'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn clean_payload_has_no_violations() {
        let raw = obj(json!({
            "inventory_id": 42,
            "name": "  Acme   Rocket Skates ",
            "price": "1.299,00",
            "quantity": "12",
            "updated_at": "2024-03-10T14:30:00Z",
            "active": "yes",
            "warehouse": "ignored"
        }));
        let (rec, violations) = normalize_record(&raw, &RecordSchema::product());
        assert!(violations.is_empty(), "{violations:?}");
        assert_eq!(rec["inventory_id"], NormalizedValue::Identifier("42".into()));
        assert_eq!(rec["name"], NormalizedValue::Text("Acme Rocket Skates".into()));
        assert_eq!(rec["price"], NormalizedValue::Integer(1299));
        assert_eq!(rec["active"], NormalizedValue::Boolean(true));
        assert!(!rec.contains_key("warehouse"));
    }

    #[test]
    fn reports_every_problem_without_failing() {
        let raw = obj(json!({
            "inventory_id": "0",
            "marketplace_sku": "AB 12",
            "name": "x".repeat(300),
            "price": "twelve",
            "quantity": 2.5,
            "updated_at": "whenever"
        }));
        let (rec, violations) = normalize_record(&raw, &RecordSchema::product());

        assert!(!rec.contains_key("inventory_id"));
        assert!(!rec.contains_key("updated_at"));
        assert!(violations.contains(&Violation::Unparsable {
            field: "price".into(),
            reason: "not a number: \"twelve\"".into()
        }));
        assert!(violations.contains(&Violation::BadIdentifier {
            field: "marketplace_sku".into(),
            value: "AB 12".into()
        }));
        assert!(violations.contains(&Violation::TooLong {
            field: "name".into(),
            len: 300,
            max: 255
        }));
        assert!(violations.contains(&Violation::NotInteger {
            field: "quantity".into()
        }));
    }

    #[test]
    fn missing_identifiers_and_required_fields() {
        let mut schema = RecordSchema::product();
        schema.fields[4].required = true; // name
        let (_, violations) = normalize_record(&obj(json!({"brand": "Acme"})), &schema);
        assert!(matches!(violations[0], Violation::MissingIdentifier { .. }));
        assert!(violations.contains(&Violation::MissingField {
            field: "name".into()
        }));
    }

    #[test]
    fn wrong_type_in_prebuilt_record() {
        let mut rec = NormalizedRecord::new();
        rec.insert("inventory_id".into(), NormalizedValue::Integer(42));
        let v = validate_record(&rec, &RecordSchema::product());
        assert_eq!(
            v,
            vec![Violation::WrongType {
                field: "inventory_id".into(),
                expected: FieldClass::Identifier
            }]
        );
    }
}
