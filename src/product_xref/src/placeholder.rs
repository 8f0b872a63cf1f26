//! Placeholder display names.
//!
//! When no real name can be cached or fetched, the resolver synthesizes one with
//! [`placeholder_name`]. Feeds also ship their own stand-ins ("Unknown Product",
//! "Product 12345", a bare id). [`is_placeholder`] recognizes both kinds so that a
//! stand-in is never served or counted as a real, synced name.

/// Marker embedded in every synthesized name.
pub const NEEDS_REFRESH_MARKER: &str = "[needs refresh]";

const STAND_INS: &[&str] = &[
    "unknown",
    "unknown product",
    "unnamed",
    "unnamed product",
    "untitled",
    "no name",
    "n/a",
    "na",
    "none",
    "null",
    "tbd",
    "-",
];

const ID_PREFIXES: &[&str] = &["product", "item", "sku", "asin"];

/// Synthesized name for `product_id`, e.g. `Product 42 [needs refresh]`.
pub fn placeholder_name(product_id: &str) -> String {
    format!("Product {} {NEEDS_REFRESH_MARKER}", product_id.trim())
}

/// `true` for blank names, the refresh marker, known stand-ins, all-digit ids
/// and `<prefix> <id>` shapes such as `Product #12345` or `Item 0042`.
///
/// Single-word model names with digits (`PS5`, `G502`) are real names.
pub fn is_placeholder(name: &str) -> bool {
    let lowered = name.trim().to_lowercase();
    if lowered.is_empty() || lowered.contains(NEEDS_REFRESH_MARKER) {
        return true;
    }
    if STAND_INS.contains(&lowered.as_str()) {
        return true;
    }
    if lowered.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }

    let mut words = lowered.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some(prefix), Some(id), None) if ID_PREFIXES.contains(&prefix) => {
            let id = id.trim_start_matches('#');
            !id.is_empty() && looks_like_id(id) && id.chars().any(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

fn looks_like_id(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}
