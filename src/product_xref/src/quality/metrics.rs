//! Quality metrics, the overall score, and threshold evaluation. Pure functions.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{alerts::QualityAlert, models::logs::AlertLevel};

/// Alert thresholds. A metric strictly beyond its threshold raises an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualityThresholds {
    /// Critical above this failed percentage.
    pub failed_pct: f64,
    /// Warning above this pending percentage.
    pub pending_pct: f64,
    /// Warning below this real-name coverage percentage.
    pub real_name_pct: f64,
    /// Critical when the stalest component is older than this.
    pub staleness_hours: f64,
    /// Critical above this many sync errors in the last hour.
    pub hourly_errors: i64,
    /// Warning above this many duplicate mapping groups.
    pub duplicate_groups: i64,
    /// Warning above this many orphaned mappings.
    pub orphaned_mappings: i64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            failed_pct: 5.0,
            pending_pct: 10.0,
            real_name_pct: 80.0,
            staleness_hours: 48.0,
            hourly_errors: 10,
            duplicate_groups: 0,
            orphaned_mappings: 0,
        }
    }
}

/// Snapshot of pipeline health.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityMetrics {
    /// Live ledger records.
    pub total_records: i64,
    pub synced_pct: f64,
    pub pending_pct: f64,
    pub failed_pct: f64,
    pub real_name_pct: f64,
    /// Hours since last success per upstream component; `None` if it never succeeded.
    pub component_age_hours: IndexMap<String, Option<f64>>,
    /// Oldest known component age.
    pub stalest_hours: Option<f64>,
    pub freshness_score: f64,
    pub errors_last_hour: i64,
    pub duplicate_groups: i64,
    pub orphaned_mappings: i64,
    pub quality_score: f64,
}

/// Step function over hours since last successful sync. Unknown age scores 25.
pub fn freshness_score(age_hours: Option<f64>) -> f64 {
    match age_hours {
        Some(h) if h <= 2.0 => 100.0,
        Some(h) if h <= 6.0 => 90.0,
        Some(h) if h <= 12.0 => 75.0,
        Some(h) if h <= 24.0 => 50.0,
        _ => 25.0,
    }
}

/// `0.4*synced + 0.4*real_name + 0.2*freshness - 2*failed`, clamped to `[0, 100]`.
pub fn quality_score(synced_pct: f64, real_name_pct: f64, freshness: f64, failed_pct: f64) -> f64 {
    let raw = 0.4 * synced_pct + 0.4 * real_name_pct + 0.2 * freshness - 2.0 * failed_pct;
    if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 100.0) }
}

/// Freshness input for the score: the stalest component, or unknown when there
/// are no components or any of them never succeeded.
pub(crate) fn score_age(ages: &IndexMap<String, Option<f64>>) -> Option<f64> {
    if ages.is_empty() || ages.values().any(Option::is_none) {
        return None;
    }
    ages.values().flatten().copied().reduce(f64::max)
}

/// Alerts for every metric beyond its threshold.
///
/// Rate-based checks are skipped on an empty ledger, where every percentage is zero.
pub fn evaluate(m: &QualityMetrics, t: &QualityThresholds) -> Vec<QualityAlert> {
    let mut out = Vec::new();
    let mut push = |level, kind: &str, message: String, value: f64, threshold: f64| {
        out.push(QualityAlert {
            level,
            alert_type: kind.to_string(),
            message,
            value,
            threshold,
        })
    };

    if m.total_records > 0 {
        if m.failed_pct > t.failed_pct {
            push(
                AlertLevel::Critical,
                "failed_rate",
                format!("{:.1}% of records failed to sync (limit {:.1}%)", m.failed_pct, t.failed_pct),
                m.failed_pct,
                t.failed_pct,
            );
        }
        if m.pending_pct > t.pending_pct {
            push(
                AlertLevel::Warning,
                "pending_rate",
                format!("{:.1}% of records are pending (limit {:.1}%)", m.pending_pct, t.pending_pct),
                m.pending_pct,
                t.pending_pct,
            );
        }
        if m.real_name_pct < t.real_name_pct {
            push(
                AlertLevel::Warning,
                "real_name_coverage",
                format!(
                    "only {:.1}% of records have a real name (minimum {:.1}%)",
                    m.real_name_pct, t.real_name_pct
                ),
                m.real_name_pct,
                t.real_name_pct,
            );
        }
    }
    if let Some(age) = m.stalest_hours.filter(|a| *a > t.staleness_hours) {
        push(
            AlertLevel::Critical,
            "staleness",
            format!("oldest component sync is {age:.1}h old (limit {:.1}h)", t.staleness_hours),
            age,
            t.staleness_hours,
        );
    }
    if m.errors_last_hour > t.hourly_errors {
        push(
            AlertLevel::Critical,
            "error_rate",
            format!("{} sync errors in the last hour (limit {})", m.errors_last_hour, t.hourly_errors),
            m.errors_last_hour as f64,
            t.hourly_errors as f64,
        );
    }
    if m.duplicate_groups > t.duplicate_groups {
        push(
            AlertLevel::Warning,
            "duplicate_mappings",
            format!("{} duplicate sku mapping groups", m.duplicate_groups),
            m.duplicate_groups as f64,
            t.duplicate_groups as f64,
        );
    }
    if m.orphaned_mappings > t.orphaned_mappings {
        push(
            AlertLevel::Warning,
            "orphaned_mappings",
            format!("{} sku mappings point at no ledger record", m.orphaned_mappings),
            m.orphaned_mappings as f64,
            t.orphaned_mappings as f64,
        );
    }
    out
}
