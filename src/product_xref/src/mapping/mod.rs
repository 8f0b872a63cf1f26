//! SKU mapping store: external SKU -> master product associations and their
//! verification workflow.
//!
//! A mapping starts `pending`. It becomes `auto` when its confidence clears the
//! approval threshold, `manual` after review, or `rejected` by an operator at any
//! time. `rejected` is final; a re-sync through [`MappingStore::save`] refreshes the
//! match data but never touches verification columns.
//!
//! `(source, external_sku)` is unique. Near-duplicates that differ only in case or
//! surrounding whitespace get past that constraint and are reported by
//! [`MappingStore::find_duplicates`]; mappings whose `master_id` has no ledger row
//! are reported by [`MappingStore::find_orphaned`].

mod repo;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::mapping::VerificationStatus;

pub use repo::MappingStore;

/// A match decision from the entity matcher, ready to be saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSkuMapping {
    /// Existing row to update; `None` resolves by `(source, external_sku)`.
    pub id: Option<i32>,
    pub master_id: i32,
    pub external_sku: String,
    pub source: String,
    pub confidence_score: f64,
    pub match_method: String,
    pub notes: Option<String>,
}

impl NewSkuMapping {
    pub fn new(
        master_id: i32,
        external_sku: impl Into<String>,
        source: impl Into<String>,
        confidence_score: f64,
        match_method: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            master_id,
            external_sku: external_sku.into(),
            source: source.into(),
            confidence_score,
            match_method: match_method.into(),
            notes: None,
        }
    }

    pub fn with_id(mut self, id: i32) -> Self {
        self.id = Some(id);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    /// `(source, external_sku)` already exists.
    #[error("mapping conflict: {0}")]
    Conflict(String),

    #[error("confidence {0} is outside [0, 1]")]
    InvalidConfidence(f64),

    #[error("{0} must not be blank")]
    Blank(&'static str),

    #[error("mapping {0} does not exist")]
    NotFound(i32),

    #[error("mapping {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: i32,
        from: VerificationStatus,
        to: VerificationStatus,
    },

    #[error("mapping {id} confidence {confidence} is below threshold {threshold}")]
    BelowThreshold {
        id: i32,
        confidence: f64,
        threshold: f64,
    },

    #[error(transparent)]
    Database(#[from] diesel::result::Error),
}

/// Conjunctive filter for [`MappingStore::search`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub master_id: Option<i32>,
    /// Substring of `external_sku`.
    pub external_sku_contains: Option<String>,
    pub source: Option<String>,
    pub status: Option<VerificationStatus>,
    pub min_confidence: Option<f64>,
    pub max_confidence: Option<f64>,
    pub created_from: Option<DateTime<Utc>>,
    /// Exclusive.
    pub created_to: Option<DateTime<Utc>>,
}

/// Histogram buckets: high `>= 0.9`, medium `[0.7, 0.9)`, low `[0.5, 0.7)`, very low `< 0.5`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfidenceTiers {
    pub high: i64,
    pub medium: i64,
    pub low: i64,
    pub very_low: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MappingStats {
    pub total: i64,
    pub pending: i64,
    pub auto: i64,
    pub manual: i64,
    pub rejected: i64,
    /// `auto + manual` as a percentage of total.
    pub verified_pct: f64,
    pub pending_pct: f64,
    /// `None` on an empty set.
    pub avg_confidence: Option<f64>,
    pub tiers: ConfidenceTiers,
}

/// Rows sharing a normalized `(source, external_sku)` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    /// `lower(trim(source))`.
    pub source: String,
    /// `lower(trim(external_sku))`.
    pub external_sku: String,
    pub ids: Vec<i32>,
}

/// Result of [`MappingStore::bulk_approve_by_confidence`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApproveReport {
    pub candidates: usize,
    pub approved: usize,
    /// Transitions that hit a storage error; each one is in the sync error log.
    pub failed: usize,
    pub interrupted: bool,
}

pub(crate) fn check_threshold(threshold: f64) -> Result<(), MappingError> {
    if threshold.is_finite() && (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(MappingError::InvalidConfidence(threshold))
    }
}
