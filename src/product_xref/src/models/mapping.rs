//! SKU mapping rows and the verification state machine.

use diesel::prelude::*;
use serde::Serialize;

use crate::models::text_enum;
use crate::schema::sku_mapping;

/// Trust level of an external SKU -> master association.
///
/// `Pending` is the only non-terminal state. `Rejected` is reachable from any
/// state but never left again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationStatus {
    Pending,
    /// Approved by confidence threshold.
    Auto,
    /// Approved by a reviewer.
    Manual,
    Rejected,
}

text_enum!(VerificationStatus, "verification_status", {
    Pending => "pending",
    Auto => "auto",
    Manual => "manual",
    Rejected => "rejected",
});

impl VerificationStatus {
    /// Legal transitions out of `self`.
    pub fn can_transition_to(self, next: VerificationStatus) -> bool {
        use VerificationStatus::*;
        match (self, next) {
            (Rejected, _) => false,
            (_, Rejected) => true,
            (Pending, Auto | Manual) => true,
            _ => false,
        }
    }

    /// Auto and manual approvals.
    pub fn is_verified(self) -> bool {
        matches!(self, VerificationStatus::Auto | VerificationStatus::Manual)
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = sku_mapping, check_for_backend(diesel::sqlite::Sqlite))]
pub struct SkuMapping {
    pub id: i32,
    /// Joins to `product_xref.id`.
    pub master_id: i32,
    pub external_sku: String,
    pub source: String,
    /// In `[0, 1]`.
    pub confidence_score: f64,
    pub verification_status: String,
    pub match_method: String,
    pub verified_by: Option<String>,
    pub verified_at: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl SkuMapping {
    pub fn status(&self) -> VerificationStatus {
        self.verification_status
            .parse()
            .unwrap_or(VerificationStatus::Pending)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sku_mapping)]
pub struct NewSkuMappingRow<'a> {
    pub master_id: i32,
    pub external_sku: &'a str,
    pub source: &'a str,
    pub confidence_score: f64,
    pub verification_status: &'a str,
    pub match_method: &'a str,
    pub notes: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Fields a re-sync may overwrite; verification columns are never among them.
#[derive(Debug, AsChangeset)]
#[diesel(table_name = sku_mapping)]
pub struct SkuMappingSync<'a> {
    pub master_id: i32,
    pub confidence_score: f64,
    pub match_method: &'a str,
    pub notes: Option<&'a str>,
    pub updated_at: &'a str,
}
