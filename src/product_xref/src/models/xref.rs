//! Ledger rows: cross-reference records, catalog back-links, sync checkpoints.

use diesel::prelude::*;
use serde::Serialize;

use crate::models::text_enum;
use crate::schema::{catalog_link, product_xref, source_sync_checkpoint};

/// Sync state of a cross-reference record's cached attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    /// Never resolved, or demoted after going stale.
    Pending,
    /// Cached name/brand came from a successful fetch.
    Synced,
    /// The last resolution attempt failed terminally.
    Failed,
}

text_enum!(SyncStatus, "sync_status", {
    Pending => "pending",
    Synced => "synced",
    Failed => "failed",
});

/// A row in [`crate::schema::product_xref`]: one physical item.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = product_xref, check_for_backend(diesel::sqlite::Sqlite))]
pub struct XrefRecord {
    pub id: i32,
    /// Identifier in the fulfillment/inventory feed.
    pub inventory_id: Option<String>,
    /// Identifier in the marketplace catalog (e.g. an ASIN).
    pub marketplace_id: Option<String>,
    /// Identifier in the analytics feed.
    pub analytics_id: Option<String>,
    /// Seller SKU on the marketplace.
    pub marketplace_sku: Option<String>,
    /// Cached display name. May be a placeholder; see [`crate::placeholder`].
    pub name: Option<String>,
    pub brand: Option<String>,
    pub sync_status: String,
    /// RFC 3339 UTC.
    pub last_successful_sync: Option<String>,
    /// Set when this record was merged into another; such rows are never served.
    pub superseded_by: Option<i32>,
    pub created_at: String,
    pub updated_at: String,
}

impl XrefRecord {
    /// Parsed status. The CHECK constraint keeps unknown strings out of the table.
    pub fn status(&self) -> SyncStatus {
        self.sync_status.parse().unwrap_or(SyncStatus::Pending)
    }

    pub fn is_live(&self) -> bool {
        self.superseded_by.is_none()
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = product_xref)]
pub struct NewXref<'a> {
    pub inventory_id: Option<&'a str>,
    pub marketplace_id: Option<&'a str>,
    pub analytics_id: Option<&'a str>,
    pub marketplace_sku: Option<&'a str>,
    pub name: Option<&'a str>,
    pub brand: Option<&'a str>,
    pub sync_status: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Partial update: `None` fields are left untouched.
#[derive(Debug, Default, AsChangeset)]
#[diesel(table_name = product_xref)]
pub struct XrefChangeset<'a> {
    pub inventory_id: Option<&'a str>,
    pub marketplace_id: Option<&'a str>,
    pub analytics_id: Option<&'a str>,
    pub marketplace_sku: Option<&'a str>,
    pub name: Option<&'a str>,
    pub brand: Option<&'a str>,
    pub updated_at: Option<&'a str>,
}

/// A row in [`crate::schema::catalog_link`].
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize)]
#[diesel(table_name = catalog_link, check_for_backend(diesel::sqlite::Sqlite))]
pub struct CatalogLink {
    pub external_sku: String,
    pub xref_id: i32,
    pub linked_at: String,
}

/// A row in [`crate::schema::source_sync_checkpoint`].
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, AsChangeset, Serialize)]
#[diesel(table_name = source_sync_checkpoint, check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncCheckpoint {
    /// Upstream component, e.g. `inventory` or `name_cache`.
    pub component: String,
    pub last_success_at: Option<String>,
    pub last_attempt_at: String,
    /// `ok` or `failed`.
    pub last_outcome: String,
}
