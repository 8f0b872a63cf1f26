//! Cross-reference ledger: one record per physical item, addressable by any of
//! its foreign identifiers.
//!
//! Lookups OR across `inventory_id`, `marketplace_id`, `analytics_id` and
//! `marketplace_sku` and return at most one live record. When one upsert names
//! identifiers held by two different records, those records are merged into the
//! oldest one (see [`merge`]); the others are kept with `superseded_by` set and
//! are never served again.
//!
//! All writes to a record happen inside `BEGIN IMMEDIATE`, so concurrent workers
//! registering the same item serialize on the SQLite write lock instead of racing
//! a read-then-insert.

mod merge;
mod repo;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    models::{text_enum, xref::XrefRecord},
    normalize::{normalize_identifier, normalize_identifier_str, normalize_text_str},
};

pub use repo::Ledger;

/// Upstream feed a product id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Inventory,
    Marketplace,
    Analytics,
}

text_enum!(SourceKind, "source_kind", {
    Inventory => "inventory",
    Marketplace => "marketplace",
    Analytics => "analytics",
});

impl SourceKind {
    /// Ledger column holding this feed's identifier.
    pub fn column(self) -> IdColumn {
        match self {
            SourceKind::Inventory => IdColumn::InventoryId,
            SourceKind::Marketplace => IdColumn::MarketplaceId,
            SourceKind::Analytics => IdColumn::AnalyticsId,
        }
    }

    /// Checkpoint component name.
    pub fn component(self) -> &'static str {
        self.as_str()
    }
}

/// Checkpoint component stamped by name-cache refreshes.
pub const NAME_CACHE_COMPONENT: &str = "name_cache";

/// One of the four identifier columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdColumn {
    InventoryId,
    MarketplaceId,
    AnalyticsId,
    MarketplaceSku,
}

impl IdColumn {
    pub const ALL: [IdColumn; 4] = [
        IdColumn::InventoryId,
        IdColumn::MarketplaceId,
        IdColumn::AnalyticsId,
        IdColumn::MarketplaceSku,
    ];

    pub fn name(self) -> &'static str {
        match self {
            IdColumn::InventoryId => "inventory_id",
            IdColumn::MarketplaceId => "marketplace_id",
            IdColumn::AnalyticsId => "analytics_id",
            IdColumn::MarketplaceSku => "marketplace_sku",
        }
    }
}

impl XrefRecord {
    pub fn identifier(&self, col: IdColumn) -> Option<&str> {
        match col {
            IdColumn::InventoryId => self.inventory_id.as_deref(),
            IdColumn::MarketplaceId => self.marketplace_id.as_deref(),
            IdColumn::AnalyticsId => self.analytics_id.as_deref(),
            IdColumn::MarketplaceSku => self.marketplace_sku.as_deref(),
        }
    }
}

/// Foreign identifiers supplied to [`Ledger::upsert`]. Absent means "not supplied".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifiers {
    pub inventory_id: Option<String>,
    pub marketplace_id: Option<String>,
    pub analytics_id: Option<String>,
    pub marketplace_sku: Option<String>,
}

impl Identifiers {
    pub fn inventory(id: impl Into<String>) -> Self {
        Self::default().with(IdColumn::InventoryId, id)
    }

    pub fn marketplace(id: impl Into<String>) -> Self {
        Self::default().with(IdColumn::MarketplaceId, id)
    }

    pub fn analytics(id: impl Into<String>) -> Self {
        Self::default().with(IdColumn::AnalyticsId, id)
    }

    pub fn sku(sku: impl Into<String>) -> Self {
        Self::default().with(IdColumn::MarketplaceSku, sku)
    }

    pub fn with(mut self, col: IdColumn, id: impl Into<String>) -> Self {
        *self.slot_mut(col) = Some(id.into());
        self
    }

    pub fn get(&self, col: IdColumn) -> Option<&str> {
        match col {
            IdColumn::InventoryId => self.inventory_id.as_deref(),
            IdColumn::MarketplaceId => self.marketplace_id.as_deref(),
            IdColumn::AnalyticsId => self.analytics_id.as_deref(),
            IdColumn::MarketplaceSku => self.marketplace_sku.as_deref(),
        }
    }

    fn slot_mut(&mut self, col: IdColumn) -> &mut Option<String> {
        match col {
            IdColumn::InventoryId => &mut self.inventory_id,
            IdColumn::MarketplaceId => &mut self.marketplace_id,
            IdColumn::AnalyticsId => &mut self.analytics_id,
            IdColumn::MarketplaceSku => &mut self.marketplace_sku,
        }
    }

    /// Trimmed copies; blanks and `"0"` become absent.
    pub fn normalized(&self) -> Self {
        let mut out = Self::default();
        for col in IdColumn::ALL {
            *out.slot_mut(col) = self.get(col).and_then(normalize_identifier_str);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        IdColumn::ALL.iter().all(|c| self.get(*c).is_none())
    }

    /// Present `(column, value)` pairs in column order.
    pub fn present(&self) -> impl Iterator<Item = (IdColumn, &str)> + '_ {
        IdColumn::ALL
            .into_iter()
            .filter_map(|c| self.get(c).map(|v| (c, v)))
    }
}

/// Display attributes supplied to [`Ledger::upsert`]. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAttributes {
    pub name: Option<String>,
    pub brand: Option<String>,
}

impl CachedAttributes {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            brand: None,
        }
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }

    pub(crate) fn normalized(&self) -> Self {
        Self {
            name: self.name.as_deref().and_then(normalize_text_str),
            brand: self.brand.as_deref().and_then(normalize_text_str),
        }
    }
}

/// One `(identifier, name?, brand?)` tuple from a source feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    /// Raw identifier; numbers and strings are both accepted.
    pub identifier: Value,
    pub name: Option<String>,
    pub brand: Option<String>,
}

impl SourceItem {
    pub fn new(identifier: impl Into<Value>) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
            brand: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn normalized_identifier(&self) -> Option<String> {
        normalize_identifier(&self.identifier)
    }
}

/// A resolved name written back into the cache by [`Ledger::update_cached_name`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameUpdate {
    pub product_id: String,
    pub name: String,
    pub brand: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A uniqueness constraint rejected the write.
    #[error("identifier conflict: {0}")]
    Conflict(String),

    #[error("no usable identifier supplied")]
    NoIdentifiers,

    #[error("cross-reference record {0} does not exist")]
    UnknownRecord(i32),

    #[error("name must not be blank")]
    BlankName,

    #[error(transparent)]
    Database(#[from] diesel::result::Error),
}

/// Result of [`Ledger::bulk_register_from_source`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegisterReport {
    pub source: Option<SourceKind>,
    /// Items looked at (bounded by `limit`).
    pub scanned: usize,
    pub created: usize,
    pub already_present: usize,
    pub skipped_invalid: usize,
    /// Rows whose insert failed; each one is in the sync error log.
    pub failed: usize,
    /// Stopped early by cancellation; every created row is still committed.
    pub interrupted: bool,
}

/// Ledger health counters over live (not superseded) records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerStats {
    pub total: i64,
    pub synced: i64,
    pub pending: i64,
    pub failed: i64,
    pub synced_pct: f64,
    pub pending_pct: f64,
    pub failed_pct: f64,
    /// Records whose cached name is present and not a placeholder.
    pub real_names: i64,
    pub real_name_pct: f64,
    pub superseded: i64,
    pub last_successful_sync: Option<String>,
}

/// `part / whole` as a percentage; zero when `whole` is zero.
pub(crate) fn pct(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}
