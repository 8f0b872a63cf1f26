//! Product cross-reference reconciliation core.
//!
//! Keeps one canonical identity per product across the inventory, marketplace and
//! analytics feeds ([`ledger`]), the external SKU associations and their review
//! workflow ([`mapping`]), resilient display-name resolution ([`resolver`]) and
//! the data quality monitor ([`quality`]). Field-level value coercion lives in
//! [`normalize`]; classified retries in [`retry`].

pub mod alerts;
pub mod cancel;
pub mod config;
pub mod db;
pub mod ledger;
pub mod mapping;
pub mod models;
pub mod normalize;
pub mod placeholder;
pub mod quality;
pub mod resolver;
pub mod retry;
pub mod schema;
pub mod sync_errors;
pub mod tz;

pub use cancel::{CancelHandle, CancelToken};
pub use db::Store;
pub use ledger::{Identifiers, Ledger, SourceKind};
pub use mapping::MappingStore;
pub use quality::QualityMonitor;
pub use resolver::{NameResolver, Resolution};
pub use retry::RetryPolicy;
