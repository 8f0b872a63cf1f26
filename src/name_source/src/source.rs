//! The name-fetch abstraction consumed by the resolver.
//!
//! The trait is async and object safe so callers can hold a registry of
//! `Arc<dyn NameSource>` keyed by which feed a product id belongs to.
//!
//! ```rust
//! # use name_source::{FetchError, FetchedName, NameSource};
//! # use async_trait::async_trait;
//! struct Fixed;
//! #[async_trait]
//! impl NameSource for Fixed {
//!     async fn fetch_name(&self, product_id: &str) -> Result<FetchedName, FetchError> {
//!         Ok(FetchedName::new(format!("Widget {product_id}")))
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::FetchError;

/// A display name as returned by an upstream source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedName {
    /// Display name, already trimmed.
    pub name: String,
    /// Brand, when the source reports one.
    pub brand: Option<String>,
}

impl FetchedName {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            brand: None,
        }
    }

    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = Some(brand.into());
        self
    }
}

#[async_trait]
pub trait NameSource: Send + Sync {
    /// Looks up the current display name of `product_id`.
    async fn fetch_name(&self, product_id: &str) -> Result<FetchedName, FetchError>;

    /// Label used in logs and persisted error context.
    fn label(&self) -> &str {
        "name_source"
    }
}
