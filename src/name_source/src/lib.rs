//! Live display-name lookups against upstream product sources.
//!
//! The [`source::NameSource`] trait is the single operation the reconciliation
//! core needs from a marketplace or analytics API: given a product identifier,
//! return its display name (and brand, when known) or a typed [`errors::FetchError`]
//! telling the caller whether a retry can help.
//!
//! [`http::HttpNameSource`] is a generic JSON-over-HTTP implementation; anything
//! else (an SDK wrapper, an in-memory fixture) only has to implement the trait.

pub mod errors;
pub mod http;
pub mod source;

pub use errors::{FetchError, SourceInitError};
pub use source::{FetchedName, NameSource};
