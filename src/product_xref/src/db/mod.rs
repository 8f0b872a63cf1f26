//! Database utilities for connections, schema migrations and the shared store handle.
//!
//! This module provides:
//! - SQLite connection helpers: [`connection::connect_sqlite`] applies WAL, foreign_keys=ON,
//!   and a 5000ms busy_timeout.
//! - Embedded Diesel migrations: [`migrate::run_sqlite`] brings a database file up to date.
//!   It is idempotent and is the only place tables are created.
//! - [`Store`]: a cloneable handle that runs migrations once at startup and hands
//!   every worker its own connection.
//!
//! Example:
//! ```no_run
//! use product_xref::db::Store;
//!
//! let db_path = std::env::temp_dir().join("product_xref_example.db");
//! let store = Store::open(db_path.to_str().unwrap()).expect("migrations");
//! let _conn = store.connect().expect("connect");
//! ```

pub mod connection;
pub mod migrate;
mod store;

pub use store::Store;

use diesel::result::{DatabaseErrorKind, Error as DieselError};

/// Message of a unique-constraint violation, `None` for any other error.
pub(crate) fn unique_violation(e: &DieselError) -> Option<String> {
    match e {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
            Some(info.message().to_string())
        }
        _ => None,
    }
}
