use std::sync::Arc;

use diesel::SqliteConnection;

use crate::db::{connection::connect_sqlite, migrate};

/// Shared handle over one SQLite database file.
///
/// Cloning is cheap. Each unit of work opens its own connection via [`Store::connect`],
/// so concurrent workers are serialized by SQLite's write lock rather than by a
/// process-wide mutex. In-memory databases are not shareable across connections;
/// use a file path.
#[derive(Debug, Clone)]
pub struct Store {
    url: Arc<str>,
}

impl Store {
    /// Applies pending migrations and returns a handle.
    pub fn open(url: &str) -> anyhow::Result<Self> {
        migrate::run_sqlite(url)?;
        Ok(Self { url: url.into() })
    }

    /// Opens a tuned connection (WAL, foreign keys, busy timeout).
    pub fn connect(&self) -> anyhow::Result<SqliteConnection> {
        connect_sqlite(&self.url)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
