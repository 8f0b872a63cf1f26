//! Embedded schema migrations.

use anyhow::anyhow;
use diesel::{Connection, SqliteConnection, connection::SimpleConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tracing::info;

use crate::db::connection::sqlite_path;

/// Embedded Diesel migrations bundled with this crate.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Runs pending migrations on the SQLite database at `url`.
///
/// Switches the file to WAL first (a persistent property of the database file).
/// Returns the number of migrations applied; zero on an up-to-date database.
pub fn run_sqlite(url: &str) -> anyhow::Result<usize> {
    let mut conn = SqliteConnection::establish(sqlite_path(url))?;
    conn.batch_execute("PRAGMA journal_mode=WAL;")?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow!(e))?;
    if !applied.is_empty() {
        info!(count = applied.len(), "applied schema migrations");
    }
    Ok(applied.len())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn migrations_apply_once() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let path = temp.path().to_string_lossy().to_string();

        let first = run_sqlite(&path).expect("migration run");
        assert!(first >= 3);
        assert_eq!(run_sqlite(&path).expect("second run"), 0);

        let mut conn = SqliteConnection::establish(&path).unwrap();
        conn.batch_execute(
            "INSERT INTO product_xref (inventory_id, created_at, updated_at)
             VALUES ('42', '2025-01-01T00:00:00.000Z', '2025-01-01T00:00:00.000Z')",
        )
        .unwrap();
    }
}
