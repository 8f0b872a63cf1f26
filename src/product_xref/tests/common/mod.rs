#![allow(dead_code)]

use diesel::QueryableByName;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Integer, Text};
use product_xref::db::{Store, connection, migrate};
use std::path::PathBuf;
use tempfile::TempDir;

#[derive(QueryableByName)]
struct JournalMode {
    #[diesel(sql_type = Text)]
    journal_mode: String,
}
#[derive(QueryableByName)]
struct ForeignKeys {
    #[diesel(sql_type = Integer)]
    foreign_keys: i32,
}
#[derive(QueryableByName)]
struct BusyTimeout {
    #[diesel(sql_type = Integer, column_name = "timeout")]
    busy_timeout: i32,
}
#[derive(QueryableByName)]
struct Count {
    #[diesel(sql_type = BigInt)]
    n: i64,
}

pub struct TestDb {
    _dir: TempDir,    // keep alive for the life of the test
    pub path: String, // <tmpdir>/test.db
}

impl TestDb {
    pub fn store(&self) -> Store {
        Store::open(&self.path).expect("store")
    }
}

pub fn setup_db() -> (TestDb, SqliteConnection) {
    let dir = TempDir::new().expect("tempdir");
    let mut p = PathBuf::from(dir.path());
    p.push("test.db");
    let path = p.to_string_lossy().to_string();

    migrate::run_sqlite(&path).expect("migrations");

    let conn = connection::connect_sqlite(&path).expect("connect");
    (TestDb { _dir: dir, path }, conn)
}

pub fn assert_sqlite_pragmas(conn: &mut SqliteConnection) {
    use diesel::sql_query;

    let jm: JournalMode = sql_query("PRAGMA journal_mode;").get_result(conn).unwrap();
    assert_eq!(jm.journal_mode.to_lowercase(), "wal");

    let fk: ForeignKeys = sql_query("PRAGMA foreign_keys;").get_result(conn).unwrap();
    assert_eq!(fk.foreign_keys, 1);

    let bt: BusyTimeout = sql_query("PRAGMA busy_timeout;").get_result(conn).unwrap();
    assert_eq!(bt.busy_timeout, 5000);
}

/// `SELECT COUNT(*) AS n FROM <table> [WHERE ..]`.
pub fn count(conn: &mut SqliteConnection, table_and_filter: &str) -> i64 {
    let row: Count = diesel::sql_query(format!("SELECT COUNT(*) AS n FROM {table_and_filter}"))
        .get_result(conn)
        .unwrap();
    row.n
}

/// Overwrites `last_successful_sync` of one ledger row.
pub fn backdate_sync(conn: &mut SqliteConnection, id: i32, ts: &str) {
    diesel::sql_query("UPDATE product_xref SET last_successful_sync = ? WHERE id = ?")
        .bind::<Text, _>(ts)
        .bind::<Integer, _>(id)
        .execute(conn)
        .unwrap();
}

pub fn backdate_checkpoint(conn: &mut SqliteConnection, component: &str, ts: &str) {
    diesel::sql_query("UPDATE source_sync_checkpoint SET last_success_at = ? WHERE component = ?")
        .bind::<Text, _>(ts)
        .bind::<Text, _>(component)
        .execute(conn)
        .unwrap();
}

/// Installs a trigger that aborts `event` writes on `table` matching `when`,
/// standing in for a storage failure on individual rows.
pub fn fail_writes_when(conn: &mut SqliteConnection, table: &str, event: &str, when: &str) {
    diesel::sql_query(format!(
        "CREATE TRIGGER fail_{table}_{event} BEFORE {event} ON {table} WHEN {when}
         BEGIN SELECT RAISE(ABORT, 'simulated write failure'); END;"
    ))
    .execute(conn)
    .unwrap();
}
