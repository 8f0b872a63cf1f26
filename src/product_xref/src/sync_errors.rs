//! Sync error log: terminal failures written by the retry policy, resolved by operators.

use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::{
    db::Store,
    models::logs::{FailureClass, NewSyncErrorRow, SyncErrorRecord},
    schema::sync_error::dsl as se,
    tz,
};

/// A terminal failure about to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub error_type: String,
    pub message: String,
    pub classification: FailureClass,
    pub operation: String,
    /// Originating context (ids, component, caller-supplied fields).
    pub context: serde_json::Value,
    pub attempts: u32,
}

/// Which rows [`SyncErrorLog::list_recent`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolvedFilter {
    #[default]
    All,
    Unresolved,
    Resolved,
}

/// Anything that can persist a [`FailureReport`].
///
/// [`Store`] writes to the `sync_error` table; tests substitute an in-memory log.
/// `record` may block on SQLite; async callers go through `record_async`.
#[async_trait]
pub trait ErrorRecorder: Send + Sync {
    fn record(&self, report: &FailureReport) -> anyhow::Result<()>;

    async fn record_async(&self, report: FailureReport) -> anyhow::Result<()> {
        self.record(&report)
    }
}

#[async_trait]
impl ErrorRecorder for Store {
    fn record(&self, report: &FailureReport) -> anyhow::Result<()> {
        let mut conn = self.connect()?;
        SyncErrorLog::record(&mut conn, report)?;
        Ok(())
    }

    async fn record_async(&self, report: FailureReport) -> anyhow::Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.record(&report))
            .await
            .context("sync error writer panicked")?
    }
}

/// Records through a borrowed connection, for synchronous batch loops that
/// already hold one.
pub struct ConnRecorder<'c>(Mutex<&'c mut SqliteConnection>);

impl<'c> ConnRecorder<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self(Mutex::new(conn))
    }
}

impl ErrorRecorder for ConnRecorder<'_> {
    fn record(&self, report: &FailureReport) -> anyhow::Result<()> {
        let mut conn = self
            .0
            .lock()
            .map_err(|_| anyhow::anyhow!("sync error recorder poisoned"))?;
        SyncErrorLog::record(&mut **conn, report)?;
        Ok(())
    }
}

/// Repository over `sync_error`.
pub struct SyncErrorLog;

impl SyncErrorLog {
    /// Appends `report` and returns the new row id.
    pub fn record(conn: &mut SqliteConnection, report: &FailureReport) -> QueryResult<i32> {
        let now = tz::now_string();
        let context = report.context.to_string();
        let row = NewSyncErrorRow {
            error_type: &report.error_type,
            message: &report.message,
            classification: report.classification.as_str(),
            operation: &report.operation,
            context: &context,
            attempts: i32::try_from(report.attempts).unwrap_or(i32::MAX),
            created_at: &now,
        };
        diesel::insert_into(se::sync_error)
            .values(&row)
            .returning(se::id)
            .get_result(conn)
    }

    /// Newest first.
    pub fn list_recent(
        conn: &mut SqliteConnection,
        limit: i64,
        filter: ResolvedFilter,
    ) -> QueryResult<Vec<SyncErrorRecord>> {
        let mut q = se::sync_error
            .select(SyncErrorRecord::as_select())
            .into_boxed();
        q = match filter {
            ResolvedFilter::All => q,
            ResolvedFilter::Unresolved => q.filter(se::resolved.eq(false)),
            ResolvedFilter::Resolved => q.filter(se::resolved.eq(true)),
        };
        q.order((se::created_at.desc(), se::id.desc()))
            .limit(limit.max(0))
            .load(conn)
    }

    /// Marks `id` resolved. Returns `false` when the row is missing or already resolved.
    pub fn mark_resolved(conn: &mut SqliteConnection, id: i32, by: &str) -> QueryResult<bool> {
        let now = tz::now_string();
        let n = diesel::update(se::sync_error.find(id).filter(se::resolved.eq(false)))
            .set((
                se::resolved.eq(true),
                se::resolved_at.eq(Some(now.as_str())),
                se::resolved_by.eq(Some(by)),
            ))
            .execute(conn)?;
        Ok(n == 1)
    }

    /// Errors recorded at or after `cutoff`.
    pub fn count_since(conn: &mut SqliteConnection, cutoff: DateTime<Utc>) -> QueryResult<i64> {
        se::sync_error
            .filter(se::created_at.ge(tz::to_rfc3339_millis(cutoff)))
            .count()
            .get_result(conn)
    }
}
