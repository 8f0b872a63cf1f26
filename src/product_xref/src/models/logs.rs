//! Append-only logs: terminal sync failures and quality alerts.

use diesel::prelude::*;
use serde::Serialize;

use crate::models::text_enum;
use crate::schema::{quality_alert, sync_error};

/// Retry taxonomy for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Network, timeout, lock contention, rate limiting. Worth another attempt.
    Transient,
    /// Auth, not-found, invalid input. Never retried.
    Fatal,
}

text_enum!(FailureClass, "classification", {
    Transient => "transient",
    Fatal => "fatal",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AlertLevel {
    Warning,
    Critical,
}

text_enum!(AlertLevel, "alert_level", {
    Warning => "warning",
    Critical => "critical",
});

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = sync_error, check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncErrorRecord {
    pub id: i32,
    pub error_type: String,
    pub message: String,
    pub classification: String,
    pub operation: String,
    /// JSON object with the originating context.
    pub context: String,
    pub attempts: i32,
    pub created_at: String,
    pub resolved: bool,
    pub resolved_at: Option<String>,
    pub resolved_by: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = sync_error)]
pub struct NewSyncErrorRow<'a> {
    pub error_type: &'a str,
    pub message: &'a str,
    pub classification: &'a str,
    pub operation: &'a str,
    pub context: &'a str,
    pub attempts: i32,
    pub created_at: &'a str,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Identifiable, Serialize)]
#[diesel(table_name = quality_alert, check_for_backend(diesel::sqlite::Sqlite))]
pub struct QualityAlertRecord {
    pub id: i32,
    pub level: String,
    pub alert_type: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub created_at: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = quality_alert)]
pub struct NewQualityAlertRow<'a> {
    pub level: &'a str,
    pub alert_type: &'a str,
    pub message: &'a str,
    pub value: f64,
    pub threshold: f64,
    pub created_at: &'a str,
}
