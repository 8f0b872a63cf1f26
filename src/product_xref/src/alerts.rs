//! Quality alert log and alert dispatch.
//!
//! Alerts are persisted before any handler sees them. Handlers are a best-effort
//! fan-out: an error or a panic in one is logged and the rest still run.

use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use tracing::{error, warn};

use crate::{
    models::logs::{AlertLevel, NewQualityAlertRow, QualityAlertRecord},
    schema::quality_alert::dsl as qa,
    tz,
};

/// Payload handed to alert sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityAlert {
    pub level: AlertLevel,
    /// Metric that breached, e.g. `failed_rate`.
    pub alert_type: String,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

/// An alert sink. Closures `Fn(&QualityAlert) -> anyhow::Result<()>` qualify.
pub trait AlertHandler: Send + Sync {
    fn handle(&self, alert: &QualityAlert) -> anyhow::Result<()>;

    fn name(&self) -> &str {
        "alert_handler"
    }
}

impl<F> AlertHandler for F
where
    F: Fn(&QualityAlert) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, alert: &QualityAlert) -> anyhow::Result<()> {
        self(alert)
    }
}

/// Writes every alert to the log at warn/error level.
pub struct TracingAlertHandler;

impl AlertHandler for TracingAlertHandler {
    fn handle(&self, alert: &QualityAlert) -> anyhow::Result<()> {
        match alert.level {
            AlertLevel::Warning => warn!(
                alert_type = %alert.alert_type,
                value = alert.value,
                threshold = alert.threshold,
                "{}", alert.message
            ),
            AlertLevel::Critical => error!(
                alert_type = %alert.alert_type,
                value = alert.value,
                threshold = alert.threshold,
                "{}", alert.message
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Runs every handler; returns how many completed without error or panic.
pub fn dispatch(handlers: &[Box<dyn AlertHandler>], alert: &QualityAlert) -> usize {
    let mut delivered = 0;
    for h in handlers {
        match catch_unwind(AssertUnwindSafe(|| h.handle(alert))) {
            Ok(Ok(())) => delivered += 1,
            Ok(Err(e)) => warn!(handler = h.name(), alert_type = %alert.alert_type, error = %e, "alert handler failed"),
            Err(_) => error!(handler = h.name(), alert_type = %alert.alert_type, "alert handler panicked"),
        }
    }
    delivered
}

/// Repository over `quality_alert`.
pub struct AlertLog;

impl AlertLog {
    pub fn record(conn: &mut SqliteConnection, alert: &QualityAlert) -> QueryResult<i32> {
        let now = tz::now_string();
        diesel::insert_into(qa::quality_alert)
            .values(&NewQualityAlertRow {
                level: alert.level.as_str(),
                alert_type: &alert.alert_type,
                message: &alert.message,
                value: alert.value,
                threshold: alert.threshold,
                created_at: &now,
            })
            .returning(qa::id)
            .get_result(conn)
    }

    /// Newest first.
    pub fn list_recent(conn: &mut SqliteConnection, limit: i64) -> QueryResult<Vec<QualityAlertRecord>> {
        qa::quality_alert
            .select(QualityAlertRecord::as_select())
            .order((qa::created_at.desc(), qa::id.desc()))
            .limit(limit.max(0))
            .load(conn)
    }

    pub fn count_since(conn: &mut SqliteConnection, cutoff: DateTime<Utc>) -> QueryResult<i64> {
        qa::quality_alert
            .filter(qa::created_at.ge(tz::to_rfc3339_millis(cutoff)))
            .count()
            .get_result(conn)
    }
}
