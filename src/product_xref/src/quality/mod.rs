//! Data quality monitor.
//!
//! A scan collects [`QualityMetrics`] from the ledger, the mapping store, the sync
//! checkpoints and the sync error log, scores them, and raises an alert for every
//! threshold breach. Each alert is persisted first and then fanned out to the
//! registered handlers.

mod metrics;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Utc};
use diesel::SqliteConnection;
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub use metrics::{QualityMetrics, QualityThresholds, evaluate, freshness_score, quality_score};

use crate::{
    alerts::{AlertHandler, AlertLog, QualityAlert, dispatch},
    cancel::CancelToken,
    db::Store,
    ledger::Ledger,
    mapping::MappingStore,
    sync_errors::SyncErrorLog,
    tz,
};

/// Outcome of one scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityReport {
    pub scanned_at: String,
    pub metrics: QualityMetrics,
    pub alerts: Vec<QualityAlert>,
    /// Alerts written to `quality_alert`.
    pub persisted: usize,
    /// Successful handler deliveries, summed over alerts.
    pub delivered: usize,
    /// Cancelled before every alert was processed.
    pub interrupted: bool,
}

pub struct QualityMonitor {
    thresholds: QualityThresholds,
    handlers: Vec<Box<dyn AlertHandler>>,
}

impl QualityMonitor {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self {
            thresholds,
            handlers: Vec::new(),
        }
    }

    pub fn with_handler(mut self, handler: impl AlertHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// Reads every metric. Sees whatever is committed; concurrent writers may
    /// make the numbers mutually inconsistent by a few rows.
    pub fn collect_metrics(
        &self,
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
    ) -> anyhow::Result<QualityMetrics> {
        let ledger = Ledger::statistics(conn).context("ledger statistics")?;

        let mut ages = IndexMap::new();
        for cp in Ledger::checkpoints(conn).context("sync checkpoints")? {
            let age = cp
                .last_success_at
                .as_deref()
                .and_then(|ts| tz::hours_since(ts, now));
            ages.insert(cp.component, age);
        }
        let stalest = ages.values().flatten().copied().reduce(f64::max);
        let freshness = freshness_score(metrics::score_age(&ages));

        let errors_last_hour = SyncErrorLog::count_since(conn, now - chrono::Duration::hours(1))
            .context("sync error count")?;
        let duplicate_groups = MappingStore::find_duplicates(conn)
            .context("duplicate mappings")?
            .len() as i64;
        let orphaned_mappings =
            MappingStore::count_orphaned(conn).context("orphaned mappings")?;

        Ok(QualityMetrics {
            total_records: ledger.total,
            synced_pct: ledger.synced_pct,
            pending_pct: ledger.pending_pct,
            failed_pct: ledger.failed_pct,
            real_name_pct: ledger.real_name_pct,
            component_age_hours: ages,
            stalest_hours: stalest,
            freshness_score: freshness,
            errors_last_hour,
            duplicate_groups,
            orphaned_mappings,
            quality_score: quality_score(
                ledger.synced_pct,
                ledger.real_name_pct,
                freshness,
                ledger.failed_pct,
            ),
        })
    }

    /// Collects metrics, then persists and dispatches one alert per breach.
    ///
    /// Cancellation is checked before evaluation and between alerts; alerts
    /// already persisted stay persisted.
    pub fn scan(
        &self,
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> anyhow::Result<QualityReport> {
        let metrics = self.collect_metrics(conn, now)?;
        let mut report = QualityReport {
            scanned_at: tz::to_rfc3339_millis(now),
            metrics,
            ..Default::default()
        };
        if cancel.is_cancelled() {
            report.interrupted = true;
            return Ok(report);
        }

        report.alerts = evaluate(&report.metrics, &self.thresholds);
        for alert in &report.alerts {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            match AlertLog::record(conn, alert) {
                Ok(_) => report.persisted += 1,
                Err(e) => error!(alert_type = %alert.alert_type, error = %e, "failed to persist alert"),
            }
            report.delivered += dispatch(&self.handlers, alert);
        }

        info!(
            score = report.metrics.quality_score,
            alerts = report.alerts.len(),
            persisted = report.persisted,
            "quality scan finished"
        );
        Ok(report)
    }

    /// Scans every `period` until `cancel` trips; returns the number of scans run.
    ///
    /// The first scan runs immediately. A failed scan is logged and the schedule continues.
    pub async fn run_periodic(
        self: Arc<Self>,
        store: Store,
        period: Duration,
        cancel: CancelToken,
    ) -> usize {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut runs = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let monitor = Arc::clone(&self);
            let store = store.clone();
            let token = cancel.clone();
            let res = tokio::task::spawn_blocking(move || {
                let mut conn = store.connect()?;
                monitor.scan(&mut conn, Utc::now(), &token)
            })
            .await;
            runs += 1;
            match res {
                Ok(Ok(r)) => debug!(score = r.metrics.quality_score, "scheduled scan done"),
                Ok(Err(e)) => warn!(error = %e, "scheduled quality scan failed"),
                Err(e) => error!(error = %e, "quality scan task panicked"),
            }
        }
        info!(runs, "periodic quality scans stopped");
        runs
    }
}

impl Default for QualityMonitor {
    fn default() -> Self {
        Self::new(QualityThresholds::default())
    }
}
