use diesel::{
    prelude::*,
    sql_query,
    sql_types::{BigInt, Double, Nullable, Text},
};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::{
    cancel::CancelToken,
    db::unique_violation,
    ledger::pct,
    mapping::{
        ApproveReport, ConfidenceTiers, DuplicateGroup, MappingError, MappingStats,
        NewSkuMapping, SearchFilters, check_threshold,
    },
    models::mapping::{NewSkuMappingRow, SkuMapping, SkuMappingSync, VerificationStatus},
    normalize::{normalize_identifier_str, normalize_text_str},
    retry::{RetryContext, handle_with_fallback},
    schema::{product_xref, sku_mapping::dsl as sm},
    sync_errors::ConnRecorder,
    tz,
};

/// Normalized, validated form of a [`NewSkuMapping`].
struct Validated {
    external_sku: String,
    source: String,
    match_method: String,
    notes: Option<String>,
}

fn validate(m: &NewSkuMapping) -> Result<Validated, MappingError> {
    check_threshold(m.confidence_score)
        .map_err(|_| MappingError::InvalidConfidence(m.confidence_score))?;
    Ok(Validated {
        external_sku: normalize_identifier_str(&m.external_sku)
            .ok_or(MappingError::Blank("external_sku"))?,
        source: normalize_text_str(&m.source).ok_or(MappingError::Blank("source"))?,
        match_method: normalize_text_str(&m.match_method)
            .ok_or(MappingError::Blank("match_method"))?,
        notes: m.notes.as_deref().and_then(normalize_text_str),
    })
}

fn map_write_err(e: diesel::result::Error) -> MappingError {
    match unique_violation(&e) {
        Some(msg) => MappingError::Conflict(msg),
        None => MappingError::Database(e),
    }
}

#[derive(QueryableByName)]
struct StatsRow {
    #[diesel(sql_type = Text)]
    source: String,
    #[diesel(sql_type = BigInt)]
    total: i64,
    #[diesel(sql_type = BigInt)]
    pending: i64,
    #[diesel(sql_type = BigInt)]
    auto: i64,
    #[diesel(sql_type = BigInt)]
    manual: i64,
    #[diesel(sql_type = BigInt)]
    rejected: i64,
    #[diesel(sql_type = Nullable<Double>)]
    avg_confidence: Option<f64>,
    #[diesel(sql_type = BigInt)]
    high: i64,
    #[diesel(sql_type = BigInt)]
    medium: i64,
    #[diesel(sql_type = BigInt)]
    low: i64,
    #[diesel(sql_type = BigInt)]
    very_low: i64,
}

impl From<StatsRow> for MappingStats {
    fn from(r: StatsRow) -> Self {
        MappingStats {
            total: r.total,
            pending: r.pending,
            auto: r.auto,
            manual: r.manual,
            rejected: r.rejected,
            verified_pct: pct(r.auto + r.manual, r.total),
            pending_pct: pct(r.pending, r.total),
            avg_confidence: r.avg_confidence,
            tiers: ConfidenceTiers {
                high: r.high,
                medium: r.medium,
                low: r.low,
                very_low: r.very_low,
            },
        }
    }
}

const STATS_COLUMNS: &str = "
    COUNT(*) AS total,
    COALESCE(SUM(verification_status = 'pending'), 0) AS pending,
    COALESCE(SUM(verification_status = 'auto'), 0) AS auto,
    COALESCE(SUM(verification_status = 'manual'), 0) AS manual,
    COALESCE(SUM(verification_status = 'rejected'), 0) AS rejected,
    AVG(confidence_score) AS avg_confidence,
    COALESCE(SUM(confidence_score >= 0.9), 0) AS high,
    COALESCE(SUM(confidence_score >= 0.7 AND confidence_score < 0.9), 0) AS medium,
    COALESCE(SUM(confidence_score >= 0.5 AND confidence_score < 0.7), 0) AS low,
    COALESCE(SUM(confidence_score < 0.5), 0) AS very_low";

#[derive(QueryableByName)]
struct DuplicateRow {
    #[diesel(sql_type = Text)]
    source_key: String,
    #[diesel(sql_type = Text)]
    sku_key: String,
    #[diesel(sql_type = Text)]
    ids: String,
}

/// Repository over `sku_mapping`.
pub struct MappingStore;

impl MappingStore {
    /// Inserts or refreshes a mapping and returns its id.
    ///
    /// With `id` set and present, that row is updated. Otherwise a single
    /// `INSERT .. ON CONFLICT (source, external_sku) DO UPDATE` either creates the
    /// row or refreshes the existing one. Verification columns are never written here.
    pub fn save(conn: &mut SqliteConnection, m: &NewSkuMapping) -> Result<i32, MappingError> {
        let v = validate(m)?;
        conn.immediate_transaction(|conn| {
            let now = tz::now_string();
            let sync = SkuMappingSync {
                master_id: m.master_id,
                confidence_score: m.confidence_score,
                match_method: &v.match_method,
                notes: v.notes.as_deref(),
                updated_at: &now,
            };

            if let Some(id) = m.id {
                let n = diesel::update(sm::sku_mapping.find(id))
                    .set((
                        &sync,
                        sm::external_sku.eq(&v.external_sku),
                        sm::source.eq(&v.source),
                    ))
                    .execute(conn)
                    .map_err(map_write_err)?;
                if n == 1 {
                    debug!(id, "updated sku mapping by id");
                    return Ok(id);
                }
            }

            let row = NewSkuMappingRow {
                master_id: m.master_id,
                external_sku: &v.external_sku,
                source: &v.source,
                confidence_score: m.confidence_score,
                verification_status: VerificationStatus::Pending.as_str(),
                match_method: &v.match_method,
                notes: v.notes.as_deref(),
                created_at: &now,
                updated_at: &now,
            };
            let id = diesel::insert_into(sm::sku_mapping)
                .values(&row)
                .on_conflict((sm::source, sm::external_sku))
                .do_update()
                .set(&sync)
                .returning(sm::id)
                .get_result(conn)
                .map_err(map_write_err)?;
            debug!(id, source = %v.source, sku = %v.external_sku, "saved sku mapping");
            Ok(id)
        })
    }

    /// Strict insert: fails with [`MappingError::Conflict`] when the key exists.
    pub fn insert(conn: &mut SqliteConnection, m: &NewSkuMapping) -> Result<i32, MappingError> {
        let v = validate(m)?;
        let now = tz::now_string();
        diesel::insert_into(sm::sku_mapping)
            .values(&NewSkuMappingRow {
                master_id: m.master_id,
                external_sku: &v.external_sku,
                source: &v.source,
                confidence_score: m.confidence_score,
                verification_status: VerificationStatus::Pending.as_str(),
                match_method: &v.match_method,
                notes: v.notes.as_deref(),
                created_at: &now,
                updated_at: &now,
            })
            .returning(sm::id)
            .get_result(conn)
            .map_err(map_write_err)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, id: i32) -> QueryResult<Option<SkuMapping>> {
        sm::sku_mapping
            .find(id)
            .select(SkuMapping::as_select())
            .first(conn)
            .optional()
    }

    /// Every mapping of `external_sku`, across sources unless `source` is given.
    pub fn find_by_external_sku(
        conn: &mut SqliteConnection,
        external_sku: &str,
        source: Option<&str>,
    ) -> QueryResult<Vec<SkuMapping>> {
        let Some(sku) = normalize_identifier_str(external_sku) else {
            return Ok(Vec::new());
        };
        let mut q = sm::sku_mapping
            .filter(sm::external_sku.eq(sku))
            .select(SkuMapping::as_select())
            .into_boxed();
        if let Some(src) = source.and_then(normalize_text_str) {
            q = q.filter(sm::source.eq(src));
        }
        q.order(sm::id.asc()).load(conn)
    }

    pub fn find_by_master_id(
        conn: &mut SqliteConnection,
        master_id: i32,
    ) -> QueryResult<Vec<SkuMapping>> {
        sm::sku_mapping
            .filter(sm::master_id.eq(master_id))
            .select(SkuMapping::as_select())
            .order(sm::id.asc())
            .load(conn)
    }

    pub fn find_by_source(
        conn: &mut SqliteConnection,
        source: &str,
        status: Option<VerificationStatus>,
        limit: i64,
    ) -> QueryResult<Vec<SkuMapping>> {
        let mut q = sm::sku_mapping
            .filter(sm::source.eq(source.trim().to_string()))
            .select(SkuMapping::as_select())
            .into_boxed();
        if let Some(s) = status {
            q = q.filter(sm::verification_status.eq(s.as_str()));
        }
        q.order(sm::id.asc()).limit(limit.max(0)).load(conn)
    }

    /// Pending mappings at or above `threshold`, most confident first, oldest
    /// first among equals.
    pub fn find_high_confidence_pending(
        conn: &mut SqliteConnection,
        threshold: f64,
        limit: i64,
    ) -> QueryResult<Vec<SkuMapping>> {
        sm::sku_mapping
            .filter(sm::verification_status.eq(VerificationStatus::Pending.as_str()))
            .filter(sm::confidence_score.ge(threshold))
            .select(SkuMapping::as_select())
            .order((sm::confidence_score.desc(), sm::created_at.asc(), sm::id.asc()))
            .limit(limit.max(0))
            .load(conn)
    }

    /// Moves every `pending` mapping at or above `threshold` to `auto`.
    ///
    /// Rows are approved one conditional update at a time (`WHERE status = 'pending'`),
    /// so a mapping rejected concurrently stays rejected and a cancelled run leaves
    /// only whole transitions behind. A transition that fails is recorded in the
    /// sync error log and counted in `failed` without stopping the run.
    pub fn bulk_approve_by_confidence(
        conn: &mut SqliteConnection,
        threshold: f64,
        approver: &str,
        cancel: &CancelToken,
    ) -> Result<ApproveReport, MappingError> {
        check_threshold(threshold)?;
        let approver = normalize_text_str(approver).ok_or(MappingError::Blank("approver"))?;

        let candidates: Vec<i32> = sm::sku_mapping
            .filter(sm::verification_status.eq(VerificationStatus::Pending.as_str()))
            .filter(sm::confidence_score.ge(threshold))
            .select(sm::id)
            .order((sm::confidence_score.desc(), sm::created_at.asc()))
            .load(conn)?;

        let mut report = ApproveReport {
            candidates: candidates.len(),
            ..Default::default()
        };
        for id in candidates {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            match Self::transition(
                conn,
                id,
                VerificationStatus::Auto,
                &approver,
                None,
                Some(threshold),
            ) {
                Ok(n) => report.approved += n,
                Err(e) => {
                    report.failed += 1;
                    let ctx = RetryContext::new("bulk_approve_by_confidence")
                        .with("mapping_id", id)
                        .with("threshold", threshold);
                    handle_with_fallback(&e, &ctx, &ConnRecorder::new(conn), ());
                }
            }
        }

        if report.interrupted {
            warn!(threshold, approved = report.approved, "bulk approval interrupted");
        } else {
            info!(
                threshold,
                approved = report.approved,
                failed = report.failed,
                %approver,
                "bulk approval finished"
            );
        }
        Ok(report)
    }

    /// `pending -> auto` for one mapping whose confidence clears `threshold`.
    pub fn approve_auto(
        conn: &mut SqliteConnection,
        id: i32,
        threshold: f64,
        approver: &str,
    ) -> Result<(), MappingError> {
        check_threshold(threshold)?;
        Self::transition_checked(conn, id, VerificationStatus::Auto, approver, None, Some(threshold))
    }

    /// `pending -> manual`.
    pub fn approve_manual(
        conn: &mut SqliteConnection,
        id: i32,
        reviewer: &str,
    ) -> Result<(), MappingError> {
        Self::transition_checked(conn, id, VerificationStatus::Manual, reviewer, None, None)
    }

    /// Any non-rejected state -> `rejected`. `reason` is kept in `notes`.
    pub fn reject(
        conn: &mut SqliteConnection,
        id: i32,
        reviewer: &str,
        reason: Option<&str>,
    ) -> Result<(), MappingError> {
        Self::transition_checked(conn, id, VerificationStatus::Rejected, reviewer, reason, None)
    }

    fn transition_checked(
        conn: &mut SqliteConnection,
        id: i32,
        to: VerificationStatus,
        by: &str,
        reason: Option<&str>,
        threshold: Option<f64>,
    ) -> Result<(), MappingError> {
        let by = normalize_text_str(by).ok_or(MappingError::Blank("reviewer"))?;
        conn.immediate_transaction(|conn| {
            if Self::transition(conn, id, to, &by, reason, threshold)? == 1 {
                return Ok(());
            }
            let current = Self::find_by_id(conn, id)?.ok_or(MappingError::NotFound(id))?;
            match threshold {
                Some(t) if current.status() == VerificationStatus::Pending => {
                    Err(MappingError::BelowThreshold {
                        id,
                        confidence: current.confidence_score,
                        threshold: t,
                    })
                }
                _ => Err(MappingError::IllegalTransition {
                    id,
                    from: current.status(),
                    to,
                }),
            }
        })
    }

    /// One conditional update; returns rows changed (0 or 1).
    fn transition(
        conn: &mut SqliteConnection,
        id: i32,
        to: VerificationStatus,
        by: &str,
        reason: Option<&str>,
        threshold: Option<f64>,
    ) -> QueryResult<usize> {
        let allowed_from: Vec<&str> = VerificationStatus::ALL
            .iter()
            .filter(|from| from.can_transition_to(to))
            .map(|from| from.as_str())
            .collect();
        let now = tz::now_string();

        // confidence is CHECKed into [0, 1], so 0.0 means "no threshold"
        let n = diesel::update(
            sm::sku_mapping
                .filter(sm::id.eq(id))
                .filter(sm::verification_status.eq_any(allowed_from))
                .filter(sm::confidence_score.ge(threshold.unwrap_or(0.0))),
        )
        .set((
            sm::verification_status.eq(to.as_str()),
            sm::verified_by.eq(Some(by)),
            sm::verified_at.eq(Some(now.as_str())),
            sm::updated_at.eq(now.as_str()),
        ))
        .execute(conn)?;
        if n == 0 {
            return Ok(0);
        }
        if let Some(r) = reason.and_then(normalize_text_str) {
            diesel::update(sm::sku_mapping.find(id))
                .set(sm::notes.eq(Some(r)))
                .execute(conn)?;
        }
        debug!(id, to = %to, by, "sku mapping transitioned");
        Ok(n)
    }

    /// Groups of mappings that share `(lower(trim(source)), lower(trim(external_sku)))`.
    pub fn find_duplicates(conn: &mut SqliteConnection) -> QueryResult<Vec<DuplicateGroup>> {
        let rows: Vec<DuplicateRow> = sql_query(
            "SELECT lower(trim(source)) AS source_key,
                    lower(trim(external_sku)) AS sku_key,
                    group_concat(id) AS ids
             FROM sku_mapping
             GROUP BY source_key, sku_key
             HAVING COUNT(*) > 1
             ORDER BY source_key, sku_key",
        )
        .load(conn)?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let mut ids: Vec<i32> = r
                    .ids
                    .split(',')
                    .filter_map(|s| s.trim().parse().ok())
                    .collect();
                ids.sort_unstable();
                DuplicateGroup {
                    source: r.source_key,
                    external_sku: r.sku_key,
                    ids,
                }
            })
            .collect())
    }

    /// Mappings whose `master_id` has no ledger row.
    pub fn find_orphaned(conn: &mut SqliteConnection) -> QueryResult<Vec<SkuMapping>> {
        sm::sku_mapping
            .left_join(product_xref::table.on(product_xref::id.eq(sm::master_id)))
            .filter(product_xref::id.nullable().is_null())
            .select(SkuMapping::as_select())
            .order(sm::id.asc())
            .load(conn)
    }

    pub fn count_orphaned(conn: &mut SqliteConnection) -> QueryResult<i64> {
        sm::sku_mapping
            .left_join(product_xref::table.on(product_xref::id.eq(sm::master_id)))
            .filter(product_xref::id.nullable().is_null())
            .count()
            .get_result(conn)
    }

    /// Filtered page of mappings, newest first.
    pub fn search(
        conn: &mut SqliteConnection,
        filters: &SearchFilters,
        limit: i64,
        offset: i64,
    ) -> QueryResult<Vec<SkuMapping>> {
        let mut q = sm::sku_mapping.select(SkuMapping::as_select()).into_boxed();

        if let Some(m) = filters.master_id {
            q = q.filter(sm::master_id.eq(m));
        }
        if let Some(sub) = filters
            .external_sku_contains
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            q = q.filter(sm::external_sku.like(format!("%{}%", escape_like(sub))).escape('\\'));
        }
        if let Some(src) = filters.source.as_deref().and_then(normalize_text_str) {
            q = q.filter(sm::source.eq(src));
        }
        if let Some(s) = filters.status {
            q = q.filter(sm::verification_status.eq(s.as_str()));
        }
        if let Some(min) = filters.min_confidence {
            q = q.filter(sm::confidence_score.ge(min));
        }
        if let Some(max) = filters.max_confidence {
            q = q.filter(sm::confidence_score.le(max));
        }
        if let Some(from) = filters.created_from {
            q = q.filter(sm::created_at.ge(tz::to_rfc3339_millis(from)));
        }
        if let Some(to) = filters.created_to {
            q = q.filter(sm::created_at.lt(tz::to_rfc3339_millis(to)));
        }

        q.order((sm::created_at.desc(), sm::id.desc()))
            .limit(limit.max(0))
            .offset(offset.max(0))
            .load(conn)
    }

    pub fn statistics(conn: &mut SqliteConnection) -> QueryResult<MappingStats> {
        let row: StatsRow = sql_query(format!(
            "SELECT '*' AS source, {STATS_COLUMNS} FROM sku_mapping"
        ))
        .get_result(conn)?;
        Ok(row.into())
    }

    /// Per-source statistics, keyed by source in alphabetical order.
    pub fn statistics_by_source(
        conn: &mut SqliteConnection,
    ) -> QueryResult<IndexMap<String, MappingStats>> {
        let rows: Vec<StatsRow> = sql_query(format!(
            "SELECT source, {STATS_COLUMNS} FROM sku_mapping GROUP BY source ORDER BY source"
        ))
        .load(conn)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.source.clone(), MappingStats::from(r)))
            .collect())
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
