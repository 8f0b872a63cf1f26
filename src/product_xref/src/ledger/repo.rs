use chrono::{DateTime, Utc};
use diesel::{dsl::count_star, prelude::*};
use tracing::{debug, info, warn};

use crate::{
    cancel::CancelToken,
    db::unique_violation,
    ledger::{
        CachedAttributes, IdColumn, Identifiers, LedgerError, LedgerStats, RegisterReport,
        SourceItem, SourceKind, merge, pct,
    },
    models::xref::{NewXref, SyncCheckpoint, SyncStatus, XrefChangeset, XrefRecord},
    normalize::{normalize_identifier_str, normalize_text_str},
    placeholder::is_placeholder,
    retry::{RetryContext, handle_with_fallback},
    schema::{catalog_link, product_xref::dsl as px, source_sync_checkpoint as ssc},
    sync_errors::ConnRecorder,
    tz,
};

/// Superseded chains are flattened on merge; this only guards against a corrupt cycle.
const MAX_SUPERSEDE_HOPS: usize = 16;

/// Repository over `product_xref`, `catalog_link` and `source_sync_checkpoint`.
pub struct Ledger;

impl Ledger {
    /// Registers or updates the record addressed by `ids`, returning its id.
    ///
    /// Matches every live record holding any supplied identifier. None: a new
    /// `pending` record is inserted. One: supplied identifiers and attributes are
    /// merged in. Several: they are first merged into the oldest.
    ///
    /// Fails with [`LedgerError::Conflict`] when a supplied identifier would
    /// overwrite a different value already held by the matched record.
    pub fn upsert(
        conn: &mut SqliteConnection,
        ids: &Identifiers,
        attrs: &CachedAttributes,
    ) -> Result<i32, LedgerError> {
        let ids = ids.normalized();
        if ids.is_empty() {
            return Err(LedgerError::NoIdentifiers);
        }
        let attrs = attrs.normalized();

        conn.immediate_transaction(|conn| {
            let now = tz::now_string();
            let mut matched = Self::matching_roots(conn, &ids)?;

            if matched.is_empty() {
                return Self::insert_new(conn, &ids, &attrs, &now);
            }

            let survivor = matched.remove(0);
            let survivor = if matched.is_empty() {
                survivor
            } else {
                merge::merge_into(conn, survivor, &matched, &now)?
            };

            let mut cs = XrefChangeset {
                updated_at: Some(&now),
                ..Default::default()
            };
            for (col, value) in ids.present() {
                match survivor.identifier(col) {
                    Some(existing) if existing == value => {}
                    Some(existing) => {
                        return Err(LedgerError::Conflict(format!(
                            "record {} already has {}={existing:?}, refusing {value:?}",
                            survivor.id,
                            col.name()
                        )));
                    }
                    None => set_changeset_id(&mut cs, col, value),
                }
            }
            cs.name = attrs.name.as_deref();
            cs.brand = attrs.brand.as_deref();

            diesel::update(px::product_xref.find(survivor.id))
                .set(&cs)
                .execute(conn)
                .map_err(map_write_err)?;
            debug!(id = survivor.id, "updated cross-reference record");
            Ok(survivor.id)
        })
    }

    fn insert_new(
        conn: &mut SqliteConnection,
        ids: &Identifiers,
        attrs: &CachedAttributes,
        now: &str,
    ) -> Result<i32, LedgerError> {
        let row = NewXref {
            inventory_id: ids.inventory_id.as_deref(),
            marketplace_id: ids.marketplace_id.as_deref(),
            analytics_id: ids.analytics_id.as_deref(),
            marketplace_sku: ids.marketplace_sku.as_deref(),
            name: attrs.name.as_deref(),
            brand: attrs.brand.as_deref(),
            sync_status: SyncStatus::Pending.as_str(),
            created_at: now,
            updated_at: now,
        };
        let id = diesel::insert_into(px::product_xref)
            .values(&row)
            .returning(px::id)
            .get_result(conn)
            .map_err(map_write_err)?;
        debug!(id, "created cross-reference record");
        Ok(id)
    }

    /// Live records holding any of `ids`, oldest first, superseded rows replaced
    /// by their survivor.
    fn matching_roots(
        conn: &mut SqliteConnection,
        ids: &Identifiers,
    ) -> QueryResult<Vec<XrefRecord>> {
        let mut q = px::product_xref
            .select(XrefRecord::as_select())
            .into_boxed();
        for (col, value) in ids.present() {
            q = match col {
                IdColumn::InventoryId => q.or_filter(px::inventory_id.eq(value)),
                IdColumn::MarketplaceId => q.or_filter(px::marketplace_id.eq(value)),
                IdColumn::AnalyticsId => q.or_filter(px::analytics_id.eq(value)),
                IdColumn::MarketplaceSku => q.or_filter(px::marketplace_sku.eq(value)),
            };
        }
        let rows: Vec<XrefRecord> = q.order(px::id.asc()).load(conn)?;

        let mut roots: Vec<XrefRecord> = Vec::with_capacity(rows.len());
        for row in rows {
            let root = live_root(conn, row)?;
            if !roots.iter().any(|r| r.id == root.id) {
                roots.push(root);
            }
        }
        roots.sort_by_key(|r| r.id);
        Ok(roots)
    }

    /// The live record addressed by `product_id` in any identifier column.
    pub fn find_by_any(
        conn: &mut SqliteConnection,
        product_id: &str,
    ) -> QueryResult<Option<XrefRecord>> {
        let Some(pid) = normalize_identifier_str(product_id) else {
            return Ok(None);
        };
        let ids = IdColumn::ALL
            .into_iter()
            .fold(Identifiers::default(), |acc, c| acc.with(c, pid.as_str()));
        Ok(Self::matching_roots(conn, &ids)?.into_iter().next())
    }

    /// The live record for `id`, following `superseded_by` when it was merged away.
    pub fn find_by_id(conn: &mut SqliteConnection, id: i32) -> QueryResult<Option<XrefRecord>> {
        let row = px::product_xref
            .find(id)
            .select(XrefRecord::as_select())
            .first(conn)
            .optional()?;
        row.map(|r| live_root(conn, r)).transpose()
    }

    /// Caches a freshly resolved name and marks the record `synced`.
    ///
    /// Returns `false` when no record matches `product_id`.
    pub fn update_cached_name(
        conn: &mut SqliteConnection,
        product_id: &str,
        name: &str,
        brand: Option<&str>,
    ) -> Result<bool, LedgerError> {
        let name = normalize_text_str(name).ok_or(LedgerError::BlankName)?;
        let brand = brand.and_then(normalize_text_str);

        conn.immediate_transaction(|conn| {
            let Some(rec) = Self::find_by_any(conn, product_id)? else {
                return Ok(false);
            };
            let now = tz::now_string();
            diesel::update(px::product_xref.find(rec.id))
                .set((
                    px::name.eq(Some(name.as_str())),
                    px::sync_status.eq(SyncStatus::Synced.as_str()),
                    px::last_successful_sync.eq(Some(now.as_str())),
                    px::updated_at.eq(now.as_str()),
                ))
                .execute(conn)?;
            if let Some(b) = brand.as_deref() {
                diesel::update(px::product_xref.find(rec.id))
                    .set(px::brand.eq(Some(b)))
                    .execute(conn)?;
            }
            Ok(true)
        })
    }

    /// Sets the sync status of the record addressed by `product_id`.
    ///
    /// `Synced` also stamps `last_successful_sync`. Returns `false` on no match.
    pub fn update_sync_status(
        conn: &mut SqliteConnection,
        product_id: &str,
        status: SyncStatus,
    ) -> Result<bool, LedgerError> {
        conn.immediate_transaction(|conn| {
            let Some(rec) = Self::find_by_any(conn, product_id)? else {
                return Ok(false);
            };
            let now = tz::now_string();
            let target = px::product_xref.find(rec.id);
            if status == SyncStatus::Synced {
                diesel::update(target)
                    .set((
                        px::sync_status.eq(status.as_str()),
                        px::last_successful_sync.eq(Some(now.as_str())),
                        px::updated_at.eq(now.as_str()),
                    ))
                    .execute(conn)?;
            } else {
                diesel::update(target)
                    .set((px::sync_status.eq(status.as_str()), px::updated_at.eq(now.as_str())))
                    .execute(conn)?;
            }
            Ok(true)
        })
    }

    /// Points the downstream catalog row `external_sku` at ledger record `xref_id`.
    ///
    /// Re-linking an existing SKU moves it. A merged-away id is redirected to its survivor.
    pub fn link_to_canonical(
        conn: &mut SqliteConnection,
        xref_id: i32,
        external_sku: &str,
    ) -> Result<i32, LedgerError> {
        let sku = normalize_identifier_str(external_sku)
            .ok_or(LedgerError::NoIdentifiers)?;
        conn.immediate_transaction(|conn| {
            let target = Self::find_by_id(conn, xref_id)?
                .ok_or(LedgerError::UnknownRecord(xref_id))?;
            let now = tz::now_string();
            diesel::insert_into(catalog_link::table)
                .values((
                    catalog_link::external_sku.eq(&sku),
                    catalog_link::xref_id.eq(target.id),
                    catalog_link::linked_at.eq(&now),
                ))
                .on_conflict(catalog_link::external_sku)
                .do_update()
                .set((
                    catalog_link::xref_id.eq(target.id),
                    catalog_link::linked_at.eq(&now),
                ))
                .execute(conn)?;
            Ok(target.id)
        })
    }

    /// Creates `pending` records for identifiers from `source` not yet in the ledger.
    ///
    /// Each row is its own statement (`INSERT .. ON CONFLICT DO NOTHING`), so re-runs
    /// never duplicate and an interrupted run leaves only whole rows behind. A row
    /// that fails is recorded in the sync error log and counted in `failed`; the
    /// rest of the batch still runs. The source's checkpoint is stamped `ok` only
    /// when every row was handled.
    pub fn bulk_register_from_source(
        conn: &mut SqliteConnection,
        source: SourceKind,
        items: &[SourceItem],
        limit: Option<usize>,
        cancel: &CancelToken,
    ) -> Result<RegisterReport, LedgerError> {
        let mut report = RegisterReport {
            source: Some(source),
            ..Default::default()
        };
        let take = limit.unwrap_or(items.len());

        for item in items.iter().take(take) {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            report.scanned += 1;

            let Some(id) = item.normalized_identifier() else {
                report.skipped_invalid += 1;
                continue;
            };
            let name = item.name.as_deref().and_then(normalize_text_str);
            let brand = item.brand.as_deref().and_then(normalize_text_str);
            let now = tz::now_string();
            let mut row = NewXref {
                inventory_id: None,
                marketplace_id: None,
                analytics_id: None,
                marketplace_sku: None,
                name: name.as_deref(),
                brand: brand.as_deref(),
                sync_status: SyncStatus::Pending.as_str(),
                created_at: &now,
                updated_at: &now,
            };
            match source.column() {
                IdColumn::InventoryId => row.inventory_id = Some(id.as_str()),
                IdColumn::MarketplaceId => row.marketplace_id = Some(id.as_str()),
                IdColumn::AnalyticsId => row.analytics_id = Some(id.as_str()),
                IdColumn::MarketplaceSku => row.marketplace_sku = Some(id.as_str()),
            }

            let inserted = diesel::insert_into(px::product_xref)
                .values(&row)
                .on_conflict_do_nothing()
                .execute(conn);
            match inserted {
                Ok(1) => report.created += 1,
                Ok(_) => report.already_present += 1,
                Err(e) => {
                    report.failed += 1;
                    let ctx = RetryContext::new("bulk_register_from_source")
                        .with("source", source.as_str())
                        .with("identifier", id.as_str());
                    handle_with_fallback(&e, &ctx, &ConnRecorder::new(conn), ());
                }
            }
        }

        if report.interrupted {
            warn!(%source, scanned = report.scanned, created = report.created, "bulk registration interrupted");
        } else {
            info!(
                %source,
                scanned = report.scanned,
                created = report.created,
                failed = report.failed,
                "bulk registration finished"
            );
        }
        let ok = !report.interrupted && report.failed == 0;
        Self::record_source_sync(conn, source.component(), ok)?;
        Ok(report)
    }

    /// Stamps the checkpoint of `component`. A failure keeps the last success time.
    pub fn record_source_sync(
        conn: &mut SqliteConnection,
        component: &str,
        ok: bool,
    ) -> QueryResult<()> {
        let now = tz::now_string();
        let outcome = if ok { "ok" } else { "failed" };
        let row = SyncCheckpoint {
            component: component.to_string(),
            last_success_at: ok.then(|| now.clone()),
            last_attempt_at: now.clone(),
            last_outcome: outcome.to_string(),
        };
        let insert = diesel::insert_into(ssc::table)
            .values(&row)
            .on_conflict(ssc::component)
            .do_update();
        if ok {
            insert.set(&row).execute(conn)?;
        } else {
            insert
                .set((
                    ssc::last_attempt_at.eq(&now),
                    ssc::last_outcome.eq(outcome),
                ))
                .execute(conn)?;
        }
        Ok(())
    }

    pub fn checkpoints(conn: &mut SqliteConnection) -> QueryResult<Vec<SyncCheckpoint>> {
        ssc::table
            .select(SyncCheckpoint::as_select())
            .order(ssc::component.asc())
            .load(conn)
    }

    /// Demotes live `synced` records last synced before `cutoff` back to `pending`.
    ///
    /// Cached names are kept as last-known-good. Returns the number demoted.
    pub fn demote_stale(conn: &mut SqliteConnection, cutoff: DateTime<Utc>) -> QueryResult<usize> {
        let cutoff = tz::to_rfc3339_millis(cutoff);
        let now = tz::now_string();
        diesel::update(
            px::product_xref
                .filter(px::superseded_by.is_null())
                .filter(px::sync_status.eq(SyncStatus::Synced.as_str()))
                .filter(
                    px::last_successful_sync
                        .lt(&cutoff)
                        .or(px::last_successful_sync.is_null()),
                ),
        )
        .set((
            px::sync_status.eq(SyncStatus::Pending.as_str()),
            px::updated_at.eq(&now),
        ))
        .execute(conn)
    }

    /// Status counts, real-name coverage and latest sync over live records.
    pub fn statistics(conn: &mut SqliteConnection) -> QueryResult<LedgerStats> {
        let live = px::superseded_by.is_null();
        let by_status: Vec<(String, i64)> = px::product_xref
            .filter(live)
            .group_by(px::sync_status)
            .select((px::sync_status, count_star()))
            .load(conn)?;

        let mut stats = LedgerStats::default();
        for (status, n) in by_status {
            stats.total += n;
            match status.parse::<SyncStatus>() {
                Ok(SyncStatus::Synced) => stats.synced += n,
                Ok(SyncStatus::Pending) => stats.pending += n,
                Ok(SyncStatus::Failed) => stats.failed += n,
                Err(e) => warn!(error = %e, "unexpected sync_status in ledger"),
            }
        }

        let names: Vec<Option<String>> = px::product_xref
            .filter(px::superseded_by.is_null())
            .select(px::name)
            .load(conn)?;
        stats.real_names = names
            .iter()
            .filter(|n| n.as_deref().is_some_and(|n| !is_placeholder(n)))
            .count() as i64;

        stats.superseded = px::product_xref
            .filter(px::superseded_by.is_not_null())
            .count()
            .get_result(conn)?;

        stats.last_successful_sync = px::product_xref
            .filter(px::superseded_by.is_null())
            .select(diesel::dsl::max(px::last_successful_sync))
            .first::<Option<String>>(conn)?;

        stats.synced_pct = pct(stats.synced, stats.total);
        stats.pending_pct = pct(stats.pending, stats.total);
        stats.failed_pct = pct(stats.failed, stats.total);
        stats.real_name_pct = pct(stats.real_names, stats.total);
        Ok(stats)
    }
}

fn set_changeset_id<'a>(cs: &mut XrefChangeset<'a>, col: IdColumn, value: &'a str) {
    match col {
        IdColumn::InventoryId => cs.inventory_id = Some(value),
        IdColumn::MarketplaceId => cs.marketplace_id = Some(value),
        IdColumn::AnalyticsId => cs.analytics_id = Some(value),
        IdColumn::MarketplaceSku => cs.marketplace_sku = Some(value),
    }
}

/// Follows `superseded_by` to the live record.
pub(super) fn live_root(conn: &mut SqliteConnection, mut rec: XrefRecord) -> QueryResult<XrefRecord> {
    for _ in 0..MAX_SUPERSEDE_HOPS {
        let Some(next) = rec.superseded_by else {
            return Ok(rec);
        };
        rec = px::product_xref
            .find(next)
            .select(XrefRecord::as_select())
            .first(conn)?;
    }
    warn!(id = rec.id, "superseded chain too long, serving last hop");
    Ok(rec)
}

fn map_write_err(e: diesel::result::Error) -> LedgerError {
    match unique_violation(&e) {
        Some(msg) => LedgerError::Conflict(msg),
        None => LedgerError::Database(e),
    }
}
