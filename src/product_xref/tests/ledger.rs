use chrono::{Duration, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use product_xref::cancel::CancelToken;
use product_xref::ledger::{
    CachedAttributes, IdColumn, Identifiers, Ledger, LedgerError, SourceItem, SourceKind,
};
use product_xref::mapping::{MappingStore, NewSkuMapping};
use product_xref::models::xref::SyncStatus;
use product_xref::schema::catalog_link;
use product_xref::sync_errors::{ResolvedFilter, SyncErrorLog};
use product_xref::tz;
use serde_json::json;

mod common;

#[test]
fn upsert_is_idempotent_and_found_by_any_identifier() {
    let (_db, mut conn) = common::setup_db();
    common::assert_sqlite_pragmas(&mut conn);

    let ids = Identifiers::inventory("INV-1").with(IdColumn::MarketplaceSku, "SKU-9");
    let first = Ledger::upsert(&mut conn, &ids, &CachedAttributes::default()).unwrap();
    let again = Ledger::upsert(&mut conn, &ids, &CachedAttributes::named("Blue Mug")).unwrap();
    assert_eq!(first, again);
    assert_eq!(common::count(&mut conn, "product_xref"), 1);

    let by_sku = Ledger::find_by_any(&mut conn, " SKU-9 ").unwrap().expect("by sku");
    assert_eq!(by_sku.id, first);
    assert_eq!(by_sku.name.as_deref(), Some("Blue Mug"));
    assert_eq!(by_sku.status(), SyncStatus::Pending);

    assert!(Ledger::find_by_any(&mut conn, "missing").unwrap().is_none());
    assert!(Ledger::find_by_any(&mut conn, "   ").unwrap().is_none());
}

#[test]
fn upsert_adds_identifiers_but_refuses_to_overwrite_them() {
    let (_db, mut conn) = common::setup_db();

    let id = Ledger::upsert(
        &mut conn,
        &Identifiers::inventory("INV-1"),
        &CachedAttributes::default(),
    )
    .unwrap();
    let same = Ledger::upsert(
        &mut conn,
        &Identifiers::inventory("INV-1").with(IdColumn::MarketplaceId, "M-1"),
        &CachedAttributes::default(),
    )
    .unwrap();
    assert_eq!(id, same);

    let err = Ledger::upsert(
        &mut conn,
        &Identifiers::inventory("INV-1").with(IdColumn::MarketplaceId, "M-2"),
        &CachedAttributes::default(),
    )
    .unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)), "{err:?}");

    let rec = Ledger::find_by_id(&mut conn, id).unwrap().unwrap();
    assert_eq!(rec.marketplace_id.as_deref(), Some("M-1"));
    assert!(Ledger::find_by_any(&mut conn, "M-2").unwrap().is_none());

    assert!(matches!(
        Ledger::upsert(&mut conn, &Identifiers::inventory("  "), &CachedAttributes::default()),
        Err(LedgerError::NoIdentifiers)
    ));
}

#[test]
fn identifier_columns_are_unique_at_the_schema_level() {
    let (_db, mut conn) = common::setup_db();
    Ledger::upsert(&mut conn, &Identifiers::analytics("A-1"), &CachedAttributes::default()).unwrap();

    let now = tz::now_string();
    let err = diesel::sql_query(
        "INSERT INTO product_xref (analytics_id, created_at, updated_at) VALUES ('A-1', ?, ?)",
    )
    .bind::<diesel::sql_types::Text, _>(&now)
    .bind::<diesel::sql_types::Text, _>(&now)
    .execute(&mut conn)
    .unwrap_err();
    assert!(matches!(
        err,
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    ));
}

#[test]
fn upsert_spanning_two_records_merges_into_the_oldest() {
    let (_db, mut conn) = common::setup_db();

    let older = Ledger::upsert(&mut conn, &Identifiers::inventory("INV-7"), &CachedAttributes::default())
        .unwrap();
    let newer = Ledger::upsert(
        &mut conn,
        &Identifiers::marketplace("M-7"),
        &CachedAttributes::named("Desk Lamp").with_brand("Lumo"),
    )
    .unwrap();
    assert!(Ledger::update_cached_name(&mut conn, "M-7", "Desk Lamp", None).unwrap());
    Ledger::link_to_canonical(&mut conn, newer, "CAT-7").unwrap();
    let mapping = MappingStore::save(
        &mut conn,
        &NewSkuMapping::new(newer, "EXT-7", "shopify", 0.8, "fuzzy_name"),
    )
    .unwrap();

    let merged = Ledger::upsert(
        &mut conn,
        &Identifiers::inventory("INV-7").with(IdColumn::MarketplaceId, "M-7"),
        &CachedAttributes::default(),
    )
    .unwrap();
    assert_eq!(merged, older);

    let survivor = Ledger::find_by_id(&mut conn, older).unwrap().unwrap();
    assert_eq!(survivor.inventory_id.as_deref(), Some("INV-7"));
    assert_eq!(survivor.marketplace_id.as_deref(), Some("M-7"));
    assert_eq!(survivor.name.as_deref(), Some("Desk Lamp"));
    assert_eq!(survivor.brand.as_deref(), Some("Lumo"));
    assert_eq!(survivor.status(), SyncStatus::Synced);
    assert!(survivor.last_successful_sync.is_some());

    // the merged-away id redirects
    assert_eq!(Ledger::find_by_id(&mut conn, newer).unwrap().unwrap().id, older);
    assert_eq!(Ledger::find_by_any(&mut conn, "M-7").unwrap().unwrap().id, older);

    let linked: i32 = catalog_link::table
        .filter(catalog_link::external_sku.eq("CAT-7"))
        .select(catalog_link::xref_id)
        .first(&mut conn)
        .unwrap();
    assert_eq!(linked, older);
    assert_eq!(
        MappingStore::find_by_id(&mut conn, mapping).unwrap().unwrap().master_id,
        older
    );

    let stats = Ledger::statistics(&mut conn).unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.superseded, 1);
    assert_eq!(stats.synced, 1);
    assert!(MappingStore::find_orphaned(&mut conn).unwrap().is_empty());
}

#[test]
fn survivor_with_real_name_keeps_it_on_merge() {
    let (_db, mut conn) = common::setup_db();

    let older = Ledger::upsert(
        &mut conn,
        &Identifiers::inventory("INV-8"),
        &CachedAttributes::named("Oak Chair"),
    )
    .unwrap();
    Ledger::upsert(
        &mut conn,
        &Identifiers::analytics("AN-8"),
        &CachedAttributes::named("Chair (analytics)").with_brand("Woodco"),
    )
    .unwrap();

    Ledger::upsert(
        &mut conn,
        &Identifiers::inventory("INV-8").with(IdColumn::AnalyticsId, "AN-8"),
        &CachedAttributes::default(),
    )
    .unwrap();

    let rec = Ledger::find_by_id(&mut conn, older).unwrap().unwrap();
    assert_eq!(rec.name.as_deref(), Some("Oak Chair"));
    assert_eq!(rec.brand.as_deref(), Some("Woodco"));
    assert_eq!(rec.analytics_id.as_deref(), Some("AN-8"));
}

#[test]
fn cached_name_and_status_updates() {
    let (_db, mut conn) = common::setup_db();
    let id = Ledger::upsert(&mut conn, &Identifiers::marketplace("M-1"), &CachedAttributes::default())
        .unwrap();

    assert!(matches!(
        Ledger::update_cached_name(&mut conn, "M-1", "   ", None),
        Err(LedgerError::BlankName)
    ));
    assert!(!Ledger::update_cached_name(&mut conn, "nope", "Name", None).unwrap());

    assert!(Ledger::update_cached_name(&mut conn, "M-1", "  Steel   Kettle ", Some("Brewer")).unwrap());
    let rec = Ledger::find_by_id(&mut conn, id).unwrap().unwrap();
    assert_eq!(rec.name.as_deref(), Some("Steel Kettle"));
    assert_eq!(rec.brand.as_deref(), Some("Brewer"));
    assert_eq!(rec.status(), SyncStatus::Synced);

    assert!(Ledger::update_sync_status(&mut conn, "M-1", SyncStatus::Failed).unwrap());
    let rec = Ledger::find_by_id(&mut conn, id).unwrap().unwrap();
    assert_eq!(rec.status(), SyncStatus::Failed);
    assert_eq!(rec.name.as_deref(), Some("Steel Kettle"));
    assert!(!Ledger::update_sync_status(&mut conn, "nope", SyncStatus::Synced).unwrap());
}

#[test]
fn link_to_canonical_moves_existing_links() {
    let (_db, mut conn) = common::setup_db();
    let a = Ledger::upsert(&mut conn, &Identifiers::inventory("A"), &CachedAttributes::default()).unwrap();
    let b = Ledger::upsert(&mut conn, &Identifiers::inventory("B"), &CachedAttributes::default()).unwrap();

    Ledger::link_to_canonical(&mut conn, a, "CAT-1").unwrap();
    Ledger::link_to_canonical(&mut conn, b, "CAT-1").unwrap();
    assert_eq!(common::count(&mut conn, "catalog_link"), 1);
    let linked: i32 = catalog_link::table
        .select(catalog_link::xref_id)
        .first(&mut conn)
        .unwrap();
    assert_eq!(linked, b);

    assert!(matches!(
        Ledger::link_to_canonical(&mut conn, 9_999, "CAT-2"),
        Err(LedgerError::UnknownRecord(9_999))
    ));
}

#[test]
fn bulk_registration_is_idempotent_and_skips_invalid_ids() {
    let (_db, mut conn) = common::setup_db();
    let items = vec![
        SourceItem::new(1).named("Pencil"),
        SourceItem::new("1"),
        SourceItem::new(json!(2.0)),
        SourceItem::new(""),
        SourceItem::new(0),
    ];

    let first = Ledger::bulk_register_from_source(
        &mut conn,
        SourceKind::Inventory,
        &items,
        None,
        &CancelToken::never(),
    )
    .unwrap();
    assert_eq!(first.scanned, 5);
    assert_eq!(first.created, 2);
    assert_eq!(first.already_present, 1);
    assert_eq!(first.skipped_invalid, 2);
    assert!(!first.interrupted);

    let second = Ledger::bulk_register_from_source(
        &mut conn,
        SourceKind::Inventory,
        &items,
        None,
        &CancelToken::never(),
    )
    .unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.already_present, 3);
    assert_eq!(common::count(&mut conn, "product_xref"), 2);

    let pencil = Ledger::find_by_any(&mut conn, "1").unwrap().unwrap();
    assert_eq!(pencil.name.as_deref(), Some("Pencil"));
    assert!(Ledger::find_by_any(&mut conn, "2").unwrap().is_some());

    let cps = Ledger::checkpoints(&mut conn).unwrap();
    assert_eq!(cps.len(), 1);
    assert_eq!(cps[0].component, "inventory");
    assert_eq!(cps[0].last_outcome, "ok");
    assert!(cps[0].last_success_at.is_some());

    let limited = Ledger::bulk_register_from_source(
        &mut conn,
        SourceKind::Analytics,
        &items,
        Some(1),
        &CancelToken::never(),
    )
    .unwrap();
    assert_eq!(limited.scanned, 1);
    assert_eq!(limited.created, 1);
}

#[test]
fn cancelled_bulk_registration_keeps_previous_success() {
    let (_db, mut conn) = common::setup_db();
    let items = vec![SourceItem::new("M-1"), SourceItem::new("M-2")];

    Ledger::bulk_register_from_source(
        &mut conn,
        SourceKind::Marketplace,
        &items[..1],
        None,
        &CancelToken::never(),
    )
    .unwrap();
    let before = Ledger::checkpoints(&mut conn).unwrap()[0].last_success_at.clone();

    let (handle, token) = CancelToken::new();
    handle.cancel();
    let report = Ledger::bulk_register_from_source(
        &mut conn,
        SourceKind::Marketplace,
        &items,
        None,
        &token,
    )
    .unwrap();
    assert!(report.interrupted);
    assert_eq!(report.scanned, 0);
    assert_eq!(common::count(&mut conn, "product_xref"), 1);

    let cp = &Ledger::checkpoints(&mut conn).unwrap()[0];
    assert_eq!(cp.last_outcome, "failed");
    assert_eq!(cp.last_success_at, before);
}

#[test]
fn failing_row_is_logged_and_the_batch_continues() {
    let (_db, mut conn) = common::setup_db();
    common::fail_writes_when(&mut conn, "product_xref", "INSERT", "NEW.inventory_id = 'BAD'");
    let items = vec![SourceItem::new("A"), SourceItem::new("BAD"), SourceItem::new("C")];

    let report = Ledger::bulk_register_from_source(
        &mut conn,
        SourceKind::Inventory,
        &items,
        None,
        &CancelToken::never(),
    )
    .unwrap();
    assert_eq!(report.scanned, 3);
    assert_eq!(report.created, 2);
    assert_eq!(report.failed, 1);
    assert!(!report.interrupted);
    assert!(Ledger::find_by_any(&mut conn, "C").unwrap().is_some());
    assert!(Ledger::find_by_any(&mut conn, "BAD").unwrap().is_none());

    let errors = SyncErrorLog::list_recent(&mut conn, 10, ResolvedFilter::All).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].operation, "bulk_register_from_source");
    assert_eq!(errors[0].attempts, 1);
    let ctx: serde_json::Value = serde_json::from_str(&errors[0].context).unwrap();
    assert_eq!(ctx["identifier"], "BAD");

    let cp = &Ledger::checkpoints(&mut conn).unwrap()[0];
    assert_eq!(cp.component, "inventory");
    assert_eq!(cp.last_outcome, "failed");
    assert_eq!(cp.last_success_at, None);
}

#[test]
fn statistics_count_real_names_and_stale_demotion() {
    let (_db, mut conn) = common::setup_db();

    let empty = Ledger::statistics(&mut conn).unwrap();
    assert_eq!(empty.total, 0);
    assert_eq!(empty.synced_pct, 0.0);

    let a = Ledger::upsert(&mut conn, &Identifiers::inventory("A"), &CachedAttributes::default())
        .unwrap();
    Ledger::upsert(&mut conn, &Identifiers::inventory("B"), &CachedAttributes::default()).unwrap();
    Ledger::upsert(
        &mut conn,
        &Identifiers::inventory("C"),
        &CachedAttributes::named("Unknown Product"),
    )
    .unwrap();
    Ledger::update_cached_name(&mut conn, "A", "Apple Crate", None).unwrap();
    Ledger::update_cached_name(&mut conn, "B", "Banana Box", None).unwrap();

    let stats = Ledger::statistics(&mut conn).unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.synced, 2);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.real_names, 2);
    assert!((stats.real_name_pct - 200.0 / 3.0).abs() < 1e-9);
    assert!(stats.last_successful_sync.is_some());

    common::backdate_sync(&mut conn, a, "2020-01-01T00:00:00.000Z");
    let demoted = Ledger::demote_stale(&mut conn, Utc::now() - Duration::hours(1)).unwrap();
    assert_eq!(demoted, 1);

    let rec = Ledger::find_by_id(&mut conn, a).unwrap().unwrap();
    assert_eq!(rec.status(), SyncStatus::Pending);
    assert_eq!(rec.name.as_deref(), Some("Apple Crate"));

    let stats = Ledger::statistics(&mut conn).unwrap();
    assert_eq!(stats.synced, 1);
    assert_eq!(stats.pending, 2);
}
