use chrono::{Duration, Utc};
use product_xref::cancel::CancelToken;
use product_xref::ledger::{CachedAttributes, Identifiers, Ledger};
use product_xref::mapping::{MappingError, MappingStore, NewSkuMapping, SearchFilters};
use product_xref::models::mapping::VerificationStatus;
use product_xref::sync_errors::{ResolvedFilter, SyncErrorLog};

mod common;

fn master(conn: &mut diesel::SqliteConnection, inv: &str) -> i32 {
    Ledger::upsert(conn, &Identifiers::inventory(inv), &CachedAttributes::default()).unwrap()
}

#[test]
fn save_refreshes_match_data_without_touching_verification() {
    let (_db, mut conn) = common::setup_db();
    let m1 = master(&mut conn, "INV-1");
    let m2 = master(&mut conn, "INV-2");

    let id = MappingStore::save(
        &mut conn,
        &NewSkuMapping::new(m1, " EXT-1 ", "shopify", 0.97, "exact_sku"),
    )
    .unwrap();
    MappingStore::approve_manual(&mut conn, id, "ops@example.com").unwrap();

    let mut resync = NewSkuMapping::new(m2, "EXT-1", "shopify", 0.61, "fuzzy_name");
    resync.notes = Some("re-matched".into());
    let again = MappingStore::save(&mut conn, &resync).unwrap();
    assert_eq!(again, id);
    assert_eq!(common::count(&mut conn, "sku_mapping"), 1);

    let row = MappingStore::find_by_id(&mut conn, id).unwrap().unwrap();
    assert_eq!(row.master_id, m2);
    assert_eq!(row.external_sku, "EXT-1");
    assert_eq!(row.confidence_score, 0.61);
    assert_eq!(row.match_method, "fuzzy_name");
    assert_eq!(row.notes.as_deref(), Some("re-matched"));
    assert_eq!(row.status(), VerificationStatus::Manual);
    assert_eq!(row.verified_by.as_deref(), Some("ops@example.com"));

    let by_id = MappingStore::save(
        &mut conn,
        &NewSkuMapping::new(m1, "EXT-1B", "shopify", 0.5, "manual").with_id(id),
    )
    .unwrap();
    assert_eq!(by_id, id);
    assert!(MappingStore::find_by_external_sku(&mut conn, "EXT-1", None).unwrap().is_empty());
}

#[test]
fn strict_insert_and_validation_errors() {
    let (_db, mut conn) = common::setup_db();
    let m = master(&mut conn, "INV-1");

    MappingStore::insert(&mut conn, &NewSkuMapping::new(m, "EXT-1", "amazon", 0.9, "exact")).unwrap();
    assert!(matches!(
        MappingStore::insert(&mut conn, &NewSkuMapping::new(m, "EXT-1", "amazon", 0.2, "exact")),
        Err(MappingError::Conflict(_))
    ));
    // same sku, other source is a different mapping
    MappingStore::insert(&mut conn, &NewSkuMapping::new(m, "EXT-1", "ebay", 0.9, "exact")).unwrap();

    assert!(matches!(
        MappingStore::save(&mut conn, &NewSkuMapping::new(m, "EXT-2", "amazon", 1.2, "exact")),
        Err(MappingError::InvalidConfidence(_))
    ));
    assert!(matches!(
        MappingStore::save(&mut conn, &NewSkuMapping::new(m, "  ", "amazon", 0.5, "exact")),
        Err(MappingError::Blank("external_sku"))
    ));
    assert!(matches!(
        MappingStore::save(&mut conn, &NewSkuMapping::new(m, "EXT-2", " ", 0.5, "exact")),
        Err(MappingError::Blank("source"))
    ));

    let both = MappingStore::find_by_external_sku(&mut conn, "EXT-1", None).unwrap();
    assert_eq!(both.len(), 2);
    let one = MappingStore::find_by_external_sku(&mut conn, "EXT-1", Some("ebay")).unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(MappingStore::find_by_master_id(&mut conn, m).unwrap().len(), 2);
    assert_eq!(
        MappingStore::find_by_source(&mut conn, "amazon", Some(VerificationStatus::Pending), 10)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn verification_transitions() {
    let (_db, mut conn) = common::setup_db();
    let m = master(&mut conn, "INV-1");
    let low = MappingStore::save(&mut conn, &NewSkuMapping::new(m, "L", "amazon", 0.4, "fuzzy")).unwrap();
    let high = MappingStore::save(&mut conn, &NewSkuMapping::new(m, "H", "amazon", 0.96, "exact")).unwrap();

    match MappingStore::approve_auto(&mut conn, low, 0.95, "bot") {
        Err(MappingError::BelowThreshold { id, threshold, .. }) => {
            assert_eq!(id, low);
            assert_eq!(threshold, 0.95);
        }
        other => panic!("expected BelowThreshold, got {other:?}"),
    }
    MappingStore::approve_auto(&mut conn, high, 0.95, "bot").unwrap();
    let row = MappingStore::find_by_id(&mut conn, high).unwrap().unwrap();
    assert_eq!(row.status(), VerificationStatus::Auto);
    assert_eq!(row.verified_by.as_deref(), Some("bot"));
    assert!(row.verified_at.is_some());

    assert!(matches!(
        MappingStore::approve_manual(&mut conn, high, "ops"),
        Err(MappingError::IllegalTransition {
            from: VerificationStatus::Auto,
            to: VerificationStatus::Manual,
            ..
        })
    ));

    MappingStore::reject(&mut conn, high, "ops", Some("wrong colour")).unwrap();
    let row = MappingStore::find_by_id(&mut conn, high).unwrap().unwrap();
    assert_eq!(row.status(), VerificationStatus::Rejected);
    assert_eq!(row.notes.as_deref(), Some("wrong colour"));

    assert!(matches!(
        MappingStore::approve_manual(&mut conn, high, "ops"),
        Err(MappingError::IllegalTransition {
            from: VerificationStatus::Rejected,
            ..
        })
    ));
    assert!(matches!(
        MappingStore::reject(&mut conn, high, "ops", None),
        Err(MappingError::IllegalTransition { .. })
    ));
    assert!(matches!(
        MappingStore::reject(&mut conn, 9_999, "ops", None),
        Err(MappingError::NotFound(9_999))
    ));
    assert!(matches!(
        MappingStore::approve_manual(&mut conn, low, "  "),
        Err(MappingError::Blank(_))
    ));
}

#[test]
fn bulk_approval_never_resurrects_rejected_mappings() {
    let (_db, mut conn) = common::setup_db();
    let m = master(&mut conn, "INV-1");
    let a = MappingStore::save(&mut conn, &NewSkuMapping::new(m, "A", "amazon", 0.99, "exact")).unwrap();
    let b = MappingStore::save(&mut conn, &NewSkuMapping::new(m, "B", "amazon", 0.97, "exact")).unwrap();
    let c = MappingStore::save(&mut conn, &NewSkuMapping::new(m, "C", "amazon", 0.50, "fuzzy")).unwrap();
    MappingStore::reject(&mut conn, b, "ops", Some("bundle, not single item")).unwrap();

    let pending = MappingStore::find_high_confidence_pending(&mut conn, 0.95, 10).unwrap();
    assert_eq!(pending.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a]);

    let report =
        MappingStore::bulk_approve_by_confidence(&mut conn, 0.95, "auto-approver", &CancelToken::never())
            .unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(report.approved, 1);
    assert!(!report.interrupted);

    let status = |conn: &mut diesel::SqliteConnection, id| {
        MappingStore::find_by_id(conn, id).unwrap().unwrap().status()
    };
    assert_eq!(status(&mut conn, a), VerificationStatus::Auto);
    assert_eq!(status(&mut conn, b), VerificationStatus::Rejected);
    assert_eq!(status(&mut conn, c), VerificationStatus::Pending);

    // a re-sync of the rejected row keeps it rejected, and bulk approval still skips it
    MappingStore::save(&mut conn, &NewSkuMapping::new(m, "B", "amazon", 1.0, "exact")).unwrap();
    let again =
        MappingStore::bulk_approve_by_confidence(&mut conn, 0.95, "auto-approver", &CancelToken::never())
            .unwrap();
    assert_eq!(again.approved, 0);
    assert_eq!(status(&mut conn, b), VerificationStatus::Rejected);

    assert!(matches!(
        MappingStore::bulk_approve_by_confidence(&mut conn, 1.5, "x", &CancelToken::never()),
        Err(MappingError::InvalidConfidence(_))
    ));
}

#[test]
fn cancelled_bulk_approval_stops_before_writing() {
    let (_db, mut conn) = common::setup_db();
    let m = master(&mut conn, "INV-1");
    MappingStore::save(&mut conn, &NewSkuMapping::new(m, "A", "amazon", 0.99, "exact")).unwrap();

    let (handle, token) = CancelToken::new();
    handle.cancel();
    let report = MappingStore::bulk_approve_by_confidence(&mut conn, 0.9, "bot", &token).unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(report.approved, 0);
    assert!(report.interrupted);
}

#[test]
fn bulk_approval_continues_past_a_failing_row() {
    let (_db, mut conn) = common::setup_db();
    let m = master(&mut conn, "INV-1");
    let a = MappingStore::save(&mut conn, &NewSkuMapping::new(m, "A", "amazon", 0.99, "exact")).unwrap();
    let b = MappingStore::save(&mut conn, &NewSkuMapping::new(m, "B", "amazon", 0.97, "exact")).unwrap();
    common::fail_writes_when(
        &mut conn,
        "sku_mapping",
        "UPDATE",
        "NEW.external_sku = 'A' AND NEW.verification_status = 'auto'",
    );

    let report =
        MappingStore::bulk_approve_by_confidence(&mut conn, 0.95, "bot", &CancelToken::never()).unwrap();
    assert_eq!(report.candidates, 2);
    assert_eq!(report.approved, 1);
    assert_eq!(report.failed, 1);
    assert!(!report.interrupted);

    let status = |conn: &mut diesel::SqliteConnection, id| {
        MappingStore::find_by_id(conn, id).unwrap().unwrap().verification_status
    };
    assert_eq!(status(&mut conn, a), VerificationStatus::Pending.as_str());
    assert_eq!(status(&mut conn, b), VerificationStatus::Auto.as_str());

    let errors = SyncErrorLog::list_recent(&mut conn, 10, ResolvedFilter::All).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].operation, "bulk_approve_by_confidence");
    let ctx: serde_json::Value = serde_json::from_str(&errors[0].context).unwrap();
    assert_eq!(ctx["mapping_id"], a);
}

#[test]
fn search_combines_filters() {
    let (_db, mut conn) = common::setup_db();
    let m1 = master(&mut conn, "INV-1");
    let m2 = master(&mut conn, "INV-2");
    MappingStore::save(&mut conn, &NewSkuMapping::new(m1, "MUG-RED", "amazon", 0.92, "exact")).unwrap();
    MappingStore::save(&mut conn, &NewSkuMapping::new(m1, "MUG-BLUE", "ebay", 0.55, "fuzzy")).unwrap();
    MappingStore::save(&mut conn, &NewSkuMapping::new(m2, "PLATE_1", "amazon", 0.75, "fuzzy")).unwrap();

    let all = MappingStore::search(&mut conn, &SearchFilters::default(), 100, 0).unwrap();
    assert_eq!(all.len(), 3);

    let mugs = SearchFilters {
        external_sku_contains: Some("MUG".into()),
        min_confidence: Some(0.6),
        ..Default::default()
    };
    let hits = MappingStore::search(&mut conn, &mugs, 100, 0).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].external_sku, "MUG-RED");

    // `_` is literal, not a wildcard
    let underscore = SearchFilters {
        external_sku_contains: Some("E_1".into()),
        ..Default::default()
    };
    let hits = MappingStore::search(&mut conn, &underscore, 100, 0).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].external_sku, "PLATE_1");

    let by_master = SearchFilters {
        master_id: Some(m1),
        source: Some("ebay".into()),
        status: Some(VerificationStatus::Pending),
        ..Default::default()
    };
    assert_eq!(MappingStore::search(&mut conn, &by_master, 100, 0).unwrap().len(), 1);

    let future = SearchFilters {
        created_from: Some(Utc::now() + Duration::days(1)),
        ..Default::default()
    };
    assert!(MappingStore::search(&mut conn, &future, 100, 0).unwrap().is_empty());

    let window = SearchFilters {
        created_from: Some(Utc::now() - Duration::days(1)),
        created_to: Some(Utc::now() + Duration::days(1)),
        ..Default::default()
    };
    let page = MappingStore::search(&mut conn, &window, 2, 1).unwrap();
    assert_eq!(page.len(), 2);
}

#[test]
fn statistics_overall_and_per_source() {
    let (_db, mut conn) = common::setup_db();

    let empty = MappingStore::statistics(&mut conn).unwrap();
    assert_eq!(empty.total, 0);
    assert_eq!(empty.avg_confidence, None);
    assert_eq!(empty.verified_pct, 0.0);

    let m = master(&mut conn, "INV-1");
    let a = MappingStore::save(&mut conn, &NewSkuMapping::new(m, "A", "amazon", 0.95, "exact")).unwrap();
    let b = MappingStore::save(&mut conn, &NewSkuMapping::new(m, "B", "amazon", 0.8, "fuzzy")).unwrap();
    MappingStore::save(&mut conn, &NewSkuMapping::new(m, "C", "ebay", 0.6, "fuzzy")).unwrap();
    MappingStore::save(&mut conn, &NewSkuMapping::new(m, "D", "ebay", 0.1, "fuzzy")).unwrap();
    MappingStore::approve_auto(&mut conn, a, 0.9, "bot").unwrap();
    MappingStore::reject(&mut conn, b, "ops", None).unwrap();

    let stats = MappingStore::statistics(&mut conn).unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!((stats.pending, stats.auto, stats.manual, stats.rejected), (2, 1, 0, 1));
    assert_eq!(stats.verified_pct, 25.0);
    assert_eq!(stats.pending_pct, 50.0);
    assert!((stats.avg_confidence.unwrap() - 0.6125).abs() < 1e-9);
    assert_eq!(
        (stats.tiers.high, stats.tiers.medium, stats.tiers.low, stats.tiers.very_low),
        (1, 1, 1, 1)
    );

    let by_source = MappingStore::statistics_by_source(&mut conn).unwrap();
    assert_eq!(by_source.keys().collect::<Vec<_>>(), vec!["amazon", "ebay"]);
    assert_eq!(by_source["amazon"].total, 2);
    assert_eq!(by_source["ebay"].pending, 2);
    assert_eq!(by_source["ebay"].tiers.very_low, 1);
}

#[test]
fn duplicates_and_orphans_are_reported() {
    let (_db, mut conn) = common::setup_db();
    let m = master(&mut conn, "INV-1");

    let a = MappingStore::save(&mut conn, &NewSkuMapping::new(m, "ABC-1", "Amazon", 0.9, "exact")).unwrap();
    let b = MappingStore::save(&mut conn, &NewSkuMapping::new(m, "abc-1", "amazon", 0.9, "exact")).unwrap();
    MappingStore::save(&mut conn, &NewSkuMapping::new(m, "XYZ", "amazon", 0.9, "exact")).unwrap();
    let orphan = MappingStore::save(&mut conn, &NewSkuMapping::new(4_242, "GONE", "amazon", 0.3, "fuzzy"))
        .unwrap();

    let dups = MappingStore::find_duplicates(&mut conn).unwrap();
    assert_eq!(dups.len(), 1);
    assert_eq!(dups[0].source, "amazon");
    assert_eq!(dups[0].external_sku, "abc-1");
    assert_eq!(dups[0].ids, vec![a, b]);

    let orphans = MappingStore::find_orphaned(&mut conn).unwrap();
    assert_eq!(orphans.iter().map(|o| o.id).collect::<Vec<_>>(), vec![orphan]);
    assert_eq!(MappingStore::count_orphaned(&mut conn).unwrap(), 1);
}
