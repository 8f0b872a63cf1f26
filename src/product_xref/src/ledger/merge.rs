//! Folding several live records into one.
//!
//! Runs inside the caller's immediate transaction. For each loser, oldest first:
//! - identifiers move onto the survivor's empty slots (cleared on the loser first,
//!   so the per-column UNIQUE indexes never see two holders);
//! - name and brand are adopted only when the survivor has no real name;
//! - `catalog_link` rows and `sku_mapping.master_id` values are re-pointed;
//! - the loser, and anything previously merged into it, gets `superseded_by`.

use diesel::prelude::*;
use tracing::info;

use crate::{
    ledger::IdColumn,
    models::xref::{SyncStatus, XrefRecord},
    placeholder::is_placeholder,
    schema::{catalog_link, product_xref::dsl as px, sku_mapping},
};

pub(super) fn merge_into(
    conn: &mut SqliteConnection,
    mut survivor: XrefRecord,
    losers: &[XrefRecord],
    now: &str,
) -> QueryResult<XrefRecord> {
    for loser in losers {
        debug_assert!(loser.id != survivor.id);

        let mut moved = Vec::new();
        for col in IdColumn::ALL {
            if survivor.identifier(col).is_some() {
                continue;
            }
            let Some(value) = loser.identifier(col) else {
                continue;
            };
            set_identifier(conn, loser.id, col, None)?;
            set_identifier(conn, survivor.id, col, Some(value))?;
            moved.push(col.name());
        }

        let survivor_has_real_name = survivor.name.as_deref().is_some_and(|n| !is_placeholder(n));
        let loser_has_real_name = loser.name.as_deref().is_some_and(|n| !is_placeholder(n));
        if !survivor_has_real_name && loser_has_real_name {
            diesel::update(px::product_xref.find(survivor.id))
                .set((px::name.eq(&loser.name), px::brand.eq(&loser.brand)))
                .execute(conn)?;
            if loser.status() == SyncStatus::Synced {
                diesel::update(px::product_xref.find(survivor.id))
                    .set((
                        px::sync_status.eq(SyncStatus::Synced.as_str()),
                        px::last_successful_sync.eq(&loser.last_successful_sync),
                    ))
                    .execute(conn)?;
            }
        } else if survivor.brand.is_none() && loser.brand.is_some() {
            diesel::update(px::product_xref.find(survivor.id))
                .set(px::brand.eq(&loser.brand))
                .execute(conn)?;
        }

        let links = diesel::update(catalog_link::table.filter(catalog_link::xref_id.eq(loser.id)))
            .set(catalog_link::xref_id.eq(survivor.id))
            .execute(conn)?;
        let mappings =
            diesel::update(sku_mapping::table.filter(sku_mapping::master_id.eq(loser.id)))
                .set(sku_mapping::master_id.eq(survivor.id))
                .execute(conn)?;

        diesel::update(
            px::product_xref.filter(
                px::id
                    .eq(loser.id)
                    .or(px::superseded_by.eq(loser.id)),
            ),
        )
        .set((px::superseded_by.eq(Some(survivor.id)), px::updated_at.eq(now)))
        .execute(conn)?;

        info!(
            survivor = survivor.id,
            merged = loser.id,
            moved = ?moved,
            links,
            mappings,
            "merged cross-reference records"
        );

        survivor = px::product_xref
            .find(survivor.id)
            .select(XrefRecord::as_select())
            .first(conn)?;
    }
    Ok(survivor)
}

fn set_identifier(
    conn: &mut SqliteConnection,
    id: i32,
    col: IdColumn,
    value: Option<&str>,
) -> QueryResult<usize> {
    let target = px::product_xref.find(id);
    match col {
        IdColumn::InventoryId => diesel::update(target).set(px::inventory_id.eq(value)).execute(conn),
        IdColumn::MarketplaceId => {
            diesel::update(target).set(px::marketplace_id.eq(value)).execute(conn)
        }
        IdColumn::AnalyticsId => diesel::update(target).set(px::analytics_id.eq(value)).execute(conn),
        IdColumn::MarketplaceSku => {
            diesel::update(target).set(px::marketplace_sku.eq(value)).execute(conn)
        }
    }
}
