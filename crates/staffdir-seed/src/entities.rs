//! Natural-key seeders for trades, regions, agencies, and compliance records.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use staffdir_core::{slugify, IdMap, NewAgency, NewComplianceRecord, NewRegion, NewTrade, Table};
use staffdir_storage::{Select, Store, StoreError};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{AgencyFixture, ReferenceCatalog};
use crate::links::{closest_match, insert_missing_pairs, LinkSeed, PairCandidate};
use crate::{ReferenceKind, SeedError, UnresolvedReference};

/// Result of reconciling one entity table against the catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntitySeed {
    /// Natural key to stored id, covering created and pre-existing rows.
    pub ids: IdMap,
    pub created: usize,
    pub skipped: usize,
    pub unresolved: Vec<UnresolvedReference>,
}

pub(crate) fn to_row<T: Serialize>(table: Table, row: &T) -> Result<JsonValue, SeedError> {
    serde_json::to_value(row).map_err(|e| SeedError::StoreOperation {
        table,
        operation: "encode",
        source: StoreError::Decode {
            table: table.name().to_string(),
            message: e.to_string(),
        },
    })
}

/// `(natural key, id)` pairs out of rows returned by the store.
fn keyed_ids(table: Table, key_column: &str, rows: Vec<JsonValue>) -> Result<IdMap, SeedError> {
    rows.into_iter()
        .map(|row| {
            let key = row.get(key_column).and_then(JsonValue::as_str);
            let id = row
                .get("id")
                .and_then(JsonValue::as_str)
                .and_then(|s| Uuid::parse_str(s).ok());
            match (key, id) {
                (Some(key), Some(id)) => Ok((key.to_string(), id)),
                _ => Err(SeedError::StoreOperation {
                    table,
                    operation: "decode",
                    source: StoreError::Decode {
                        table: table.name().to_string(),
                        message: format!("row without a usable id/{key_column}: {row}"),
                    },
                }),
            }
        })
        .collect()
}

/// Insert the candidates whose natural key is not stored yet, one batch at a
/// time, and map every candidate key to its id. Candidates are keyed, so a key
/// can only be attempted once.
pub(crate) async fn seed_by_natural_key(
    store: &dyn Store,
    table: Table,
    key_column: &'static str,
    candidates: BTreeMap<String, JsonValue>,
    batch_size: usize,
) -> Result<EntitySeed, SeedError> {
    let span = info_span!("seed_entities", table = %table, candidates = candidates.len());
    async move {
        let keys: Vec<&String> = candidates.keys().collect();
        let returning = format!("id,{key_column}");
        let mut seed = EntitySeed::default();

        for batch in keys.chunks(batch_size.max(1)) {
            let existing = store
                .select(
                    table,
                    &Select::columns(&returning).in_list(key_column, batch.iter()),
                )
                .await
                .map_err(SeedError::store(table, "select"))?;
            let existing = keyed_ids(table, key_column, existing.data)?;

            let missing: Vec<JsonValue> = batch
                .iter()
                .filter(|key| !existing.contains_key(key.as_str()))
                .filter_map(|key| candidates.get(*key).cloned())
                .collect();
            seed.skipped += batch.len() - missing.len();

            if !missing.is_empty() {
                let inserted = store
                    .insert(table, missing, &returning)
                    .await
                    .map_err(SeedError::store(table, "insert"))?;
                let inserted = keyed_ids(table, key_column, inserted)?;
                seed.created += inserted.len();
                seed.ids.extend(inserted);
            }
            seed.ids.extend(existing);
            debug!(batch = batch.len(), mapped = seed.ids.len(), "batch reconciled");
        }

        info!(created = seed.created, skipped = seed.skipped, "seeded {table}");
        Ok(seed)
    }
    .instrument(span)
    .await
}

pub async fn seed_trades(
    store: &dyn Store,
    catalog: &ReferenceCatalog,
    batch_size: usize,
) -> Result<EntitySeed, SeedError> {
    let mut candidates = BTreeMap::new();
    for name in catalog.trade_names() {
        let row = to_row(Table::Trades, &NewTrade::from_name(&name))?;
        candidates.insert(name, row);
    }
    seed_by_natural_key(store, Table::Trades, "name", candidates, batch_size).await
}

/// Regions are keyed by state code and named after the state table's
/// spelling. State names without a code are reported and left out rather than
/// inserted with an empty code.
pub async fn seed_regions(
    store: &dyn Store,
    catalog: &ReferenceCatalog,
    batch_size: usize,
) -> Result<EntitySeed, SeedError> {
    let mut candidates = BTreeMap::new();
    let mut unresolved = Vec::new();
    for name in catalog.region_names() {
        match catalog.state_entry(&name) {
            Some((display_name, code)) => {
                if !candidates.contains_key(code) {
                    let row = to_row(Table::Regions, &NewRegion::new(display_name, code))?;
                    candidates.insert(code.to_string(), row);
                }
            }
            None => {
                let reference = UnresolvedReference {
                    kind: ReferenceKind::StateName,
                    suggestion: closest_match(&name, catalog.states.keys()),
                    natural_key: name,
                    agency: None,
                };
                warn!(%reference, "skipping region without a state code");
                unresolved.push(reference);
            }
        }
    }
    let mut seed =
        seed_by_natural_key(store, Table::Regions, "state_code", candidates, batch_size).await?;
    seed.unresolved = unresolved;
    Ok(seed)
}

fn new_agency(fixture: &AgencyFixture, now: chrono::DateTime<Utc>) -> NewAgency {
    NewAgency {
        name: fixture.name.clone(),
        slug: slugify(&fixture.name),
        description: fixture.description.clone(),
        logo_url: fixture.logo_url.clone(),
        website: fixture.website.clone(),
        phone: fixture.phone.clone(),
        email: fixture.email.clone(),
        is_claimed: false,
        is_active: true,
        offers_per_diem: fixture.offers_per_diem,
        is_union: fixture.is_union,
        founded_year: fixture.founded_year,
        employee_count: fixture.employee_count.clone(),
        headquarters: fixture.headquarters.clone(),
        created_at: now,
        updated_at: now,
    }
}

pub async fn seed_agencies(
    store: &dyn Store,
    catalog: &ReferenceCatalog,
    batch_size: usize,
) -> Result<EntitySeed, SeedError> {
    let now = Utc::now();
    let mut candidates = BTreeMap::new();
    for fixture in &catalog.agencies {
        if candidates.contains_key(&fixture.name) {
            continue;
        }
        let row = to_row(Table::Agencies, &new_agency(fixture, now))?;
        candidates.insert(fixture.name.clone(), row);
    }
    seed_by_natural_key(store, Table::Agencies, "name", candidates, batch_size).await
}

/// Compliance rows keyed by `(agency_id, compliance_type)`.
pub async fn seed_compliance(
    store: &dyn Store,
    catalog: &ReferenceCatalog,
    agency_ids: &IdMap,
    batch_size: usize,
) -> Result<LinkSeed, SeedError> {
    let mut candidates = Vec::new();
    let mut unresolved = Vec::new();
    for fixture in &catalog.agencies {
        let Some(agency_id) = agency_ids.get(&fixture.name).copied() else {
            for record in &fixture.compliance {
                let reference = UnresolvedReference {
                    kind: ReferenceKind::Agency,
                    natural_key: fixture.name.clone(),
                    agency: None,
                    suggestion: closest_match(&fixture.name, agency_ids.keys()),
                };
                warn!(%reference, compliance_type = %record.compliance_type, "skipping compliance record");
                unresolved.push(reference);
            }
            continue;
        };
        for record in &fixture.compliance {
            let row = NewComplianceRecord {
                agency_id,
                compliance_type: record.compliance_type.clone(),
                is_active: true,
                is_verified: record.is_verified,
                expiration_date: record.expiration_date,
            };
            candidates.push(PairCandidate {
                agency_id,
                other: record.compliance_type.clone(),
                row: to_row(Table::AgencyCompliance, &row)?,
            });
        }
    }

    let mut seed = insert_missing_pairs(
        store,
        Table::AgencyCompliance,
        "compliance_type",
        candidates,
        batch_size,
    )
    .await?;
    seed.unresolved = unresolved;
    Ok(seed)
}
