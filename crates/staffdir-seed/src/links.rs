//! Junction-table linkers: agency–trade and agency–region.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use serde_json::Value as JsonValue;
use staffdir_core::{AgencyRegionLink, AgencyTradeLink, IdMap, Table};
use staffdir_storage::{Select, Store};
use strsim::jaro_winkler;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::ReferenceCatalog;
use crate::entities::to_row;
use crate::{ReferenceKind, SeedError, UnresolvedReference};

const SUGGESTION_THRESHOLD: f64 = 0.85;

/// Counts for a composite-key table (junctions and compliance records).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkSeed {
    pub created: usize,
    pub skipped: usize,
    pub unresolved: Vec<UnresolvedReference>,
}

/// A row keyed by `(agency_id, other)`.
#[derive(Debug, Clone)]
pub(crate) struct PairCandidate {
    pub agency_id: Uuid,
    pub other: String,
    pub row: JsonValue,
}

/// Closest known key by Jaro-Winkler similarity, for "did you mean" hints.
pub(crate) fn closest_match<'a>(
    needle: &str,
    haystack: impl IntoIterator<Item = &'a String>,
) -> Option<String> {
    let needle = needle.trim().to_lowercase();
    haystack
        .into_iter()
        .map(|candidate| (jaro_winkler(&needle, &candidate.to_lowercase()), candidate))
        .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, candidate)| candidate.clone())
}

fn text_field(row: &JsonValue, column: &str) -> Option<String> {
    match row.get(column)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Insert candidates whose `(agency_id, other_column)` pair is not stored yet.
/// Each batch checks existence by the batch's agency ids.
pub(crate) async fn insert_missing_pairs(
    store: &dyn Store,
    table: Table,
    other_column: &'static str,
    mut candidates: Vec<PairCandidate>,
    batch_size: usize,
) -> Result<LinkSeed, SeedError> {
    let span = info_span!("link_pairs", table = %table, candidates = candidates.len());
    async move {
        let mut seen = HashSet::new();
        candidates.retain(|c| seen.insert((c.agency_id, c.other.clone())));

        let columns = format!("agency_id,{other_column}");
        let mut seed = LinkSeed::default();
        for batch in candidates.chunks(batch_size.max(1)) {
            let agency_ids: BTreeSet<Uuid> = batch.iter().map(|c| c.agency_id).collect();
            let existing = store
                .select(table, &Select::columns(&columns).in_list("agency_id", &agency_ids))
                .await
                .map_err(SeedError::store(table, "select"))?;
            let existing: HashSet<(String, String)> = existing
                .data
                .iter()
                .filter_map(|row| Some((text_field(row, "agency_id")?, text_field(row, other_column)?)))
                .collect();

            let missing: Vec<JsonValue> = batch
                .iter()
                .filter(|c| !existing.contains(&(c.agency_id.to_string(), c.other.clone())))
                .map(|c| c.row.clone())
                .collect();
            seed.skipped += batch.len() - missing.len();

            if !missing.is_empty() {
                let inserted = store
                    .insert(table, missing, &columns)
                    .await
                    .map_err(SeedError::store(table, "insert"))?;
                seed.created += inserted.len();
            }
            debug!(batch = batch.len(), created = seed.created, "batch linked");
        }

        info!(created = seed.created, skipped = seed.skipped, "linked {table}");
        Ok(seed)
    }
    .instrument(span)
    .await
}

fn unresolved_agency(name: &str, agency_ids: &IdMap) -> UnresolvedReference {
    UnresolvedReference {
        kind: ReferenceKind::Agency,
        natural_key: name.to_string(),
        agency: None,
        suggestion: closest_match(name, agency_ids.keys()),
    }
}

pub async fn link_agency_trades(
    store: &dyn Store,
    catalog: &ReferenceCatalog,
    agency_ids: &IdMap,
    trade_ids: &IdMap,
    batch_size: usize,
) -> Result<LinkSeed, SeedError> {
    let spellings = catalog.trade_spellings();
    let mut candidates = Vec::new();
    let mut unresolved = Vec::new();

    for fixture in &catalog.agencies {
        let agency_id = agency_ids.get(&fixture.name).copied();
        for trade in &fixture.trades {
            let trade = spellings
                .get(&trade.trim().to_lowercase())
                .map(String::as_str)
                .unwrap_or_else(|| trade.trim());
            let Some(agency_id) = agency_id else {
                let reference = unresolved_agency(&fixture.name, agency_ids);
                warn!(%reference, trade, "skipping agency-trade link");
                unresolved.push(reference);
                continue;
            };
            let Some(trade_id) = trade_ids.get(trade).copied() else {
                let reference = UnresolvedReference {
                    kind: ReferenceKind::Trade,
                    natural_key: trade.to_string(),
                    agency: Some(fixture.name.clone()),
                    suggestion: closest_match(trade, trade_ids.keys()),
                };
                warn!(%reference, "skipping agency-trade link");
                unresolved.push(reference);
                continue;
            };
            let link = AgencyTradeLink { agency_id, trade_id };
            candidates.push(PairCandidate {
                agency_id,
                other: trade_id.to_string(),
                row: to_row(Table::AgencyTrades, &link)?,
            });
        }
    }

    let mut seed =
        insert_missing_pairs(store, Table::AgencyTrades, "trade_id", candidates, batch_size).await?;
    seed.unresolved = unresolved;
    Ok(seed)
}

/// Regions resolve in two hops: state name to code through the catalog's
/// state table, then code to region id.
pub async fn link_agency_regions(
    store: &dyn Store,
    catalog: &ReferenceCatalog,
    agency_ids: &IdMap,
    region_ids: &IdMap,
    batch_size: usize,
) -> Result<LinkSeed, SeedError> {
    let mut candidates = Vec::new();
    let mut unresolved = Vec::new();

    for fixture in &catalog.agencies {
        let agency_id = agency_ids.get(&fixture.name).copied();
        for state in &fixture.regions {
            let state = state.trim();
            let Some(agency_id) = agency_id else {
                let reference = unresolved_agency(&fixture.name, agency_ids);
                warn!(%reference, state, "skipping agency-region link");
                unresolved.push(reference);
                continue;
            };
            let Some(code) = catalog.state_code(state) else {
                let reference = UnresolvedReference {
                    kind: ReferenceKind::StateName,
                    natural_key: state.to_string(),
                    agency: Some(fixture.name.clone()),
                    suggestion: closest_match(state, catalog.states.keys()),
                };
                warn!(%reference, "skipping agency-region link");
                unresolved.push(reference);
                continue;
            };
            let Some(region_id) = region_ids.get(code).copied() else {
                let reference = UnresolvedReference {
                    kind: ReferenceKind::Region,
                    natural_key: code.to_string(),
                    agency: Some(fixture.name.clone()),
                    suggestion: None,
                };
                warn!(%reference, state, "skipping agency-region link");
                unresolved.push(reference);
                continue;
            };
            let link = AgencyRegionLink { agency_id, region_id };
            candidates.push(PairCandidate {
                agency_id,
                other: region_id.to_string(),
                row: to_row(Table::AgencyRegions, &link)?,
            });
        }
    }

    let mut seed =
        insert_missing_pairs(store, Table::AgencyRegions, "region_id", candidates, batch_size)
            .await?;
    seed.unresolved = unresolved;
    Ok(seed)
}
