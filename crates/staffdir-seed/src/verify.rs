//! Read-only audit of a seeded store against the catalog.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value as JsonValue;
use staffdir_core::Table;
use staffdir_storage::{Select, Store, StoreError};
use tracing::{debug, info_span, warn, Instrument};

use crate::catalog::ReferenceCatalog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationCheck {
    pub name: String,
    pub table: Table,
    pub expected: u64,
    /// `None` when the store could not answer.
    pub actual: Option<u64>,
    pub passed: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub checks: Vec<VerificationCheck>,
}

impl VerificationReport {
    pub fn failures(&self) -> impl Iterator<Item = &VerificationCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

async fn count_check(
    store: &dyn Store,
    name: &str,
    table: Table,
    expected: usize,
) -> VerificationCheck {
    let expected = expected as u64;
    match store.select(table, &Select::count_only()).await {
        Ok(response) => {
            let actual = response.total();
            VerificationCheck {
                name: name.to_string(),
                table,
                expected,
                actual: Some(actual),
                passed: actual == expected,
                detail: (actual != expected)
                    .then(|| format!("expected {expected} rows, found {actual}")),
            }
        }
        Err(err) => VerificationCheck {
            name: name.to_string(),
            table,
            expected,
            actual: None,
            passed: false,
            detail: Some(err.to_string()),
        },
    }
}

fn text_column(rows: &[JsonValue], column: &str) -> BTreeSet<String> {
    rows.iter()
        .filter_map(|row| row.get(column).and_then(JsonValue::as_str))
        .map(str::to_string)
        .collect()
}

/// Names of the trades linked to the named agency, following the junction rows.
async fn linked_trade_names(store: &dyn Store, agency: &str) -> Result<BTreeSet<String>, StoreError> {
    let agencies = store
        .select(Table::Agencies, &Select::columns("id").eq("name", agency))
        .await?;
    let agency_ids = text_column(&agencies.data, "id");
    if agency_ids.is_empty() {
        return Ok(BTreeSet::new());
    }
    let links = store
        .select(
            Table::AgencyTrades,
            &Select::columns("trade_id").in_list("agency_id", &agency_ids),
        )
        .await?;
    let trade_ids = text_column(&links.data, "trade_id");
    if trade_ids.is_empty() {
        return Ok(BTreeSet::new());
    }
    let trades = store
        .select(Table::Trades, &Select::columns("name").in_list("id", &trade_ids))
        .await?;
    Ok(text_column(&trades.data, "name"))
}

async fn sample_join_check(store: &dyn Store, catalog: &ReferenceCatalog) -> Option<VerificationCheck> {
    let sample = catalog.agencies.first()?;
    let spellings = catalog.trade_spellings();
    let expected: BTreeSet<String> = sample
        .trades
        .iter()
        .map(|t| {
            let t = t.trim();
            spellings.get(&t.to_lowercase()).cloned().unwrap_or_else(|| t.to_string())
        })
        .collect();
    let name = format!("trades linked to {}", sample.name);

    let check = match linked_trade_names(store, &sample.name).await {
        Ok(actual) => {
            let passed = actual == expected;
            VerificationCheck {
                name,
                table: Table::AgencyTrades,
                expected: expected.len() as u64,
                actual: Some(actual.len() as u64),
                passed,
                detail: (!passed).then(|| {
                    format!(
                        "expected [{}], found [{}]",
                        expected.iter().cloned().collect::<Vec<_>>().join(", "),
                        actual.iter().cloned().collect::<Vec<_>>().join(", ")
                    )
                }),
            }
        }
        Err(err) => VerificationCheck {
            name,
            table: Table::AgencyTrades,
            expected: expected.len() as u64,
            actual: None,
            passed: false,
            detail: Some(err.to_string()),
        },
    };
    Some(check)
}

/// Compare stored counts with what the catalog implies, then spot-check one
/// agency's trades through the junction table. Never mutates and never fails:
/// store errors become failed checks.
pub async fn verify_store(store: &dyn Store, catalog: &ReferenceCatalog) -> VerificationReport {
    let span = info_span!("verify", backend = store.backend());
    async move {
        let mut checks = vec![
            count_check(store, "trades", Table::Trades, catalog.trade_names().len()).await,
            count_check(store, "regions", Table::Regions, catalog.region_codes().len()).await,
            count_check(store, "agencies", Table::Agencies, catalog.agencies.len()).await,
            count_check(
                store,
                "compliance records",
                Table::AgencyCompliance,
                catalog.expected_compliance_records(),
            )
            .await,
            count_check(
                store,
                "agency-trade links",
                Table::AgencyTrades,
                catalog.expected_trade_links(),
            )
            .await,
            count_check(
                store,
                "agency-region links",
                Table::AgencyRegions,
                catalog.expected_region_links(),
            )
            .await,
        ];
        checks.extend(sample_join_check(store, catalog).await);

        for check in checks.iter().filter(|c| !c.passed) {
            warn!(
                check = %check.name,
                table = %check.table,
                detail = check.detail.as_deref().unwrap_or(""),
                "verification check failed"
            );
        }
        let passed = checks.iter().all(|c| c.passed);
        debug!(passed, checks = checks.len(), "verification finished");
        VerificationReport { passed, checks }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{seed_agencies, seed_compliance, seed_regions, seed_trades};
    use crate::links::{link_agency_regions, link_agency_trades};
    use staffdir_storage::{MemoryStore, Operation};

    fn catalog() -> ReferenceCatalog {
        ReferenceCatalog::from_yaml_str(
            r#"
trades: [Roofer]
agencies:
  - name: Apex Staffing
    trades: [Welder, Electrician]
    regions: [Texas, Oklahoma]
    compliance:
      - compliance_type: OSHA 10
"#,
            "test",
        )
        .expect("catalog")
    }

    async fn seed_all(store: &MemoryStore, catalog: &ReferenceCatalog) {
        let trades = seed_trades(store, catalog, 10).await.expect("trades");
        let regions = seed_regions(store, catalog, 10).await.expect("regions");
        let agencies = seed_agencies(store, catalog, 20).await.expect("agencies");
        seed_compliance(store, catalog, &agencies.ids, 50).await.expect("compliance");
        link_agency_trades(store, catalog, &agencies.ids, &trades.ids, 50)
            .await
            .expect("trade links");
        link_agency_regions(store, catalog, &agencies.ids, &regions.ids, 50)
            .await
            .expect("region links");
    }

    #[tokio::test]
    async fn seeded_store_passes_every_check() {
        let store = MemoryStore::new();
        let catalog = catalog();
        seed_all(&store, &catalog).await;

        let report = verify_store(&store, &catalog).await;
        assert!(report.passed, "{:?}", report.failures().collect::<Vec<_>>());
        assert_eq!(report.checks.len(), 7);
    }

    #[tokio::test]
    async fn empty_store_fails_with_counts() {
        let store = MemoryStore::new();
        let report = verify_store(&store, &catalog()).await;
        assert!(!report.passed);
        let trades = &report.checks[0];
        assert_eq!((trades.expected, trades.actual), (3, Some(0)));
        assert!(store.calls().iter().all(|c| c.operation == Operation::Select));
    }

    #[tokio::test]
    async fn store_error_fails_one_check_and_the_rest_still_run() {
        let store = MemoryStore::new();
        let catalog = catalog();
        seed_all(&store, &catalog).await;
        store.fail_on(Operation::Select, Table::AgencyRegions);

        let report = verify_store(&store, &catalog).await;
        assert!(!report.passed);
        let failed: Vec<&str> = report.failures().map(|c| c.name.as_str()).collect();
        assert_eq!(failed, vec!["agency-region links"]);
        assert_eq!(report.checks.len(), 7);
    }

    #[tokio::test]
    async fn sample_join_catches_a_missing_link() {
        let store = MemoryStore::new();
        let mut catalog = catalog();
        seed_all(&store, &catalog).await;
        catalog.agencies[0].trades.push("Roofer".to_string());

        let report = verify_store(&store, &catalog).await;
        let sample = report.checks.last().expect("sample check");
        assert!(!sample.passed);
        assert!(sample.detail.as_deref().is_some_and(|d| d.contains("Roofer")));
    }
}
