//! Destructive clear of every seeded table, children before parents.

use serde::Serialize;
use staffdir_core::{Table, NIL_ID};
use staffdir_storage::{Filter, Store};
use tracing::{info, info_span, warn, Instrument};

use crate::SeedError;

/// Deletion order. Every table is cleared before any table it references.
pub const RESET_ORDER: [Table; 9] = [
    Table::AgencyIntegrationEvents,
    Table::AgencyIntegrationSyncs,
    Table::AgencyIntegrations,
    Table::AgencyTrades,
    Table::AgencyRegions,
    Table::AgencyCompliance,
    Table::Agencies,
    Table::Trades,
    Table::Regions,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum ResetOutcome {
    Cleared,
    /// Speculative table absent from this environment.
    Missing,
    /// Speculative table that failed for another reason; the reset went on.
    Warning(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableReset {
    pub table: Table,
    pub deleted: u64,
    pub outcome: ResetOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub tables: Vec<TableReset>,
}

impl ResetReport {
    pub fn total_deleted(&self) -> u64 {
        self.tables.iter().map(|t| t.deleted).sum()
    }
}

/// Reject an order in which a table comes after a table it references, or a
/// seeded table is missing.
pub fn validate_reset_order(order: &[Table]) -> Result<(), SeedError> {
    for table in Table::ALL {
        if !order.contains(&table) {
            return Err(SeedError::Configuration(format!(
                "reset order does not clear {table}"
            )));
        }
    }
    for (position, table) in order.iter().enumerate() {
        for (_, parent) in table.references() {
            let parent_position = order.iter().position(|t| t == parent);
            if parent_position.is_some_and(|p| p < position) {
                return Err(SeedError::Configuration(format!(
                    "reset order clears {parent} before {table}, which references it"
                )));
            }
        }
    }
    Ok(())
}

/// Delete every row of every seeded table.
///
/// Missing speculative tables count as zero deleted; any other failure on a
/// speculative table is logged and skipped. A failure on a mandatory table
/// stops the reset and leaves earlier tables cleared.
pub async fn reset_store(store: &dyn Store) -> Result<ResetReport, SeedError> {
    validate_reset_order(&RESET_ORDER)?;
    let mut report = ResetReport::default();

    for table in RESET_ORDER {
        let filter = Filter::neq(table.key_column(), NIL_ID);
        let result = store
            .delete(table, std::slice::from_ref(&filter))
            .instrument(info_span!("reset_table", table = %table))
            .await;

        let entry = match result {
            Ok(deleted) => {
                info!(table = %table, deleted, "cleared table");
                TableReset { table, deleted, outcome: ResetOutcome::Cleared }
            }
            Err(err) if table.is_speculative() && err.is_missing_relation() => {
                info!(table = %table, "table not present; skipping");
                TableReset { table, deleted: 0, outcome: ResetOutcome::Missing }
            }
            Err(err) if table.is_speculative() => {
                warn!(table = %table, error = %err, "could not clear optional table; continuing");
                TableReset {
                    table,
                    deleted: 0,
                    outcome: ResetOutcome::Warning(err.to_string()),
                }
            }
            Err(err) => {
                warn!(
                    table = %table,
                    error = %err,
                    cleared = report.tables.len(),
                    "reset aborted; the store may be partially deleted"
                );
                return Err(SeedError::store(table, "delete")(err));
            }
        };
        report.tables.push(entry);
    }

    info!(deleted = report.total_deleted(), "reset complete");
    Ok(report)
}
