//! In-process store double. Enforces natural-key uniqueness and foreign keys the
//! way the hosted schema does, records every call, and can simulate missing
//! relations and failing operations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use staffdir_core::Table;
use uuid::Uuid;

use crate::{project_columns, Filter, Select, Store, StoreError, StoreResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCall {
    pub operation: Operation,
    pub table: Table,
}

type Row = Map<String, JsonValue>;

#[derive(Debug)]
struct MemoryState {
    tables: BTreeMap<Table, Vec<Row>>,
    missing: BTreeSet<Table>,
    transient_failures: usize,
    failing: Vec<(Operation, Table)>,
    calls: Vec<StoreCall>,
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                tables: BTreeMap::new(),
                missing: BTreeSet::new(),
                transient_failures: 0,
                failing: Vec::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// Treat `table` as absent from the schema.
    pub fn with_missing_table(self, table: Table) -> Self {
        self.lock().missing.insert(table);
        self
    }

    /// The next `times` calls fail with a transient error, whatever the table.
    pub fn fail_transiently(&self, times: usize) {
        self.lock().transient_failures = times;
    }

    /// Every `operation` on `table` fails with a non-transient error.
    pub fn fail_on(&self, operation: Operation, table: Table) {
        self.lock().failing.push((operation, table));
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn rows(&self, table: Table) -> Vec<JsonValue> {
        self.lock()
            .tables
            .get(&table)
            .map(|rows| rows.iter().cloned().map(JsonValue::Object).collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: Table) -> usize {
        self.lock().tables.get(&table).map(Vec::len).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, operation: Operation, table: Table) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall { operation, table });
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(StoreError::Unavailable(format!(
                "simulated outage during {operation:?} on {table}"
            )));
        }
        if state.missing.contains(&table) {
            return Err(StoreError::MissingRelation {
                table: table.name().to_string(),
            });
        }
        if state.failing.contains(&(operation, table)) {
            return Err(StoreError::Http {
                table: table.name().to_string(),
                status: 400,
                code: Some("INJECTED".to_string()),
                message: format!("injected {operation:?} failure"),
            });
        }
        Ok(state)
    }
}

/// Columns that identify a row within its table.
fn unique_columns(table: Table) -> &'static [&'static str] {
    match table {
        Table::Trades | Table::Agencies => &["name"],
        Table::Regions => &["state_code"],
        Table::AgencyCompliance => &["agency_id", "compliance_type"],
        Table::AgencyTrades => &["agency_id", "trade_id"],
        Table::AgencyRegions => &["agency_id", "region_id"],
        _ => &[],
    }
}

fn text_of(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn matches(row: &Row, filter: &Filter) -> bool {
    match filter {
        Filter::Eq { column, value } => text_of(row, column).as_deref() == Some(value.as_str()),
        // SQL `<>`: a NULL or absent column never matches.
        Filter::Neq { column, value } => text_of(row, column).is_some_and(|t| t != *value),
        Filter::In { column, values } => {
            text_of(row, column).is_some_and(|t| values.iter().any(|v| *v == t))
        }
    }
}

fn constraint(table: Table, code: &str, message: String) -> StoreError {
    StoreError::Constraint {
        table: table.name().to_string(),
        code: Some(code.to_string()),
        message,
    }
}

impl MemoryState {
    fn check_insert(&self, table: Table, row: &Row, pending: &[Row]) -> Result<(), StoreError> {
        let keys = unique_columns(table);
        if !keys.is_empty() {
            let key_of = |r: &Row| keys.iter().map(|k| text_of(r, k)).collect::<Vec<_>>();
            let key = key_of(row);
            let existing = self.tables.get(&table).into_iter().flatten();
            if existing.chain(pending.iter()).any(|r| key_of(r) == key) {
                return Err(constraint(
                    table,
                    "23505",
                    format!("duplicate key value violates unique constraint on ({})", keys.join(", ")),
                ));
            }
        }

        for (column, parent) in table.references() {
            let Some(value) = text_of(row, column) else {
                continue;
            };
            let found = self
                .tables
                .get(parent)
                .into_iter()
                .flatten()
                .any(|r| text_of(r, "id").as_deref() == Some(value.as_str()));
            if !found {
                return Err(constraint(
                    table,
                    "23503",
                    format!("{column}={value} is not present in table \"{parent}\""),
                ));
            }
        }
        Ok(())
    }

    fn check_delete(&self, table: Table, doomed_ids: &BTreeSet<String>) -> Result<(), StoreError> {
        if doomed_ids.is_empty() {
            return Ok(());
        }
        for (child, rows) in &self.tables {
            for (column, parent) in child.references() {
                if *parent != table {
                    continue;
                }
                if rows
                    .iter()
                    .any(|r| text_of(r, column).is_some_and(|v| doomed_ids.contains(&v)))
                {
                    return Err(constraint(
                        table,
                        "23503",
                        format!("rows are still referenced from table \"{child}\""),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn select(&self, table: Table, query: &Select) -> Result<StoreResponse, StoreError> {
        let state = self.begin(Operation::Select, table)?;
        let matched: Vec<&Row> = state
            .tables
            .get(&table)
            .into_iter()
            .flatten()
            .filter(|row| query.filters.iter().all(|f| matches(row, f)))
            .collect();
        let count = query.count.then_some(matched.len() as u64);
        let data = if query.head {
            Vec::new()
        } else {
            matched
                .into_iter()
                .map(|row| project_columns(JsonValue::Object(row.clone()), &query.columns))
                .collect()
        };
        Ok(StoreResponse { data, count })
    }

    async fn insert(
        &self,
        table: Table,
        rows: Vec<JsonValue>,
        returning: &str,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let mut state = self.begin(Operation::Insert, table)?;
        let mut staged: Vec<Row> = Vec::with_capacity(rows.len());
        for row in rows {
            let JsonValue::Object(mut row) = row else {
                return Err(constraint(table, "22P02", "row is not a JSON object".to_string()));
            };
            if table.key_column() == "id" && !row.contains_key("id") {
                row.insert("id".to_string(), JsonValue::String(Uuid::new_v4().to_string()));
            }
            state.check_insert(table, &row, &staged)?;
            staged.push(row);
        }
        let returned = staged
            .iter()
            .cloned()
            .map(|row| project_columns(JsonValue::Object(row), returning))
            .collect();
        state.tables.entry(table).or_default().extend(staged);
        Ok(returned)
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
        let mut state = self.begin(Operation::Delete, table)?;
        let rows = state.tables.get(&table).cloned().unwrap_or_default();
        let (doomed, kept): (Vec<Row>, Vec<Row>) = rows
            .into_iter()
            .partition(|row| filters.iter().all(|f| matches(row, f)));
        let doomed_ids: BTreeSet<String> = doomed.iter().filter_map(|r| text_of(r, "id")).collect();
        state.check_delete(table, &doomed_ids)?;
        state.tables.insert(table, kept);
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn insert_assigns_ids_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let rows = store
            .insert(Table::Trades, vec![json!({"name": "Welder", "slug": "welder"})], "id,name")
            .await
            .expect("insert");
        assert!(rows[0]["id"].is_string());
        assert!(rows[0].get("slug").is_none());

        let err = store
            .insert(Table::Trades, vec![json!({"name": "Welder", "slug": "welder"})], "id")
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::Constraint { code: Some(ref c), .. } if c == "23505"));
        assert_eq!(store.row_count(Table::Trades), 1);
    }

    #[tokio::test]
    async fn foreign_keys_block_parent_deletes() {
        let store = MemoryStore::new();
        let trade = store
            .insert(Table::Trades, vec![json!({"name": "Welder"})], "id")
            .await
            .expect("trade");
        let agency = store
            .insert(Table::Agencies, vec![json!({"name": "Apex Staffing"})], "id")
            .await
            .expect("agency");
        store
            .insert(
                Table::AgencyTrades,
                vec![json!({"agency_id": agency[0]["id"], "trade_id": trade[0]["id"]})],
                "agency_id",
            )
            .await
            .expect("link");

        let err = store
            .delete(Table::Trades, &[Filter::neq("id", Uuid::nil())])
            .await
            .expect_err("still referenced");
        assert!(err.to_string().contains("agency_trades"));

        let removed = store
            .delete(Table::AgencyTrades, &[Filter::neq("agency_id", Uuid::nil())])
            .await
            .expect("junction delete");
        assert_eq!(removed, 1);
        assert_eq!(
            store.delete(Table::Trades, &[Filter::neq("id", Uuid::nil())]).await.expect("trades"),
            1
        );
    }

    #[tokio::test]
    async fn not_equal_never_matches_null_keys() {
        let store = MemoryStore::new();
        let agency = store
            .insert(Table::Agencies, vec![json!({"name": "Apex Staffing"})], "id")
            .await
            .expect("agency");
        store
            .insert(
                Table::AgencyIntegrations,
                vec![
                    json!({"agency_id": agency[0]["id"], "provider": "bullhorn"}),
                    json!({"agency_id": null, "provider": "orphan"}),
                    json!({"provider": "unkeyed"}),
                ],
                "provider",
            )
            .await
            .expect("integrations");

        let deleted = store
            .delete(Table::AgencyIntegrations, &[Filter::neq("agency_id", Uuid::nil())])
            .await
            .expect("delete");
        assert_eq!(deleted, 1);
        let left: Vec<JsonValue> = store
            .rows(Table::AgencyIntegrations)
            .into_iter()
            .map(|row| row["provider"].clone())
            .collect();
        assert_eq!(left, vec![json!("orphan"), json!("unkeyed")]);
    }

    #[tokio::test]
    async fn filters_and_counts() {
        let store = MemoryStore::new();
        store
            .insert(
                Table::Trades,
                vec![json!({"name": "Welder"}), json!({"name": "Electrician"}), json!({"name": "Pipefitter"})],
                "id",
            )
            .await
            .expect("insert");

        let resp = store
            .select(Table::Trades, &Select::columns("name").in_list("name", ["Welder", "Pipefitter", "Roofer"]))
            .await
            .expect("select");
        assert_eq!(resp.data.len(), 2);
        assert_eq!(resp.count, None);

        let counted = store.select(Table::Trades, &Select::count_only()).await.expect("count");
        assert_eq!(counted.total(), 3);
        assert!(counted.data.is_empty());
    }

    #[tokio::test]
    async fn missing_tables_and_injected_failures_surface_as_errors() {
        let store = MemoryStore::new().with_missing_table(Table::AgencyIntegrations);
        let err = store
            .delete(Table::AgencyIntegrations, &[])
            .await
            .expect_err("missing");
        assert!(err.is_missing_relation());

        store.fail_on(Operation::Insert, Table::Regions);
        let err = store
            .insert(Table::Regions, vec![json!({"name": "Texas", "state_code": "TX"})], "id")
            .await
            .expect_err("injected");
        assert!(!err.is_transient());
        assert_eq!(
            store.calls(),
            vec![
                StoreCall { operation: Operation::Delete, table: Table::AgencyIntegrations },
                StoreCall { operation: Operation::Insert, table: Table::Regions },
            ]
        );
    }
}
