//! Direct Postgres backend over sqlx. Rows travel as `jsonb` so the same
//! query-builder contract holds without per-table structs.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::QueryScalar;
use sqlx::{PgPool, Postgres};
use staffdir_core::Table;
use tracing::{debug, info_span, Instrument};

use crate::{project_columns, Filter, Select, Store, StoreError, StoreResponse};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Bind {
    Text(String),
    TextList(Vec<String>),
}

impl PgStore {
    /// Pool that connects on first use, so the connectivity probe is the first
    /// real connection attempt.
    pub fn connect_lazy(database_url: &str, acquire_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `WHERE` clause over the text form of each column; placeholders start at `$first`.
fn where_clause(filters: &[Filter], first: usize) -> (String, Vec<Bind>) {
    let mut clauses = Vec::with_capacity(filters.len());
    let mut binds = Vec::with_capacity(filters.len());
    for filter in filters {
        let column = format!("(to_jsonb(t) ->> {})", quote_literal(filter.column()));
        let placeholder = first + binds.len();
        match filter {
            Filter::Eq { value, .. } => {
                clauses.push(format!("{column} = ${placeholder}"));
                binds.push(Bind::Text(value.clone()));
            }
            Filter::Neq { value, .. } => {
                clauses.push(format!("{column} <> ${placeholder}"));
                binds.push(Bind::Text(value.clone()));
            }
            Filter::In { values, .. } => {
                clauses.push(format!("{column} = ANY(${placeholder})"));
                binds.push(Bind::TextList(values.clone()));
            }
        }
    }
    if clauses.is_empty() {
        (String::new(), binds)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), binds)
    }
}

fn bind_all<'q, O>(
    mut query: QueryScalar<'q, Postgres, O, PgArguments>,
    binds: &'q [Bind],
) -> QueryScalar<'q, Postgres, O, PgArguments> {
    for bind in binds {
        query = match bind {
            Bind::Text(value) => query.bind(value.as_str()),
            Bind::TextList(values) => query.bind(values.as_slice()),
        };
    }
    query
}

fn map_sqlx(table: Table, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some("42P01") => {
                return StoreError::MissingRelation {
                    table: table.name().to_string(),
                }
            }
            Some(code) if code.starts_with("23") => {
                return StoreError::Constraint {
                    table: table.name().to_string(),
                    code: Some(code.to_string()),
                    message: db.message().to_string(),
                }
            }
            _ => {}
        }
    }
    StoreError::Database(err)
}

/// Column list covering every key of every row, in stable order.
fn insert_columns(rows: &[JsonValue]) -> Vec<String> {
    rows.iter()
        .filter_map(JsonValue::as_object)
        .flat_map(|row| row.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[async_trait]
impl Store for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn select(&self, table: Table, query: &Select) -> Result<StoreResponse, StoreError> {
        let span = info_span!("store_select", table = %table, filters = query.filters.len());
        async move {
            let (filter_sql, binds) = where_clause(&query.filters, 1);
            let from = format!("FROM {} AS t{filter_sql}", quote_ident(table.name()));

            let count = if query.count {
                let sql = format!("SELECT count(*) {from}");
                let total: i64 = bind_all(sqlx::query_scalar::<_, i64>(&sql), &binds)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| map_sqlx(table, e))?;
                Some(total.max(0) as u64)
            } else {
                None
            };

            let data = if query.head {
                Vec::new()
            } else {
                let sql = format!("SELECT to_jsonb(t) {from}");
                bind_all(sqlx::query_scalar::<_, JsonValue>(&sql), &binds)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| map_sqlx(table, e))?
                    .into_iter()
                    .map(|row| project_columns(row, &query.columns))
                    .collect()
            };
            debug!(rows = data.len(), ?count, "select complete");
            Ok(StoreResponse { data, count })
        }
        .instrument(span)
        .await
    }

    async fn insert(
        &self,
        table: Table,
        rows: Vec<JsonValue>,
        returning: &str,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let span = info_span!("store_insert", table = %table, rows = rows.len());
        async move {
            if rows.is_empty() {
                return Ok(Vec::new());
            }
            let columns = insert_columns(&rows)
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let target = quote_ident(table.name());
            let sql = format!(
                "INSERT INTO {target} AS t ({columns}) \
                 SELECT {columns} FROM jsonb_populate_recordset(NULL::{target}, $1) \
                 RETURNING to_jsonb(t)"
            );
            let inserted = sqlx::query_scalar::<_, JsonValue>(&sql)
                .bind(JsonValue::Array(rows))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx(table, e))?
                .into_iter()
                .map(|row| project_columns(row, returning))
                .collect::<Vec<_>>();
            debug!(inserted = inserted.len(), "insert complete");
            Ok(inserted)
        }
        .instrument(span)
        .await
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
        let span = info_span!("store_delete", table = %table);
        async move {
            let (filter_sql, binds) = where_clause(filters, 1);
            let sql = format!(
                "WITH removed AS (DELETE FROM {} AS t{filter_sql} RETURNING 1) SELECT count(*) FROM removed",
                quote_ident(table.name())
            );
            let deleted: i64 = bind_all(sqlx::query_scalar::<_, i64>(&sql), &binds)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx(table, e))?;
            debug!(deleted, "delete complete");
            Ok(deleted.max(0) as u64)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn where_clause_numbers_placeholders_in_order() {
        let (sql, binds) = where_clause(
            &[
                Filter::in_list("name", ["Welder", "Roofer"]),
                Filter::neq("id", "nil"),
            ],
            1,
        );
        assert_eq!(
            sql,
            " WHERE (to_jsonb(t) ->> 'name') = ANY($1) AND (to_jsonb(t) ->> 'id') <> $2"
        );
        assert_eq!(
            binds,
            vec![
                Bind::TextList(vec!["Welder".into(), "Roofer".into()]),
                Bind::Text("nil".into()),
            ]
        );
    }

    #[test]
    fn empty_filters_render_no_where_clause() {
        let (sql, binds) = where_clause(&[], 1);
        assert!(sql.is_empty());
        assert!(binds.is_empty());
    }

    #[test]
    fn identifiers_and_literals_are_escaped() {
        assert_eq!(quote_ident("agency_trades"), "\"agency_trades\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn insert_columns_cover_all_rows() {
        let rows = vec![
            json!({"name": "Welder", "slug": "welder"}),
            json!({"name": "Texas", "state_code": "TX"}),
        ];
        assert_eq!(insert_columns(&rows), vec!["name", "slug", "state_code"]);
    }
}
