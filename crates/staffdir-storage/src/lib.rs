//! Query-builder store contract + REST, Postgres, and in-memory backends.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Map, Value as JsonValue};
use staffdir_core::Table;
use thiserror::Error;
use tracing::warn;

pub mod memory;
pub mod postgres;
pub mod rest;

pub use memory::{MemoryStore, Operation, StoreCall};
pub use postgres::PgStore;
pub use reqwest::Url;
pub use rest::{RestStore, RestStoreConfig};

pub const CRATE_NAME: &str = "staffdir-storage";

/// Row filter. Values are compared in their text form so the same filter works
/// for uuid, text, and numeric columns. `Neq` is SQL `<>`: NULL never matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Eq { column: String, value: String },
    Neq { column: String, value: String },
    In { column: String, values: Vec<String> },
}

impl Filter {
    pub fn eq(column: &str, value: impl ToString) -> Self {
        Filter::Eq {
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    pub fn neq(column: &str, value: impl ToString) -> Self {
        Filter::Neq {
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    pub fn in_list<I, V>(column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        Filter::In {
            column: column.to_string(),
            values: values.into_iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq { column, .. } | Filter::Neq { column, .. } | Filter::In { column, .. } => {
                column
            }
        }
    }
}

/// A `select(columns)` call with its chained filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Select {
    pub columns: String,
    pub filters: Vec<Filter>,
    /// Ask the store for an exact row count.
    pub count: bool,
    /// Return the count only, no rows.
    pub head: bool,
}

impl Select {
    pub fn columns(columns: &str) -> Self {
        Self {
            columns: columns.to_string(),
            filters: Vec::new(),
            count: false,
            head: false,
        }
    }

    pub fn count_only() -> Self {
        Self {
            columns: "*".to_string(),
            filters: Vec::new(),
            count: true,
            head: true,
        }
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn neq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters.push(Filter::neq(column, value));
        self
    }

    pub fn in_list<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        self.filters.push(Filter::in_list(column, values));
        self
    }

}

/// `{data, count}` half of a store reply; the error half is the `Err` arm.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreResponse {
    pub data: Vec<JsonValue>,
    pub count: Option<u64>,
}

impl StoreResponse {
    /// Exact count when the store reported one, else the number of rows returned.
    pub fn total(&self) -> u64 {
        self.count.unwrap_or(self.data.len() as u64)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("relation \"{table}\" does not exist")]
    MissingRelation { table: String },
    #[error("{table}: constraint violation ({}): {message}", .code.as_deref().unwrap_or("unknown"))]
    Constraint {
        table: String,
        code: Option<String>,
        message: String,
    },
    #[error("{table}: http status {status}: {message}")]
    Http {
        table: String,
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decoding {table} rows: {message}")]
    Decode { table: String, message: String },
}

impl StoreError {
    pub fn is_missing_relation(&self) -> bool {
        matches!(self, StoreError::MissingRelation { .. })
    }

    /// Whether retrying the same call could succeed (network trouble, 5xx, 429).
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Http { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            StoreError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            StoreError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }
}

/// The query-builder surface the seeding pipeline composes. Backends never
/// see raw query language from callers.
#[async_trait]
pub trait Store: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn select(&self, table: Table, query: &Select) -> Result<StoreResponse, StoreError>;

    /// Insert rows and return the stored rows restricted to `returning` columns.
    async fn insert(
        &self,
        table: Table,
        rows: Vec<JsonValue>,
        returning: &str,
    ) -> Result<Vec<JsonValue>, StoreError>;

    /// Delete rows matching every filter and return how many were removed.
    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError>;

    /// Cheap read used to confirm connectivity before any mutation.
    async fn probe(&self) -> Result<(), StoreError> {
        self.select(Table::Trades, &Select::count_only())
            .await
            .map(|_| ())
    }
}

/// Keep only the requested columns of a row; `*` keeps everything.
pub fn project_columns(row: JsonValue, columns: &str) -> JsonValue {
    let wanted: Vec<&str> = columns
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();
    if wanted.is_empty() || wanted.contains(&"*") {
        return row;
    }
    match row {
        JsonValue::Object(map) => JsonValue::Object(
            map.into_iter()
                .filter(|(k, _)| wanted.contains(&k.as_str()))
                .collect::<Map<String, JsonValue>>(),
        ),
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(2))
    }
}

impl BackoffPolicy {
    /// Same delay before every retry.
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
#[error("store unreachable after {attempts} attempt(s): {source}")]
pub struct ProbeError {
    pub attempts: usize,
    pub source: StoreError,
}

/// Probe the store, retrying transient failures per `policy`. Returns the
/// number of attempts it took.
pub async fn probe_with_backoff(
    store: &dyn Store,
    policy: &BackoffPolicy,
) -> Result<usize, ProbeError> {
    let mut attempt = 0usize;
    loop {
        match store.probe().await {
            Ok(()) => return Ok(attempt + 1),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    backend = store.backend(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "store probe failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(ProbeError {
                    attempts: attempt + 1,
                    source: err,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let policy = BackoffPolicy::fixed(3, Duration::from_millis(40));
        for attempt in 0..6 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(40));
        }
    }

    #[test]
    fn status_classification_retries_server_errors_only() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn http_errors_are_transient_only_for_5xx() {
        let gateway = StoreError::Http {
            table: "trades".into(),
            status: 503,
            code: None,
            message: "upstream".into(),
        };
        let auth = StoreError::Http {
            table: "trades".into(),
            status: 401,
            code: None,
            message: "invalid jwt".into(),
        };
        assert!(gateway.is_transient());
        assert!(!auth.is_transient());
        assert!(!StoreError::MissingRelation { table: "x".into() }.is_transient());
    }

    #[test]
    fn projection_keeps_requested_columns() {
        let row = json!({"id": "a", "name": "Welder", "slug": "welder"});
        assert_eq!(
            project_columns(row.clone(), "id, name"),
            json!({"id": "a", "name": "Welder"})
        );
        assert_eq!(project_columns(row.clone(), "*"), row);
    }

    #[test]
    fn select_builder_chains_filters() {
        let query = Select::columns("id,name")
            .in_list("name", ["Welder", "Electrician"])
            .neq("id", "0");
        assert_eq!(query.filters.len(), 2);
        assert_eq!(query.filters[0].column(), "name");
        assert!(!query.head);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_retries_transient_failures_then_succeeds() {
        let store = MemoryStore::new();
        store.fail_transiently(2);
        let attempts = probe_with_backoff(&store, &BackoffPolicy::fixed(3, Duration::from_secs(2)))
            .await
            .expect("probe");
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_gives_up_after_bounded_retries() {
        let store = MemoryStore::new();
        store.fail_transiently(10);
        let err = probe_with_backoff(&store, &BackoffPolicy::fixed(2, Duration::from_secs(1)))
            .await
            .expect_err("probe should fail");
        assert_eq!(err.attempts, 3);
        assert!(err.source.is_transient());
    }

    #[tokio::test]
    async fn probe_does_not_retry_permanent_failures() {
        let store = MemoryStore::new().with_missing_table(Table::Trades);
        let err = probe_with_backoff(&store, &BackoffPolicy::fixed(5, Duration::from_secs(1)))
            .await
            .expect_err("missing table is fatal");
        assert_eq!(err.attempts, 1);
        assert!(err.source.is_missing_relation());
    }
}
