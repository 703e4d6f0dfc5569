//! PostgREST-over-HTTP backend (the hosted store's REST interface).

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use staffdir_core::Table;
use tracing::{debug, info_span, Instrument};

use crate::{Filter, Select, Store, StoreError, StoreResponse};

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub service_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl RestStoreConfig {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            service_key: service_key.into(),
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct RestStore {
    client: reqwest::Client,
    rest_url: String,
}

/// Error body PostgREST returns alongside non-2xx statuses.
#[derive(Debug, Default, Deserialize)]
struct PostgrestErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let mut key = HeaderValue::from_str(&config.service_key)
            .context("service key is not a valid header value")?;
        key.set_sensitive(true);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.service_key))
            .context("service key is not a valid header value")?;
        bearer.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", config.base_url.trim_end_matches('/')),
        })
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/{}", self.rest_url, table.name())
    }

    async fn send(&self, table: Table, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(table, response).await)
        }
    }
}

/// PostgREST query pairs for a filter chain.
pub fn filter_query_pairs(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|filter| match filter {
            Filter::Eq { column, value } => (column.clone(), format!("eq.{value}")),
            Filter::Neq { column, value } => (column.clone(), format!("neq.{value}")),
            Filter::In { column, values } => {
                let quoted = values.iter().map(|v| quote_list_value(v)).collect::<Vec<_>>();
                (column.clone(), format!("in.({})", quoted.join(",")))
            }
        })
        .collect()
}

fn quote_list_value(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Total from a `Content-Range` header such as `0-24/573` or `*/0`.
pub fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}

fn is_missing_relation(code: Option<&str>, message: &str) -> bool {
    matches!(code, Some("42P01") | Some("PGRST205"))
        || (message.contains("relation") && message.contains("does not exist"))
        || message.contains("Could not find the table")
}

async fn error_from_response(table: Table, response: Response) -> StoreError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let body: PostgrestErrorBody = serde_json::from_str(&text).unwrap_or_default();
    let mut message = body.message.unwrap_or_else(|| text.trim().to_string());
    if let Some(details) = body.details.filter(|d| !d.is_empty()) {
        message = format!("{message} ({details})");
    }
    if let Some(hint) = body.hint.filter(|h| !h.is_empty()) {
        message = format!("{message}; hint: {hint}");
    }

    if is_missing_relation(body.code.as_deref(), &message) {
        return StoreError::MissingRelation {
            table: table.name().to_string(),
        };
    }
    if status == reqwest::StatusCode::CONFLICT
        || body.code.as_deref().is_some_and(|c| c.starts_with("23"))
    {
        return StoreError::Constraint {
            table: table.name().to_string(),
            code: body.code,
            message,
        };
    }
    StoreError::Http {
        table: table.name().to_string(),
        status: status.as_u16(),
        code: body.code,
        message,
    }
}

fn content_range_total(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range_total)
}

async fn json_rows(table: Table, response: Response) -> Result<Vec<JsonValue>, StoreError> {
    response
        .json::<Vec<JsonValue>>()
        .await
        .map_err(|e| StoreError::Decode {
            table: table.name().to_string(),
            message: e.to_string(),
        })
}

#[async_trait]
impl Store for RestStore {
    fn backend(&self) -> &'static str {
        "rest"
    }

    async fn select(&self, table: Table, query: &Select) -> Result<StoreResponse, StoreError> {
        let span = info_span!("store_select", table = %table, filters = query.filters.len());
        async move {
            let url = self.table_url(table);
            let request = if query.head {
                self.client.head(&url)
            } else {
                self.client.get(&url)
            };
            let mut params = vec![("select".to_string(), query.columns.clone())];
            params.extend(filter_query_pairs(&query.filters));
            let mut request = request.query(&params);
            if query.count {
                request = request.header("Prefer", "count=exact");
            }

            let response = self.send(table, request).await?;
            let count = if query.count {
                content_range_total(&response)
            } else {
                None
            };
            let data = if query.head {
                Vec::new()
            } else {
                json_rows(table, response).await?
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
            let request = self
                .client
                .post(self.table_url(table))
                .query(&[("select", returning)])
                .header("Prefer", "return=representation")
                .json(&rows);
            let response = self.send(table, request).await?;
            let inserted = json_rows(table, response).await?;
            debug!(inserted = inserted.len(), "insert complete");
            Ok(inserted)
        }
        .instrument(span)
        .await
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<u64, StoreError> {
        let span = info_span!("store_delete", table = %table);
        async move {
            let request = self
                .client
                .delete(self.table_url(table))
                .query(&filter_query_pairs(filters))
                .header("Prefer", "return=minimal,count=exact");
            let response = self.send(table, request).await?;
            let deleted = content_range_total(&response).unwrap_or(0);
            debug!(deleted, "delete complete");
            Ok(deleted)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_render_as_postgrest_operators() {
        let pairs = filter_query_pairs(&[
            Filter::eq("agency_id", "abc"),
            Filter::neq("id", "00000000-0000-0000-0000-000000000000"),
            Filter::in_list("name", ["Welder", "Sheet Metal, Duct", "Say \"hi\""]),
        ]);
        assert_eq!(pairs[0], ("agency_id".to_string(), "eq.abc".to_string()));
        assert_eq!(
            pairs[1].1,
            "neq.00000000-0000-0000-0000-000000000000".to_string()
        );
        assert_eq!(
            pairs[2].1,
            r#"in.("Welder","Sheet Metal, Duct","Say \"hi\"")"#.to_string()
        );
    }

    #[test]
    fn content_range_totals_parse() {
        assert_eq!(parse_content_range_total("0-24/573"), Some(573));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-9/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn missing_relation_detection_covers_postgres_and_postgrest_codes() {
        assert!(is_missing_relation(Some("42P01"), ""));
        assert!(is_missing_relation(Some("PGRST205"), ""));
        assert!(is_missing_relation(
            None,
            "relation \"public.agency_integrations\" does not exist"
        ));
        assert!(!is_missing_relation(Some("23503"), "violates foreign key"));
    }

    #[test]
    fn store_builds_rest_url_without_double_slash() {
        let store = RestStore::new(RestStoreConfig::new("https://example.supabase.co/", "a.b.c"))
            .expect("client");
        assert_eq!(
            store.table_url(Table::AgencyTrades),
            "https://example.supabase.co/rest/v1/agency_trades"
        );
    }
}
