//! Upsertable table store: PostgREST-over-HTTP adapter and an in-memory double.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store rejected {target} with status {status}: {body}")]
    Rejected {
        status: u16,
        target: String,
        body: String,
    },
    #[error("store returned no usable row count for {table}")]
    MissingCount { table: String },
}

/// A network table store that supports keyed upsert and named procedures.
#[async_trait]
pub trait PermitStore: Send + Sync {
    /// Insert `rows` into `table`, replacing any existing row whose
    /// `conflict_key` column matches.
    async fn upsert(
        &self,
        table: &str,
        rows: &[JsonValue],
        conflict_key: &str,
    ) -> Result<(), StoreError>;

    /// Invoke a stored procedure by name.
    async fn call_rpc(&self, function: &str, params: JsonValue) -> Result<(), StoreError>;

    /// Exact number of rows in `table`.
    async fn count_rows(&self, table: &str) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub service_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// Supabase-style PostgREST endpoint under `{base_url}/rest/v1`.
#[derive(Debug, Clone)]
pub struct PostgrestStore {
    client: reqwest::Client,
    rest_url: String,
}

impl PostgrestStore {
    pub fn new(config: StoreConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut api_key =
            HeaderValue::from_str(&config.service_key).context("service key is not a valid header value")?;
        api_key.set_sensitive(true);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.service_key))
            .context("service key is not a valid header value")?;
        bearer.set_sensitive(true);
        headers.insert("apikey", api_key);
        headers.insert(AUTHORIZATION, bearer);

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building store client")?;

        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", config.base_url.trim_end_matches('/')),
        })
    }

    async fn ensure_success(resp: reqwest::Response, target: &str) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::Rejected {
            status: status.as_u16(),
            target: target.to_string(),
            body,
        })
    }
}

#[async_trait]
impl PermitStore for PostgrestStore {
    async fn upsert(
        &self,
        table: &str,
        rows: &[JsonValue],
        conflict_key: &str,
    ) -> Result<(), StoreError> {
        let url = format!("{}/{}", self.rest_url, table);
        let columns = upsert_columns(rows);
        debug!(table, rows = rows.len(), conflict_key, %columns, "posting upsert batch");
        let resp = self
            .client
            .post(&url)
            .query(&[("on_conflict", conflict_key), ("columns", columns.as_str())])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await?;
        Self::ensure_success(resp, table).await?;
        Ok(())
    }

    async fn call_rpc(&self, function: &str, params: JsonValue) -> Result<(), StoreError> {
        let url = format!("{}/rpc/{}", self.rest_url, function);
        debug!(function, "calling store procedure");
        let resp = self.client.post(&url).json(&params).send().await?;
        Self::ensure_success(resp, function).await?;
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        let url = format!("{}/{}", self.rest_url, table);
        let resp = self
            .client
            .head(&url)
            .query(&[("select", "*")])
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let resp = Self::ensure_success(resp, table).await?;
        resp.headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| StoreError::MissingCount {
                table: table.to_string(),
            })
    }
}

/// Comma-joined union of the keys of every object in `rows`, sorted.
///
/// Bulk inserts need one column list for the whole batch; rows lacking a
/// listed key take the column default.
pub fn upsert_columns(rows: &[JsonValue]) -> String {
    let columns: BTreeSet<&str> = rows
        .iter()
        .filter_map(JsonValue::as_object)
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();
    columns.into_iter().collect::<Vec<_>>().join(",")
}

/// Total from a `Content-Range` value such as `0-24/3573` or `*/0`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, BTreeMap<String, JsonValue>>,
    upsert_calls: usize,
    rpc_calls: Vec<(String, JsonValue)>,
    fail_upsert_call: Option<usize>,
    failing_rpcs: BTreeSet<String>,
}

/// In-process store with replace-on-conflict semantics. Records every call so
/// tests can assert on writes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the upsert call with this zero-based index.
    pub fn failing_upsert_call(mut self, call_index: usize) -> Self {
        self.state.get_mut().fail_upsert_call = Some(call_index);
        self
    }

    pub fn failing_rpc(mut self, function: &str) -> Self {
        self.state.get_mut().failing_rpcs.insert(function.to_string());
        self
    }

    pub async fn rows(&self, table: &str) -> Vec<JsonValue> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn keys(&self, table: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|rows| rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn upsert_calls(&self) -> usize {
        self.state.lock().await.upsert_calls
    }

    pub async fn rpc_calls(&self) -> Vec<(String, JsonValue)> {
        self.state.lock().await.rpc_calls.clone()
    }
}

#[async_trait]
impl PermitStore for MemoryStore {
    async fn upsert(
        &self,
        table: &str,
        rows: &[JsonValue],
        conflict_key: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let call_index = state.upsert_calls;
        state.upsert_calls += 1;
        if state.fail_upsert_call == Some(call_index) {
            return Err(StoreError::Rejected {
                status: 503,
                target: table.to_string(),
                body: format!("injected failure on upsert call {call_index}"),
            });
        }

        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let key = match row.get(conflict_key) {
                Some(JsonValue::String(s)) => s.clone(),
                Some(JsonValue::Null) | None => {
                    return Err(StoreError::Rejected {
                        status: 400,
                        target: table.to_string(),
                        body: format!("row is missing conflict column {conflict_key}"),
                    })
                }
                Some(other) => other.to_string(),
            };
            keyed.push((key, row.clone()));
        }

        let table_rows = state.tables.entry(table.to_string()).or_default();
        for (key, row) in keyed {
            table_rows.insert(key, row);
        }
        Ok(())
    }

    async fn call_rpc(&self, function: &str, params: JsonValue) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.rpc_calls.push((function.to_string(), params));
        if state.failing_rpcs.contains(function) {
            return Err(StoreError::Rejected {
                status: 404,
                target: function.to_string(),
                body: format!("function {function} does not exist"),
            });
        }
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tables.get(table).map(|rows| rows.len() as u64).unwrap_or(0))
    }
}
