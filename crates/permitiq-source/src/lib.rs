//! ArcGIS feature-layer client, record transformer and field discovery.

use std::time::Duration;

use async_trait::async_trait;
use permitiq_core::RawFeature;
use permitiq_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod discovery;
pub mod transform;

pub use discovery::{discover_fields, FieldDiscoveryReport};
pub use transform::{transform, Transformed, TransformWarning};

pub const CRATE_NAME: &str = "permitiq-source";

/// Hard ceiling the layer applies to `resultRecordCount`.
pub const MAX_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(#[from] FetchError),
    #[error("source protocol error: {0}")]
    Protocol(String),
}

/// A paginated, read-only record source.
#[async_trait]
pub trait FeatureSource: Send + Sync {
    /// Number of records matching the configured filter.
    async fn total_count(&self) -> Result<u64, SourceError>;

    /// Up to `limit` records starting at `offset`, in source order.
    async fn fetch_page(&self, offset: u64, limit: u32) -> Result<Vec<RawFeature>, SourceError>;

    /// Every record, page by page. Stops once the accumulated count reaches
    /// the queried total or a page comes back empty; an empty page is logged,
    /// not treated as an error, so the result may be shorter than the total.
    async fn fetch_all(&self, batch_size: u32) -> Result<Vec<RawFeature>, SourceError> {
        let batch_size = batch_size.clamp(1, MAX_PAGE_SIZE);
        let total = self.total_count().await?;
        info!(total, batch_size, "starting full fetch");

        let mut all = Vec::new();
        let mut offset = 0u64;
        while offset < total {
            let page = self.fetch_page(offset, batch_size).await?;
            if page.is_empty() {
                warn!(offset, total, "no records returned, stopping early");
                break;
            }

            offset += page.len() as u64;
            all.extend(page);

            let progress = (all.len() as f64 / total as f64) * 100.0;
            info!(fetched = all.len(), total, "progress {progress:.1}%");
        }

        info!(fetched = all.len(), total, "fetch complete");
        Ok(all)
    }
}

/// Query options shared by count and page requests.
#[derive(Debug, Clone)]
pub struct ArcGisQuery {
    pub where_clause: String,
    pub out_fields: String,
    pub return_geometry: bool,
    /// Output spatial reference WKID.
    pub out_sr: u32,
}

impl Default for ArcGisQuery {
    fn default() -> Self {
        Self {
            where_clause: "1=1".to_string(),
            out_fields: "*".to_string(),
            return_geometry: true,
            out_sr: 4326,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArcGisClientConfig {
    /// Layer URL, without the trailing `/query`.
    pub layer_url: String,
    pub query: ArcGisQuery,
    pub count_timeout: Duration,
    pub page_timeout: Duration,
}

impl ArcGisClientConfig {
    pub fn new(layer_url: impl Into<String>) -> Self {
        Self {
            layer_url: layer_url.into(),
            query: ArcGisQuery::default(),
            count_timeout: Duration::from_secs(30),
            page_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct ArcGisClient {
    http: HttpFetcher,
    query_url: String,
    query: ArcGisQuery,
    count_timeout: Duration,
    page_timeout: Duration,
}

impl ArcGisClient {
    pub fn new(http: HttpFetcher, config: ArcGisClientConfig) -> Self {
        Self {
            http,
            query_url: format!("{}/query", config.layer_url.trim_end_matches('/')),
            query: config.query,
            count_timeout: config.count_timeout,
            page_timeout: config.page_timeout,
        }
    }

    pub fn query_url(&self) -> &str {
        &self.query_url
    }

    pub fn count_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("where", self.query.where_clause.clone()),
            ("returnCountOnly", "true".to_string()),
            ("f", "json".to_string()),
        ]
    }

    pub fn page_params(&self, offset: u64, limit: u32) -> Vec<(&'static str, String)> {
        vec![
            ("where", self.query.where_clause.clone()),
            ("outFields", self.query.out_fields.clone()),
            ("returnGeometry", self.query.return_geometry.to_string()),
            ("outSR", self.query.out_sr.to_string()),
            ("f", "json".to_string()),
            ("resultOffset", offset.to_string()),
            ("resultRecordCount", limit.min(MAX_PAGE_SIZE).to_string()),
        ]
    }
}

#[async_trait]
impl FeatureSource for ArcGisClient {
    async fn total_count(&self) -> Result<u64, SourceError> {
        let resp = self
            .http
            .fetch_bytes(&self.query_url, &self.count_params(), self.count_timeout)
            .await?;
        let count = parse_count_response(&resp.body)?;
        info!(count, "total records available");
        Ok(count)
    }

    async fn fetch_page(&self, offset: u64, limit: u32) -> Result<Vec<RawFeature>, SourceError> {
        debug!(offset, limit, "fetching records");
        let resp = self
            .http
            .fetch_bytes(&self.query_url, &self.page_params(offset, limit), self.page_timeout)
            .await?;
        let features = parse_features_response(&resp.body)?;
        info!(fetched = features.len(), offset, "fetched page");
        Ok(features)
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    error: Option<JsonValue>,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    features: Option<Vec<RawFeature>>,
}

fn parse_query_response(body: &[u8]) -> Result<QueryResponse, SourceError> {
    let parsed: QueryResponse = serde_json::from_slice(body)
        .map_err(|err| SourceError::Protocol(format!("malformed query response: {err}")))?;
    if let Some(error) = &parsed.error {
        return Err(SourceError::Protocol(describe_service_error(error)));
    }
    Ok(parsed)
}

/// Total from a `returnCountOnly` response.
pub fn parse_count_response(body: &[u8]) -> Result<u64, SourceError> {
    parse_query_response(body)?
        .count
        .ok_or_else(|| SourceError::Protocol("count response has no count".to_string()))
}

/// Features from a page response. An `error` member fails even on HTTP 200.
pub fn parse_features_response(body: &[u8]) -> Result<Vec<RawFeature>, SourceError> {
    parse_query_response(body)?
        .features
        .ok_or_else(|| SourceError::Protocol("page response has no features array".to_string()))
}

fn describe_service_error(error: &JsonValue) -> String {
    let code = error.get("code").and_then(JsonValue::as_i64);
    let message = error
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or("unknown service error");
    let details = error
        .get("details")
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(JsonValue::as_str)
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|d| !d.is_empty());

    let mut text = match code {
        Some(code) => format!("service error {code}: {message}"),
        None => format!("service error: {message}"),
    };
    if let Some(details) = details {
        text.push_str(&format!(" ({details})"));
    }
    text
}
