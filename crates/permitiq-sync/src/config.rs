//! Environment-sourced run configuration.

use std::time::Duration;

use permitiq_source::MAX_PAGE_SIZE;
use thiserror::Error;

pub const ENV_SOURCE_URL: &str = "PERMITIQ_SWFWMD_API_URL";
pub const ENV_STORE_URL: &str = "PERMITIQ_SUPABASE_URL";
pub const ENV_STORE_KEY: &str = "PERMITIQ_SUPABASE_SERVICE_KEY";
pub const ENV_DRY_RUN: &str = "PERMITIQ_DRY_RUN";
pub const ENV_LOG_LEVEL: &str = "PERMITIQ_LOG_LEVEL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone)]
pub struct StoreSettings {
    pub url: String,
    pub service_key: String,
}

impl std::fmt::Debug for StoreSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSettings")
            .field("url", &self.url)
            .field("service_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source_url: Option<String>,
    pub store: Option<StoreSettings>,
    pub dry_run: bool,
    /// Tracing filter; `None` defers to `RUST_LOG`.
    pub log_level: Option<String>,
    pub page_size: u32,
    pub upsert_batch_size: usize,
    pub count_timeout_secs: u64,
    pub page_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let store = match (get(ENV_STORE_URL), get(ENV_STORE_KEY)) {
            (Some(url), Some(service_key)) => Some(StoreSettings { url, service_key }),
            (Some(_), None) => return Err(ConfigError::Missing(ENV_STORE_KEY)),
            (None, Some(_)) => return Err(ConfigError::Missing(ENV_STORE_URL)),
            (None, None) => None,
        };

        let page_size: u32 = parse_or(&get, "PERMITIQ_PAGE_SIZE", MAX_PAGE_SIZE)?;

        Ok(Self {
            source_url: get(ENV_SOURCE_URL),
            store,
            dry_run: parse_flag(&get, ENV_DRY_RUN)?,
            log_level: get(ENV_LOG_LEVEL),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            upsert_batch_size: parse_or(&get, "PERMITIQ_UPSERT_BATCH_SIZE", 100usize)?.max(1),
            count_timeout_secs: parse_or(&get, "PERMITIQ_COUNT_TIMEOUT_SECS", 30)?,
            page_timeout_secs: parse_or(&get, "PERMITIQ_PAGE_TIMEOUT_SECS", 60)?,
            store_timeout_secs: parse_or(&get, "PERMITIQ_STORE_TIMEOUT_SECS", 60)?,
            user_agent: get("PERMITIQ_USER_AGENT").unwrap_or_else(|| "permitiq-etl/0.1".to_string()),
            scheduler_enabled: parse_flag(&get, "PERMITIQ_SCHEDULER_ENABLED")?,
            sync_cron: get("PERMITIQ_SYNC_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
        })
    }

    pub fn require_source_url(&self) -> Result<&str, ConfigError> {
        self.source_url
            .as_deref()
            .ok_or(ConfigError::Missing(ENV_SOURCE_URL))
    }

    pub fn require_store(&self) -> Result<&StoreSettings, ConfigError> {
        self.store.as_ref().ok_or(ConfigError::Missing(ENV_STORE_URL))
    }

    /// `log_level` as a tracing filter directive. Accepts the usual
    /// `WARNING`/`CRITICAL` spellings.
    pub fn log_filter(&self) -> Option<String> {
        self.log_level.as_deref().map(|level| match level.to_ascii_lowercase().as_str() {
            "warning" => "warn".to_string(),
            "critical" | "fatal" => "error".to_string(),
            other => other.to_string(),
        })
    }

    pub fn count_timeout(&self) -> Duration {
        Duration::from_secs(self.count_timeout_secs)
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

fn parse_flag(get: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<bool, ConfigError> {
    match get(name) {
        None => Ok(false),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value: v }),
        },
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(name) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid { name, value: v }),
    }
}
