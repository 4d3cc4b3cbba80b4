//! Permit harvest pipeline orchestration: fetch, transform, dedupe, load,
//! then aggregate refresh.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use permitiq_source::discovery::FieldDiscoveryReport;
use permitiq_source::{
    discover_fields, transform, ArcGisClient, ArcGisClientConfig, FeatureSource, SourceError,
};
use permitiq_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, PermitStore, PostgrestStore, StoreConfig,
};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod dedup;
pub mod load;

pub use config::{ConfigError, PipelineConfig, StoreSettings};
pub use dedup::{dedupe_latest, DedupOutcome};
pub use load::{
    load_permits, recompute_aggregates, refresh_statistics, table_counts, AggregateWarning,
    LoadError, LoadSettings, AGGREGATE_PROCEDURES,
};

pub const CRATE_NAME: &str = "permitiq-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("building clients: {0}")]
    Setup(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("fetch stage failed: {0}")]
    Source(#[from] SourceError),
    #[error("load stage failed: {0}")]
    Load(#[from] LoadError),
}

/// Linear run stages. `Failed` is reachable from any stage and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStage {
    Fetching,
    Transforming,
    Deduplicating,
    Loading,
    RecomputingAggregates,
    Completed,
    Failed,
}

impl RunStage {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Fetching => Some(Self::Transforming),
            Self::Transforming => Some(Self::Deduplicating),
            Self::Deduplicating => Some(Self::Loading),
            Self::Loading => Some(Self::RecomputingAggregates),
            Self::RecomputingAggregates => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fetching => "fetching",
            Self::Transforming => "transforming",
            Self::Deduplicating => "deduplicating",
            Self::Loading => "loading",
            Self::RecomputingAggregates => "recomputing_aggregates",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Ephemeral context for one run; never persisted.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    started: Instant,
    stage: RunStage,
}

impl PipelineRun {
    pub fn begin(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            dry_run,
            started_at: Utc::now(),
            started: Instant::now(),
            stage: RunStage::Fetching,
        }
    }

    pub fn stage(&self) -> RunStage {
        self.stage
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Moves to the following stage. No-op once terminal.
    pub fn advance(&mut self) -> RunStage {
        if let Some(next) = self.stage.next() {
            self.stage = next;
            info!(stage = %next, "entering stage");
        }
        self.stage
    }

    pub fn fail(&mut self, err: &PipelineError) {
        error!(stage = %self.stage, error = %err, "pipeline run failed");
        self.stage = RunStage::Failed;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub records_fetched: usize,
    pub transform_warnings: usize,
    pub records_without_key: usize,
    pub revisions_superseded: usize,
    pub records_unique: usize,
    pub records_loaded: usize,
    pub aggregates_refreshed: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub dry_run: bool,
    pub page_size: u32,
    pub load: LoadSettings,
    pub aggregate_procedures: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            dry_run: false,
            page_size: permitiq_source::MAX_PAGE_SIZE,
            load: LoadSettings::default(),
            aggregate_procedures: AGGREGATE_PROCEDURES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            dry_run: config.dry_run,
            page_size: config.page_size,
            load: LoadSettings {
                batch_size: config.upsert_batch_size,
                ..LoadSettings::default()
            },
            ..Self::default()
        }
    }
}

pub struct PermitPipeline {
    source: Arc<dyn FeatureSource>,
    store: Option<Arc<dyn PermitStore>>,
    settings: PipelineSettings,
}

impl PermitPipeline {
    /// A store is required unless the settings ask for a dry run.
    pub fn new(
        source: Arc<dyn FeatureSource>,
        store: Option<Arc<dyn PermitStore>>,
        settings: PipelineSettings,
    ) -> Result<Self, PipelineError> {
        if store.is_none() && !settings.dry_run {
            return Err(ConfigError::Missing(config::ENV_STORE_URL).into());
        }
        Ok(Self {
            source,
            store,
            settings,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.require_source_url()?;
        let source = build_source(config).map_err(|e| PipelineError::Setup(e.into()))?;
        let store: Option<Arc<dyn PermitStore>> = match &config.store {
            Some(_) => Some(Arc::new(
                build_store(config).map_err(|e| PipelineError::Setup(e.into()))?,
            )),
            None => None,
        };
        Self::new(Arc::new(source), store, PipelineSettings::from_config(config))
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runs every stage once. Any stage error ends the run in `Failed`; a
    /// rerun is the only recovery and converges because loads are upserts.
    pub async fn run_once(&self) -> Result<RunResult, PipelineError> {
        let mut run = PipelineRun::begin(self.settings.dry_run);
        let span = info_span!("pipeline_run", run_id = %run.run_id, dry_run = run.dry_run);

        async {
            if run.dry_run {
                warn!("dry run: no data will be written to the store");
            }
            info!(stage = %run.stage(), "pipeline run started");
            match self.execute(&mut run).await {
                Ok(result) => Ok(result),
                Err(err) => {
                    run.fail(&err);
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<RunResult, PipelineError> {
        let features = self.source.fetch_all(self.settings.page_size).await?;
        let records_fetched = features.len();
        info!(records_fetched, "fetched raw permit records");

        run.advance();
        let mut transform_warnings = 0usize;
        let mut transformed = Vec::with_capacity(features.len());
        for feature in &features {
            let out = transform(feature);
            for warning in &out.warnings {
                warn!(
                    permit_number = out.permit.permit_number.as_deref().unwrap_or("<none>"),
                    %warning,
                    "field omitted"
                );
            }
            transform_warnings += out.warnings.len();
            transformed.push(out.permit);
        }
        drop(features);
        info!(transformed = transformed.len(), transform_warnings, "transformed permits");

        run.advance();
        let deduped = dedupe_latest(transformed);
        info!(
            unique = deduped.permits.len(),
            superseded = deduped.superseded,
            without_key = deduped.without_key,
            "deduplicated permits"
        );

        run.advance();
        let store = if run.dry_run { None } else { self.store.as_deref() };
        let records_loaded = load_permits(store, &deduped.permits, &self.settings.load).await?;

        run.advance();
        let mut aggregates_refreshed = false;
        if let Some(store) = store {
            match recompute_aggregates(store, &self.settings.aggregate_procedures).await {
                Ok(()) => aggregates_refreshed = true,
                Err(warning) => warn!(%warning, "aggregate recomputation failed; load stands"),
            }
        }

        run.advance();
        let result = RunResult {
            run_id: run.run_id,
            dry_run: run.dry_run,
            started_at: run.started_at,
            finished_at: Utc::now(),
            duration: run.elapsed(),
            records_fetched,
            transform_warnings,
            records_without_key: deduped.without_key,
            revisions_superseded: deduped.superseded,
            records_unique: deduped.permits.len(),
            records_loaded,
            aggregates_refreshed,
        };
        info!(
            duration_secs = result.duration.as_secs_f64(),
            records_loaded,
            "pipeline run completed"
        );
        Ok(result)
    }
}

pub fn build_http(config: &PipelineConfig) -> anyhow::Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: config.page_timeout(),
        user_agent: Some(config.user_agent.clone()),
        backoff: BackoffPolicy::default(),
    })
}

pub fn build_source(config: &PipelineConfig) -> anyhow::Result<ArcGisClient> {
    let layer_url = config.require_source_url()?;
    let http = build_http(config)?;
    Ok(ArcGisClient::new(
        http,
        ArcGisClientConfig {
            count_timeout: config.count_timeout(),
            page_timeout: config.page_timeout(),
            ..ArcGisClientConfig::new(layer_url)
        },
    ))
}

pub fn build_store(config: &PipelineConfig) -> anyhow::Result<PostgrestStore> {
    let settings = config.require_store()?;
    PostgrestStore::new(StoreConfig {
        base_url: settings.url.clone(),
        service_key: settings.service_key.clone(),
        timeout: config.store_timeout(),
        user_agent: Some(config.user_agent.clone()),
    })
}

/// Library entry point: one full run against the configured source and store.
pub async fn run_pipeline(config: PipelineConfig) -> Result<RunResult, PipelineError> {
    PermitPipeline::from_config(&config)?.run_once().await
}

/// Profiles the first `sample` records of the source.
pub async fn run_discovery(
    source: &dyn FeatureSource,
    sample: u32,
) -> Result<FieldDiscoveryReport, SourceError> {
    let features = source.fetch_page(0, sample).await?;
    info!(records = features.len(), "fetched discovery sample");
    Ok(discover_fields(&features, Utc::now()))
}

pub async fn write_discovery_report(report: &FieldDiscoveryReport, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(report).context("serializing discovery report")?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "discovery report saved");
    Ok(())
}

/// Cron-driven runs; `None` when scheduling is disabled. Each tick is an
/// independent run and a failed tick does not stop the schedule.
pub async fn maybe_build_scheduler(
    pipeline: Arc<PermitPipeline>,
    config: &PipelineConfig,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(result) => info!(
                    run_id = %result.run_id,
                    records_loaded = result.records_loaded,
                    "scheduled run finished"
                ),
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_advance_linearly_to_completed() {
        let mut run = PipelineRun::begin(false);
        let mut seen = vec![run.stage()];
        while !run.stage().is_terminal() {
            seen.push(run.advance());
        }
        assert_eq!(
            seen,
            vec![
                RunStage::Fetching,
                RunStage::Transforming,
                RunStage::Deduplicating,
                RunStage::Loading,
                RunStage::RecomputingAggregates,
                RunStage::Completed,
            ]
        );
        assert_eq!(run.advance(), RunStage::Completed);
    }

    #[test]
    fn failure_is_terminal_from_any_stage() {
        let mut run = PipelineRun::begin(true);
        run.advance();
        run.fail(&PipelineError::Setup("boom".into()));
        assert_eq!(run.stage(), RunStage::Failed);
        assert_eq!(run.advance(), RunStage::Failed);
    }

    #[test]
    fn run_ids_are_unique_per_run() {
        assert_ne!(PipelineRun::begin(false).run_id, PipelineRun::begin(false).run_id);
    }

    #[test]
    fn settings_follow_config() {
        let config = PipelineConfig::from_lookup(|key| match key {
            "PERMITIQ_DRY_RUN" => Some("true".into()),
            "PERMITIQ_UPSERT_BATCH_SIZE" => Some("25".into()),
            "PERMITIQ_PAGE_SIZE" => Some("500".into()),
            _ => None,
        })
        .expect("config");
        let settings = PipelineSettings::from_config(&config);
        assert!(settings.dry_run);
        assert_eq!(settings.page_size, 500);
        assert_eq!(settings.load.batch_size, 25);
        assert_eq!(settings.load.table, "erp_permits");
        assert_eq!(
            settings.aggregate_procedures,
            vec!["calculate_daily_statistics", "calculate_hotspot_scores"]
        );
    }

    #[test]
    fn missing_source_url_is_a_config_error() {
        let config = PipelineConfig::from_lookup(|key| match key {
            "PERMITIQ_DRY_RUN" => Some("true".into()),
            _ => None,
        })
        .expect("config");
        let err = PermitPipeline::from_config(&config).err().expect("source url required");
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::Missing(config::ENV_SOURCE_URL))
        ));
    }

    #[test]
    fn setup_failures_keep_their_cause() {
        let config = PipelineConfig::from_lookup(|key| match key {
            "PERMITIQ_SWFWMD_API_URL" => Some("https://example.test/layer/0".into()),
            "PERMITIQ_SUPABASE_URL" => Some("https://db.example.test".into()),
            "PERMITIQ_SUPABASE_SERVICE_KEY" => Some("bad\nkey".into()),
            _ => None,
        })
        .expect("config");
        let err = PermitPipeline::from_config(&config).err().expect("invalid key");
        assert!(matches!(err, PipelineError::Setup(_)));
        let cause = std::error::Error::source(&err).expect("source kept");
        assert!(cause.to_string().contains("service key"), "{cause}");
    }

    #[tokio::test]
    async fn discovery_report_is_written_as_pretty_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("docs/planning/api_field_discovery.json");
        let report = discover_fields(&[], Utc::now());

        write_discovery_report(&report, &path).await.expect("write");

        let text = std::fs::read_to_string(&path).expect("read back");
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["summary"]["total_fields"], 0);
        assert!(text.contains('\n'));
    }

    #[tokio::test]
    async fn scheduler_is_not_built_when_disabled() {
        let config = PipelineConfig::from_lookup(|_| None).expect("config");
        let pipeline = PermitPipeline::new(
            Arc::new(
                build_source(&PipelineConfig {
                    source_url: Some("https://example.test/layer/0".into()),
                    ..config.clone()
                })
                .expect("source"),
            ),
            None,
            PipelineSettings {
                dry_run: true,
                ..PipelineSettings::default()
            },
        )
        .expect("pipeline");
        assert!(maybe_build_scheduler(Arc::new(pipeline), &config)
            .await
            .expect("scheduler")
            .is_none());
    }
}
