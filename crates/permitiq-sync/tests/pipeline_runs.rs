use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use permitiq_core::{AttributeValue, RawFeature};
use permitiq_source::{parse_features_response, FeatureSource, SourceError};
use permitiq_storage::{FetchError, MemoryStore, PermitStore};
use permitiq_sync::{ConfigError, LoadError, PermitPipeline, PipelineError, PipelineSettings};

/// Pages over a fixed feature list and records every page request.
struct ScriptedSource {
    features: Vec<RawFeature>,
    fail_at_offset: Option<u64>,
    calls: Mutex<Vec<(u64, u32)>>,
}

impl ScriptedSource {
    fn new(features: Vec<RawFeature>) -> Self {
        Self {
            features,
            fail_at_offset: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing_at(mut self, offset: u64) -> Self {
        self.fail_at_offset = Some(offset);
        self
    }

    fn calls(&self) -> Vec<(u64, u32)> {
        self.calls.lock().expect("calls").clone()
    }
}

#[async_trait]
impl FeatureSource for ScriptedSource {
    async fn total_count(&self) -> Result<u64, SourceError> {
        Ok(self.features.len() as u64)
    }

    async fn fetch_page(&self, offset: u64, limit: u32) -> Result<Vec<RawFeature>, SourceError> {
        self.calls.lock().expect("calls").push((offset, limit));
        if self.fail_at_offset == Some(offset) {
            return Err(SourceError::Unavailable(FetchError::HttpStatus {
                status: 503,
                url: format!("https://example.test/query?resultOffset={offset}"),
            }));
        }
        let start = (offset as usize).min(self.features.len());
        let end = (start + limit as usize).min(self.features.len());
        Ok(self.features[start..end].to_vec())
    }
}

fn fixture_features() -> Vec<RawFeature> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/swfwmd/query_page.json");
    let body = std::fs::read(&path).expect("fixture");
    parse_features_response(&body).expect("features")
}

fn numbered_features(n: usize) -> Vec<RawFeature> {
    (0..n)
        .map(|i| {
            let mut feature = RawFeature::default();
            feature
                .attributes
                .insert("OBJECTID".into(), AttributeValue::Integer(i as i64 + 1));
            feature
                .attributes
                .insert("ERP_PERMIT_NBR".into(), AttributeValue::Text(format!("P-{i:05}")));
            feature
        })
        .collect()
}

fn settings(dry_run: bool, page_size: u32, batch_size: usize) -> PipelineSettings {
    let mut settings = PipelineSettings {
        dry_run,
        page_size,
        ..PipelineSettings::default()
    };
    settings.load.batch_size = batch_size;
    settings
}

fn pipeline(
    source: Arc<ScriptedSource>,
    store: &Arc<MemoryStore>,
    settings: PipelineSettings,
) -> PermitPipeline {
    let store: Arc<dyn PermitStore> = store.clone();
    PermitPipeline::new(source, Some(store), settings).expect("pipeline")
}

#[tokio::test]
async fn fixture_run_keeps_latest_revision_per_permit() {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(ScriptedSource::new(fixture_features()));
    let result = pipeline(source, &store, settings(false, 1000, 100))
        .run_once()
        .await
        .expect("run");

    assert_eq!(result.records_fetched, 3);
    assert_eq!(result.records_unique, 2);
    assert_eq!(result.revisions_superseded, 1);
    assert_eq!(result.records_loaded, 2);
    assert_eq!(result.transform_warnings, 1);
    assert!(result.aggregates_refreshed);

    let rows = store.rows("erp_permits").await;
    let bell_shoals = rows
        .iter()
        .find(|r| r["permit_number"] == "43040123.001")
        .expect("bell shoals row");
    assert_eq!(bell_shoals["objectid"], 1203);
    assert_eq!(bell_shoals["permit_status"], "Modified");
    assert!(bell_shoals["geometry"]
        .as_str()
        .expect("boundary")
        .starts_with("POLYGON(("));

    let pasco = rows
        .iter()
        .find(|r| r["permit_number"] == "44012345")
        .expect("pasco row");
    let pasco = pasco.as_object().expect("object");
    assert!(!pasco.contains_key("application_date"));
    assert!(!pasco.contains_key("expiration_date"));
    assert!(!pasco.contains_key("location"));

    let procedures: Vec<String> = store.rpc_calls().await.into_iter().map(|(name, _)| name).collect();
    assert_eq!(procedures, vec!["calculate_daily_statistics", "calculate_hotspot_scores"]);
}

#[tokio::test]
async fn repeated_runs_converge_on_the_same_rows() {
    let store = Arc::new(MemoryStore::new());
    let features = numbered_features(230);

    let first = pipeline(
        Arc::new(ScriptedSource::new(features.clone())),
        &store,
        settings(false, 100, 50),
    )
    .run_once()
    .await
    .expect("first run");
    let keys_after_first = store.keys("erp_permits").await;
    let rows_after_first = store.rows("erp_permits").await;

    let second = pipeline(
        Arc::new(ScriptedSource::new(features)),
        &store,
        settings(false, 100, 50),
    )
    .run_once()
    .await
    .expect("second run");

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(keys_after_first.len(), 230);
    assert_eq!(store.keys("erp_permits").await, keys_after_first);
    assert_eq!(store.rows("erp_permits").await, rows_after_first);
    assert_eq!(store.upsert_calls().await, 10);
}

#[tokio::test]
async fn pagination_requests_each_offset_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(ScriptedSource::new(numbered_features(250)));
    let result = pipeline(source.clone(), &store, settings(false, 100, 100))
        .run_once()
        .await
        .expect("run");

    assert_eq!(source.calls(), vec![(0, 100), (100, 100), (200, 100)]);
    assert_eq!(result.records_fetched, 250);
}

#[tokio::test]
async fn dry_run_reports_counts_without_touching_the_store() {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(ScriptedSource::new(fixture_features()));
    let result = pipeline(source, &store, settings(true, 1000, 100))
        .run_once()
        .await
        .expect("dry run");

    assert!(result.dry_run);
    assert_eq!(result.records_loaded, result.records_unique);
    assert_eq!(result.records_loaded, 2);
    assert!(!result.aggregates_refreshed);
    assert_eq!(store.upsert_calls().await, 0);
    assert!(store.rpc_calls().await.is_empty());
}

#[tokio::test]
async fn dry_run_needs_no_store() {
    let source = Arc::new(ScriptedSource::new(numbered_features(5)));
    let result = PermitPipeline::new(source, None, settings(true, 1000, 100))
        .expect("pipeline")
        .run_once()
        .await
        .expect("dry run");
    assert_eq!(result.records_loaded, 5);
}

#[test]
fn live_run_without_store_is_a_config_error() {
    let source = Arc::new(ScriptedSource::new(Vec::new()));
    let err = PermitPipeline::new(source, None, settings(false, 1000, 100))
        .err()
        .expect("store required");
    assert!(matches!(
        err,
        PipelineError::Config(ConfigError::Missing("PERMITIQ_SUPABASE_URL"))
    ));
}

#[tokio::test]
async fn source_failure_aborts_before_any_write() {
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(ScriptedSource::new(numbered_features(250)).failing_at(100));
    let err = pipeline(source, &store, settings(false, 100, 100))
        .run_once()
        .await
        .expect_err("source down");

    assert!(matches!(err, PipelineError::Source(SourceError::Unavailable(_))));
    assert_eq!(store.upsert_calls().await, 0);
    assert!(store.rpc_calls().await.is_empty());
}

#[tokio::test]
async fn load_failure_keeps_committed_batches_and_skips_aggregates() {
    let store = Arc::new(MemoryStore::new().failing_upsert_call(2));
    let source = Arc::new(ScriptedSource::new(numbered_features(250)));
    let err = pipeline(source, &store, settings(false, 1000, 100))
        .run_once()
        .await
        .expect_err("third batch fails");

    match err {
        PipelineError::Load(LoadError::Batch {
            batch_index,
            committed,
            ..
        }) => {
            assert_eq!(batch_index, 2);
            assert_eq!(committed, 200);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(store.keys("erp_permits").await.len(), 200);
    assert!(store.rpc_calls().await.is_empty());
}

#[tokio::test]
async fn aggregate_failure_is_only_a_warning() {
    let store = Arc::new(MemoryStore::new().failing_rpc("calculate_hotspot_scores"));
    let source = Arc::new(ScriptedSource::new(numbered_features(10)));
    let result = pipeline(source, &store, settings(false, 1000, 100))
        .run_once()
        .await
        .expect("run succeeds despite aggregate failure");

    assert_eq!(result.records_loaded, 10);
    assert!(!result.aggregates_refreshed);
    assert_eq!(store.rpc_calls().await.len(), 2);
}
