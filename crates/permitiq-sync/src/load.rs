//! Batched upsert of permits and the post-load procedure calls.

use permitiq_core::NormalizedPermit;
use permitiq_storage::{PermitStore, StoreError};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

pub const PERMITS_TABLE: &str = "erp_permits";
pub const PERMITS_CONFLICT_KEY: &str = "permit_number";

/// Procedures run after a successful load, in order.
pub const AGGREGATE_PROCEDURES: [&str; 2] = ["calculate_daily_statistics", "calculate_hotspot_scores"];

pub const REFRESH_STATISTICS_PROCEDURE: &str = "refresh_statistics";

/// Tables reported by [`table_counts`].
pub const COUNTED_TABLES: [&str; 3] = ["erp_permits", "erp_permit_changes", "erp_statistics"];

#[derive(Debug, Clone)]
pub struct LoadSettings {
    pub table: String,
    pub conflict_key: String,
    pub batch_size: usize,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            table: PERMITS_TABLE.to_string(),
            conflict_key: PERMITS_CONFLICT_KEY.to_string(),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("serializing permit row: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("upsert batch {batch_index} of {batch_count} failed after {committed} rows were committed: {source}")]
    Batch {
        batch_index: usize,
        batch_count: usize,
        committed: usize,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error)]
#[error("aggregate procedure {procedure} failed: {source}")]
pub struct AggregateWarning {
    pub procedure: String,
    #[source]
    pub source: StoreError,
}

/// Serialized store rows. Absent fields are not present as keys.
pub fn permit_rows(permits: &[NormalizedPermit]) -> Result<Vec<JsonValue>, serde_json::Error> {
    permits.iter().map(serde_json::to_value).collect()
}

/// Upserts `permits` in batches keyed on the conflict column; an existing row
/// is replaced on conflict. Stops at the first failing batch, leaving earlier
/// batches committed. With `store` absent (dry run) nothing is written and
/// the would-be count is returned.
pub async fn load_permits(
    store: Option<&dyn PermitStore>,
    permits: &[NormalizedPermit],
    settings: &LoadSettings,
) -> Result<usize, LoadError> {
    let Some(store) = store else {
        info!(count = permits.len(), "dry run: would upsert permits");
        return Ok(permits.len());
    };

    let rows = permit_rows(permits)?;
    let batch_size = settings.batch_size.max(1);
    let batch_count = rows.len().div_ceil(batch_size);
    let mut committed = 0usize;

    for (batch_index, batch) in rows.chunks(batch_size).enumerate() {
        store
            .upsert(&settings.table, batch, &settings.conflict_key)
            .await
            .map_err(|source| LoadError::Batch {
                batch_index,
                batch_count,
                committed,
                source,
            })?;
        committed += batch.len();
        info!(committed, total = rows.len(), "upserted batch");
    }

    info!(committed, table = %settings.table, "upsert complete");
    Ok(committed)
}

/// Runs each procedure in order with no parameters. The first failure is
/// returned as a warning and the remaining procedures are skipped.
pub async fn recompute_aggregates(
    store: &dyn PermitStore,
    procedures: &[String],
) -> Result<(), AggregateWarning> {
    for procedure in procedures {
        store
            .call_rpc(procedure, json!({}))
            .await
            .map_err(|source| AggregateWarning {
                procedure: procedure.clone(),
                source,
            })?;
        info!(procedure = %procedure, "aggregate procedure finished");
    }
    Ok(())
}

pub async fn refresh_statistics(store: &dyn PermitStore, days_back: u32) -> Result<(), StoreError> {
    info!(days_back, "refreshing statistics");
    store
        .call_rpc(REFRESH_STATISTICS_PROCEDURE, json!({ "days_back": days_back }))
        .await
}

pub async fn table_counts(store: &dyn PermitStore) -> Result<Vec<(&'static str, u64)>, StoreError> {
    let mut counts = Vec::with_capacity(COUNTED_TABLES.len());
    for table in COUNTED_TABLES {
        let count = store.count_rows(table).await.inspect_err(|err| {
            warn!(table, error = %err, "row count failed");
        })?;
        counts.push((table, count));
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use permitiq_core::AttributeBag;
    use permitiq_storage::MemoryStore;

    fn permits(n: usize) -> Vec<NormalizedPermit> {
        (0..n)
            .map(|i| {
                let mut p = NormalizedPermit::from_payload(AttributeBag::new());
                p.permit_number = Some(format!("P-{i:04}"));
                p.revision_id = Some(i as i64);
                p
            })
            .collect()
    }

    fn settings(batch_size: usize) -> LoadSettings {
        LoadSettings {
            batch_size,
            ..LoadSettings::default()
        }
    }

    #[tokio::test]
    async fn rows_are_written_in_fixed_size_batches() {
        let store = MemoryStore::new();
        let loaded = load_permits(Some(&store), &permits(250), &settings(100))
            .await
            .expect("load");

        assert_eq!(loaded, 250);
        assert_eq!(store.upsert_calls().await, 3);
        assert_eq!(store.count_rows(PERMITS_TABLE).await.expect("count"), 250);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing_and_reports_would_be_count() {
        let loaded = load_permits(None, &permits(42), &settings(10))
            .await
            .expect("dry run");
        assert_eq!(loaded, 42);
    }

    #[tokio::test]
    async fn failed_batch_aborts_but_keeps_earlier_batches() {
        let store = MemoryStore::new().failing_upsert_call(1);
        let err = load_permits(Some(&store), &permits(250), &settings(100))
            .await
            .expect_err("second batch fails");

        match err {
            LoadError::Batch {
                batch_index,
                batch_count,
                committed,
                ..
            } => {
                assert_eq!(batch_index, 1);
                assert_eq!(batch_count, 3);
                assert_eq!(committed, 100);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(store.upsert_calls().await, 2);
        assert_eq!(store.count_rows(PERMITS_TABLE).await.expect("count"), 100);
    }

    #[tokio::test]
    async fn aggregate_failure_stops_remaining_procedures() {
        let store = MemoryStore::new().failing_rpc("calculate_daily_statistics");
        let procedures: Vec<String> = AGGREGATE_PROCEDURES.iter().map(|s| s.to_string()).collect();
        let warning = recompute_aggregates(&store, &procedures)
            .await
            .expect_err("first procedure fails");

        assert_eq!(warning.procedure, "calculate_daily_statistics");
        assert_eq!(store.rpc_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn statistics_refresh_passes_days_back() {
        let store = MemoryStore::new();
        refresh_statistics(&store, 7).await.expect("refresh");
        assert_eq!(
            store.rpc_calls().await,
            vec![("refresh_statistics".to_string(), json!({"days_back": 7}))]
        );
    }

    #[tokio::test]
    async fn table_counts_cover_every_reported_table() {
        let store = MemoryStore::new();
        load_permits(Some(&store), &permits(3), &settings(100))
            .await
            .expect("load");
        let counts = table_counts(&store).await.expect("counts");
        assert_eq!(
            counts,
            vec![("erp_permits", 3), ("erp_permit_changes", 0), ("erp_statistics", 0)]
        );
    }
}
