//! Merging staged artifacts into destination tables

use super::{JsonColumnEncoder, Transformer, deadline};
use crate::destination::{Destination, DestinationTransaction, MAX_BIND_PARAMETERS};
use crate::error::{PipelineError, Result};
use crate::storage::{StagedArtifact, StagingStore, delimited};
use crate::table::{MergePolicy, RowSet, TableSpec};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one successful merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub table: String,
    pub policy: MergePolicy,
    /// Rows replaced or upserted
    pub rows: u64,
    /// Statements the rows were sent in
    pub chunks: usize,
}

/// Reconciles a staged artifact into its destination table
///
/// Each merge runs in a single destination transaction. Replace truncates
/// and reloads; Upsert inserts new keys and overwrites the non-key columns
/// of existing ones, never deleting. Key problems are detected before the
/// transaction opens, and any later failure rolls back everything.
#[derive(Clone)]
pub struct TableMerger {
    store: Arc<dyn StagingStore>,
    destination: Arc<dyn Destination>,
    batch_size: usize,
    storage_timeout: Duration,
    transaction_timeout: Duration,
}

impl TableMerger {
    pub fn new(store: Arc<dyn StagingStore>, destination: Arc<dyn Destination>) -> Self {
        Self {
            store,
            destination,
            batch_size: 1000,
            storage_timeout: Duration::from_secs(60),
            transaction_timeout: Duration::from_secs(900),
        }
    }

    /// Rows per statement; zero is treated as one
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_timeouts(mut self, storage: Duration, transaction: Duration) -> Self {
        self.storage_timeout = storage;
        self.transaction_timeout = transaction;
        self
    }

    pub async fn merge(
        &self,
        spec: &TableSpec,
        artifact: &StagedArtifact,
        policy: MergePolicy,
    ) -> Result<MergeResult> {
        if policy == MergePolicy::Upsert && !spec.has_primary_key() {
            return Err(PipelineError::Configuration(format!(
                "table '{}' cannot be upserted without a primary key",
                spec.name
            )));
        }

        let bytes = deadline(
            "object download",
            self.storage_timeout,
            self.store.get_object(&artifact.bucket, &artifact.key),
        )
        .await?;
        let rows = delimited::decode(&bytes)?;
        let rows = JsonColumnEncoder::new(spec.json_columns.iter().cloned()).transform(rows)?;
        rows.check_primary_key(&spec.primary_key)?;

        if rows.is_empty() && policy == MergePolicy::Upsert {
            log::info!("[{}] Artifact is empty, nothing to upsert", spec.name);
            return Ok(MergeResult {
                table: spec.name.clone(),
                policy,
                rows: 0,
                chunks: 0,
            });
        }

        let result = deadline(
            "destination transaction",
            self.transaction_timeout,
            self.apply(spec, &rows, policy),
        )
        .await?;
        log::info!(
            "[{}] Merged {} row(s) with {} in {} statement(s)",
            spec.name,
            result.rows,
            policy,
            result.chunks
        );
        Ok(result)
    }

    /// Run the writes in one transaction, committing only if all succeed
    async fn apply(&self, spec: &TableSpec, rows: &RowSet, policy: MergePolicy) -> Result<MergeResult> {
        let mut tx = self.destination.begin().await?;
        match self.write(tx.as_mut(), spec, rows, policy).await {
            Ok(result) => {
                tx.commit().await?;
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    log::warn!("[{}] Rollback failed: {}", spec.name, rollback);
                }
                Err(e)
            }
        }
    }

    async fn write(
        &self,
        tx: &mut dyn DestinationTransaction,
        spec: &TableSpec,
        rows: &RowSet,
        policy: MergePolicy,
    ) -> Result<MergeResult> {
        let declared: HashSet<String> = tx
            .columns(&spec.name)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();
        if let Some(column) = rows.columns().iter().find(|c| !declared.contains(*c)) {
            return Err(PipelineError::Deserialization {
                message: format!(
                    "staged column '{}' does not exist in destination table '{}'",
                    column, spec.name
                ),
                row: None,
            });
        }

        if policy == MergePolicy::Replace {
            tx.truncate(&spec.name).await?;
        }

        let width = rows.columns().len().max(1);
        let chunk_size = self.batch_size.min(MAX_BIND_PARAMETERS / width).max(1);
        let mut chunks = 0;

        for (offset, chunk) in rows.chunks(chunk_size) {
            let affected = match policy {
                MergePolicy::Replace => tx.insert(&spec.name, rows.columns(), chunk).await,
                MergePolicy::Upsert => {
                    tx.upsert(&spec.name, rows.columns(), &spec.primary_key, chunk)
                        .await
                }
            }
            .map_err(|e| e.at_row(offset))?;

            chunks += 1;
            log::debug!(
                "[{}] Rows {}..{} written ({} affected)",
                spec.name,
                offset,
                offset + chunk.len(),
                affected
            );
        }

        Ok(MergeResult {
            table: spec.name.clone(),
            policy,
            rows: rows.len() as u64,
            chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{ColumnInfo, MemoryDestination};
    use crate::error::PrimaryKeyViolation;
    use crate::storage::MemoryStore;
    use bytes::Bytes;
    use serde_json::{Value, json};

    const BUCKET: &str = "extracted-data";

    async fn stage(store: &MemoryStore, table: &str, csv: &str) -> StagedArtifact {
        store.make_bucket(BUCKET).await.unwrap();
        let key = StagedArtifact::key_for("temp", table);
        store
            .put_object(BUCKET, &key, Bytes::from(csv.to_string()), delimited::CONTENT_TYPE)
            .await
            .unwrap();
        StagedArtifact::from_info(BUCKET, &key, store.stat_object(BUCKET, &key).await.unwrap())
    }

    async fn fixture() -> (MemoryStore, MemoryDestination, TableMerger) {
        let store = MemoryStore::new();
        let destination = MemoryDestination::new();
        destination
            .create_table(
                "t",
                vec![ColumnInfo::new("pk", "integer"), ColumnInfo::new("val", "text")],
                &["pk"],
            )
            .await;
        let merger = TableMerger::new(Arc::new(store.clone()), Arc::new(destination.clone()));
        (store, destination, merger)
    }

    async fn seed(destination: &MemoryDestination, rows: &[(&str, &str)]) {
        let mut set = RowSet::new(["pk", "val"]);
        for (pk, val) in rows {
            set.push(vec![json!(pk), json!(val)]).unwrap();
        }
        destination.seed("t", &set).await.unwrap();
    }

    fn values(rows: &RowSet) -> Vec<(Value, Value)> {
        (0..rows.len())
            .map(|i| (rows.get(i, "pk").unwrap().clone(), rows.get(i, "val").unwrap().clone()))
            .collect()
    }

    fn spec() -> TableSpec {
        TableSpec::new("t", "SELECT * FROM t").with_primary_key(["pk"])
    }

    #[tokio::test]
    async fn test_upsert_updates_inserts_and_keeps() {
        let (store, destination, merger) = fixture().await;
        seed(&destination, &[("1", "A"), ("2", "B")]).await;
        let artifact = stage(&store, "t", "pk,val\n2,C\n3,D\n").await;

        let result = merger.merge(&spec(), &artifact, MergePolicy::Upsert).await.unwrap();
        assert_eq!(result.rows, 2);

        let rows = destination.snapshot("t").await.unwrap();
        assert_eq!(
            values(&rows),
            vec![
                (json!("1"), json!("A")),
                (json!("2"), json!("C")),
                (json!("3"), json!("D")),
            ]
        );
    }

    #[tokio::test]
    async fn test_replace_twice_matches_artifact() {
        let (store, destination, merger) = fixture().await;
        seed(&destination, &[("9", "stale")]).await;
        let artifact = stage(&store, "t", "pk,val\n1,A\n2,\n").await;

        for _ in 0..2 {
            merger.merge(&spec(), &artifact, MergePolicy::Replace).await.unwrap();
            let rows = destination.snapshot("t").await.unwrap();
            assert_eq!(
                values(&rows),
                vec![(json!("1"), json!("A")), (json!("2"), json!(""))]
            );
        }
    }

    #[tokio::test]
    async fn test_small_batches_are_chunked() {
        let (store, destination, merger) = fixture().await;
        let merger = merger.with_batch_size(2);
        let artifact = stage(&store, "t", "pk,val\n1,a\n2,b\n3,c\n4,d\n5,e\n").await;

        let result = merger.merge(&spec(), &artifact, MergePolicy::Replace).await.unwrap();
        assert_eq!(result.chunks, 3);
        assert_eq!(destination.snapshot("t").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_empty_artifact() {
        let (store, destination, merger) = fixture().await;
        seed(&destination, &[("1", "A")]).await;
        let artifact = stage(&store, "t", "pk,val\n").await;

        let result = merger.merge(&spec(), &artifact, MergePolicy::Upsert).await.unwrap();
        assert_eq!(result.rows, 0);
        assert_eq!(destination.snapshot("t").await.unwrap().len(), 1);

        merger.merge(&spec(), &artifact, MergePolicy::Replace).await.unwrap();
        assert!(destination.snapshot("t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_key_leaves_destination_untouched() {
        let (store, destination, merger) = fixture().await;
        seed(&destination, &[("1", "A")]).await;
        let artifact = stage(&store, "t", "pk,val\n2,B\n2,C\n").await;

        for policy in [MergePolicy::Replace, MergePolicy::Upsert] {
            let err = merger.merge(&spec(), &artifact, policy).await.unwrap_err();
            assert!(matches!(
                err,
                PipelineError::PrimaryKeyViolation(PrimaryKeyViolation::DuplicateKey {
                    first_row: 0,
                    duplicate_row: 1,
                    ..
                })
            ));
            assert_eq!(
                values(&destination.snapshot("t").await.unwrap()),
                vec![(json!("1"), json!("A"))]
            );
        }
    }

    #[tokio::test]
    async fn test_upsert_without_key_is_configuration_error() {
        let (store, _, merger) = fixture().await;
        let artifact = stage(&store, "t", "pk,val\n1,A\n").await;
        let err = merger
            .merge(&TableSpec::new("t", "SELECT 1"), &artifact, MergePolicy::Upsert)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_truncate() {
        let (store, destination, merger) = fixture().await;
        let merger = merger.with_batch_size(1);
        seed(&destination, &[("7", "keep")]).await;
        // second statement collides with the first
        let artifact = stage(&store, "t", "pk,val\n1,A\n1,B\n").await;

        let err = merger
            .merge(&TableSpec::new("t", "SELECT 1"), &artifact, MergePolicy::Replace)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DestinationWrite { row: Some(1), .. }
        ));
        assert_eq!(
            values(&destination.snapshot("t").await.unwrap()),
            vec![(json!("7"), json!("keep"))]
        );
    }

    #[tokio::test]
    async fn test_over_length_value_fails_instead_of_truncating() {
        let store = MemoryStore::new();
        let destination = MemoryDestination::new();
        destination
            .create_table(
                "seats",
                vec![
                    ColumnInfo::new("aircraft_code", "character(3)"),
                    ColumnInfo::new("seat_no", "character varying(4)"),
                    ColumnInfo::new("fare_conditions", "character varying(10)"),
                ],
                &["aircraft_code", "seat_no"],
            )
            .await;
        let mut existing = RowSet::new(["aircraft_code", "seat_no", "fare_conditions"]);
        existing
            .push(vec![json!("773"), json!("1A"), json!("Business")])
            .unwrap();
        destination.seed("seats", &existing).await.unwrap();

        let merger = TableMerger::new(Arc::new(store.clone()), Arc::new(destination.clone()));
        let spec = TableSpec::new("seats", "SELECT * FROM bookings.seats")
            .with_primary_key(["aircraft_code", "seat_no"]);
        let artifact = stage(
            &store,
            "seats",
            "aircraft_code,seat_no,fare_conditions\n319,2A,Economy\n3199,2B,Business-Premium-Plus\n",
        )
        .await;

        let err = merger
            .merge(&spec, &artifact, MergePolicy::Replace)
            .await
            .unwrap_err();
        match err {
            PipelineError::DestinationWrite { message, row, .. } => {
                assert!(message.contains("value too long"));
                assert_eq!(row, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(destination.snapshot("seats").await.unwrap(), existing);
    }

    #[tokio::test]
    async fn test_unknown_staged_column() {
        let (store, _, merger) = fixture().await;
        let artifact = stage(&store, "t", "pk,colour\n1,red\n").await;
        let err = merger
            .merge(&spec(), &artifact, MergePolicy::Replace)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Deserialization { .. }));
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let (store, _, merger) = fixture().await;
        store.make_bucket(BUCKET).await.unwrap();
        let artifact = StagedArtifact {
            bucket: BUCKET.to_string(),
            key: "/temp/t.csv".to_string(),
            byte_length: 0,
            content_type: delimited::CONTENT_TYPE.to_string(),
        };
        let err = merger
            .merge(&spec(), &artifact, MergePolicy::Replace)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Storage(crate::storage::StorageError::NotFound { .. })
        ));
    }
}
