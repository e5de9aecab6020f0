//! Table extraction into the staging area

use super::deadline;
use crate::error::Result;
use crate::source::SourceDatabase;
use crate::storage::{StagedArtifact, StagingStore, delimited};
use crate::table::TableSpec;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Runs a table's query and stages the result under its deterministic key
///
/// The staged object is replaced in one step, so a failed extraction
/// leaves the previous artifact authoritative.
///
/// # Example
/// ```no_run
/// use stagepipe::etl::TableExtractor;
/// use stagepipe::source::MemorySource;
/// use stagepipe::storage::MemoryStore;
/// use stagepipe::table::TableSpec;
/// use std::sync::Arc;
///
/// # async fn example() -> eyre::Result<()> {
/// let extractor = TableExtractor::new(
///     Arc::new(MemorySource::new()),
///     Arc::new(MemoryStore::new()),
///     "extracted-data",
///     "temp",
/// );
/// let artifact = extractor
///     .extract(&TableSpec::new("flights", "SELECT * FROM bookings.flights"))
///     .await?;
/// println!("staged {} bytes at {}", artifact.byte_length, artifact);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TableExtractor {
    source: Arc<dyn SourceDatabase>,
    store: Arc<dyn StagingStore>,
    bucket: String,
    prefix: String,
    query_timeout: Duration,
    storage_timeout: Duration,
}

impl TableExtractor {
    pub fn new(
        source: Arc<dyn SourceDatabase>,
        store: Arc<dyn StagingStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
            query_timeout: Duration::from_secs(300),
            storage_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeouts(mut self, query: Duration, storage: Duration) -> Self {
        self.query_timeout = query;
        self.storage_timeout = storage;
        self
    }

    /// Query, serialize, provision the bucket, overwrite the artifact
    ///
    /// # Errors
    /// Fails on the first step that fails; nothing is written unless the
    /// query result serialized cleanly.
    pub async fn extract(&self, spec: &TableSpec) -> Result<StagedArtifact> {
        log::debug!("[{}] Running source query", spec.name);
        let rows = deadline(
            "source query",
            self.query_timeout,
            self.source.query(&spec.query),
        )
        .await?;
        rows.check_primary_key(&spec.primary_key)?;
        log::info!(
            "[{}] Extracted {} row(s), {} column(s)",
            spec.name,
            rows.len(),
            rows.columns().len()
        );

        let bytes = Bytes::from(delimited::encode(&rows)?);

        let exists = deadline(
            "bucket check",
            self.storage_timeout,
            self.store.bucket_exists(&self.bucket),
        )
        .await?;
        if !exists {
            log::info!("Bucket '{}' not found, creating it", self.bucket);
            deadline(
                "bucket creation",
                self.storage_timeout,
                self.store.make_bucket(&self.bucket),
            )
            .await?;
        }

        let key = StagedArtifact::key_for(&self.prefix, &spec.name);
        let byte_length = bytes.len() as u64;
        deadline(
            "object upload",
            self.storage_timeout,
            self.store
                .put_object(&self.bucket, &key, bytes, delimited::CONTENT_TYPE),
        )
        .await?;

        let artifact = StagedArtifact {
            bucket: self.bucket.clone(),
            key,
            byte_length,
            content_type: delimited::CONTENT_TYPE.to_string(),
        };
        log::info!("[{}] Staged {} byte(s) at {}", spec.name, byte_length, artifact);
        Ok(artifact)
    }
}
