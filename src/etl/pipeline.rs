//! Two-phase orchestration across tables

use super::{MergeResult, TableExtractor, TableMerger, deadline};
use crate::destination::Destination;
use crate::error::{Phase, TableError};
use crate::source::SourceDatabase;
use crate::storage::{StagedArtifact, StagingStore};
use crate::table::{MergePolicy, TableSpec};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;

/// Run-wide settings shared by every table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub bucket: String,
    pub staging_prefix: String,
    /// Policy for tables that do not set their own
    pub default_policy: MergePolicy,
    pub batch_size: usize,
    /// Concurrent extractions
    pub max_parallel_tables: usize,
    /// Concurrent merges; at 1 tables merge in configuration order, so a
    /// cascading truncate of a parent runs before its children load
    pub max_parallel_merges: usize,
    pub query_timeout: Duration,
    pub storage_timeout: Duration,
    pub transaction_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            bucket: "extracted-data".to_string(),
            staging_prefix: "temp".to_string(),
            default_policy: MergePolicy::Replace,
            batch_size: 1000,
            max_parallel_tables: 4,
            max_parallel_merges: 1,
            query_timeout: Duration::from_secs(300),
            storage_timeout: Duration::from_secs(60),
            transaction_timeout: Duration::from_secs(900),
        }
    }
}

/// What happened to a table's merge
#[derive(Debug)]
pub enum MergeStatus {
    Merged(MergeResult),
    Failed(TableError),
    /// Extraction failed, so there was nothing trustworthy to merge
    Skipped,
    /// The run did not include a load phase
    NotRun,
}

/// Per-table result of a run
#[derive(Debug)]
pub struct TableOutcome {
    pub table: String,
    /// `None` when the run had no extract phase
    pub extract: Option<Result<StagedArtifact, TableError>>,
    pub merge: MergeStatus,
}

impl TableOutcome {
    pub fn errors(&self) -> impl Iterator<Item = &TableError> {
        let extract = match &self.extract {
            Some(Err(e)) => Some(e),
            _ => None,
        };
        let merge = match &self.merge {
            MergeStatus::Failed(e) => Some(e),
            _ => None,
        };
        extract.into_iter().chain(merge)
    }

    pub fn is_success(&self) -> bool {
        self.errors().next().is_none()
    }
}

/// Outcomes of every table in a run, in configuration order
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<TableOutcome>,
}

impl RunReport {
    pub fn failed(&self) -> impl Iterator<Item = &TableError> {
        self.outcomes.iter().flat_map(|o| o.errors())
    }

    /// Tables with no failure in any phase that ran
    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|o| o.is_success())
            .map(|o| o.table.as_str())
    }

    pub fn is_success(&self) -> bool {
        self.failed().next().is_none()
    }

    pub fn outcome(&self, table: &str) -> Option<&TableOutcome> {
        self.outcomes.iter().find(|o| o.table == table)
    }
}

fn report_failure(error: &TableError) {
    log::error!(
        "Table '{}' failed during {} ({}): {}",
        error.table,
        error.phase,
        if error.is_retryable() {
            "retryable"
        } else {
            "not retryable"
        },
        error.source
    );
}

/// Extract every table, then merge every table whose extraction succeeded
///
/// Extractions run concurrently up to `max_parallel_tables`, merges up to
/// `max_parallel_merges`. A failing table is logged and recorded; its siblings carry on.
///
/// # Example
/// ```no_run
/// use stagepipe::destination::MemoryDestination;
/// use stagepipe::etl::{Pipeline, PipelineOptions};
/// use stagepipe::source::MemorySource;
/// use stagepipe::storage::MemoryStore;
/// use stagepipe::table::TableSpec;
/// use std::sync::Arc;
///
/// # async fn example() {
/// let pipeline = Pipeline::new(
///     Arc::new(MemorySource::new()),
///     Arc::new(MemoryStore::new()),
///     Arc::new(MemoryDestination::new()),
///     PipelineOptions::default(),
/// );
/// let report = pipeline
///     .run(&[TableSpec::new("flights", "SELECT * FROM bookings.flights")])
///     .await;
/// for error in report.failed() {
///     eprintln!("{}", error);
/// }
/// # }
/// ```
pub struct Pipeline {
    extractor: TableExtractor,
    merger: TableMerger,
    store: Arc<dyn StagingStore>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn SourceDatabase>,
        store: Arc<dyn StagingStore>,
        destination: Arc<dyn Destination>,
        options: PipelineOptions,
    ) -> Self {
        let extractor = TableExtractor::new(
            source,
            Arc::clone(&store),
            &options.bucket,
            &options.staging_prefix,
        )
        .with_timeouts(options.query_timeout, options.storage_timeout);

        let merger = TableMerger::new(Arc::clone(&store), destination)
            .with_batch_size(options.batch_size)
            .with_timeouts(options.storage_timeout, options.transaction_timeout);

        Self {
            extractor,
            merger,
            store,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    fn extract_parallelism(&self) -> usize {
        self.options.max_parallel_tables.max(1)
    }

    fn merge_parallelism(&self) -> usize {
        self.options.max_parallel_merges.max(1)
    }

    async fn extract_phase(&self, specs: &[TableSpec]) -> Vec<Result<StagedArtifact, TableError>> {
        log::info!("Extract phase: {} table(s)", specs.len());
        stream::iter(specs)
            .map(|spec| async move {
                self.extractor
                    .extract(spec)
                    .await
                    .map_err(|e| TableError::new(&spec.name, Phase::Extract, e))
                    .inspect_err(report_failure)
            })
            .buffered(self.extract_parallelism())
            .collect()
            .await
    }

    async fn merge_one(
        &self,
        spec: &TableSpec,
        artifact: &StagedArtifact,
        policy: Option<MergePolicy>,
    ) -> MergeStatus {
        let policy = policy.unwrap_or_else(|| spec.policy_or(self.options.default_policy));
        match self.merger.merge(spec, artifact, policy).await {
            Ok(result) => MergeStatus::Merged(result),
            Err(e) => {
                let error = TableError::new(&spec.name, Phase::Load, e);
                report_failure(&error);
                MergeStatus::Failed(error)
            }
        }
    }

    /// Both phases, with a barrier between them
    pub async fn run(&self, specs: &[TableSpec]) -> RunReport {
        self.run_with_policy(specs, None).await
    }

    /// Both phases, merging every table with `policy` when given
    pub async fn run_with_policy(&self, specs: &[TableSpec], policy: Option<MergePolicy>) -> RunReport {
        let extracted = self.extract_phase(specs).await;

        log::info!("Merge phase: {} table(s)", specs.len());
        let merges: Vec<MergeStatus> = stream::iter(specs.iter().zip(&extracted))
            .map(|(spec, extract)| async move {
                match extract {
                    Ok(artifact) => self.merge_one(spec, artifact, policy).await,
                    Err(_) => {
                        log::warn!("[{}] Skipping merge, extraction failed", spec.name);
                        MergeStatus::Skipped
                    }
                }
            })
            .buffered(self.merge_parallelism())
            .collect()
            .await;

        let report = RunReport {
            outcomes: specs
                .iter()
                .zip(extracted)
                .zip(merges)
                .map(|((spec, extract), merge)| TableOutcome {
                    table: spec.name.clone(),
                    extract: Some(extract),
                    merge,
                })
                .collect(),
        };
        log_summary(&report);
        report
    }

    /// Extract phase only, leaving artifacts staged for a later load
    pub async fn extract_only(&self, specs: &[TableSpec]) -> RunReport {
        let extracted = self.extract_phase(specs).await;
        let report = RunReport {
            outcomes: specs
                .iter()
                .zip(extracted)
                .map(|(spec, extract)| TableOutcome {
                    table: spec.name.clone(),
                    extract: Some(extract),
                    merge: MergeStatus::NotRun,
                })
                .collect(),
        };
        log_summary(&report);
        report
    }

    /// Merge phase only, from each table's currently staged artifact
    pub async fn load_only(&self, specs: &[TableSpec], policy: Option<MergePolicy>) -> RunReport {
        log::info!("Merge phase: {} table(s)", specs.len());
        let merges: Vec<MergeStatus> = stream::iter(specs)
            .map(|spec| async move {
                match self.locate(spec).await {
                    Ok(artifact) => self.merge_one(spec, &artifact, policy).await,
                    Err(error) => {
                        report_failure(&error);
                        MergeStatus::Failed(error)
                    }
                }
            })
            .buffered(self.merge_parallelism())
            .collect()
            .await;

        let report = RunReport {
            outcomes: specs
                .iter()
                .zip(merges)
                .map(|(spec, merge)| TableOutcome {
                    table: spec.name.clone(),
                    extract: None,
                    merge,
                })
                .collect(),
        };
        log_summary(&report);
        report
    }

    /// The table's current artifact at its deterministic key
    async fn locate(&self, spec: &TableSpec) -> Result<StagedArtifact, TableError> {
        let key = StagedArtifact::key_for(&self.options.staging_prefix, &spec.name);
        deadline(
            "object lookup",
            self.options.storage_timeout,
            self.store.stat_object(&self.options.bucket, &key),
        )
        .await
        .map(|info| StagedArtifact::from_info(&self.options.bucket, key, info))
        .map_err(|e| TableError::new(&spec.name, Phase::Load, e))
    }
}

fn log_summary(report: &RunReport) {
    let failed = report.outcomes.iter().filter(|o| !o.is_success()).count();
    let total = report.outcomes.len();
    if failed == 0 {
        log::info!("Run finished: {} table(s) succeeded", total);
    } else {
        log::warn!(
            "Run finished: {} of {} table(s) failed",
            failed,
            total
        );
    }
}
