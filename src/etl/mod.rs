//! Extract, stage and merge
//!
//! This module provides the per-table workers and the orchestrator:
//! - [`TableExtractor`] runs a table's query and stages the result
//! - [`JsonColumnEncoder`] re-encodes semi-structured columns
//! - [`TableMerger`] reconciles a staged artifact into the destination
//! - [`Pipeline`] runs the extract phase, waits, then runs the merge phase

mod extract;
mod load;
mod pipeline;
mod transform;

pub use extract::TableExtractor;
pub use load::{MergeResult, TableMerger};
pub use pipeline::{MergeStatus, Pipeline, PipelineOptions, RunReport, TableOutcome};
pub use transform::{JsonColumnEncoder, Transformer};

use crate::error::{PipelineError, Result};
use std::future::Future;
use std::time::Duration;

/// Await `future`, failing with [`PipelineError::Timeout`] after `after`
pub(crate) async fn deadline<T, E, F>(operation: &'static str, after: Duration, future: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<PipelineError>,
{
    match tokio::time::timeout(after, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(PipelineError::Timeout { operation, after }),
    }
}
