//! Stagepipe
//!
//! Moves relational tables from a source database through an object-store
//! staging area into a destination schema, one table at a time.

pub mod cli;
pub mod config;
pub mod destination;
pub mod error;
pub mod etl;
pub mod source;
pub mod storage;
pub mod table;

// Re-exports for convenience
pub use destination::{Destination, MemoryDestination, PostgresDestination};
pub use error::{PipelineError, TableError};
pub use etl::{Pipeline, PipelineOptions, RunReport, TableExtractor, TableMerger};
pub use source::{MemorySource, PostgresSource, SourceDatabase};
pub use storage::{MemoryStore, S3Store, StagedArtifact, StagingStore};
pub use table::{MergePolicy, RowSet, TableSpec};
