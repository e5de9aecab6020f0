//! Source query interface
//!
//! A source runs one parameterless, read-only statement and returns its
//! full result as a [`RowSet`](crate::table::RowSet).

mod memory;
mod postgres;

pub use memory::MemorySource;
pub use postgres::PostgresSource;

use crate::error::Result;
use crate::table::RowSet;
use async_trait::async_trait;

#[async_trait]
pub trait SourceDatabase: Send + Sync {
    /// Run `sql` and collect its rows in projection order
    ///
    /// # Errors
    /// Returns [`PipelineError::SourceQuery`](crate::error::PipelineError::SourceQuery)
    /// on connection failure, malformed SQL or permission denial.
    async fn query(&self, sql: &str) -> Result<RowSet>;
}
