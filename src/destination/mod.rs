//! Destination database interface
//!
//! The merger drives a destination through one [`DestinationTransaction`]
//! per table run. Nothing written inside it is visible until `commit`, and
//! dropping it uncommitted discards every change.

mod memory;
mod postgres;

pub use memory::MemoryDestination;
pub use postgres::PostgresDestination;

use crate::error::Result;
use crate::table::Cell;
use async_trait::async_trait;

/// Most bind parameters one statement may carry (PostgreSQL's wire limit)
pub const MAX_BIND_PARAMETERS: usize = 65_535;

/// A destination column and its declared SQL type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub sql_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

/// Transactional connection to the destination schema
#[async_trait]
pub trait Destination: Send + Sync {
    /// Open a transaction on a connection of its own
    async fn begin(&self) -> Result<Box<dyn DestinationTransaction>>;
}

/// Operations inside one destination transaction
///
/// Table names are unqualified; the destination owns the schema.
#[async_trait]
pub trait DestinationTransaction: Send {
    /// Columns of `table` in declaration order
    ///
    /// # Errors
    /// Returns a configuration error if the table does not exist.
    async fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Remove every row, cascading to dependent tables
    async fn truncate(&mut self, table: &str) -> Result<()>;

    /// Insert `rows`, positionally matching `columns`
    async fn insert(&mut self, table: &str, columns: &[String], rows: &[Vec<Cell>]) -> Result<u64>;

    /// Insert `rows`, overwriting the non-key columns of rows whose `key` already exists
    async fn upsert(
        &mut self,
        table: &str,
        columns: &[String],
        key: &[String],
        rows: &[Vec<Cell>],
    ) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
