//! Error taxonomy for per-table pipeline failures
//!
//! Every failure is scoped to one table. The orchestrator wraps a
//! [`PipelineError`] in a [`TableError`] naming the table and the phase it
//! failed in, so sibling tables keep running.

use crate::storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Boxed error used for backend-specific causes (postgres, S3, I/O)
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias for pipeline operations
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Failure of one table's extraction or merge
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Connection failure, malformed query or permission denial on the source
    #[error("source query failed: {message}")]
    SourceQuery {
        message: String,
        /// True when the failure happened before the query ran (connect, auth)
        connection: bool,
        #[source]
        source: Option<BoxError>,
    },

    /// RowSet could not be written in the interchange format
    #[error("serialization failed{}: {message}", row_suffix(.row))]
    Serialization { message: String, row: Option<usize> },

    /// Object store failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Staged artifact is corrupt or incompatible with the destination
    #[error("deserialization failed{}: {message}", row_suffix(.row))]
    Deserialization { message: String, row: Option<usize> },

    /// Declared key missing, null or duplicated in the RowSet
    #[error(transparent)]
    PrimaryKeyViolation(#[from] PrimaryKeyViolation),

    /// Destination transaction failed and was rolled back
    #[error("destination write failed{}: {message}", row_suffix(.row))]
    DestinationWrite {
        message: String,
        /// First row of the statement that failed, when known
        row: Option<usize>,
        #[source]
        source: Option<BoxError>,
    },

    /// Table configuration cannot satisfy the requested operation
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An external call exceeded its deadline
    #[error("{operation} timed out after {}s", .after.as_secs_f64())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

fn row_suffix(row: &Option<usize>) -> String {
    match row {
        Some(row) => format!(" at row {}", row),
        None => String::new(),
    }
}

/// Server message and SQLSTATE when there is one, otherwise the client-side error
pub(crate) fn describe_postgres(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => format!("{} ({})", db.message(), db.code().code()),
        None => err.to_string(),
    }
}

impl PipelineError {
    pub fn source_query(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::SourceQuery {
            message: message.into(),
            connection: false,
            source: Some(source.into()),
        }
    }

    pub fn source_connection(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::SourceQuery {
            message: message.into(),
            connection: true,
            source: Some(source.into()),
        }
    }

    pub fn destination_write(
        message: impl Into<String>,
        row: Option<usize>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::DestinationWrite {
            message: message.into(),
            row,
            source: Some(source.into()),
        }
    }

    /// Attribute a destination write failure to the statement starting at
    /// `offset`. A row already reported is relative to that statement.
    pub fn at_row(self, offset: usize) -> Self {
        match self {
            Self::DestinationWrite {
                message,
                row,
                source,
            } => Self::DestinationWrite {
                message,
                row: Some(offset + row.unwrap_or(0)),
                source,
            },
            other => other,
        }
    }

    /// Whether retrying the table on the next scheduled run may succeed
    /// without any configuration or data change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SourceQuery { connection, .. } => *connection,
            Self::Storage(e) => e.is_retryable(),
            Self::DestinationWrite { .. } | Self::Timeout { .. } => true,
            Self::Serialization { .. }
            | Self::Deserialization { .. }
            | Self::PrimaryKeyViolation(_)
            | Self::Configuration(_) => false,
        }
    }
}

/// Primary-key problems detected before any destination write
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrimaryKeyViolation {
    #[error("primary key column '{column}' is missing from the row set")]
    MissingColumn { column: String },

    #[error("primary key column '{column}' is null at row {row}")]
    NullKey { column: String, row: usize },

    #[error("duplicate primary key {key:?} at rows {first_row} and {duplicate_row}")]
    DuplicateKey {
        key: Vec<String>,
        first_row: usize,
        duplicate_row: usize,
    },
}

/// Which half of a table's run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Extract,
    Load,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Extract => write!(f, "extract"),
            Self::Load => write!(f, "load"),
        }
    }
}

/// A [`PipelineError`] attributed to a table and phase
#[derive(Debug, Error)]
#[error("table '{table}' failed during {phase}: {source}")]
pub struct TableError {
    pub table: String,
    pub phase: Phase,
    #[source]
    pub source: PipelineError,
}

impl TableError {
    pub fn new(table: impl Into<String>, phase: Phase, source: PipelineError) -> Self {
        Self {
            table: table.into(),
            phase,
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_error_display() {
        let err = TableError::new(
            "bookings",
            Phase::Load,
            PrimaryKeyViolation::DuplicateKey {
                key: vec!["42".to_string()],
                first_row: 0,
                duplicate_row: 3,
            }
            .into(),
        );
        assert_eq!(
            err.to_string(),
            "table 'bookings' failed during load: duplicate primary key [\"42\"] at rows 0 and 3"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_row_suffix_in_messages() {
        let err = PipelineError::Deserialization {
            message: "found 3 fields, expected 2".to_string(),
            row: Some(7),
        };
        assert_eq!(
            err.to_string(),
            "deserialization failed at row 7: found 3 fields, expected 2"
        );

        let err = PipelineError::Serialization {
            message: "broken pipe".to_string(),
            row: None,
        };
        assert_eq!(err.to_string(), "serialization failed: broken pipe");
    }

    #[test]
    fn test_retryable_classification() {
        let timeout = PipelineError::Timeout {
            operation: "source query",
            after: Duration::from_secs(30),
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.to_string(), "source query timed out after 30s");

        let io = std::io::Error::other("refused");
        assert!(PipelineError::source_connection("connect", io).is_retryable());

        let io = std::io::Error::other("syntax error");
        assert!(!PipelineError::source_query("bad sql", io).is_retryable());

        assert!(!PipelineError::Configuration("no key".to_string()).is_retryable());
    }

    #[test]
    fn test_at_row_offsets_statement_rows() {
        let err = PipelineError::DestinationWrite {
            message: "value too long".to_string(),
            row: None,
            source: None,
        }
        .at_row(2000);
        assert_eq!(err.to_string(), "destination write failed at row 2000: value too long");

        let err = err.at_row(5);
        assert!(matches!(err, PipelineError::DestinationWrite { row: Some(2005), .. }));
    }
}
