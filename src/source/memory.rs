//! Static in-process source

use super::SourceDatabase;
use crate::error::{PipelineError, Result};
use crate::table::RowSet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
enum Response {
    Rows(RowSet),
    Failure(String),
}

/// Source answering fixed queries with fixed results
///
/// Clones share state, so a test can change a table between runs.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    responses: Arc<RwLock<HashMap<String, Response>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `sql` with `rows`
    pub async fn set_rows(&self, sql: impl Into<String>, rows: RowSet) {
        self.responses
            .write()
            .await
            .insert(sql.into().trim().to_string(), Response::Rows(rows));
    }

    /// Make `sql` fail with `message`
    pub async fn set_failure(&self, sql: impl Into<String>, message: impl Into<String>) {
        self.responses
            .write()
            .await
            .insert(sql.into().trim().to_string(), Response::Failure(message.into()));
    }
}

#[async_trait]
impl SourceDatabase for MemorySource {
    async fn query(&self, sql: &str) -> Result<RowSet> {
        match self.responses.read().await.get(sql.trim()) {
            Some(Response::Rows(rows)) => Ok(rows.clone()),
            Some(Response::Failure(message)) => Err(PipelineError::SourceQuery {
                message: message.clone(),
                connection: false,
                source: None,
            }),
            None => Err(PipelineError::SourceQuery {
                message: format!("no result registered for query: {}", sql.trim()),
                connection: false,
                source: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_registered_rows_and_failures() {
        let source = MemorySource::new();
        let mut rows = RowSet::new(["id"]);
        rows.push(vec![json!("1")]).unwrap();
        source.set_rows("SELECT id FROM t", rows.clone()).await;
        source.set_failure("SELECT * FROM locked", "permission denied").await;

        assert_eq!(source.query("  SELECT id FROM t\n").await.unwrap(), rows);

        let err = source.query("SELECT * FROM locked").await.unwrap_err();
        assert_eq!(err.to_string(), "source query failed: permission denied");

        assert!(source.query("SELECT 1").await.is_err());
    }
}
