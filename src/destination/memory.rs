//! In-process destination with transactional semantics

use super::{ColumnInfo, Destination, DestinationTransaction};
use crate::error::{PipelineError, Result};
use crate::table::{Cell, RowSet};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: Vec<ColumnInfo>,
    key: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl MemoryTable {
    fn index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    fn key_of(&self, row: &[Cell]) -> Vec<Cell> {
        self.key
            .iter()
            .filter_map(|k| self.index(k).map(|i| row[i].clone()))
            .collect()
    }

    fn find(&self, key: &[Cell]) -> Option<usize> {
        self.rows.iter().position(|row| self.key_of(row) == key)
    }
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    /// table -> message of an injected write failure
    failures: HashMap<String, String>,
}

/// Destination schema held in memory
///
/// A transaction works on a private copy of the schema and writes back only
/// the tables it touched on commit, so concurrent merges of different tables
/// do not overwrite each other. Declared keys are enforced as unique,
/// `json`/`jsonb` columns reject text that is not valid JSON, and
/// `character(n)`/`character varying(n)` columns reject longer text.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    state: Arc<Mutex<State>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or recreate empty) a table with a unique `key`
    pub async fn create_table(&self, name: &str, columns: Vec<ColumnInfo>, key: &[&str]) {
        self.state.lock().await.tables.insert(
            name.to_string(),
            MemoryTable {
                columns,
                key: key.iter().map(|k| k.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Append rows directly, bypassing transactions and constraints
    ///
    /// Columns absent from `rows` are filled with NULL.
    pub async fn seed(&self, name: &str, rows: &RowSet) -> Result<()> {
        let mut state = self.state.lock().await;
        let table = state.tables.get_mut(name).ok_or_else(|| missing_table(name))?;
        let positions = positions(table, rows.columns())?;
        for row in rows.rows() {
            let mut full = vec![Value::Null; table.columns.len()];
            for (value, &pos) in row.iter().zip(&positions) {
                full[pos] = value.clone();
            }
            table.rows.push(full);
        }
        Ok(())
    }

    /// Committed contents of `name`, ordered by key
    pub async fn snapshot(&self, name: &str) -> Option<RowSet> {
        let state = self.state.lock().await;
        let table = state.tables.get(name)?;

        let mut rows = table.rows.clone();
        rows.sort_by_key(|row| table.key_of(row).iter().map(Value::to_string).collect::<Vec<_>>());

        let mut set = RowSet::new(table.columns.iter().map(|c| c.name.as_str()));
        for row in rows {
            // widths always match the declared columns
            let _ = set.push(row);
        }
        Some(set)
    }

    /// Fail every write to `name` with `message` until cleared
    pub async fn fail_writes(&self, name: &str, message: impl Into<String>) {
        self.state
            .lock()
            .await
            .failures
            .insert(name.to_string(), message.into());
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn begin(&self) -> Result<Box<dyn DestinationTransaction>> {
        let state = self.state.lock().await;
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.state),
            tables: state.tables.clone(),
            failures: state.failures.clone(),
            touched: HashSet::new(),
        }))
    }
}

struct MemoryTransaction {
    shared: Arc<Mutex<State>>,
    tables: HashMap<String, MemoryTable>,
    failures: HashMap<String, String>,
    touched: HashSet<String>,
}

fn missing_table(name: &str) -> PipelineError {
    PipelineError::Configuration(format!("destination table \"{}\" does not exist", name))
}

fn write_failure(message: impl Into<String>) -> PipelineError {
    PipelineError::DestinationWrite {
        message: message.into(),
        row: None,
        source: None,
    }
}

fn positions(table: &MemoryTable, columns: &[String]) -> Result<Vec<usize>> {
    columns
        .iter()
        .map(|c| {
            table.index(c).ok_or_else(|| PipelineError::Deserialization {
                message: format!("column '{}' does not exist in destination", c),
                row: None,
            })
        })
        .collect()
}

fn is_json_type(sql_type: &str) -> bool {
    matches!(sql_type, "json" | "jsonb")
}

/// Declared length of a `character(n)` or `character varying(n)` column
fn length_limit(sql_type: &str) -> Option<usize> {
    static SIZED: OnceLock<Regex> = OnceLock::new();
    SIZED
        .get_or_init(|| {
            Regex::new(r"^(?:character varying|varchar|character|char|bpchar)\((\d+)\)$")
                .expect("sized text regex")
        })
        .captures(sql_type)
        .and_then(|c| c[1].parse().ok())
}

/// Text too long for `limit`; trailing spaces past the limit are allowed
fn exceeds(text: &str, limit: usize) -> bool {
    text.chars().skip(limit).any(|c| c != ' ')
}

fn check_cell(column: &ColumnInfo, value: &Cell, row: usize) -> Result<()> {
    let Value::String(text) = value else {
        return Ok(());
    };
    let message = if is_json_type(&column.sql_type) && serde_json::from_str::<Value>(text).is_err() {
        format!(
            "invalid input syntax for type {} in column '{}'",
            column.sql_type, column.name
        )
    } else if let Some(limit) = length_limit(&column.sql_type)
        && exceeds(text, limit)
    {
        format!(
            "value too long for type {} in column '{}'",
            column.sql_type, column.name
        )
    } else {
        return Ok(());
    };
    Err(PipelineError::DestinationWrite {
        message,
        row: Some(row),
        source: None,
    })
}

impl MemoryTransaction {
    fn table_for_write(&mut self, name: &str) -> Result<&mut MemoryTable> {
        if let Some(message) = self.failures.get(name) {
            return Err(write_failure(message.clone()));
        }
        self.touched.insert(name.to_string());
        self.tables.get_mut(name).ok_or_else(|| missing_table(name))
    }

    /// Rows widened to the full column list, with each value checked against its column type
    fn widen(table: &MemoryTable, columns: &[String], rows: &[Vec<Cell>]) -> Result<Vec<Vec<Cell>>> {
        let positions = positions(table, columns)?;
        rows.iter()
            .enumerate()
            .map(|(row_idx, row)| {
                let mut full = vec![Value::Null; table.columns.len()];
                for (value, &pos) in row.iter().zip(&positions) {
                    check_cell(&table.columns[pos], value, row_idx)?;
                    full[pos] = value.clone();
                }
                Ok(full)
            })
            .collect()
    }
}

#[async_trait]
impl DestinationTransaction for MemoryTransaction {
    async fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        self.tables
            .get(table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| missing_table(table))
    }

    async fn truncate(&mut self, table: &str) -> Result<()> {
        self.table_for_write(table)?.rows.clear();
        Ok(())
    }

    async fn insert(&mut self, table: &str, columns: &[String], rows: &[Vec<Cell>]) -> Result<u64> {
        let target = self.table_for_write(table)?;
        let widened = Self::widen(target, columns, rows)?;

        for (row_idx, row) in widened.into_iter().enumerate() {
            if !target.key.is_empty() && target.find(&target.key_of(&row)).is_some() {
                return Err(PipelineError::DestinationWrite {
                    message: format!(
                        "duplicate key value violates unique constraint \"{}_pkey\"",
                        table
                    ),
                    row: Some(row_idx),
                    source: None,
                });
            }
            target.rows.push(row);
        }
        Ok(rows.len() as u64)
    }

    async fn upsert(
        &mut self,
        table: &str,
        columns: &[String],
        key: &[String],
        rows: &[Vec<Cell>],
    ) -> Result<u64> {
        let target = self.table_for_write(table)?;

        let declared: HashSet<&String> = target.key.iter().collect();
        let requested: HashSet<&String> = key.iter().collect();
        if declared.is_empty() || declared != requested {
            return Err(write_failure(
                "there is no unique or exclusion constraint matching the ON CONFLICT specification",
            ));
        }

        let written: HashSet<usize> = positions(target, columns)?.into_iter().collect();
        let widened = Self::widen(target, columns, rows)?;

        for row in widened {
            match target.find(&target.key_of(&row)) {
                Some(existing) => {
                    for &pos in &written {
                        target.rows[existing][pos] = row[pos].clone();
                    }
                }
                None => target.rows.push(row),
            }
        }
        Ok(rows.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction {
            shared,
            mut tables,
            touched,
            ..
        } = *self;
        let mut state = shared.lock().await;
        for name in touched {
            if let Some(table) = tables.remove(&name) {
                state.tables.insert(name, table);
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
