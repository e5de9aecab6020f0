//! In-memory table snapshot

use crate::error::PrimaryKeyViolation;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// One cell: `Null`, a text scalar, or a structured JSON value
pub type Cell = Value;

/// Row whose width does not match the row set's column count
#[derive(Debug, Error, PartialEq, Eq)]
#[error("row has {found} values but the row set has {expected} columns")]
pub struct RaggedRow {
    pub expected: usize,
    pub found: usize,
}

/// Ordered, uniformly-shaped rows of one table
///
/// Rows are stored positionally against `columns`, so every row has the
/// same column set by construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl RowSet {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row, rejecting one whose width differs from the header
    pub fn push(&mut self, row: Vec<Cell>) -> Result<(), RaggedRow> {
        if row.len() != self.columns.len() {
            return Err(RaggedRow {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell at `row` for the named column
    pub fn get(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Mutable iterator over one column's cells, top to bottom
    pub fn column_mut(&mut self, idx: usize) -> impl Iterator<Item = &mut Cell> {
        self.rows.iter_mut().filter_map(move |row| row.get_mut(idx))
    }

    /// Positions of the key columns, in key order
    pub fn key_indices(&self, key: &[String]) -> Result<Vec<usize>, PrimaryKeyViolation> {
        key.iter()
            .map(|column| {
                self.column_index(column)
                    .ok_or_else(|| PrimaryKeyViolation::MissingColumn {
                        column: column.clone(),
                    })
            })
            .collect()
    }

    /// Verify that `key` names existing columns and identifies every row
    /// uniquely with no null component.
    ///
    /// A row set without any columns (an empty artifact) has nothing to check.
    pub fn check_primary_key(&self, key: &[String]) -> Result<(), PrimaryKeyViolation> {
        if key.is_empty() || self.columns.is_empty() {
            return Ok(());
        }

        let indices = self.key_indices(key)?;
        let mut seen: HashMap<Vec<String>, usize> = HashMap::with_capacity(self.rows.len());

        for (row_idx, row) in self.rows.iter().enumerate() {
            let mut tuple = Vec::with_capacity(indices.len());
            for (&idx, column) in indices.iter().zip(key) {
                match &row[idx] {
                    Value::Null => {
                        return Err(PrimaryKeyViolation::NullKey {
                            column: column.clone(),
                            row: row_idx,
                        });
                    }
                    Value::String(s) => tuple.push(s.clone()),
                    other => tuple.push(other.to_string()),
                }
            }

            if let Some(&first_row) = seen.get(&tuple) {
                return Err(PrimaryKeyViolation::DuplicateKey {
                    key: tuple,
                    first_row,
                    duplicate_row: row_idx,
                });
            }
            seen.insert(tuple, row_idx);
        }

        Ok(())
    }

    /// Rows in bounded chunks, each paired with the index of its first row
    pub fn chunks(&self, size: usize) -> impl Iterator<Item = (usize, &[Vec<Cell>])> {
        let size = size.max(1);
        self.rows
            .chunks(size)
            .enumerate()
            .map(move |(i, chunk)| (i * size, chunk))
    }
}
