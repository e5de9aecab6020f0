//! CSV interchange format for staged tables
//!
//! Header row first, fields quoted only when needed. CSV has no native null,
//! so NULL is written as `\N` and any text beginning with a backslash gets
//! one extra leading backslash. Decoding undoes both, which keeps the empty
//! string and NULL apart across a round trip.

use crate::error::{PipelineError, Result};
use crate::table::{Cell, RowSet};
use csv::{QuoteStyle, ReaderBuilder, WriterBuilder};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashSet;

/// MIME type recorded on staged objects
pub const CONTENT_TYPE: &str = "application/csv";

/// File extension used in staging keys
pub const EXTENSION: &str = "csv";

/// Field text standing for SQL NULL
pub const NULL_MARKER: &str = r"\N";

fn encode_cell(cell: &Cell) -> Cow<'_, str> {
    match cell {
        Value::Null => Cow::Borrowed(NULL_MARKER),
        Value::String(s) if s.starts_with('\\') => Cow::Owned(format!("\\{}", s)),
        Value::String(s) => Cow::Borrowed(s.as_str()),
        other => Cow::Owned(other.to_string()),
    }
}

fn decode_cell(field: &str) -> Cell {
    if field == NULL_MARKER {
        return Value::Null;
    }
    match field.strip_prefix('\\') {
        Some(rest) if rest.starts_with('\\') => Value::String(rest.to_string()),
        _ => Value::String(field.to_string()),
    }
}

/// Serialize a row set to CSV bytes
///
/// A row set without columns encodes to zero bytes.
///
/// # Example
/// ```
/// use stagepipe::storage::delimited;
/// use stagepipe::table::RowSet;
/// use serde_json::{Value, json};
///
/// let mut rows = RowSet::new(["code", "note"]);
/// rows.push(vec![json!("773"), json!("")]).unwrap();
/// rows.push(vec![json!("320"), Value::Null]).unwrap();
///
/// let bytes = delimited::encode(&rows).unwrap();
/// assert_eq!(String::from_utf8(bytes.clone()).unwrap(), "code,note\n773,\n320,\\N\n");
/// assert_eq!(delimited::decode(&bytes).unwrap(), rows);
/// ```
pub fn encode(rows: &RowSet) -> Result<Vec<u8>> {
    if rows.columns().is_empty() {
        return Ok(Vec::new());
    }

    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Necessary)
        .from_writer(Vec::new());

    writer
        .write_record(rows.columns())
        .map_err(|e| PipelineError::Serialization {
            message: format!("header: {}", e),
            row: None,
        })?;

    for (idx, row) in rows.rows().iter().enumerate() {
        if row.len() != rows.columns().len() {
            return Err(PipelineError::Serialization {
                message: format!(
                    "row has {} values for {} columns",
                    row.len(),
                    rows.columns().len()
                ),
                row: Some(idx),
            });
        }
        let fields: Vec<Cow<'_, str>> = row.iter().map(encode_cell).collect();
        writer
            .write_record(fields.iter().map(|f| f.as_bytes()))
            .map_err(|e| PipelineError::Serialization {
                message: e.to_string(),
                row: Some(idx),
            })?;
    }

    writer
        .into_inner()
        .map_err(|e| PipelineError::Serialization {
            message: e.error().to_string(),
            row: None,
        })
}

/// Parse CSV bytes back into a row set
///
/// Every non-null cell comes back as text. Ragged rows, invalid UTF-8 and
/// repeated header names are rejected.
pub fn decode(bytes: &[u8]) -> Result<RowSet> {
    if bytes.is_empty() {
        return Ok(RowSet::default());
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| PipelineError::Deserialization {
            message: format!("header: {}", e),
            row: None,
        })?
        .clone();

    let mut seen = HashSet::new();
    for name in headers.iter() {
        if !seen.insert(name) {
            return Err(PipelineError::Deserialization {
                message: format!("column '{}' appears more than once in the header", name),
                row: None,
            });
        }
    }

    let mut rows = RowSet::new(headers.iter());
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| PipelineError::Deserialization {
            message: e.to_string(),
            row: Some(idx),
        })?;
        rows.push(record.iter().map(decode_cell).collect())
            .map_err(|e| PipelineError::Deserialization {
                message: e.to_string(),
                row: Some(idx),
            })?;
    }

    Ok(rows)
}
