//! Transformer trait and JSON column re-encoding

use crate::error::{PipelineError, Result};
use crate::table::RowSet;
use serde_json::Value;
use std::collections::BTreeSet;

/// Transformer trait for transforming data items
///
/// # Example
/// ```
/// use stagepipe::etl::Transformer;
/// use stagepipe::error::Result;
/// use stagepipe::table::RowSet;
///
/// struct ColumnDropper(String);
///
/// impl Transformer for ColumnDropper {
///     type Input = RowSet;
///     type Output = RowSet;
///
///     fn transform(&self, input: RowSet) -> Result<RowSet> {
///         let keep: Vec<usize> = (0..input.columns().len())
///             .filter(|&i| input.columns()[i] != self.0)
///             .collect();
///         let mut output = RowSet::new(keep.iter().map(|&i| input.columns()[i].clone()));
///         for row in input.rows() {
///             output.push(keep.iter().map(|&i| row[i].clone()).collect()).unwrap();
///         }
///         Ok(output)
///     }
/// }
/// ```
pub trait Transformer: Send + Sync {
    /// Input item type
    type Input: Send;

    /// Output item type after transformation
    type Output: Send;

    /// Transform a single item
    ///
    /// # Errors
    /// Returns an error if the item cannot be converted
    fn transform(&self, input: Self::Input) -> Result<Self::Output>;

    /// Transform multiple items, stopping at the first failure
    fn transform_many(&self, inputs: Vec<Self::Input>) -> Result<Vec<Self::Output>> {
        inputs.into_iter().map(|i| self.transform(i)).collect()
    }
}

/// Re-encodes the named columns as canonical JSON text
///
/// - structured values become their compact JSON text
/// - text that already parses as JSON is re-serialized compactly
/// - any other text becomes a JSON string literal
/// - NULL stays NULL
///
/// Named columns that the row set does not have are ignored.
#[derive(Debug, Clone, Default)]
pub struct JsonColumnEncoder {
    columns: BTreeSet<String>,
}

impl JsonColumnEncoder {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

fn canonical(value: &Value) -> Result<Value> {
    let encoded = match value {
        Value::Null => return Ok(Value::Null),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(parsed) => serde_json::to_string(&parsed),
            Err(_) => serde_json::to_string(value),
        },
        structured => serde_json::to_string(structured),
    };
    encoded
        .map(Value::String)
        .map_err(|e| PipelineError::Serialization {
            message: format!("cannot encode JSON value: {}", e),
            row: None,
        })
}

impl Transformer for JsonColumnEncoder {
    type Input = RowSet;
    type Output = RowSet;

    fn transform(&self, mut rows: RowSet) -> Result<RowSet> {
        let indices: Vec<usize> = self
            .columns
            .iter()
            .filter_map(|c| rows.column_index(c))
            .collect();

        for idx in indices {
            for (row, cell) in rows.column_mut(idx).enumerate() {
                *cell = canonical(cell).map_err(|e| match e {
                    PipelineError::Serialization { message, .. } => {
                        PipelineError::Serialization {
                            message,
                            row: Some(row),
                        }
                    }
                    other => other,
                })?;
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn airports() -> RowSet {
        let mut rows = RowSet::new(["airport_code", "airport_name", "city"]);
        rows.push(vec![
            json!("YKS"),
            json!("{\"en\": \"Yakutsk Airport\", \"ru\": \"Якутск\"}"),
            json!({"en": "Yakutsk"}),
        ])
        .unwrap();
        rows.push(vec![json!("MJZ"), json!("Mirny Airport"), Value::Null])
            .unwrap();
        rows
    }

    #[test]
    fn test_json_encoding_rules() {
        let encoder = JsonColumnEncoder::new(["airport_name", "city", "timezone"]);
        let rows = encoder.transform(airports()).unwrap();

        // parsed and re-serialized compactly
        assert_eq!(
            rows.get(0, "airport_name"),
            Some(&json!("{\"en\":\"Yakutsk Airport\",\"ru\":\"Якутск\"}"))
        );
        assert_eq!(rows.get(0, "city"), Some(&json!("{\"en\":\"Yakutsk\"}")));
        // plain text becomes a JSON string literal
        assert_eq!(rows.get(1, "airport_name"), Some(&json!("\"Mirny Airport\"")));
        assert_eq!(rows.get(1, "city"), Some(&Value::Null));
        // undeclared columns untouched
        assert_eq!(rows.get(0, "airport_code"), Some(&json!("YKS")));
    }

    #[test]
    fn test_encoding_is_stable() {
        let encoder = JsonColumnEncoder::new(["airport_name", "city"]);
        let once = encoder.transform(airports()).unwrap();
        let twice = encoder.transform(once.clone()).unwrap();

        // valid JSON text is a fixed point
        assert_eq!(once.get(0, "city"), twice.get(0, "city"));
        assert_eq!(once.get(0, "airport_name"), twice.get(0, "airport_name"));
    }

    #[test]
    fn test_output_parses_back_to_the_structure() {
        let mut rows = RowSet::new(["contact_data"]);
        let structure = json!({"phone": "+70127117011", "email": null, "tags": [1, 2]});
        rows.push(vec![structure.clone()]).unwrap();

        let rows = JsonColumnEncoder::new(["contact_data"]).transform(rows).unwrap();
        let text = rows.get(0, "contact_data").unwrap().as_str().unwrap();
        assert_eq!(serde_json::from_str::<Value>(text).unwrap(), structure);
    }

    #[test]
    fn test_transform_many() {
        let encoder = JsonColumnEncoder::default();
        assert!(encoder.is_empty());
        let out = encoder.transform_many(vec![airports(), RowSet::default()]).unwrap();
        assert_eq!(out[0], airports());
        assert!(out[1].is_empty());
    }
}
