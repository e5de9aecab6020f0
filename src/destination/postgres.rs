//! PostgreSQL destination

use super::{ColumnInfo, Destination, DestinationTransaction};
use crate::config::redact_url;
use crate::error::{PipelineError, Result, describe_postgres};
use crate::table::Cell;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, Statement};

/// Column base types without modifiers; an explicit `::varchar(n)` cast
/// truncates where assignment to the column raises an error
const COLUMNS_SQL: &str = "\
SELECT a.attname, pg_catalog.format_type(a.atttypid, NULL)
FROM pg_catalog.pg_attribute a
JOIN pg_catalog.pg_class c ON c.oid = a.attrelid
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum";

/// Double-quote an identifier
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// `INSERT … VALUES` with every value bound as text and cast to its column type
fn insert_statement(schema: &str, table: &str, columns: &[String], types: &[&str], rows: usize) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let width = columns.len();
    let tuples = (0..rows)
        .map(|r| {
            let values = types
                .iter()
                .enumerate()
                .map(|(c, ty)| format!("${}::{}", r * width + c + 1, ty))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", values)
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified(schema, table),
        column_list,
        tuples
    )
}

/// Conflict clause overwriting every non-key column
fn conflict_clause(columns: &[String], key: &[String]) -> String {
    let target = key
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let updates = columns
        .iter()
        .filter(|c| !key.contains(c))
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect::<Vec<_>>();

    if updates.is_empty() {
        format!(" ON CONFLICT ({}) DO NOTHING", target)
    } else {
        format!(" ON CONFLICT ({}) DO UPDATE SET {}", target, updates.join(", "))
    }
}

fn cell_text(cell: &Cell) -> Option<String> {
    match cell {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn write_error(err: tokio_postgres::Error) -> PipelineError {
    PipelineError::destination_write(describe_postgres(&err), None, err)
}

/// Destination schema in a PostgreSQL database
///
/// Every [`begin`](Destination::begin) opens a dedicated connection, so
/// concurrent merges of different tables never share a transaction.
///
/// # Example
/// ```no_run
/// use stagepipe::destination::{Destination, PostgresDestination};
///
/// # async fn example() -> eyre::Result<()> {
/// let destination = PostgresDestination::new("postgres://etl@localhost/dwh", "stg")?;
/// let mut tx = destination.begin().await?;
/// let columns = tx.columns("flights").await?;
/// tx.rollback().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresDestination {
    config: Config,
    schema: String,
    label: String,
}

impl PostgresDestination {
    pub fn new(connection: &str, schema: impl Into<String>) -> Result<Self, tokio_postgres::Error> {
        Ok(Self {
            config: connection.parse()?,
            schema: schema.into(),
            label: redact_url(connection),
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }
}

impl std::fmt::Debug for PostgresDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PostgresDestination<{} schema={}>", self.label, self.schema)
    }
}

#[async_trait]
impl Destination for PostgresDestination {
    async fn begin(&self) -> Result<Box<dyn DestinationTransaction>> {
        log::debug!("Connecting to destination {}", self.label);
        let (client, connection) = self.config.connect(NoTls).await.map_err(|e| {
            PipelineError::destination_write(
                format!("cannot connect to {}: {}", self.label, describe_postgres(&e)),
                None,
                e,
            )
        })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::warn!("Destination connection closed with error: {}", e);
            }
        });

        client.batch_execute("BEGIN").await.map_err(write_error)?;

        Ok(Box::new(PostgresTransaction {
            client,
            schema: self.schema.clone(),
            types: HashMap::new(),
            statements: HashMap::new(),
        }))
    }
}

/// Open transaction; the connection closes (and rolls back) on drop
struct PostgresTransaction {
    client: Client,
    schema: String,
    /// table -> column -> declared type
    types: HashMap<String, HashMap<String, String>>,
    statements: HashMap<String, Statement>,
}

impl PostgresTransaction {
    async fn column_types(&mut self, table: &str, columns: &[String]) -> Result<Vec<String>> {
        if !self.types.contains_key(table) {
            let info = self.columns(table).await?;
            self.types.insert(
                table.to_string(),
                info.into_iter().map(|c| (c.name, c.sql_type)).collect(),
            );
        }
        let declared = &self.types[table];

        columns
            .iter()
            .map(|c| {
                declared.get(c).cloned().ok_or_else(|| {
                    PipelineError::Deserialization {
                        message: format!(
                            "column '{}' does not exist in {}",
                            c,
                            qualified(&self.schema, table)
                        ),
                        row: None,
                    }
                })
            })
            .collect()
    }

    async fn execute(&mut self, sql: String, rows: &[Vec<Cell>]) -> Result<u64> {
        let params: Vec<Option<String>> = rows.iter().flatten().map(cell_text).collect();

        let statement = match self.statements.get(&sql) {
            Some(statement) => statement.clone(),
            None => {
                let types = vec![Type::TEXT; params.len()];
                let statement = self
                    .client
                    .prepare_typed(&sql, &types)
                    .await
                    .map_err(write_error)?;
                self.statements.insert(sql, statement.clone());
                statement
            }
        };

        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        self.client
            .execute(&statement, &refs)
            .await
            .map_err(write_error)
    }

    async fn write(
        &mut self,
        table: &str,
        columns: &[String],
        key: Option<&[String]>,
        rows: &[Vec<Cell>],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let types = self.column_types(table, columns).await?;
        let types: Vec<&str> = types.iter().map(String::as_str).collect();

        let mut sql = insert_statement(&self.schema, table, columns, &types, rows.len());
        if let Some(key) = key {
            sql.push_str(&conflict_clause(columns, key));
        }
        self.execute(sql, rows).await
    }
}

#[async_trait]
impl DestinationTransaction for PostgresTransaction {
    async fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = self
            .client
            .query(COLUMNS_SQL, &[&self.schema, &table])
            .await
            .map_err(write_error)?;

        let columns = rows
            .iter()
            .map(|row| -> Result<ColumnInfo, tokio_postgres::Error> {
                Ok(ColumnInfo::new(
                    row.try_get::<_, String>(0)?,
                    row.try_get::<_, String>(1)?,
                ))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(write_error)?;

        if columns.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "destination table {} does not exist",
                qualified(&self.schema, table)
            )));
        }
        Ok(columns)
    }

    async fn truncate(&mut self, table: &str) -> Result<()> {
        let sql = format!("TRUNCATE TABLE {} CASCADE", qualified(&self.schema, table));
        log::debug!("{}", sql);
        self.client.batch_execute(&sql).await.map_err(write_error)
    }

    async fn insert(&mut self, table: &str, columns: &[String], rows: &[Vec<Cell>]) -> Result<u64> {
        self.write(table, columns, None, rows).await
    }

    async fn upsert(
        &mut self,
        table: &str,
        columns: &[String],
        key: &[String],
        rows: &[Vec<Cell>],
    ) -> Result<u64> {
        self.write(table, columns, Some(key), rows).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.client.batch_execute("COMMIT").await.map_err(write_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .map_err(write_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(columns: &[&str]) -> Vec<String> {
        columns.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("flights"), "\"flights\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_insert_statement_numbers_parameters_row_major() {
        let sql = insert_statement(
            "stg",
            "seats",
            &names(&["aircraft_code", "seat_no", "fare_conditions"]),
            &["bpchar", "character varying", "character varying"],
            2,
        );
        assert_eq!(
            sql,
            "INSERT INTO \"stg\".\"seats\" (\"aircraft_code\", \"seat_no\", \"fare_conditions\") VALUES \
             ($1::bpchar, $2::character varying, $3::character varying), \
             ($4::bpchar, $5::character varying, $6::character varying)"
        );
    }

    #[test]
    fn test_column_types_drop_length_modifiers() {
        assert!(COLUMNS_SQL.contains("format_type(a.atttypid, NULL)"));
        assert!(!COLUMNS_SQL.contains("atttypmod"));
    }

    #[test]
    fn test_conflict_clause_updates_non_key_columns() {
        let clause = conflict_clause(&names(&["id", "val", "note"]), &names(&["id"]));
        assert_eq!(
            clause,
            " ON CONFLICT (\"id\") DO UPDATE SET \"val\" = EXCLUDED.\"val\", \"note\" = EXCLUDED.\"note\""
        );
    }

    #[test]
    fn test_conflict_clause_all_key_columns() {
        let clause = conflict_clause(
            &names(&["ticket_no", "flight_id"]),
            &names(&["ticket_no", "flight_id"]),
        );
        assert_eq!(clause, " ON CONFLICT (\"ticket_no\", \"flight_id\") DO NOTHING");
    }

    #[test]
    fn test_cell_text() {
        assert_eq!(cell_text(&Value::Null), None);
        assert_eq!(cell_text(&json!("")), Some(String::new()));
        assert_eq!(cell_text(&json!({"a": 1})), Some("{\"a\":1}".to_string()));
        assert_eq!(cell_text(&json!(42)), Some("42".to_string()));
    }

    #[test]
    fn test_debug_redacts_password() {
        let destination =
            PostgresDestination::new("postgres://etl:hunter2@db:5432/dwh", "stg").unwrap();
        let debug = format!("{:?}", destination);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("schema=stg"));
    }
}
