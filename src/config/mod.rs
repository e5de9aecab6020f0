//! Pipeline configuration
//!
//! The pipeline is described by a `pipeline.yml` file. Secrets (connection
//! URLs, object store keys) never live in it; they come from the
//! environment, see [`env`].
//!
//! Example format:
//! ```yaml
//! bucket: extracted-data
//! schema: stg
//! policy: replace
//! tables:
//!   - name: flights
//!     primary_key: [flight_id]
//!   - name: seats
//!     query: SELECT * FROM bookings.seats
//!     primary_key: [aircraft_code, seat_no]
//!     policy: upsert
//! ```

pub mod env;

use crate::etl::PipelineOptions;
use crate::table::{MergePolicy, TableSpec, is_identifier};
use eyre::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

/// Connection string with any password replaced by `***`
///
/// Handles both `postgres://` URLs and `key=value` connection strings.
pub fn redact_url(connection: &str) -> String {
    if let Ok(mut url) = Url::parse(connection)
        && url.has_host()
    {
        if url.password().is_some() {
            let _ = url.set_password(Some("***"));
        }
        return url.to_string();
    }

    static PASSWORD: OnceLock<Regex> = OnceLock::new();
    PASSWORD
        .get_or_init(|| Regex::new(r"password\s*=\s*('[^']*'|\S+)").expect("password regex"))
        .replace_all(connection, "password=***")
        .into_owned()
}

/// Deadlines for external calls, in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// Source query, including connecting
    pub query_secs: u64,
    /// Each object store call
    pub storage_secs: u64,
    /// Whole destination transaction
    pub transaction_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            query_secs: 300,
            storage_secs: 60,
            transaction_secs: 900,
        }
    }
}

/// One `tables:` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TableEntry {
    pub name: String,
    /// Inline SQL; takes precedence over `query_file`
    #[serde(default)]
    pub query: Option<String>,
    /// Defaults to `{query_dir}/{name}.sql`
    #[serde(default)]
    pub query_file: Option<PathBuf>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub json_columns: Vec<String>,
    #[serde(default)]
    pub policy: Option<MergePolicy>,
}

/// Contents of `pipeline.yml`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub bucket: String,
    pub staging_prefix: String,
    /// Destination schema holding the staged tables
    pub schema: String,
    /// Connection id resolved through `{ID}_URL`
    pub source_connection: String,
    pub destination_connection: String,
    pub query_dir: PathBuf,
    pub policy: MergePolicy,
    pub batch_size: usize,
    pub max_parallel_tables: usize,
    pub max_parallel_merges: usize,
    pub timeouts: Timeouts,
    pub tables: Vec<TableEntry>,

    /// Directory relative paths resolve against
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bucket: "extracted-data".to_string(),
            staging_prefix: "temp".to_string(),
            schema: "stg".to_string(),
            source_connection: "source_db".to_string(),
            destination_connection: "staging_db".to_string(),
            query_dir: PathBuf::from("queries"),
            policy: MergePolicy::Replace,
            batch_size: 1000,
            max_parallel_tables: 4,
            max_parallel_merges: 1,
            timeouts: Timeouts::default(),
            tables: Vec::new(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl PipelineConfig {
    /// Read and validate a pipeline file
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config: {}", path.display()))?;

        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Invalid pipeline config: {}", path.display()))?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config)
    }

    /// Parse and validate YAML; relative paths resolve against the working directory
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).with_context(|| "Failed to parse pipeline YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket.trim().is_empty() {
            bail!("bucket must not be empty");
        }
        if !is_identifier(&self.schema) {
            bail!("schema '{}' is not a plain SQL identifier", self.schema);
        }
        for id in [&self.source_connection, &self.destination_connection] {
            if !is_identifier(id) {
                bail!("connection id '{}' must be a plain identifier", id);
            }
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.max_parallel_tables == 0 {
            bail!("max_parallel_tables must be at least 1");
        }
        if self.max_parallel_merges == 0 {
            bail!("max_parallel_merges must be at least 1");
        }

        let mut names = HashSet::new();
        for table in &self.tables {
            if !is_identifier(&table.name) {
                bail!("table name '{}' is not a plain SQL identifier", table.name);
            }
            if !names.insert(table.name.as_str()) {
                bail!("table '{}' is listed more than once", table.name);
            }
            if let Some(column) = table
                .primary_key
                .iter()
                .chain(&table.json_columns)
                .find(|c| c.trim().is_empty())
            {
                bail!("table '{}' names an empty column '{}'", table.name, column);
            }
            let policy = table.policy.unwrap_or(self.policy);
            if policy == MergePolicy::Upsert && table.primary_key.is_empty() {
                bail!(
                    "table '{}' uses the upsert policy but declares no primary_key",
                    table.name
                );
            }
        }
        Ok(())
    }

    fn query_path(&self, table: &TableEntry) -> PathBuf {
        let path = table
            .query_file
            .clone()
            .unwrap_or_else(|| self.query_dir.join(format!("{}.sql", table.name)));
        if path.is_absolute() {
            path
        } else {
            self.base_dir.join(path)
        }
    }

    /// Table descriptors with every query file read
    pub fn table_specs(&self) -> Result<Vec<TableSpec>> {
        self.tables
            .iter()
            .map(|table| {
                let query = match &table.query {
                    Some(sql) => sql.clone(),
                    None => {
                        let path = self.query_path(table);
                        std::fs::read_to_string(&path).with_context(|| {
                            format!(
                                "Failed to read query for table '{}': {}",
                                table.name,
                                path.display()
                            )
                        })?
                    }
                };
                if query.trim().is_empty() {
                    bail!("query for table '{}' is empty", table.name);
                }

                let mut spec = TableSpec::new(&table.name, query.trim())
                    .with_primary_key(table.primary_key.iter().cloned())
                    .with_json_columns(table.json_columns.iter().cloned());
                spec.policy = table.policy;
                Ok(spec)
            })
            .collect()
    }

    /// Knobs for the orchestrator
    pub fn options(&self) -> PipelineOptions {
        PipelineOptions {
            bucket: self.bucket.clone(),
            staging_prefix: self.staging_prefix.clone(),
            default_policy: self.policy,
            batch_size: self.batch_size,
            max_parallel_tables: self.max_parallel_tables,
            max_parallel_merges: self.max_parallel_merges,
            query_timeout: Duration::from_secs(self.timeouts.query_secs),
            storage_timeout: Duration::from_secs(self.timeouts.storage_secs),
            transaction_timeout: Duration::from_secs(self.timeouts.transaction_secs),
        }
    }
}
