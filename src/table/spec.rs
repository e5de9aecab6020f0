//! Static per-table descriptor

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// How a staged table is reconciled into its destination table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    /// Truncate the destination and bulk-insert every staged row
    #[default]
    Replace,
    /// Insert or update by primary key; never deletes
    Upsert,
}

impl std::fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replace => write!(f, "replace"),
            Self::Upsert => write!(f, "upsert"),
        }
    }
}

/// Whether `name` is a plain SQL identifier usable as a table, schema or key name
pub fn is_identifier(name: &str) -> bool {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"))
        .is_match(name)
}

/// Descriptor of one source table
///
/// `name` doubles as the staging key stem and the destination table name.
///
/// # Example
/// ```
/// use stagepipe::table::{MergePolicy, TableSpec};
///
/// let spec = TableSpec::new("seats", "SELECT * FROM bookings.seats")
///     .with_primary_key(["aircraft_code", "seat_no"])
///     .with_policy(MergePolicy::Upsert);
///
/// assert_eq!(spec.primary_key, vec!["aircraft_code", "seat_no"]);
/// assert_eq!(spec.policy_or(MergePolicy::Replace), MergePolicy::Upsert);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    /// Parameterless read-only statement
    pub query: String,
    /// Ordered key columns; empty means replace-only
    pub primary_key: Vec<String>,
    /// Columns re-encoded as canonical JSON text before load
    pub json_columns: BTreeSet<String>,
    /// Per-table override of the pipeline's default policy
    pub policy: Option<MergePolicy>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            primary_key: Vec::new(),
            json_columns: BTreeSet::new(),
            policy: None,
        }
    }

    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_json_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.json_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_policy(mut self, policy: MergePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// The table's own policy, or `default` when it has none
    pub fn policy_or(&self, default: MergePolicy) -> MergePolicy {
        self.policy.unwrap_or(default)
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }
}
