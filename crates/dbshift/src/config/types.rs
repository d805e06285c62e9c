//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logical database id -> connection descriptor.
    pub databases: BTreeMap<String, DatabaseDescriptor>,

    /// Run-level settings.
    pub settings: Settings,

    /// Static variables substituted into query text as `${name}`.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Dynamic variables extracted from a database before migration.
    #[serde(default)]
    pub dynamic_variables: Vec<DynamicVariable>,

    /// Ordered migration query definitions.
    pub queries: Vec<QueryDefinition>,
}

/// Connection descriptor for one logical database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    /// Backend kind: mssql, postgres, or mysql (with common aliases).
    pub backend: String,

    /// Database host.
    pub host: String,

    /// Database port. Defaults to the backend's standard port when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    pub password: String,

    /// Whether this database may be used as a migration target.
    #[serde(default)]
    pub writable: bool,

    /// Encrypt the connection (default: false; MSSQL and PostgreSQL only).
    #[serde(default)]
    pub encrypt: bool,

    /// Trust the server certificate when encryption is on (default: true).
    #[serde(default = "default_true")]
    pub trust_server_cert: bool,

    /// Optional human description, shown by `list-databases`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Run-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Logical id of the source database.
    pub source: String,

    /// Logical id of the target database. Must refer to a writable database.
    pub target: String,

    /// Default rows per insert batch (default: 1000). Queries may override.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Wrap the whole run in one target transaction (fail-fast mode).
    #[serde(default)]
    pub use_transaction: bool,

    /// Default delete-before-insert flag for queries that do not set it.
    #[serde(default)]
    pub delete_before_insert: bool,

    /// Directory for durable run progress files (default: ".dbshift").
    #[serde(default = "default_progress_dir")]
    pub progress_dir: String,
}

/// One migration query definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDefinition {
    /// Unique query id, used as the progress key and resume skip-list entry.
    pub id: String,

    /// Human description.
    #[serde(default)]
    pub description: String,

    /// Whether this query participates in the run (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// SELECT statement executed on the source database.
    pub source_query: String,

    /// Target table name.
    pub target_table: String,

    /// Explicit target column list, or `"*"` to resolve from live target
    /// metadata (default: `"*"`).
    #[serde(default)]
    pub target_columns: ColumnSpec,

    /// Key columns for delete-before-insert predicates.
    #[serde(default)]
    pub key_columns: Vec<String>,

    /// Per-query batch size override. Supports `${var}` substitution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<String>,

    /// Delete matching target rows before inserting. Falls back to
    /// `settings.delete_before_insert` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_before_insert: Option<bool>,

    /// Statements executed on a chosen database before this query runs.
    /// A failure here fails the query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_process: Option<ProcessScript>,

    /// Statements executed after a successful insert. A failure here is
    /// logged but does not fail the query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_process: Option<ProcessScript>,
}

impl QueryDefinition {
    /// Effective delete-before-insert flag given the run settings.
    pub fn deletes_before_insert(&self, settings: &Settings) -> bool {
        self.delete_before_insert
            .unwrap_or(settings.delete_before_insert)
    }
}

/// Target column specification: an explicit list or a wildcard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ColumnSpec {
    /// A literal string; only `"*"` is valid.
    Wildcard(String),
    /// An explicit column list.
    Columns(Vec<String>),
}

impl Default for ColumnSpec {
    fn default() -> Self {
        ColumnSpec::Wildcard("*".to_string())
    }
}

impl ColumnSpec {
    /// Whether live-metadata column resolution was requested.
    pub fn is_wildcard(&self) -> bool {
        match self {
            ColumnSpec::Wildcard(s) => s == "*",
            ColumnSpec::Columns(cols) => cols.len() == 1 && cols[0] == "*",
        }
    }
}

/// Pre/post-process script attached to a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessScript {
    /// Human description.
    #[serde(default)]
    pub description: String,

    /// Which database to run on: "source" or "target" (default: "target").
    #[serde(default = "default_target_db")]
    pub database: String,

    /// Statements to execute, in order.
    pub statements: Vec<String>,
}

/// Dynamic variable extracted from a database before migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicVariable {
    /// Variable name bound into `${name}` substitutions.
    pub variable_name: String,

    /// Human description.
    #[serde(default)]
    pub description: String,

    /// Whether this variable is extracted (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Query whose result provides the value.
    pub query: String,

    /// Logical database id to run against (default: the source database).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// How the result is turned into a value.
    #[serde(default)]
    pub extract_type: ExtractType,
}

/// How a dynamic variable's query result becomes a substitution value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractType {
    /// First column of the first row, rendered as plain text.
    #[default]
    Value,
    /// First column of every row, rendered as a quoted comma-joined list
    /// suitable for an IN (...) clause.
    List,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    1000
}

fn default_progress_dir() -> String {
    ".dbshift".to_string()
}

fn default_target_db() -> String {
    "target".to_string()
}
