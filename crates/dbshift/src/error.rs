//! Error types for the migration engine.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing database id, read-only
    /// target used as writable, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Query definition failed validation before any I/O was attempted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An adapter was asked to do work before `connect()`, or connecting
    /// itself failed. Always names the logical database id.
    #[error("Database '{db_id}' connection error: {message}")]
    Connection { db_id: String, message: String },

    /// The requested backend driver was not compiled into this build.
    #[error("Backend driver for '{backend}' is not available (db '{db_id}'). Rebuild with the matching feature enabled.")]
    DependencyMissing { backend: String, db_id: String },

    /// A statement failed on some database.
    #[error("Query failed on '{db_id}': {message}")]
    Query { db_id: String, message: String },

    /// Transaction begin/commit/rollback failed.
    #[error("Transaction error on '{db_id}': {message}")]
    Transaction { db_id: String, message: String },

    /// Resume was requested for an unknown or non-resumable run.
    #[error("Cannot resume migration: {0}")]
    Resume(String),

    /// MSSQL driver error.
    #[cfg(feature = "mssql")]
    #[error("MSSQL driver error: {0}")]
    Mssql(#[from] tiberius::error::Error),

    /// PostgreSQL driver error.
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL driver error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL driver error.
    #[cfg(feature = "mysql")]
    #[error("MySQL driver error: {0}")]
    Mysql(#[from] mysql_async::Error),

    /// IO error (progress files, config files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Create a Connection error naming the logical database id.
    pub fn connection(db_id: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Connection {
            db_id: db_id.into(),
            message: message.into(),
        }
    }

    /// Create a Query error naming the logical database id.
    pub fn query(db_id: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Query {
            db_id: db_id.into(),
            message: message.into(),
        }
    }

    /// Create a Transaction error naming the logical database id.
    pub fn transaction(db_id: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transaction {
            db_id: db_id.into(),
            message: message.into(),
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }

    /// Exit code for the CLI, stable per error class.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Validation(_) => 2,
            MigrateError::Connection { .. } | MigrateError::DependencyMissing { .. } => 3,
            MigrateError::Resume(_) => 4,
            _ => 1,
        }
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
