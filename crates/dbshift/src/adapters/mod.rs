//! Backend adapters: one uniform async interface over the supported drivers.

#[cfg(feature = "mssql")]
mod mssql;
#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "mssql")]
pub use mssql::MssqlAdapter;
#[cfg(feature = "mysql")]
pub use mysql::MysqlAdapter;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAdapter;

use crate::config::DatabaseDescriptor;
use crate::error::{MigrateError, Result};
use crate::value::{QueryResult, SqlValue};
use async_trait::async_trait;

/// Supported database backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Mssql,
    Postgres,
    Mysql,
}

impl BackendKind {
    /// Parse a backend name, accepting common aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mssql" | "sqlserver" | "sql-server" => Some(BackendKind::Mssql),
            "postgres" | "postgresql" | "pg" => Some(BackendKind::Postgres),
            "mysql" | "mariadb" => Some(BackendKind::Mysql),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Mssql => "mssql",
            BackendKind::Postgres => "postgres",
            BackendKind::Mysql => "mysql",
        }
    }

    /// Standard port used when a descriptor omits one.
    pub fn default_port(&self) -> u16 {
        match self {
            BackendKind::Mssql => 1433,
            BackendKind::Postgres => 5432,
            BackendKind::Mysql => 3306,
        }
    }

    /// Placeholder for the nth (1-based) parameter in a prepared statement.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            BackendKind::Mssql => format!("@P{}", n),
            BackendKind::Postgres => format!("${}", n),
            BackendKind::Mysql => "?".to_string(),
        }
    }

    /// A trivial round-trip query for connectivity checks.
    pub fn test_query(&self) -> &'static str {
        "SELECT 1"
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a backend can do beyond the common query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Live target-table column metadata (name filtering of computed,
    /// identity, and binary columns) is available.
    pub column_metadata: bool,
    /// Session-scoped foreign key constraint toggling is available.
    pub constraint_toggle: bool,
    /// Multi-statement transactions are available on this connection.
    pub transactions: bool,
}

/// Uniform async interface over one database connection.
///
/// Adapters hold a single connection; all methods take `&mut self` so a
/// transaction opened with [`begin_transaction`](Self::begin_transaction)
/// pins subsequent statements to the same session.
#[async_trait]
pub trait BackendAdapter: Send {
    /// Backend kind this adapter drives.
    fn backend(&self) -> BackendKind;

    /// Logical database id from the registry, for diagnostics.
    fn db_id(&self) -> &str;

    /// Whether a live connection is currently held.
    fn is_connected(&self) -> bool;

    /// Capabilities of this backend.
    fn capabilities(&self) -> Capabilities;

    /// Swap the connection descriptor without replacing the adapter. Takes
    /// effect on the next connect.
    fn set_descriptor(&mut self, descriptor: DatabaseDescriptor);

    /// Open the connection. Idempotent when already connected.
    async fn connect(&mut self) -> Result<()>;

    /// Close the connection. Idempotent when already closed.
    async fn disconnect(&mut self) -> Result<()>;

    /// Run a statement that returns rows.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult>;

    /// Run a statement for its side effect; returns affected row count.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Begin a transaction on this connection.
    async fn begin_transaction(&mut self) -> Result<()>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> Result<()>;

    /// Insertable column names for a target table, excluding computed,
    /// identity, and binary-typed columns. Backends without live column
    /// metadata return an empty list.
    async fn table_columns(&mut self, table: &str) -> Result<Vec<String>>;

    /// Enable or disable foreign key constraint checking for this session.
    async fn set_constraints_enabled(&mut self, enabled: bool) -> Result<()>;
}

/// Construct the adapter for a descriptor's backend.
///
/// Backends compiled out via cargo features yield
/// [`MigrateError::DependencyMissing`] instead of a parse failure, so a
/// config naming an unavailable backend fails with a pointed message.
pub fn create_adapter(
    db_id: &str,
    descriptor: &DatabaseDescriptor,
) -> Result<Box<dyn BackendAdapter>> {
    let kind = BackendKind::parse(&descriptor.backend).ok_or_else(|| {
        MigrateError::Config(format!(
            "database '{}': unknown backend '{}'",
            db_id, descriptor.backend
        ))
    })?;

    match kind {
        BackendKind::Mssql => {
            #[cfg(feature = "mssql")]
            {
                Ok(Box::new(MssqlAdapter::new(db_id, descriptor.clone())))
            }
            #[cfg(not(feature = "mssql"))]
            {
                Err(MigrateError::DependencyMissing {
                    backend: "mssql".to_string(),
                    db_id: db_id.to_string(),
                })
            }
        }
        BackendKind::Postgres => {
            #[cfg(feature = "postgres")]
            {
                Ok(Box::new(PostgresAdapter::new(db_id, descriptor.clone())))
            }
            #[cfg(not(feature = "postgres"))]
            {
                Err(MigrateError::DependencyMissing {
                    backend: "postgres".to_string(),
                    db_id: db_id.to_string(),
                })
            }
        }
        BackendKind::Mysql => {
            #[cfg(feature = "mysql")]
            {
                Ok(Box::new(MysqlAdapter::new(db_id, descriptor.clone())))
            }
            #[cfg(not(feature = "mysql"))]
            {
                Err(MigrateError::DependencyMissing {
                    backend: "mysql".to_string(),
                    db_id: db_id.to_string(),
                })
            }
        }
    }
}
