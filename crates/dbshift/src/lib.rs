//! # dbshift
//!
//! Resumable SQL data migration library for moving query results between
//! databases of different vendors.
//!
//! The pieces:
//!
//! - **Backend adapters** giving MSSQL, PostgreSQL, and MySQL one async
//!   interface (feature-gated per backend)
//! - **Connection registry** mapping logical database ids to live adapters
//! - **Foreign key analysis** computing a safe child-first deletion order
//! - **Durable progress** as JSON checkpoints, so interrupted runs resume
//!   without redoing completed queries
//! - **Orchestrator** running configured queries in batches, with
//!   delete-before-insert, variable substitution, and pre/post scripts
//!
//! ## Example
//!
//! ```rust,no_run
//! use dbshift::{config, Migrator};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> dbshift::Result<()> {
//!     let path = Path::new("migration.yaml");
//!     let cfg = config::load_config(path)?;
//!     let hash = config::config_hash(path)?;
//!     let mut migrator = Migrator::new(cfg, hash)?;
//!     let report = migrator.execute_migration(None).await?;
//!     println!("Inserted {} rows", report.total_rows_inserted);
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod config;
pub mod error;
pub mod fk;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod value;
pub mod variables;

// Re-exports for convenient access
pub use adapters::{BackendAdapter, BackendKind, Capabilities};
pub use config::{Config, DatabaseDescriptor, QueryDefinition, Settings};
pub use error::{MigrateError, Result};
pub use fk::{DeletionOrder, ForeignKeyRelation};
pub use orchestrator::{DryRunReport, MigrationReport, Migrator};
pub use progress::{MigrationRun, ProgressStore, QueryStatus, RunPhase, RunStatus};
pub use registry::ConnectionRegistry;
pub use value::{QueryResult, Row, SqlValue};
