//! YAML configuration loading and validation.

mod types;
mod validation;

pub use types::{
    ColumnSpec, Config, DatabaseDescriptor, DynamicVariable, ExtractType, ProcessScript,
    QueryDefinition, Settings,
};
pub use validation::validate_config;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&raw)?;
    validate_config(&config)?;
    debug!(
        databases = config.databases.len(),
        queries = config.queries.len(),
        "loaded config from {}",
        path.display()
    );
    Ok(config)
}

/// SHA-256 hash of a config file's raw bytes, used to detect config drift
/// between an interrupted run and a resume attempt.
pub fn config_hash(path: &Path) -> Result<String> {
    let raw = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&raw);
    Ok(format!("{:x}", hasher.finalize()))
}
