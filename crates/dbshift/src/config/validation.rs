//! Structural validation run after parsing, before any connection is made.

use super::types::{ColumnSpec, Config};
use crate::adapters::BackendKind;
use crate::error::{MigrateError, Result};
use std::collections::HashSet;

/// Validate a parsed configuration.
///
/// Checks referential integrity between sections (settings refer to declared
/// databases, scripts refer to source/target or a declared id), per-query
/// attribute completeness, unique ids, and the writable-target rule.
pub fn validate_config(config: &Config) -> Result<()> {
    if config.databases.is_empty() {
        return Err(MigrateError::Validation(
            "config declares no databases".to_string(),
        ));
    }

    for (id, db) in &config.databases {
        BackendKind::parse(&db.backend).ok_or_else(|| {
            MigrateError::Validation(format!(
                "database '{}': unknown backend '{}'",
                id, db.backend
            ))
        })?;
        for (field, value) in [
            ("host", &db.host),
            ("database", &db.database),
            ("user", &db.user),
        ] {
            if value.trim().is_empty() {
                return Err(MigrateError::Validation(format!(
                    "database '{}': missing required field '{}'",
                    id, field
                )));
            }
        }
    }

    let settings = &config.settings;
    for (role, id) in [("source", &settings.source), ("target", &settings.target)] {
        if !config.databases.contains_key(id) {
            return Err(MigrateError::Validation(format!(
                "settings.{} refers to undeclared database '{}'",
                role, id
            )));
        }
    }
    if !config.databases[&settings.target].writable {
        return Err(MigrateError::Validation(format!(
            "target database '{}' is not marked writable",
            settings.target
        )));
    }
    if settings.batch_size == 0 {
        return Err(MigrateError::Validation(
            "settings.batch_size must be greater than zero".to_string(),
        ));
    }

    if config.queries.is_empty() {
        return Err(MigrateError::Validation(
            "config declares no queries".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for query in &config.queries {
        if query.id.trim().is_empty() {
            return Err(MigrateError::Validation(
                "query with empty id".to_string(),
            ));
        }
        if !seen_ids.insert(query.id.as_str()) {
            return Err(MigrateError::Validation(format!(
                "duplicate query id '{}'",
                query.id
            )));
        }
        if query.source_query.trim().is_empty() {
            return Err(MigrateError::Validation(format!(
                "query '{}': source_query is empty",
                query.id
            )));
        }
        if query.target_table.trim().is_empty() {
            return Err(MigrateError::Validation(format!(
                "query '{}': target_table is empty",
                query.id
            )));
        }
        match &query.target_columns {
            ColumnSpec::Columns(cols) if cols.is_empty() => {
                return Err(MigrateError::Validation(format!(
                    "query '{}': target_columns list is empty",
                    query.id
                )));
            }
            ColumnSpec::Wildcard(s) if s != "*" => {
                return Err(MigrateError::Validation(format!(
                    "query '{}': target_columns must be '*' or a column list",
                    query.id
                )));
            }
            _ => {}
        }
        if query.deletes_before_insert(settings) && query.key_columns.is_empty() {
            return Err(MigrateError::Validation(format!(
                "query '{}': delete_before_insert requires key_columns",
                query.id
            )));
        }
        if contains_multiple_statements(&query.source_query) {
            return Err(MigrateError::Validation(format!(
                "query '{}': source_query must be a single statement",
                query.id
            )));
        }
        for (label, script) in [
            ("pre_process", &query.pre_process),
            ("post_process", &query.post_process),
        ] {
            if let Some(script) = script {
                if script.statements.is_empty() {
                    return Err(MigrateError::Validation(format!(
                        "query '{}': {} has no statements",
                        query.id, label
                    )));
                }
                validate_db_ref(config, &query.id, label, &script.database)?;
            }
        }
    }

    let mut seen_vars = HashSet::new();
    for var in &config.dynamic_variables {
        if var.variable_name.trim().is_empty() {
            return Err(MigrateError::Validation(
                "dynamic variable with empty variable_name".to_string(),
            ));
        }
        if !seen_vars.insert(var.variable_name.as_str()) {
            return Err(MigrateError::Validation(format!(
                "duplicate dynamic variable '{}'",
                var.variable_name
            )));
        }
        if var.query.trim().is_empty() {
            return Err(MigrateError::Validation(format!(
                "dynamic variable '{}': query is empty",
                var.variable_name
            )));
        }
        if let Some(db) = &var.database {
            validate_db_ref(config, &var.variable_name, "dynamic variable", db)?;
        }
    }

    Ok(())
}

fn validate_db_ref(config: &Config, owner: &str, label: &str, db: &str) -> Result<()> {
    if db == "source" || db == "target" || config.databases.contains_key(db) {
        Ok(())
    } else {
        Err(MigrateError::Validation(format!(
            "'{}': {} refers to undeclared database '{}'",
            owner, label, db
        )))
    }
}

/// Reject statements with a top-level `;` followed by more SQL. A trailing
/// semicolon is fine. Quoted strings are skipped so literals containing `;`
/// do not trip the guard.
fn contains_multiple_statements(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut i = 0;
    let mut in_string = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b';' if !in_string => {
                let rest = &sql[i + 1..];
                if !rest.trim().is_empty() {
                    return true;
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}
