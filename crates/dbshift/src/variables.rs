//! `${name}` variable substitution and dynamic variable extraction.

use crate::config::ExtractType;
use crate::error::{MigrateError, Result};
use crate::value::QueryResult;
use std::collections::BTreeMap;

/// Replace every `${name}` occurrence with its bound value. Unbound names
/// are left in place so a typo stays visible in the executed SQL rather
/// than silently becoming an empty string.
pub fn substitute(text: &str, variables: &BTreeMap<String, String>) -> String {
    let mut out = text.to_string();
    for (name, value) in variables {
        out = out.replace(&format!("${{{}}}", name), value);
    }
    out
}

/// Names of `${...}` references appearing in a text.
pub fn referenced_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        let tail = &rest[start + 2..];
        match tail.find('}') {
            Some(end) => {
                let name = &tail[..end];
                if !name.is_empty() && !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
                rest = &tail[end + 1..];
            }
            None => break,
        }
    }
    names
}

/// Turn a dynamic variable's query result into a substitution value.
pub fn extract(name: &str, result: &QueryResult, extract_type: ExtractType) -> Result<String> {
    match extract_type {
        ExtractType::Value => {
            let row = result.rows.first().ok_or_else(|| {
                MigrateError::Validation(format!(
                    "dynamic variable '{}': query returned no rows",
                    name
                ))
            })?;
            let value = row.values().next().ok_or_else(|| {
                MigrateError::Validation(format!(
                    "dynamic variable '{}': query returned no columns",
                    name
                ))
            })?;
            Ok(value.to_display_string())
        }
        ExtractType::List => {
            if result.rows.is_empty() {
                return Err(MigrateError::Validation(format!(
                    "dynamic variable '{}': list query returned no rows",
                    name
                )));
            }
            let mut parts = Vec::with_capacity(result.rows.len());
            for row in &result.rows {
                let value = row.values().next().ok_or_else(|| {
                    MigrateError::Validation(format!(
                        "dynamic variable '{}': query returned no columns",
                        name
                    ))
                })?;
                parts.push(value.to_sql_literal());
            }
            Ok(parts.join(","))
        }
    }
}
