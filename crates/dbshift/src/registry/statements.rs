//! SQL statement construction for delete-before-insert and batched inserts.

use crate::adapters::BackendKind;
use crate::error::{MigrateError, Result};
use crate::value::{Row, SqlValue};

/// Rows matched per DELETE statement. Keeps the OR-of-predicates clause
/// below driver statement-size limits.
pub const DELETE_CHUNK_SIZE: usize = 500;

/// Build chunked DELETE statements removing the target rows whose key
/// columns match the given source rows.
///
/// Each statement covers up to [`DELETE_CHUNK_SIZE`] rows, one parenthesised
/// AND-predicate per row, OR-ed together. NULL key values become `IS NULL`.
/// Key values are rendered as SQL literals with quote doubling, so the
/// statements are safe to run verbatim.
pub fn build_delete_chunks(
    table: &str,
    key_columns: &[String],
    rows: &[Row],
) -> Result<Vec<String>> {
    build_delete_chunks_sized(table, key_columns, rows, DELETE_CHUNK_SIZE)
}

pub fn build_delete_chunks_sized(
    table: &str,
    key_columns: &[String],
    rows: &[Row],
    chunk_size: usize,
) -> Result<Vec<String>> {
    if key_columns.is_empty() {
        return Err(MigrateError::Validation(format!(
            "delete from '{}' requires key columns",
            table
        )));
    }

    let mut statements = Vec::new();
    for chunk in rows.chunks(chunk_size) {
        let mut predicates = Vec::with_capacity(chunk.len());
        for row in chunk {
            let mut terms = Vec::with_capacity(key_columns.len());
            for key in key_columns {
                let value = row.get(key).ok_or_else(|| {
                    MigrateError::Validation(format!(
                        "key column '{}' missing from source row for table '{}'",
                        key, table
                    ))
                })?;
                let term = match value {
                    SqlValue::Null(_) => format!("{} IS NULL", key),
                    other => format!("{} = {}", key, other.to_sql_literal()),
                };
                terms.push(term);
            }
            predicates.push(format!("({})", terms.join(" AND ")));
        }
        statements.push(format!(
            "DELETE FROM {} WHERE {}",
            table,
            predicates.join(" OR ")
        ));
    }

    Ok(statements)
}

/// Build a single-row parameterized INSERT for the backend's placeholder
/// style.
pub fn build_insert(kind: BackendKind, table: &str, columns: &[String]) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|n| kind.placeholder(n)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SqlNullType;

    fn key_row(id: i32, code: Option<&str>) -> Row {
        let mut row = Row::new();
        row.push("id".to_string(), SqlValue::I32(id));
        row.push(
            "code".to_string(),
            match code {
                Some(c) => SqlValue::Text(c.to_string()),
                None => SqlValue::Null(SqlNullType::Text),
            },
        );
        row
    }

    #[test]
    fn chunks_of_five_hundred() {
        let rows: Vec<Row> = (0..1200).map(|i| key_row(i, Some("x"))).collect();
        let stmts = build_delete_chunks("t", &["id".to_string()], &rows).unwrap();
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0].matches(" OR ").count(), 499);
        assert_eq!(stmts[2].matches(" OR ").count(), 199);
    }

    #[test]
    fn composite_key_predicate() {
        let rows = vec![key_row(7, Some("a"))];
        let stmts =
            build_delete_chunks("t", &["id".to_string(), "code".to_string()], &rows).unwrap();
        assert_eq!(stmts, vec!["DELETE FROM t WHERE (id = 7 AND code = 'a')"]);
    }

    #[test]
    fn null_key_becomes_is_null() {
        let rows = vec![key_row(1, None)];
        let stmts =
            build_delete_chunks("t", &["id".to_string(), "code".to_string()], &rows).unwrap();
        assert!(stmts[0].contains("code IS NULL"));
    }

    #[test]
    fn string_keys_are_escaped() {
        let mut row = Row::new();
        row.push("name".to_string(), SqlValue::Text("O'Brien".to_string()));
        let stmts = build_delete_chunks("t", &["name".to_string()], &[row]).unwrap();
        assert_eq!(stmts[0], "DELETE FROM t WHERE (name = 'O''Brien')");
    }

    #[test]
    fn missing_key_column_is_an_error() {
        let rows = vec![key_row(1, Some("a"))];
        let err = build_delete_chunks("t", &["nope".to_string()], &rows).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn empty_key_columns_rejected() {
        let err = build_delete_chunks("t", &[], &[]).unwrap_err();
        assert!(err.to_string().contains("key columns"));
    }

    #[test]
    fn insert_placeholders_per_backend() {
        let cols = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            build_insert(BackendKind::Mssql, "t", &cols),
            "INSERT INTO t (a, b) VALUES (@P1, @P2)"
        );
        assert_eq!(
            build_insert(BackendKind::Postgres, "t", &cols),
            "INSERT INTO t (a, b) VALUES ($1, $2)"
        );
        assert_eq!(
            build_insert(BackendKind::Mysql, "t", &cols),
            "INSERT INTO t (a, b) VALUES (?, ?)"
        );
    }
}
