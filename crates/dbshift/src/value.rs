//! Normalized SQL values and statement results.
//!
//! Every backend adapter converts driver-native rows into [`SqlValue`] so the
//! registry, the batched delete/insert builders, and the orchestrator never
//! see a driver type. Values are owned: rows cross batch and checkpoint
//! boundaries and must not borrow from driver buffers.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Type hint for NULL values so adapters can bind a correctly typed NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNullType {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    Text,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

/// Owned SQL value, the common currency between backends.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with type hint for correctly typed parameter binding.
    Null(SqlNullType),
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Decimal(Decimal),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Render this value as a SQL literal for predicate construction.
    ///
    /// String-like values are single-quoted with embedded quotes doubled.
    /// This is the single escaping policy used by the batched keyed delete;
    /// inserts always go through parameter binding instead.
    #[must_use]
    pub fn to_sql_literal(&self) -> String {
        fn quoted(s: &str) -> String {
            format!("'{}'", s.replace('\'', "''"))
        }

        match self {
            SqlValue::Null(_) => "NULL".to_string(),
            SqlValue::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => v.to_string(),
            SqlValue::F64(v) => v.to_string(),
            SqlValue::Text(s) => quoted(s),
            SqlValue::Bytes(b) => {
                let hex: String = b.iter().map(|x| format!("{:02x}", x)).collect();
                format!("0x{}", hex)
            }
            SqlValue::Uuid(u) => quoted(&u.to_string()),
            SqlValue::Decimal(d) => d.to_string(),
            SqlValue::DateTime(dt) => quoted(&dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
            SqlValue::DateTimeOffset(dt) => quoted(&dt.to_rfc3339()),
            SqlValue::Date(d) => quoted(&d.format("%Y-%m-%d").to_string()),
            SqlValue::Time(t) => quoted(&t.format("%H:%M:%S%.3f").to_string()),
        }
    }

    /// Render this value as plain text (for variable extraction).
    #[must_use]
    pub fn to_display_string(&self) -> String {
        match self {
            SqlValue::Null(_) => String::new(),
            SqlValue::Text(s) => s.clone(),
            other => other.to_sql_literal().trim_matches('\'').to_string(),
        }
    }
}

#[cfg(feature = "postgres")]
mod pg_binding {
    //! Parameter binding for tokio-postgres: delegate to the inner value's
    //! own `ToSql` implementation.

    use super::SqlValue;
    use bytes::BytesMut;
    use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

    impl ToSql for SqlValue {
        fn to_sql(
            &self,
            ty: &Type,
            out: &mut BytesMut,
        ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
            match self {
                SqlValue::Null(_) => Ok(IsNull::Yes),
                SqlValue::Bool(v) => v.to_sql(ty, out),
                SqlValue::I16(v) => v.to_sql(ty, out),
                SqlValue::I32(v) => v.to_sql(ty, out),
                SqlValue::I64(v) => v.to_sql(ty, out),
                SqlValue::F32(v) => v.to_sql(ty, out),
                SqlValue::F64(v) => v.to_sql(ty, out),
                SqlValue::Text(v) => v.to_sql(ty, out),
                SqlValue::Bytes(v) => v.to_sql(ty, out),
                SqlValue::Uuid(v) => v.to_sql(ty, out),
                SqlValue::Decimal(v) => v.to_sql(ty, out),
                SqlValue::DateTime(v) => v.to_sql(ty, out),
                SqlValue::DateTimeOffset(v) => v.to_sql(ty, out),
                SqlValue::Date(v) => v.to_sql(ty, out),
                SqlValue::Time(v) => v.to_sql(ty, out),
            }
        }

        fn accepts(_ty: &Type) -> bool {
            // The inner value's to_sql performs the real type check.
            true
        }

        to_sql_checked!();
    }
}

/// One result row as an ordered list of (column name, value) pairs.
///
/// Order is preserved from the source result set so that wildcard inserts
/// keep the source column order. Lookup by name is linear, which is fine for
/// the column counts migration queries deal with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: Vec<(String, SqlValue)>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named value.
    pub fn push(&mut self, name: impl Into<String>, value: SqlValue) {
        self.cells.push((name.into(), value));
    }

    /// Look up a value by column name (case-insensitive, first match wins).
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.cells
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Column names in result-set order.
    pub fn column_names(&self) -> Vec<&str> {
        self.cells.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Values in result-set order.
    pub fn values(&self) -> impl Iterator<Item = &SqlValue> {
        self.cells.iter().map(|(_, v)| v)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl FromIterator<(String, SqlValue)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, SqlValue)>>(iter: T) -> Self {
        Self {
            cells: iter.into_iter().collect(),
        }
    }
}

/// Normalized result of one statement: rows for SELECTs, affected count for
/// DML.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

impl QueryResult {
    /// Empty result.
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            rows_affected: 0,
        }
    }

    /// Result carrying rows (affected count equals the row count).
    pub fn with_rows(rows: Vec<Row>) -> Self {
        let rows_affected = rows.len() as u64;
        Self {
            rows,
            rows_affected,
        }
    }

    /// Result of a DML statement with no result set.
    pub fn affected(count: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected: count,
        }
    }
}
