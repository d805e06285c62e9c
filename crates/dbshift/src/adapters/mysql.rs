//! MySQL adapter built on mysql_async.

use super::{BackendAdapter, BackendKind, Capabilities};
use crate::config::DatabaseDescriptor;
use crate::error::{MigrateError, Result};
use crate::value::{QueryResult, Row, SqlNullType, SqlValue};
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Params, Value};
use tracing::debug;

/// Single-connection MySQL adapter.
pub struct MysqlAdapter {
    db_id: String,
    descriptor: DatabaseDescriptor,
    conn: Option<Conn>,
}

impl MysqlAdapter {
    pub fn new(db_id: &str, descriptor: DatabaseDescriptor) -> Self {
        Self {
            db_id: db_id.to_string(),
            descriptor,
            conn: None,
        }
    }

    fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.descriptor.host.clone())
            .tcp_port(
                self.descriptor
                    .port
                    .unwrap_or_else(|| BackendKind::Mysql.default_port()),
            )
            .db_name(Some(self.descriptor.database.clone()))
            .user(Some(self.descriptor.user.clone()))
            .pass(Some(self.descriptor.password.clone()))
            .into()
    }

    fn conn(&mut self) -> Result<&mut Conn> {
        self.conn.as_mut().ok_or_else(|| {
            MigrateError::connection(&self.db_id, "not connected")
        })
    }

    async fn run_statement(&mut self, sql: &str) -> Result<()> {
        let db_id = self.db_id.clone();
        self.conn()?
            .query_drop(sql)
            .await
            .map_err(|e| MigrateError::query(&db_id, e.to_string()))
    }

    async fn run_control(&mut self, sql: &str) -> Result<()> {
        let db_id = self.db_id.clone();
        self.conn()?
            .query_drop(sql)
            .await
            .map_err(|e| MigrateError::transaction(&db_id, e.to_string()))
    }
}

#[async_trait]
impl BackendAdapter for MysqlAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Mysql
    }

    fn db_id(&self) -> &str {
        &self.db_id
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            column_metadata: false,
            constraint_toggle: true,
            transactions: true,
        }
    }

    fn set_descriptor(&mut self, descriptor: DatabaseDescriptor) {
        self.descriptor = descriptor;
    }

    async fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }

        let conn = Conn::new(self.build_opts())
            .await
            .map_err(|e| MigrateError::connection(&self.db_id, e.to_string()))?;

        debug!(db_id = %self.db_id, "connected to mysql");
        self.conn = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.disconnect()
                .await
                .map_err(|e| MigrateError::connection(&self.db_id, e.to_string()))?;
            debug!(db_id = %self.db_id, "disconnected from mysql");
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        let db_id = self.db_id.clone();
        let params = to_params(params);
        let raw_rows: Vec<mysql_async::Row> = self
            .conn()?
            .exec(sql, params)
            .await
            .map_err(|e| MigrateError::query(&db_id, e.to_string()))?;

        let mut rows = Vec::with_capacity(raw_rows.len());
        for mut raw in raw_rows {
            let columns = raw.columns();
            let mut row = Row::new();
            for (idx, col) in columns.iter().enumerate() {
                let value = raw
                    .take::<Value, _>(idx)
                    .map(convert_value)
                    .unwrap_or(SqlValue::Null(SqlNullType::Text));
                row.push(col.name_str().to_string(), value);
            }
            rows.push(row);
        }

        Ok(QueryResult::with_rows(rows))
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let db_id = self.db_id.clone();
        let params = to_params(params);
        let conn = self.conn()?;
        conn.exec_drop(sql, params)
            .await
            .map_err(|e| MigrateError::query(&db_id, e.to_string()))?;
        Ok(conn.affected_rows())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.run_control("START TRANSACTION").await
    }

    async fn commit(&mut self) -> Result<()> {
        self.run_control("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.run_control("ROLLBACK").await
    }

    async fn table_columns(&mut self, _table: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn set_constraints_enabled(&mut self, enabled: bool) -> Result<()> {
        let sql = if enabled {
            "SET FOREIGN_KEY_CHECKS = 1"
        } else {
            "SET FOREIGN_KEY_CHECKS = 0"
        };
        self.run_statement(sql).await
    }
}

fn to_params(params: &[SqlValue]) -> Params {
    if params.is_empty() {
        Params::Empty
    } else {
        Params::Positional(params.iter().map(to_mysql_value).collect())
    }
}

fn to_mysql_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null(_) => Value::NULL,
        SqlValue::Bool(v) => Value::Int(i64::from(*v)),
        SqlValue::I16(v) => Value::Int(i64::from(*v)),
        SqlValue::I32(v) => Value::Int(i64::from(*v)),
        SqlValue::I64(v) => Value::Int(*v),
        SqlValue::F32(v) => Value::Float(*v),
        SqlValue::F64(v) => Value::Double(*v),
        SqlValue::Text(v) => Value::Bytes(v.clone().into_bytes()),
        SqlValue::Bytes(v) => Value::Bytes(v.clone()),
        SqlValue::Uuid(v) => Value::Bytes(v.to_string().into_bytes()),
        SqlValue::Decimal(v) => Value::Bytes(v.to_string().into_bytes()),
        SqlValue::DateTime(v) => datetime_value(v),
        SqlValue::DateTimeOffset(v) => datetime_value(&v.naive_utc()),
        SqlValue::Date(v) => Value::Date(v.year() as u16, v.month() as u8, v.day() as u8, 0, 0, 0, 0),
        SqlValue::Time(v) => Value::Time(
            false,
            0,
            v.hour() as u8,
            v.minute() as u8,
            v.second() as u8,
            v.nanosecond() / 1000,
        ),
    }
}

fn datetime_value(v: &NaiveDateTime) -> Value {
    Value::Date(
        v.year() as u16,
        v.month() as u8,
        v.day() as u8,
        v.hour() as u8,
        v.minute() as u8,
        v.second() as u8,
        v.nanosecond() / 1000,
    )
}

fn convert_value(value: Value) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null(SqlNullType::Text),
        Value::Int(v) => SqlValue::I64(v),
        Value::UInt(v) => SqlValue::I64(v as i64),
        Value::Float(v) => SqlValue::F32(v),
        Value::Double(v) => SqlValue::F64(v),
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => SqlValue::Text(s),
            Err(e) => SqlValue::Bytes(e.into_bytes()),
        },
        Value::Date(year, month, day, hour, minute, second, micros) => {
            match NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day)) {
                Some(date) if hour == 0 && minute == 0 && second == 0 && micros == 0 => {
                    SqlValue::Date(date)
                }
                Some(date) => date
                    .and_hms_micro_opt(
                        u32::from(hour),
                        u32::from(minute),
                        u32::from(second),
                        micros,
                    )
                    .map(SqlValue::DateTime)
                    .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
                None => SqlValue::Null(SqlNullType::DateTime),
            }
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            if negative || days > 0 {
                // Durations outside a single day do not map onto a wall
                // clock time; render as text.
                SqlValue::Text(format!(
                    "{}{}:{:02}:{:02}.{:06}",
                    if negative { "-" } else { "" },
                    u32::from(hours) + days * 24,
                    minutes,
                    seconds,
                    micros
                ))
            } else {
                NaiveTime::from_hms_micro_opt(
                    u32::from(hours),
                    u32::from(minutes),
                    u32::from(seconds),
                    micros,
                )
                .map(SqlValue::Time)
                .unwrap_or(SqlValue::Null(SqlNullType::Time))
            }
        }
    }
}
