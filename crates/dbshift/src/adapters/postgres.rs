//! PostgreSQL adapter built on tokio-postgres.

use super::{BackendAdapter, BackendKind, Capabilities};
use crate::config::DatabaseDescriptor;
use crate::error::{MigrateError, Result};
use crate::value::{QueryResult, Row, SqlNullType, SqlValue};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::debug;
use uuid::Uuid;

/// Single-connection PostgreSQL adapter.
///
/// tokio-postgres splits the client from the connection task; the task is
/// spawned on connect and aborted on disconnect.
pub struct PostgresAdapter {
    db_id: String,
    descriptor: DatabaseDescriptor,
    client: Option<Client>,
    connection_task: Option<JoinHandle<()>>,
}

impl PostgresAdapter {
    pub fn new(db_id: &str, descriptor: DatabaseDescriptor) -> Self {
        Self {
            db_id: db_id.to_string(),
            descriptor,
            client: None,
            connection_task: None,
        }
    }

    fn conn_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.descriptor.host,
            self.descriptor
                .port
                .unwrap_or_else(|| BackendKind::Postgres.default_port()),
            self.descriptor.database,
            self.descriptor.user,
            self.descriptor.password,
        )
    }

    fn client(&self) -> Result<&Client> {
        self.client.as_ref().ok_or_else(|| {
            MigrateError::connection(&self.db_id, "not connected")
        })
    }

    async fn run_statement(&mut self, sql: &str) -> Result<()> {
        let db_id = self.db_id.clone();
        self.client()?
            .batch_execute(sql)
            .await
            .map_err(|e| MigrateError::query(&db_id, e.to_string()))
    }

    async fn run_control(&mut self, sql: &str) -> Result<()> {
        let db_id = self.db_id.clone();
        self.client()?
            .batch_execute(sql)
            .await
            .map_err(|e| MigrateError::transaction(&db_id, e.to_string()))
    }
}

#[async_trait]
impl BackendAdapter for PostgresAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn db_id(&self) -> &str {
        &self.db_id
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
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
        if self.client.is_some() {
            return Ok(());
        }

        let (client, connection) = tokio_postgres::connect(&self.conn_string(), NoTls)
            .await
            .map_err(|e| MigrateError::connection(&self.db_id, e.to_string()))?;

        let db_id = self.db_id.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(db_id = %db_id, "postgres connection closed: {}", e);
            }
        });

        debug!(db_id = %self.db_id, "connected to postgres");
        self.client = Some(client);
        self.connection_task = Some(task);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.client.take().is_some() {
            debug!(db_id = %self.db_id, "disconnected from postgres");
        }
        // Dropping the client ends the connection task on its own; abort
        // covers a task stuck mid-poll.
        if let Some(task) = self.connection_task.take() {
            task.abort();
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        let db_id = self.db_id.clone();
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        let raw_rows = self
            .client()?
            .query(sql, &refs)
            .await
            .map_err(|e| MigrateError::query(&db_id, e.to_string()))?;

        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw in &raw_rows {
            let mut row = Row::new();
            for (idx, col) in raw.columns().iter().enumerate() {
                let value = convert_row_value(raw, idx, col.type_().name());
                row.push(col.name().to_string(), value);
            }
            rows.push(row);
        }

        Ok(QueryResult::with_rows(rows))
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let db_id = self.db_id.clone();
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        self.client()?
            .execute(sql, &refs)
            .await
            .map_err(|e| MigrateError::query(&db_id, e.to_string()))
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.run_control("BEGIN").await
    }

    async fn commit(&mut self) -> Result<()> {
        self.run_control("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.run_control("ROLLBACK").await
    }

    async fn table_columns(&mut self, _table: &str) -> Result<Vec<String>> {
        // No computed/identity filtering here; wildcard column resolution
        // is an MSSQL-target facility.
        Ok(Vec::new())
    }

    async fn set_constraints_enabled(&mut self, enabled: bool) -> Result<()> {
        let sql = if enabled {
            "SET session_replication_role = DEFAULT"
        } else {
            "SET session_replication_role = replica"
        };
        self.run_statement(sql).await
    }
}

fn convert_row_value(row: &tokio_postgres::Row, idx: usize, type_name: &str) -> SqlValue {
    match type_name {
        "bool" => row
            .try_get::<_, bool>(idx)
            .ok()
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        "int2" => row
            .try_get::<_, i16>(idx)
            .ok()
            .map(SqlValue::I16)
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "int4" => row
            .try_get::<_, i32>(idx)
            .ok()
            .map(SqlValue::I32)
            .unwrap_or(SqlValue::Null(SqlNullType::I32)),
        "int8" => row
            .try_get::<_, i64>(idx)
            .ok()
            .map(SqlValue::I64)
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        "float4" => row
            .try_get::<_, f32>(idx)
            .ok()
            .map(SqlValue::F32)
            .unwrap_or(SqlValue::Null(SqlNullType::F32)),
        "float8" => row
            .try_get::<_, f64>(idx)
            .ok()
            .map(SqlValue::F64)
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        "numeric" => row
            .try_get::<_, Decimal>(idx)
            .ok()
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        "uuid" => row
            .try_get::<_, Uuid>(idx)
            .ok()
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        "timestamp" => row
            .try_get::<_, NaiveDateTime>(idx)
            .ok()
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        "timestamptz" => row
            .try_get::<_, DateTime<FixedOffset>>(idx)
            .ok()
            .map(SqlValue::DateTimeOffset)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        "date" => row
            .try_get::<_, NaiveDate>(idx)
            .ok()
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        "time" => row
            .try_get::<_, NaiveTime>(idx)
            .ok()
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        "bytea" => row
            .try_get::<_, Vec<u8>>(idx)
            .ok()
            .map(SqlValue::Bytes)
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        _ => row
            .try_get::<_, String>(idx)
            .ok()
            .map(SqlValue::Text)
            .unwrap_or(SqlValue::Null(SqlNullType::Text)),
    }
}
