//! SQL Server adapter built on tiberius.

use super::{BackendAdapter, BackendKind, Capabilities};
use crate::config::DatabaseDescriptor;
use crate::error::{MigrateError, Result};
use crate::value::{QueryResult, Row, SqlNullType, SqlValue};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tiberius::numeric::Numeric;
use tiberius::{AuthMethod, Client, ColumnType, Config, EncryptionLevel, Query};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;
use uuid::Uuid;

type MssqlClient = Client<Compat<TcpStream>>;

/// Single-connection SQL Server adapter.
pub struct MssqlAdapter {
    db_id: String,
    descriptor: DatabaseDescriptor,
    client: Option<MssqlClient>,
}

impl MssqlAdapter {
    pub fn new(db_id: &str, descriptor: DatabaseDescriptor) -> Self {
        Self {
            db_id: db_id.to_string(),
            descriptor,
            client: None,
        }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.descriptor.host);
        config.port(
            self.descriptor
                .port
                .unwrap_or_else(|| BackendKind::Mssql.default_port()),
        );
        config.database(&self.descriptor.database);
        config.authentication(AuthMethod::sql_server(
            &self.descriptor.user,
            &self.descriptor.password,
        ));

        if self.descriptor.encrypt {
            if self.descriptor.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }

    fn client(&mut self) -> Result<&mut MssqlClient> {
        self.client.as_mut().ok_or_else(|| {
            MigrateError::connection(&self.db_id, "not connected")
        })
    }

    async fn run_statement(&mut self, sql: &str) -> Result<()> {
        let db_id = self.db_id.clone();
        let client = self.client()?;
        client
            .simple_query(sql)
            .await
            .map_err(|e| MigrateError::query(&db_id, e.to_string()))?
            .into_results()
            .await
            .map_err(|e| MigrateError::query(&db_id, e.to_string()))?;
        Ok(())
    }

    async fn run_control(&mut self, sql: &str) -> Result<()> {
        let db_id = self.db_id.clone();
        let client = self.client()?;
        client
            .simple_query(sql)
            .await
            .map_err(|e| MigrateError::transaction(&db_id, e.to_string()))?
            .into_results()
            .await
            .map_err(|e| MigrateError::transaction(&db_id, e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl BackendAdapter for MssqlAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Mssql
    }

    fn db_id(&self) -> &str {
        &self.db_id
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            column_metadata: true,
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

        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| MigrateError::connection(&self.db_id, e.to_string()))?;
        tcp.set_nodelay(true).ok();

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| MigrateError::connection(&self.db_id, e.to_string()))?;

        debug!(db_id = %self.db_id, "connected to mssql");
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client
                .close()
                .await
                .map_err(|e| MigrateError::connection(&self.db_id, e.to_string()))?;
            debug!(db_id = %self.db_id, "disconnected from mssql");
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        let db_id = self.db_id.clone();
        let client = self.client()?;

        let mut query = Query::new(sql.to_string());
        for param in params {
            bind_param(&mut query, param);
        }

        let stream = query
            .query(client)
            .await
            .map_err(|e| MigrateError::query(&db_id, e.to_string()))?;
        let raw_rows = stream
            .into_first_result()
            .await
            .map_err(|e| MigrateError::query(&db_id, e.to_string()))?;

        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw in &raw_rows {
            let mut row = Row::new();
            for (idx, col) in raw.columns().iter().enumerate() {
                let value = convert_row_value(raw, idx, col.column_type());
                row.push(col.name().to_string(), value);
            }
            rows.push(row);
        }

        Ok(QueryResult::with_rows(rows))
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let db_id = self.db_id.clone();
        let client = self.client()?;

        let mut query = Query::new(sql.to_string());
        for param in params {
            bind_param(&mut query, param);
        }

        let result = query
            .execute(client)
            .await
            .map_err(|e| MigrateError::query(&db_id, e.to_string()))?;
        Ok(result.total())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.run_control("BEGIN TRANSACTION").await
    }

    async fn commit(&mut self) -> Result<()> {
        self.run_control("COMMIT TRANSACTION").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.run_control("ROLLBACK TRANSACTION").await
    }

    async fn table_columns(&mut self, table: &str) -> Result<Vec<String>> {
        // Computed and identity columns cannot be inserted; binary and
        // rowversion columns are skipped to match delete/insert literals.
        let sql = r#"
            SELECT c.name
            FROM sys.columns c
            JOIN sys.types ty ON c.user_type_id = ty.user_type_id
            WHERE c.object_id = OBJECT_ID(@P1)
              AND c.is_computed = 0
              AND c.is_identity = 0
              AND ty.name NOT IN ('binary', 'varbinary', 'image', 'timestamp', 'rowversion')
            ORDER BY c.column_id
        "#;

        let result = self
            .query(sql, &[SqlValue::Text(table.to_string())])
            .await?;

        Ok(result
            .rows
            .iter()
            .filter_map(|row| match row.values().next() {
                Some(SqlValue::Text(name)) => Some(name.clone()),
                _ => None,
            })
            .collect())
    }

    async fn set_constraints_enabled(&mut self, enabled: bool) -> Result<()> {
        let sql = if enabled {
            "EXEC sp_msforeachtable 'ALTER TABLE ? WITH CHECK CHECK CONSTRAINT ALL'"
        } else {
            "EXEC sp_msforeachtable 'ALTER TABLE ? NOCHECK CONSTRAINT ALL'"
        };
        self.run_statement(sql).await
    }
}

fn bind_param<'a>(query: &mut Query<'a>, value: &'a SqlValue) {
    match value {
        SqlValue::Null(null_type) => bind_null(query, *null_type),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::I16(v) => query.bind(*v),
        SqlValue::I32(v) => query.bind(*v),
        SqlValue::I64(v) => query.bind(*v),
        SqlValue::F32(v) => query.bind(*v),
        SqlValue::F64(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
        SqlValue::Uuid(v) => query.bind(*v),
        SqlValue::Decimal(v) => query.bind(numeric_param(v)),
        SqlValue::DateTime(v) => query.bind(*v),
        SqlValue::DateTimeOffset(v) => query.bind(v.with_timezone(&Utc)),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::Time(v) => query.bind(*v),
    }
}

fn bind_null(query: &mut Query<'_>, null_type: SqlNullType) {
    match null_type {
        SqlNullType::Bool => query.bind(Option::<bool>::None),
        SqlNullType::I16 => query.bind(Option::<i16>::None),
        SqlNullType::I32 => query.bind(Option::<i32>::None),
        SqlNullType::I64 => query.bind(Option::<i64>::None),
        SqlNullType::F32 => query.bind(Option::<f32>::None),
        SqlNullType::F64 => query.bind(Option::<f64>::None),
        SqlNullType::Text => query.bind(Option::<&str>::None),
        SqlNullType::Bytes => query.bind(Option::<&[u8]>::None),
        SqlNullType::Uuid => query.bind(Option::<Uuid>::None),
        SqlNullType::Decimal => query.bind(Option::<Numeric>::None),
        SqlNullType::DateTime => query.bind(Option::<NaiveDateTime>::None),
        SqlNullType::DateTimeOffset => query.bind(Option::<DateTime<Utc>>::None),
        SqlNullType::Date => query.bind(Option::<NaiveDate>::None),
        SqlNullType::Time => query.bind(Option::<NaiveTime>::None),
    }
}

fn numeric_param(value: &Decimal) -> Numeric {
    Numeric::new_with_scale(value.mantissa(), value.scale() as u8)
}

/// Decode one cell as the strongest matching type.
///
/// The `cell` helper goes through `try_get` so a width mismatch falls
/// through to the next candidate instead of panicking; the variable-width
/// wire types (Intn, Floatn) carry their actual width per row.
fn convert_row_value(row: &tiberius::Row, idx: usize, col_type: ColumnType) -> SqlValue {
    fn cell<'a, T: tiberius::FromSql<'a>>(row: &'a tiberius::Row, idx: usize) -> Option<T> {
        row.try_get(idx).ok().flatten()
    }

    match col_type {
        ColumnType::Bit | ColumnType::Bitn => cell::<bool>(row, idx)
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        ColumnType::Int1 => cell::<u8>(row, idx)
            .map(|v| SqlValue::I16(v as i16))
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        ColumnType::Int2 => cell::<i16>(row, idx)
            .map(SqlValue::I16)
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        ColumnType::Int4 => cell::<i32>(row, idx)
            .map(SqlValue::I32)
            .unwrap_or(SqlValue::Null(SqlNullType::I32)),
        ColumnType::Int8 => cell::<i64>(row, idx)
            .map(SqlValue::I64)
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        // Nullable integers arrive as Intn with a runtime width.
        ColumnType::Intn => cell::<i64>(row, idx)
            .map(SqlValue::I64)
            .or_else(|| cell::<i32>(row, idx).map(SqlValue::I32))
            .or_else(|| cell::<i16>(row, idx).map(SqlValue::I16))
            .or_else(|| cell::<u8>(row, idx).map(|v| SqlValue::I16(v as i16)))
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        ColumnType::Float4 => cell::<f32>(row, idx)
            .map(SqlValue::F32)
            .unwrap_or(SqlValue::Null(SqlNullType::F32)),
        ColumnType::Float8 => cell::<f64>(row, idx)
            .map(SqlValue::F64)
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        ColumnType::Floatn => cell::<f64>(row, idx)
            .map(SqlValue::F64)
            .or_else(|| cell::<f32>(row, idx).map(SqlValue::F32))
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        ColumnType::Decimaln | ColumnType::Numericn => cell::<Decimal>(row, idx)
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        // MONEY comes off the wire as a scaled float.
        ColumnType::Money | ColumnType::Money4 => cell::<f64>(row, idx)
            .and_then(Decimal::from_f64)
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        ColumnType::Guid => cell::<Uuid>(row, idx)
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        ColumnType::Datetime
        | ColumnType::Datetime4
        | ColumnType::Datetimen
        | ColumnType::Datetime2 => cell::<NaiveDateTime>(row, idx)
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        ColumnType::DatetimeOffsetn => cell::<DateTime<Utc>>(row, idx)
            .map(|v| SqlValue::DateTimeOffset(v.fixed_offset()))
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        ColumnType::Daten => cell::<NaiveDate>(row, idx)
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        ColumnType::Timen => cell::<NaiveTime>(row, idx)
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        ColumnType::BigBinary | ColumnType::BigVarBin | ColumnType::Image => {
            cell::<&[u8]>(row, idx)
                .map(|v| SqlValue::Bytes(v.to_vec()))
                .unwrap_or(SqlValue::Null(SqlNullType::Bytes))
        }
        // Everything else (char/varchar/nvarchar/text/xml) comes out as text.
        _ => cell::<&str>(row, idx)
            .map(|v| SqlValue::Text(v.to_string()))
            .unwrap_or(SqlValue::Null(SqlNullType::Text)),
    }
}
