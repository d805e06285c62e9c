//! Connection registry: logical database ids mapped to live adapters.

pub mod statements;

use crate::adapters::{create_adapter, BackendAdapter, BackendKind};
use crate::config::{ColumnSpec, DatabaseDescriptor};
use crate::error::{MigrateError, Result};
use crate::value::{QueryResult, Row};
use futures::future::join_all;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

struct RegistryEntry {
    descriptor: DatabaseDescriptor,
    adapter: Box<dyn BackendAdapter>,
}

/// Holds one adapter per logical database id and routes statements to them.
///
/// `"source"` and `"target"` are accepted anywhere an id is, resolving to
/// the ids set via [`set_roles`](Self::set_roles).
pub struct ConnectionRegistry {
    entries: BTreeMap<String, RegistryEntry>,
    source_id: Option<String>,
    target_id: Option<String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            source_id: None,
            target_id: None,
        }
    }

    /// Build a registry covering every database in a config map.
    pub fn from_databases(databases: &BTreeMap<String, DatabaseDescriptor>) -> Result<Self> {
        let mut registry = Self::new();
        for (id, descriptor) in databases {
            registry.upsert(id, descriptor.clone())?;
        }
        Ok(registry)
    }

    /// Record which ids play the source and target roles.
    pub fn set_roles(&mut self, source: &str, target: &str) {
        self.source_id = Some(source.to_string());
        self.target_id = Some(target.to_string());
    }

    /// Insert or update a database entry.
    ///
    /// For an existing id with an unchanged backend kind the adapter
    /// instance is kept and only its descriptor is swapped, so an open
    /// connection is not torn down by a config refresh. A changed backend
    /// kind replaces the adapter.
    pub fn upsert(&mut self, id: &str, descriptor: DatabaseDescriptor) -> Result<()> {
        if let Some(entry) = self.entries.get_mut(id) {
            let new_kind = BackendKind::parse(&descriptor.backend);
            if new_kind == Some(entry.adapter.backend()) {
                debug!(db_id = %id, "updated descriptor on existing adapter");
                entry.adapter.set_descriptor(descriptor.clone());
                entry.descriptor = descriptor;
                return Ok(());
            }
        }

        let adapter = create_adapter(id, &descriptor)?;
        self.entries.insert(
            id.to_string(),
            RegistryEntry {
                descriptor,
                adapter,
            },
        );
        Ok(())
    }

    fn resolve(&self, id: &str) -> Result<String> {
        let resolved = match id {
            "source" => self.source_id.as_deref(),
            "target" => self.target_id.as_deref(),
            other => Some(other),
        };
        let resolved = resolved.ok_or_else(|| {
            MigrateError::Config(format!("role '{}' has not been assigned", id))
        })?;
        if self.entries.contains_key(resolved) {
            Ok(resolved.to_string())
        } else {
            Err(MigrateError::Config(format!(
                "unknown database id '{}'",
                resolved
            )))
        }
    }

    /// Borrow the adapter for an id or role.
    pub fn adapter(&mut self, id: &str) -> Result<&mut Box<dyn BackendAdapter>> {
        let resolved = self.resolve(id)?;
        Ok(&mut self
            .entries
            .get_mut(&resolved)
            .ok_or_else(|| MigrateError::Config(format!("unknown database id '{}'", resolved)))?
            .adapter)
    }

    /// Descriptor for an id or role.
    pub fn descriptor(&self, id: &str) -> Result<&DatabaseDescriptor> {
        let resolved = self.resolve(id)?;
        Ok(&self.entries[&resolved].descriptor)
    }

    /// All registered ids.
    pub fn ids(&self) -> Vec<&str> {
        self.entries.keys().map(|k| k.as_str()).collect()
    }

    pub fn is_connected(&self, id: &str) -> bool {
        self.resolve(id)
            .ok()
            .map(|resolved| self.entries[&resolved].adapter.is_connected())
            .unwrap_or(false)
    }

    /// Connect one database.
    pub async fn connect(&mut self, id: &str) -> Result<()> {
        let adapter = self.adapter(id)?;
        adapter.connect().await
    }

    /// Connect several databases in parallel. Every attempt runs to
    /// completion; failures are collected instead of aborting the rest.
    /// Role names are resolved and duplicates connect once.
    pub async fn connect_many(&mut self, ids: &[&str]) -> Vec<(String, MigrateError)> {
        let mut resolved = Vec::new();
        let mut failures = Vec::new();
        for id in ids {
            match self.resolve(id) {
                Ok(r) => {
                    if !resolved.contains(&r) {
                        resolved.push(r);
                    }
                }
                Err(e) => failures.push((id.to_string(), e)),
            }
        }

        // Entries move out of the map so the connect futures can run
        // concurrently, then move back in.
        let mut taken = Vec::new();
        for id in &resolved {
            if let Some(entry) = self.entries.remove(id) {
                taken.push((id.clone(), entry));
            }
        }

        let results = join_all(taken.into_iter().map(|(id, mut entry)| async move {
            let outcome = entry.adapter.connect().await;
            (id, entry, outcome)
        }))
        .await;

        for (id, entry, outcome) in results {
            if let Err(e) = outcome {
                warn!(db_id = %id, "connect failed: {}", e);
                failures.push((id.clone(), e));
            } else {
                info!(db_id = %id, backend = %entry.adapter.backend(), "connected");
            }
            self.entries.insert(id, entry);
        }

        failures
    }

    /// Disconnect one database.
    pub async fn disconnect(&mut self, id: &str) -> Result<()> {
        let adapter = self.adapter(id)?;
        adapter.disconnect().await
    }

    /// Disconnect every connected database, continuing past individual
    /// failures so one broken socket does not leave the rest open.
    pub async fn disconnect_all(&mut self) -> Vec<(String, MigrateError)> {
        let mut failures = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if !entry.adapter.is_connected() {
                continue;
            }
            if let Err(e) = entry.adapter.disconnect().await {
                warn!(db_id = %id, "disconnect failed: {}", e);
                failures.push((id.clone(), e));
            }
        }
        failures
    }

    /// Run a row-returning statement on a database.
    pub async fn fetch(&mut self, id: &str, sql: &str) -> Result<QueryResult> {
        let adapter = self.adapter(id)?;
        adapter.query(sql, &[]).await
    }

    /// Run a side-effecting statement on a database.
    pub async fn execute_on(&mut self, id: &str, sql: &str) -> Result<u64> {
        let adapter = self.adapter(id)?;
        adapter.execute(sql, &[]).await
    }

    /// Delete the target rows whose key columns match the given source rows,
    /// in chunks. Returns total rows deleted.
    pub async fn delete_by_keys(
        &mut self,
        id: &str,
        table: &str,
        key_columns: &[String],
        rows: &[Row],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let chunks = statements::build_delete_chunks(table, key_columns, rows)?;
        let adapter = self.adapter(id)?;
        let mut deleted = 0;
        for chunk in &chunks {
            deleted += adapter.execute(chunk, &[]).await?;
        }
        debug!(
            db_id = %id,
            table,
            rows = rows.len(),
            statements = chunks.len(),
            deleted,
            "delete-before-insert complete"
        );
        Ok(deleted)
    }

    /// Resolve the effective target column list for an insert.
    ///
    /// A wildcard spec asks the backend for live column metadata and keeps
    /// the columns the source rows actually carry. Backends without column
    /// metadata cannot serve a wildcard.
    pub async fn resolve_columns(
        &mut self,
        id: &str,
        table: &str,
        spec: &ColumnSpec,
        sample: &Row,
    ) -> Result<Vec<String>> {
        if !spec.is_wildcard() {
            if let ColumnSpec::Columns(cols) = spec {
                return Ok(cols.clone());
            }
        }

        let adapter = self.adapter(id)?;
        if !adapter.capabilities().column_metadata {
            return Err(MigrateError::Validation(format!(
                "table '{}': target_columns '*' needs explicit columns on a {} target",
                table,
                adapter.backend()
            )));
        }
        let metadata = adapter.table_columns(table).await?;
        if metadata.is_empty() {
            return Err(MigrateError::Validation(format!(
                "table '{}': no insertable columns found on target table",
                table
            )));
        }

        let filtered: Vec<String> = metadata
            .into_iter()
            .filter(|col| sample.get(col).is_some())
            .collect();
        if filtered.is_empty() {
            return Err(MigrateError::Validation(format!(
                "table '{}': no target column matches the source result set",
                table
            )));
        }
        Ok(filtered)
    }

    /// Insert rows into a target table with one parameterized statement per
    /// row. Returns rows inserted.
    pub async fn insert_rows(
        &mut self,
        id: &str,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let adapter = self.adapter(id)?;
        let sql = statements::build_insert(adapter.backend(), table, columns);

        let mut inserted = 0;
        for row in rows {
            let mut params = Vec::with_capacity(columns.len());
            for col in columns {
                let value = row.get(col).ok_or_else(|| {
                    MigrateError::Validation(format!(
                        "column '{}' missing from source row for table '{}'",
                        col, table
                    ))
                })?;
                params.push(value.clone());
            }
            adapter.execute(&sql, &params).await?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Connect, run the backend's health-check query, and report success.
    pub async fn test_connection(&mut self, id: &str) -> Result<()> {
        let adapter = self.adapter(id)?;
        let was_connected = adapter.is_connected();
        adapter.connect().await?;
        let check = adapter.backend().test_query();
        adapter.query(check, &[]).await?;
        if !was_connected {
            adapter.disconnect().await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn insert_adapter(
        &mut self,
        id: &str,
        descriptor: DatabaseDescriptor,
        adapter: Box<dyn BackendAdapter>,
    ) {
        self.entries.insert(
            id.to_string(),
            RegistryEntry {
                descriptor,
                adapter,
            },
        );
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{mock_descriptor, MockAdapter};
    use crate::value::{SqlValue};
    use std::sync::atomic::Ordering;

    fn registry_with_mock(id: &str, kind: BackendKind) -> ConnectionRegistry {
        let mut registry = ConnectionRegistry::new();
        let adapter = MockAdapter::new(id, kind);
        registry.insert_adapter(id, mock_descriptor(kind), Box::new(adapter));
        registry
    }

    #[tokio::test]
    async fn upsert_keeps_adapter_for_same_backend() {
        let mut registry = ConnectionRegistry::new();
        let adapter = MockAdapter::new("db1", BackendKind::Postgres);
        let dropped = adapter.drop_marker();
        registry.insert_adapter("db1", mock_descriptor(BackendKind::Postgres), Box::new(adapter));

        let mut new_descriptor = mock_descriptor(BackendKind::Postgres);
        new_descriptor.host = "replica.example.com".to_string();
        registry.upsert("db1", new_descriptor.clone()).unwrap();

        assert!(!dropped.load(Ordering::SeqCst));
        assert_eq!(
            registry.descriptor("db1").unwrap().host,
            "replica.example.com"
        );
    }

    #[tokio::test]
    async fn upsert_replaces_adapter_for_changed_backend() {
        let mut registry = ConnectionRegistry::new();
        let adapter = MockAdapter::new("db1", BackendKind::Postgres);
        let dropped = adapter.drop_marker();
        registry.insert_adapter("db1", mock_descriptor(BackendKind::Postgres), Box::new(adapter));

        registry
            .upsert("db1", mock_descriptor(BackendKind::Mysql))
            .unwrap();
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(
            registry.adapter("db1").unwrap().backend(),
            BackendKind::Mysql
        );
    }

    #[tokio::test]
    async fn disconnect_all_continues_past_failures() {
        let mut registry = ConnectionRegistry::new();

        let mut bad = MockAdapter::new("bad", BackendKind::Mysql);
        bad.connected = true;
        bad.fail_disconnect = true;
        registry.insert_adapter("bad", mock_descriptor(BackendKind::Mysql), Box::new(bad));

        let mut good = MockAdapter::new("good", BackendKind::Postgres);
        good.connected = true;
        registry.insert_adapter("good", mock_descriptor(BackendKind::Postgres), Box::new(good));

        let failures = registry.disconnect_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "bad");
        assert!(!registry.adapter("good").unwrap().is_connected());
    }

    #[tokio::test]
    async fn connect_many_collects_failures_and_connects_rest() {
        let mut registry = ConnectionRegistry::new();

        let mut bad = MockAdapter::new("bad", BackendKind::Mysql);
        bad.fail_connect = true;
        registry.insert_adapter("bad", mock_descriptor(BackendKind::Mysql), Box::new(bad));
        registry.insert_adapter(
            "good",
            mock_descriptor(BackendKind::Postgres),
            Box::new(MockAdapter::new("good", BackendKind::Postgres)),
        );

        let failures = registry.connect_many(&["bad", "good"]).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "bad");
        assert!(registry.is_connected("good"));
        assert!(!registry.is_connected("bad"));
    }

    #[tokio::test]
    async fn source_and_target_roles_resolve() {
        let mut registry = registry_with_mock("db1", BackendKind::Postgres);
        registry.insert_adapter(
            "db2",
            mock_descriptor(BackendKind::Mysql),
            Box::new(MockAdapter::new("db2", BackendKind::Mysql)),
        );
        registry.set_roles("db1", "db2");

        assert_eq!(registry.adapter("source").unwrap().db_id(), "db1");
        assert_eq!(registry.adapter("target").unwrap().db_id(), "db2");
    }

    #[tokio::test]
    async fn same_source_and_target_connects_once() {
        let mut registry = registry_with_mock("db1", BackendKind::Postgres);
        registry.set_roles("db1", "db1");
        let failures = registry.connect_many(&["source", "target"]).await;
        assert!(failures.is_empty());
        assert!(registry.is_connected("db1"));
    }

    #[tokio::test]
    async fn insert_rows_requires_all_columns() {
        let mut registry = registry_with_mock("db1", BackendKind::Postgres);

        let mut row = Row::new();
        row.push("a", SqlValue::I32(1));
        let err = registry
            .insert_rows("db1", "t", &["a".to_string(), "b".to_string()], &[row])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }

    #[tokio::test]
    async fn wildcard_resolution_filters_to_source_columns() {
        let mut registry = ConnectionRegistry::new();
        let mut adapter = MockAdapter::new("db1", BackendKind::Mssql);
        adapter.columns = vec!["id".to_string(), "name".to_string(), "extra".to_string()];
        registry.insert_adapter("db1", mock_descriptor(BackendKind::Mssql), Box::new(adapter));

        let mut sample = Row::new();
        sample.push("id", SqlValue::I32(1));
        sample.push("name", SqlValue::Text("x".to_string()));

        let cols = registry
            .resolve_columns("db1", "t", &ColumnSpec::default(), &sample)
            .await
            .unwrap();
        assert_eq!(cols, vec!["id", "name"]);
    }

    #[tokio::test]
    async fn wildcard_without_metadata_is_an_error() {
        let mut registry = registry_with_mock("db1", BackendKind::Postgres);
        let mut sample = Row::new();
        sample.push("id", SqlValue::I32(1));
        let err = registry
            .resolve_columns("db1", "t", &ColumnSpec::default(), &sample)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("explicit columns"));
    }

    #[tokio::test]
    async fn delete_by_keys_empty_rows_is_noop() {
        let mut registry = registry_with_mock("db1", BackendKind::Postgres);
        let deleted = registry
            .delete_by_keys("db1", "t", &["id".to_string()], &[])
            .await
            .unwrap();
        assert_eq!(deleted, 0);
    }
}
