//! Migration orchestration: drives queries from source to target with
//! durable progress.

use crate::config::{validate_config, Config, ProcessScript, QueryDefinition};
use crate::error::{MigrateError, Result};
use crate::fk::{self, DeletionOrder};
use crate::progress::{MigrationRun, ProgressStore, RunPhase, RunStatus};
use crate::registry::ConnectionRegistry;
use crate::variables;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{error, info, warn};

/// Outcome of one query within a run.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub id: String,
    pub rows_read: u64,
    pub rows_deleted: u64,
    pub rows_inserted: u64,
    pub batches: u64,
    /// Already completed in a previous attempt and skipped on resume.
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryOutcome {
    fn skipped(id: &str) -> Self {
        Self {
            id: id.to_string(),
            rows_read: 0,
            rows_deleted: 0,
            rows_inserted: 0,
            batches: 0,
            skipped: true,
            error: None,
        }
    }

    fn failed(id: &str, error: String) -> Self {
        Self {
            id: id.to_string(),
            rows_read: 0,
            rows_deleted: 0,
            rows_inserted: 0,
            batches: 0,
            skipped: false,
            error: Some(error),
        }
    }
}

/// Summary of a finished (or failed best-effort) run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub run_id: String,
    pub status: RunStatus,
    pub success: bool,
    pub queries: Vec<QueryOutcome>,
    pub failed_queries: u64,
    pub total_rows_inserted: u64,
    pub duration_secs: f64,
    /// Checkpoint file holding this run's durable state.
    pub progress_file: String,
}

/// One query's preview in a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunQuery {
    pub id: String,
    pub target_table: String,
    pub rows_available: u64,
    pub source_columns: Vec<String>,
    pub would_delete_first: bool,
}

/// Result of a dry run: what a real run would do, without writing.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub success: bool,
    pub total_rows_available: u64,
    pub variables: BTreeMap<String, String>,
    pub queries: Vec<DryRunQuery>,
}

/// One entry from [`Migrator::list_databases`].
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub id: String,
    pub backend: String,
    pub host: String,
    pub database: String,
    pub writable: bool,
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Drives migrations described by a [`Config`] through a
/// [`ConnectionRegistry`], checkpointing into a [`ProgressStore`].
pub struct Migrator {
    config: Config,
    config_hash: String,
    registry: ConnectionRegistry,
    store: ProgressStore,
}

impl Migrator {
    pub fn new(config: Config, config_hash: String) -> Result<Self> {
        let mut registry = ConnectionRegistry::from_databases(&config.databases)?;
        registry.set_roles(&config.settings.source, &config.settings.target);
        let store = ProgressStore::new(&config.settings.progress_dir);
        Ok(Self {
            config,
            config_hash,
            registry,
            store,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_parts(
        config: Config,
        config_hash: String,
        registry: ConnectionRegistry,
        store: ProgressStore,
    ) -> Self {
        Self {
            config,
            config_hash,
            registry,
            store,
        }
    }

    pub fn progress_store(&self) -> &ProgressStore {
        &self.store
    }

    /// Run the migration, or pick up an interrupted run when `resume_id`
    /// is given. Connections are always torn down before returning.
    pub async fn execute_migration(&mut self, resume_id: Option<&str>) -> Result<MigrationReport> {
        let started = std::time::Instant::now();
        let mut run = match resume_id {
            Some(id) => {
                let mut run = self.store.load_for_resume(id, &self.config_hash)?;
                run.prepare_for_resume();
                self.store.save(&run)?;
                info!(
                    run_id = %run.id,
                    completed = run.completed_queries().len(),
                    "resuming run"
                );
                run
            }
            None => {
                let ids: Vec<String> = self
                    .enabled_queries()
                    .iter()
                    .map(|q| q.id.clone())
                    .collect();
                self.store.create_run(&self.config_hash, &ids)?
            }
        };

        let result = self.run_migration(&mut run).await;
        for (id, e) in self.registry.disconnect_all().await {
            warn!(db_id = %id, "disconnect failed: {}", e);
        }

        match result {
            Ok(mut report) => {
                report.duration_secs = started.elapsed().as_secs_f64();
                Ok(report)
            }
            Err(e) => {
                if run.status == RunStatus::Running {
                    let _ = self.store.fail_run(&mut run, &e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn run_migration(&mut self, run: &mut MigrationRun) -> Result<MigrationReport> {
        let connect_ids = self.databases_in_use();
        let connect_refs: Vec<&str> = connect_ids.iter().map(String::as_str).collect();
        let failures = self.registry.connect_many(&connect_refs).await;
        if let Some((id, e)) = failures.into_iter().next() {
            return Err(MigrateError::connection(&id, e.to_string()));
        }

        self.store
            .update_phase(run, RunPhase::ExtractingVariables)?;
        let vars = self.collect_variables(false).await?;

        self.store.update_phase(run, RunPhase::Migrating)?;
        let completed: HashSet<String> = run
            .completed_queries()
            .into_iter()
            .map(str::to_string)
            .collect();

        let transactional = self.config.settings.use_transaction;
        if transactional {
            let target = self.registry.adapter("target")?;
            if !target.capabilities().transactions {
                return Err(MigrateError::Validation(format!(
                    "use_transaction is set but the {} target does not support transactions",
                    target.backend()
                )));
            }
            target.begin_transaction().await?;
        }

        let queries = self.enabled_queries();
        let total = queries.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut failed = 0u64;
        // Completed checkpoints held back until the target transaction
        // commits; a rollback leaves these queries in progress so resume
        // re-runs them.
        let mut deferred: Vec<(String, u64, u64)> = Vec::new();

        for query in &queries {
            if completed.contains(&query.id) {
                info!(query_id = %query.id, "already completed; skipping");
                outcomes.push(QueryOutcome::skipped(&query.id));
                continue;
            }

            self.store.start_query(run, &query.id)?;
            match self.run_query(run, query, &vars).await {
                Ok(outcome) => {
                    if transactional {
                        deferred.push((
                            query.id.clone(),
                            outcome.rows_read,
                            outcome.rows_deleted,
                        ));
                    } else {
                        self.store.complete_query(
                            run,
                            &query.id,
                            outcome.rows_read,
                            outcome.rows_deleted,
                        )?;
                    }
                    info!(
                        query_id = %query.id,
                        rows = outcome.rows_inserted,
                        batches = outcome.batches,
                        "query complete"
                    );
                    outcomes.push(outcome);
                }
                Err(e) => {
                    let detail = e.to_string();
                    self.store.fail_query(run, &query.id, &detail)?;
                    if transactional {
                        if let Err(rb) = self.registry.adapter("target")?.rollback().await {
                            warn!("rollback failed: {}", rb);
                        }
                        self.store.fail_run(run, &detail)?;
                        return Err(e);
                    }
                    error!(query_id = %query.id, "query failed: {}", detail);
                    failed += 1;
                    outcomes.push(QueryOutcome::failed(&query.id, detail));
                }
            }
        }

        if transactional {
            self.registry.adapter("target")?.commit().await?;
            for (id, rows_read, rows_deleted) in deferred {
                self.store.complete_query(run, &id, rows_read, rows_deleted)?;
            }
        }

        if failed == 0 {
            self.store.complete_run(run)?;
        } else {
            self.store
                .fail_run(run, &format!("{} of {} queries failed", failed, total))?;
        }

        Ok(MigrationReport {
            run_id: run.id.clone(),
            status: run.status,
            success: run.status == RunStatus::Completed,
            failed_queries: failed,
            total_rows_inserted: outcomes.iter().map(|o| o.rows_inserted).sum(),
            queries: outcomes,
            duration_secs: 0.0,
            progress_file: self.store.run_path(&run.id).display().to_string(),
        })
    }

    /// Every database id a run will touch: the two roles plus any extra
    /// databases referenced by enabled dynamic variables and scripts.
    fn databases_in_use(&self) -> Vec<String> {
        let mut ids = vec!["source".to_string(), "target".to_string()];
        for var in self.config.dynamic_variables.iter().filter(|v| v.enabled) {
            if let Some(db) = &var.database {
                ids.push(db.clone());
            }
        }
        for query in self.config.queries.iter().filter(|q| q.enabled) {
            for script in [&query.pre_process, &query.post_process]
                .into_iter()
                .flatten()
            {
                ids.push(script.database.clone());
            }
        }
        ids
    }

    async fn run_query(
        &mut self,
        run: &mut MigrationRun,
        query: &QueryDefinition,
        vars: &BTreeMap<String, String>,
    ) -> Result<QueryOutcome> {
        if let Some(script) = &query.pre_process {
            self.run_script(&query.id, script, vars).await?;
        }

        let sql = variables::substitute(&query.source_query, vars);
        let rows = self.registry.fetch("source", &sql).await?.rows;
        let rows_read = rows.len() as u64;

        let mut rows_deleted = 0;
        let mut rows_inserted = 0;
        let mut batches = 0;
        if rows.is_empty() {
            info!(query_id = %query.id, "source returned no rows; nothing to write");
        } else {
            let columns = self
                .registry
                .resolve_columns(
                    "target",
                    &query.target_table,
                    &query.target_columns,
                    &rows[0],
                )
                .await?;

            let batch_size = self.effective_batch_size(query, vars)?;
            self.store.plan_query(
                run,
                &query.id,
                rows_read,
                rows_read.div_ceil(batch_size as u64),
            )?;

            if query.deletes_before_insert(&self.config.settings) {
                rows_deleted = self
                    .registry
                    .delete_by_keys("target", &query.target_table, &query.key_columns, &rows)
                    .await?;
            }

            for batch in rows.chunks(batch_size) {
                let inserted = self
                    .registry
                    .insert_rows("target", &query.target_table, &columns, batch)
                    .await?;
                rows_inserted += inserted;
                batches += 1;
                self.store.update_batch_progress(run, &query.id, inserted)?;
            }
        }

        if let Some(script) = &query.post_process {
            if let Err(e) = self.run_script(&query.id, script, vars).await {
                warn!(query_id = %query.id, "post-process failed, continuing: {}", e);
            }
        }

        Ok(QueryOutcome {
            id: query.id.clone(),
            rows_read,
            rows_deleted,
            rows_inserted,
            batches,
            skipped: false,
            error: None,
        })
    }

    async fn run_script(
        &mut self,
        query_id: &str,
        script: &ProcessScript,
        vars: &BTreeMap<String, String>,
    ) -> Result<()> {
        for statement in &script.statements {
            let sql = variables::substitute(statement, vars);
            self.registry.execute_on(&script.database, &sql).await?;
        }
        info!(
            query_id,
            statements = script.statements.len(),
            db = %script.database,
            "script complete"
        );
        Ok(())
    }

    /// Static variables merged with extracted dynamic ones. With
    /// `source_only` (dry runs), dynamic variables bound to other databases
    /// are skipped instead of forcing a connection.
    async fn collect_variables(&mut self, source_only: bool) -> Result<BTreeMap<String, String>> {
        let mut vars = self.config.variables.clone();
        let dynamic = self.config.dynamic_variables.clone();
        for var in dynamic.iter().filter(|v| v.enabled) {
            let db = var.database.clone().unwrap_or_else(|| "source".to_string());
            if source_only && !self.is_source_db(&db) {
                warn!(
                    variable = %var.variable_name,
                    db = %db,
                    "skipping non-source dynamic variable in dry run"
                );
                continue;
            }
            let sql = variables::substitute(&var.query, &vars);
            let result = self.registry.fetch(&db, &sql).await?;
            let value = variables::extract(&var.variable_name, &result, var.extract_type)?;
            info!(variable = %var.variable_name, value = %value, "extracted variable");
            vars.insert(var.variable_name.clone(), value);
        }
        Ok(vars)
    }

    fn is_source_db(&self, db: &str) -> bool {
        db == "source" || db == self.config.settings.source
    }

    fn enabled_queries(&self) -> Vec<QueryDefinition> {
        self.config
            .queries
            .iter()
            .filter(|q| q.enabled)
            .cloned()
            .collect()
    }

    fn effective_batch_size(
        &self,
        query: &QueryDefinition,
        vars: &BTreeMap<String, String>,
    ) -> Result<usize> {
        match &query.batch_size {
            None => Ok(self.config.settings.batch_size),
            Some(raw) => {
                let resolved = variables::substitute(raw, vars);
                let size: usize = resolved.trim().parse().map_err(|_| {
                    MigrateError::Validation(format!(
                        "query '{}': batch_size '{}' is not a positive integer",
                        query.id, resolved
                    ))
                })?;
                if size == 0 {
                    return Err(MigrateError::Validation(format!(
                        "query '{}': batch_size must be greater than zero",
                        query.id
                    )));
                }
                Ok(size)
            }
        }
    }

    /// Preview a run against the source only. Nothing is written and the
    /// target is never contacted.
    pub async fn execute_dry_run(&mut self) -> Result<DryRunReport> {
        let result = self.dry_run_inner().await;
        for (id, e) in self.registry.disconnect_all().await {
            warn!(db_id = %id, "disconnect failed: {}", e);
        }
        result
    }

    async fn dry_run_inner(&mut self) -> Result<DryRunReport> {
        self.registry.connect("source").await?;
        let vars = self.collect_variables(true).await?;

        let mut previews = Vec::new();
        for query in self.enabled_queries() {
            let sql = variables::substitute(&query.source_query, &vars);
            let result = self.registry.fetch("source", &sql).await?;
            let source_columns = result
                .rows
                .first()
                .map(|row| {
                    row.column_names()
                        .into_iter()
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            previews.push(DryRunQuery {
                id: query.id.clone(),
                target_table: query.target_table.clone(),
                rows_available: result.rows.len() as u64,
                source_columns,
                would_delete_first: query.deletes_before_insert(&self.config.settings),
            });
        }

        Ok(DryRunReport {
            success: true,
            total_rows_available: previews.iter().map(|q| q.rows_available).sum(),
            variables: vars,
            queries: previews,
        })
    }

    /// Full static validation: structure plus variable reference checks.
    pub fn validate_configuration(&self) -> Result<()> {
        validate_config(&self.config)?;

        let mut known: HashSet<String> = self.config.variables.keys().cloned().collect();
        known.extend(
            self.config
                .dynamic_variables
                .iter()
                .filter(|v| v.enabled)
                .map(|v| v.variable_name.clone()),
        );

        for query in &self.config.queries {
            let mut texts = vec![query.source_query.clone()];
            if let Some(raw) = &query.batch_size {
                texts.push(raw.clone());
            }
            for script in [&query.pre_process, &query.post_process].into_iter().flatten() {
                texts.extend(script.statements.iter().cloned());
            }
            for text in &texts {
                for name in variables::referenced_names(text) {
                    if !known.contains(&name) {
                        return Err(MigrateError::Validation(format!(
                            "query '{}': unknown variable '${{{}}}'",
                            query.id, name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Declared databases with their roles.
    pub fn list_databases(&self) -> Vec<DatabaseInfo> {
        self.config
            .databases
            .iter()
            .map(|(id, db)| DatabaseInfo {
                id: id.clone(),
                backend: db.backend.clone(),
                host: db.host.clone(),
                database: db.database.clone(),
                writable: db.writable,
                role: if *id == self.config.settings.source && *id == self.config.settings.target {
                    Some("source+target")
                } else if *id == self.config.settings.source {
                    Some("source")
                } else if *id == self.config.settings.target {
                    Some("target")
                } else {
                    None
                },
                description: db.description.clone(),
            })
            .collect()
    }

    /// Check connectivity for one database id or role.
    pub async fn test_connection(&mut self, id: &str) -> Result<()> {
        self.registry.test_connection(id).await
    }

    /// Safe deletion order for a set of tables, from the foreign keys
    /// visible to the given database.
    pub async fn deletion_order(&mut self, id: &str, tables: &[String]) -> Result<DeletionOrder> {
        self.registry.connect(id).await?;
        let adapter = self.registry.adapter(id)?;
        fk::analyze(adapter.as_mut(), tables).await
    }

    /// Disable or re-enable foreign key checking on one database; the
    /// escape hatch when the deletion order reports a cycle.
    pub async fn set_constraints(&mut self, id: &str, enabled: bool) -> Result<()> {
        self.registry.connect(id).await?;
        let adapter = self.registry.adapter(id)?;
        fk::toggle_constraints(adapter.as_mut(), enabled).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{mock_descriptor, MockAdapter};
    use crate::adapters::BackendKind;
    use crate::progress::QueryStatus;
    use crate::value::{QueryResult, Row, SqlValue};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn test_config(yaml_queries: &str) -> Config {
        serde_yaml::from_str(&format!(
            r#"
databases:
  src:
    backend: mssql
    host: h
    database: d
    user: u
    password: p
  dst:
    backend: postgres
    host: h
    database: d
    user: u
    password: p
    writable: true
settings:
  source: src
  target: dst
  batch_size: 2
{}
"#,
            yaml_queries
        ))
        .unwrap()
    }

    fn simple_queries() -> &'static str {
        r#"
queries:
  - id: people
    source_query: SELECT * FROM people
    target_table: people
    target_columns: [id, name]
    key_columns: [id]
"#
    }

    fn person_rows(count: usize) -> Vec<Row> {
        (0..count)
            .map(|i| {
                let mut row = Row::new();
                row.push("id", SqlValue::I32(i as i32));
                row.push("name", SqlValue::Text(format!("p{}", i)));
                row
            })
            .collect()
    }

    struct Harness {
        migrator: Migrator,
        source_log: Arc<Mutex<Vec<String>>>,
        target_log: Arc<Mutex<Vec<String>>>,
        _dir: TempDir,
    }

    fn harness(config: Config, source: MockAdapter, target: MockAdapter) -> Harness {
        let dir = TempDir::new().unwrap();
        let source_log = source.statement_log();
        let target_log = target.statement_log();
        let mut registry = ConnectionRegistry::new();
        registry.insert_adapter("src", mock_descriptor(BackendKind::Mssql), Box::new(source));
        registry.insert_adapter("dst", mock_descriptor(BackendKind::Postgres), Box::new(target));
        registry.set_roles("src", "dst");
        let store = ProgressStore::new(dir.path());
        let migrator = Migrator::with_parts(config, "hash".to_string(), registry, store);
        Harness {
            migrator,
            source_log,
            target_log,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn migrates_rows_in_batches() {
        let config = test_config(simple_queries());
        let source = MockAdapter::new("src", BackendKind::Mssql);
        source.queue_result(QueryResult::with_rows(person_rows(5)));
        let target = MockAdapter::new("dst", BackendKind::Postgres);

        let mut h = harness(config, source, target);
        let report = h.migrator.execute_migration(None).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.success);
        assert!(report
            .progress_file
            .ends_with(&format!("{}.json", report.run_id)));
        assert_eq!(report.total_rows_inserted, 5);
        assert_eq!(report.queries.len(), 1);
        // batch_size 2 over 5 rows
        assert_eq!(report.queries[0].batches, 3);

        let run = h.migrator.progress_store().load(&report.run_id).unwrap();
        assert_eq!(run.queries["people"].rows_total, 5);
        assert_eq!(run.queries["people"].batches_total, 3);
        assert_eq!(run.total_rows_estimate, 5);

        let inserts: Vec<String> = h
            .target_log
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.starts_with("INSERT"))
            .cloned()
            .collect();
        assert_eq!(inserts.len(), 5);
        assert_eq!(inserts[0], "INSERT INTO people (id, name) VALUES ($1, $2)");
    }

    #[tokio::test]
    async fn empty_source_writes_nothing() {
        let config = test_config(simple_queries());
        let source = MockAdapter::new("src", BackendKind::Mssql);
        source.queue_result(QueryResult::new());
        let target = MockAdapter::new("dst", BackendKind::Postgres);

        let mut h = harness(config, source, target);
        let report = h.migrator.execute_migration(None).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.total_rows_inserted, 0);
        assert!(h.target_log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_before_insert_runs_deletes_first() {
        let config = test_config(
            r#"
queries:
  - id: people
    source_query: SELECT * FROM people
    target_table: people
    target_columns: [id, name]
    key_columns: [id]
    delete_before_insert: true
"#,
        );
        let source = MockAdapter::new("src", BackendKind::Mssql);
        source.queue_result(QueryResult::with_rows(person_rows(2)));
        let target = MockAdapter::new("dst", BackendKind::Postgres);

        let mut h = harness(config, source, target);
        h.migrator.execute_migration(None).await.unwrap();

        let log = h.target_log.lock().unwrap();
        assert!(log[0].starts_with("DELETE FROM people WHERE (id = 0) OR (id = 1)"));
        assert!(log[1].starts_with("INSERT"));
    }

    #[tokio::test]
    async fn dry_run_never_touches_target() {
        let config = test_config(simple_queries());
        let source = MockAdapter::new("src", BackendKind::Mssql);
        source.queue_result(QueryResult::with_rows(person_rows(3)));
        let target = MockAdapter::new("dst", BackendKind::Postgres);

        let mut h = harness(config, source, target);
        let report = h.migrator.execute_dry_run().await.unwrap();

        assert!(report.success);
        assert_eq!(report.total_rows_available, 3);
        assert_eq!(report.queries[0].rows_available, 3);
        assert_eq!(report.queries[0].source_columns, vec!["id", "name"]);
        assert!(h.target_log.lock().unwrap().is_empty());
        assert!(!h.migrator.registry.is_connected("dst"));
    }

    #[tokio::test]
    async fn resume_skips_completed_queries() {
        let config = test_config(
            r#"
queries:
  - id: first
    source_query: SELECT * FROM a
    target_table: a
    target_columns: [id, name]
  - id: second
    source_query: SELECT * FROM b
    target_table: b
    target_columns: [id, name]
"#,
        );
        let source = MockAdapter::new("src", BackendKind::Mssql);
        // Only the second query should hit the source on resume.
        source.queue_result(QueryResult::with_rows(person_rows(2)));
        let target = MockAdapter::new("dst", BackendKind::Postgres);

        let mut h = harness(config, source, target);

        // Seed an interrupted run: first completed, second failed.
        let store = ProgressStore::new(h._dir.path());
        let mut run = store
            .create_run("hash", &["first".to_string(), "second".to_string()])
            .unwrap();
        store.update_phase(&mut run, RunPhase::Migrating).unwrap();
        store.start_query(&mut run, "first").unwrap();
        store.complete_query(&mut run, "first", 4, 0).unwrap();
        store.fail_query(&mut run, "second", "interrupted").unwrap();
        store.fail_run(&mut run, "interrupted").unwrap();

        let report = h.migrator.execute_migration(Some(&run.id)).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.queries[0].skipped);
        assert!(!report.queries[1].skipped);
        assert_eq!(report.queries[1].rows_inserted, 2);

        let source_queries = h.source_log.lock().unwrap();
        assert_eq!(source_queries.len(), 1);
        assert!(source_queries[0].contains("FROM b"));
    }

    #[tokio::test]
    async fn resume_refuses_config_drift() {
        let config = test_config(simple_queries());
        let source = MockAdapter::new("src", BackendKind::Mssql);
        let target = MockAdapter::new("dst", BackendKind::Postgres);
        let mut h = harness(config, source, target);

        let store = ProgressStore::new(h._dir.path());
        let mut run = store.create_run("other-hash", &["people".to_string()]).unwrap();
        store.update_phase(&mut run, RunPhase::Migrating).unwrap();

        let err = h
            .migrator
            .execute_migration(Some(&run.id))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Resume(_)));
    }

    #[tokio::test]
    async fn best_effort_continues_past_a_failed_query() {
        let config = test_config(
            r#"
queries:
  - id: first
    source_query: SELECT * FROM a
    target_table: a
    target_columns: [id, name]
  - id: second
    source_query: SELECT * FROM b
    target_table: b
    target_columns: [id, name]
"#,
        );
        let source = MockAdapter::new("src", BackendKind::Mssql);
        source.queue_result(QueryResult::with_rows(person_rows(1)));
        source.queue_result(QueryResult::with_rows(person_rows(1)));
        let mut target = MockAdapter::new("dst", BackendKind::Postgres);
        target.fail_execute = true;

        let mut h = harness(config, source, target);
        let report = h.migrator.execute_migration(None).await.unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_queries, 2);
        // Both queries were attempted against the source.
        assert_eq!(h.source_log.lock().unwrap().len(), 2);

        let run = h
            .migrator
            .progress_store()
            .load(&report.run_id)
            .unwrap();
        assert_eq!(run.queries["first"].status, QueryStatus::Failed);
        assert_eq!(run.queries["second"].status, QueryStatus::Failed);
    }

    #[tokio::test]
    async fn transactional_run_fails_fast_and_rolls_back() {
        let mut config = test_config(
            r#"
queries:
  - id: first
    source_query: SELECT * FROM a
    target_table: a
    target_columns: [id, name]
  - id: second
    source_query: SELECT * FROM b
    target_table: b
    target_columns: [id, name]
"#,
        );
        config.settings.use_transaction = true;
        let source = MockAdapter::new("src", BackendKind::Mssql);
        source.queue_result(QueryResult::with_rows(person_rows(1)));
        let mut target = MockAdapter::new("dst", BackendKind::Postgres);
        target.fail_execute = true;

        let mut h = harness(config, source, target);
        let err = h.migrator.execute_migration(None).await.unwrap_err();
        assert!(matches!(err, MigrateError::Query { .. }));

        let log = h.target_log.lock().unwrap();
        assert_eq!(log.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(log.last().map(String::as_str), Some("ROLLBACK"));
        assert!(!log.iter().any(|s| s == "COMMIT"));
        // Fail fast: the second query never reached the source.
        assert_eq!(h.source_log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn post_process_failure_is_not_fatal() {
        let config = test_config(
            r#"
queries:
  - id: people
    source_query: SELECT * FROM people
    target_table: people
    target_columns: [id, name]
    post_process:
      database: src
      statements:
        - UPDATE audit SET done = 1
"#,
        );
        let mut source = MockAdapter::new("src", BackendKind::Mssql);
        source.fail_execute = true;
        source.queue_result(QueryResult::with_rows(person_rows(1)));
        let target = MockAdapter::new("dst", BackendKind::Postgres);

        let mut h = harness(config, source, target);
        let report = h.migrator.execute_migration(None).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.total_rows_inserted, 1);
    }

    #[tokio::test]
    async fn pre_process_failure_fails_the_query() {
        let config = test_config(
            r#"
queries:
  - id: people
    source_query: SELECT * FROM people
    target_table: people
    target_columns: [id, name]
    pre_process:
      database: target
      statements:
        - TRUNCATE staging
"#,
        );
        let source = MockAdapter::new("src", BackendKind::Mssql);
        let mut target = MockAdapter::new("dst", BackendKind::Postgres);
        target.fail_execute = true;

        let mut h = harness(config, source, target);
        let report = h.migrator.execute_migration(None).await.unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_queries, 1);
        // Source never queried: the pre-process gate failed first.
        assert!(h.source_log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dynamic_variables_flow_into_queries() {
        let config = test_config(
            r#"
variables:
  region: emea
dynamic_variables:
  - variable_name: max_id
    query: SELECT MAX(id) FROM people
queries:
  - id: people
    source_query: SELECT * FROM people WHERE id <= ${max_id} AND region = '${region}'
    target_table: people
    target_columns: [id, name]
"#,
        );
        let source = MockAdapter::new("src", BackendKind::Mssql);
        let mut max_row = Row::new();
        max_row.push("max_id", SqlValue::I64(7));
        source.queue_result(QueryResult::with_rows(vec![max_row]));
        source.queue_result(QueryResult::with_rows(person_rows(1)));
        let target = MockAdapter::new("dst", BackendKind::Postgres);

        let mut h = harness(config, source, target);
        h.migrator.execute_migration(None).await.unwrap();

        let log = h.source_log.lock().unwrap();
        assert_eq!(log[0], "SELECT MAX(id) FROM people");
        assert_eq!(
            log[1],
            "SELECT * FROM people WHERE id <= 7 AND region = 'emea'"
        );
    }

    #[tokio::test]
    async fn connect_failure_fails_the_run() {
        let config = test_config(simple_queries());
        let mut source = MockAdapter::new("src", BackendKind::Mssql);
        source.fail_connect = true;
        let target = MockAdapter::new("dst", BackendKind::Postgres);

        let mut h = harness(config, source, target);
        let err = h.migrator.execute_migration(None).await.unwrap_err();
        assert!(matches!(err, MigrateError::Connection { .. }));

        let runs = h.migrator.progress_store().list_runs().unwrap();
        let run = h.migrator.progress_store().load(&runs[0]).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[test]
    fn validate_flags_unknown_variables() {
        let config = test_config(
            r#"
queries:
  - id: people
    source_query: SELECT * FROM people WHERE region = '${region}'
    target_table: people
"#,
        );
        let dir = TempDir::new().unwrap();
        let migrator = Migrator::with_parts(
            config,
            "hash".to_string(),
            ConnectionRegistry::new(),
            ProgressStore::new(dir.path()),
        );
        let err = migrator.validate_configuration().unwrap_err();
        assert!(err.to_string().contains("${region}"));
    }

    #[test]
    fn list_databases_reports_roles() {
        let config = test_config(simple_queries());
        let dir = TempDir::new().unwrap();
        let migrator = Migrator::with_parts(
            config,
            "hash".to_string(),
            ConnectionRegistry::new(),
            ProgressStore::new(dir.path()),
        );
        let infos = migrator.list_databases();
        assert_eq!(infos.len(), 2);
        let src = infos.iter().find(|i| i.id == "src").unwrap();
        assert_eq!(src.role, Some("source"));
        let dst = infos.iter().find(|i| i.id == "dst").unwrap();
        assert_eq!(dst.role, Some("target"));
        assert!(dst.writable);
    }

    #[tokio::test]
    async fn rolled_back_queries_are_rerun_on_resume() {
        let mut config = test_config(
            r#"
queries:
  - id: first
    source_query: SELECT * FROM a
    target_table: a
    target_columns: [id, name]
  - id: second
    source_query: SELECT * FROM b
    target_table: b
    target_columns: [id, name]
    batch_size: oops
"#,
        );
        config.settings.use_transaction = true;
        let source = MockAdapter::new("src", BackendKind::Mssql);
        // Two results per attempt: one fetch for each query.
        for _ in 0..2 {
            source.queue_result(QueryResult::with_rows(person_rows(1)));
            source.queue_result(QueryResult::with_rows(person_rows(1)));
        }
        let target = MockAdapter::new("dst", BackendKind::Postgres);

        let mut h = harness(config, source, target);
        let err = h.migrator.execute_migration(None).await.unwrap_err();
        assert!(matches!(err, MigrateError::Validation(_)));

        // The first query's insert was rolled back with everything else,
        // so its checkpoint must not claim completion.
        let runs = h.migrator.progress_store().list_runs().unwrap();
        let run = h.migrator.progress_store().load(&runs[0]).unwrap();
        assert_ne!(run.queries["first"].status, QueryStatus::Completed);
        assert!(run.can_resume());

        // Resume re-reads and re-inserts the first query instead of
        // skipping rows that never landed.
        let _ = h.migrator.execute_migration(Some(&runs[0])).await;
        let reads = h
            .source_log
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.contains("FROM a"))
            .count();
        assert_eq!(reads, 2);
        let inserts = h
            .target_log
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.starts_with("INSERT INTO a"))
            .count();
        assert_eq!(inserts, 2);
    }

    #[tokio::test]
    async fn transactional_completions_persist_after_commit() {
        let mut config = test_config(simple_queries());
        config.settings.use_transaction = true;
        let source = MockAdapter::new("src", BackendKind::Mssql);
        source.queue_result(QueryResult::with_rows(person_rows(2)));
        let target = MockAdapter::new("dst", BackendKind::Postgres);

        let mut h = harness(config, source, target);
        let report = h.migrator.execute_migration(None).await.unwrap();
        assert!(report.success);

        let run = h.migrator.progress_store().load(&report.run_id).unwrap();
        assert_eq!(run.queries["people"].status, QueryStatus::Completed);
        assert_eq!(run.queries["people"].rows_read, 2);
    }

    #[tokio::test]
    async fn dynamic_variable_on_a_third_database_gets_connected() {
        let config: Config = serde_yaml::from_str(
            r#"
databases:
  src:
    backend: mssql
    host: h
    database: d
    user: u
    password: p
  dst:
    backend: postgres
    host: h
    database: d
    user: u
    password: p
    writable: true
  audit:
    backend: mysql
    host: h
    database: d
    user: u
    password: p
settings:
  source: src
  target: dst
  batch_size: 2
dynamic_variables:
  - variable_name: max_id
    database: audit
    query: SELECT MAX(id) FROM events
queries:
  - id: people
    source_query: SELECT * FROM people WHERE id <= ${max_id}
    target_table: people
    target_columns: [id, name]
"#,
        )
        .unwrap();

        let dir = TempDir::new().unwrap();
        let source = MockAdapter::new("src", BackendKind::Mssql);
        source.queue_result(QueryResult::with_rows(person_rows(1)));
        let source_log = source.statement_log();
        let target = MockAdapter::new("dst", BackendKind::Postgres);
        let audit = MockAdapter::new("audit", BackendKind::Mysql);
        let mut max_row = Row::new();
        max_row.push("max_id", SqlValue::I64(9));
        audit.queue_result(QueryResult::with_rows(vec![max_row]));
        let audit_log = audit.statement_log();

        let mut registry = ConnectionRegistry::new();
        registry.insert_adapter("src", mock_descriptor(BackendKind::Mssql), Box::new(source));
        registry.insert_adapter("dst", mock_descriptor(BackendKind::Postgres), Box::new(target));
        registry.insert_adapter("audit", mock_descriptor(BackendKind::Mysql), Box::new(audit));
        registry.set_roles("src", "dst");
        let store = ProgressStore::new(dir.path());
        let mut migrator = Migrator::with_parts(config, "hash".to_string(), registry, store);

        let report = migrator.execute_migration(None).await.unwrap();
        assert!(report.success);
        assert_eq!(
            audit_log.lock().unwrap().as_slice(),
            ["SELECT MAX(id) FROM events"]
        );
        assert_eq!(
            source_log.lock().unwrap().as_slice(),
            ["SELECT * FROM people WHERE id <= 9"]
        );
    }

    #[tokio::test]
    async fn script_databases_are_connected_for_the_run() {
        let config = test_config(
            r#"
queries:
  - id: people
    source_query: SELECT * FROM people
    target_table: people
    target_columns: [id, name]
    post_process:
      database: src
      statements:
        - UPDATE audit SET done = 1
"#,
        );
        let source = MockAdapter::new("src", BackendKind::Mssql);
        source.queue_result(QueryResult::with_rows(person_rows(1)));
        let target = MockAdapter::new("dst", BackendKind::Postgres);

        let mut h = harness(config, source, target);
        let report = h.migrator.execute_migration(None).await.unwrap();
        assert!(report.success);
        assert!(h
            .source_log
            .lock()
            .unwrap()
            .iter()
            .any(|s| s == "UPDATE audit SET done = 1"));
    }

    #[tokio::test]
    async fn transactional_run_requires_transaction_support() {
        let mut config = test_config(simple_queries());
        config.settings.use_transaction = true;
        let source = MockAdapter::new("src", BackendKind::Mssql);
        let mut target = MockAdapter::new("dst", BackendKind::Postgres);
        target.transactions = false;

        let mut h = harness(config, source, target);
        let err = h.migrator.execute_migration(None).await.unwrap_err();
        assert!(matches!(err, MigrateError::Validation(_)));
        assert!(err.to_string().contains("transactions"));
        assert!(h.target_log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn begin_failure_is_a_transaction_error() {
        let mut config = test_config(simple_queries());
        config.settings.use_transaction = true;
        let source = MockAdapter::new("src", BackendKind::Mssql);
        let mut target = MockAdapter::new("dst", BackendKind::Postgres);
        target.fail_begin = true;

        let mut h = harness(config, source, target);
        let err = h.migrator.execute_migration(None).await.unwrap_err();
        assert!(matches!(err, MigrateError::Transaction { .. }));
    }

    #[tokio::test]
    async fn set_constraints_reaches_the_named_database() {
        let config = test_config(simple_queries());
        let source = MockAdapter::new("src", BackendKind::Mssql);
        let target = MockAdapter::new("dst", BackendKind::Postgres);

        let mut h = harness(config, source, target);
        h.migrator.set_constraints("dst", false).await.unwrap();
        h.migrator.set_constraints("dst", true).await.unwrap();

        let log = h.target_log.lock().unwrap();
        assert_eq!(log.as_slice(), ["CONSTRAINTS OFF", "CONSTRAINTS ON"]);
        assert!(h.source_log.lock().unwrap().is_empty());
    }
}
