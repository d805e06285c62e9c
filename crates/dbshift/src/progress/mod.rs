//! Durable run progress: checkpoint files that make interrupted migrations
//! resumable.

use crate::error::{MigrateError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Lifecycle phase of a run. Phases only move forward; a stale caller
/// cannot drag a run backwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunPhase {
    Connecting,
    ExtractingVariables,
    Migrating,
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// Status of one query within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Progress of one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryProgress {
    pub status: QueryStatus,
    pub rows_read: u64,
    pub rows_deleted: u64,
    pub rows_inserted: u64,
    pub batches_done: u64,
    /// Planned row count, known once the source rows are fetched.
    #[serde(default)]
    pub rows_total: u64,
    /// Planned batch count at the effective batch size.
    #[serde(default)]
    pub batches_total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueryProgress {
    fn pending() -> Self {
        Self {
            status: QueryStatus::Pending,
            rows_read: 0,
            rows_deleted: 0,
            rows_inserted: 0,
            batches_done: 0,
            rows_total: 0,
            batches_total: 0,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Durable state of one migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRun {
    pub id: String,
    /// SHA-256 of the config file at run start. Resume refuses to continue
    /// under a different config.
    pub config_hash: String,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Sum of the per-query planned row counts known so far.
    #[serde(default)]
    pub total_rows_estimate: u64,
    pub queries: BTreeMap<String, QueryProgress>,
}

impl MigrationRun {
    /// Whether this run can be picked up again: it failed, or it was
    /// interrupted mid-flight. Completed runs have nothing left to do and a
    /// run still connecting or extracting variables restarts from scratch
    /// instead.
    pub fn can_resume(&self) -> bool {
        match self.status {
            RunStatus::Failed => true,
            RunStatus::Running => self.phase == RunPhase::Migrating,
            RunStatus::Completed => false,
        }
    }

    /// Completed vs remaining query counts, for resume summaries.
    pub fn resume_info(&self) -> (usize, usize) {
        let completed = self
            .queries
            .values()
            .filter(|q| q.status == QueryStatus::Completed)
            .count();
        (completed, self.queries.len() - completed)
    }

    /// Query ids already completed, in map order.
    pub fn completed_queries(&self) -> Vec<&str> {
        self.queries
            .iter()
            .filter(|(_, q)| q.status == QueryStatus::Completed)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Reset failed and in-progress queries to pending, preserving
    /// completed ones, and mark the run running again.
    pub fn prepare_for_resume(&mut self) {
        for progress in self.queries.values_mut() {
            if matches!(
                progress.status,
                QueryStatus::Failed | QueryStatus::InProgress
            ) {
                *progress = QueryProgress::pending();
            }
        }
        self.status = RunStatus::Running;
        self.error = None;
        self.finished_at = None;
    }
}

/// Filesystem-backed store for [`MigrationRun`] checkpoints, one JSON file
/// per run. Writes go through a temp file and rename so an interrupted
/// write never corrupts an existing checkpoint.
pub struct ProgressStore {
    dir: PathBuf,
}

impl ProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Checkpoint file path for a run id.
    pub fn run_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    /// Create and persist a new run covering the given query ids.
    pub fn create_run(&self, config_hash: &str, query_ids: &[String]) -> Result<MigrationRun> {
        let now = Utc::now();
        let run = MigrationRun {
            id: format!("run-{}", now.format("%Y%m%d-%H%M%S-%3f")),
            config_hash: config_hash.to_string(),
            status: RunStatus::Running,
            phase: RunPhase::Connecting,
            started_at: now,
            updated_at: now,
            finished_at: None,
            error: None,
            total_rows_estimate: 0,
            queries: query_ids
                .iter()
                .map(|id| (id.clone(), QueryProgress::pending()))
                .collect(),
        };
        self.save(&run)?;
        info!(run_id = %run.id, "created migration run");
        Ok(run)
    }

    /// Persist a run atomically.
    pub fn save(&self, run: &MigrationRun) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.run_path(&run.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(run)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        debug!(run_id = %run.id, "checkpoint saved");
        Ok(())
    }

    /// Load a run by id.
    pub fn load(&self, run_id: &str) -> Result<MigrationRun> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Err(MigrateError::Resume(format!(
                "no progress file for run '{}' in {}",
                run_id,
                self.dir.display()
            )));
        }
        let raw = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Ids of all stored runs, newest first. The time-derived id format
    /// makes reverse lexicographic order chronological.
    pub fn list_runs(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".json") {
                if id.starts_with("run-") {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        ids.reverse();
        Ok(ids)
    }

    /// Load a run and check it can resume under the current config.
    pub fn load_for_resume(&self, run_id: &str, config_hash: &str) -> Result<MigrationRun> {
        let run = self.load(run_id)?;
        if !run.can_resume() {
            return Err(MigrateError::Resume(format!(
                "run '{}' is {:?} and cannot be resumed",
                run_id, run.status
            )));
        }
        if run.config_hash != config_hash {
            return Err(MigrateError::Resume(format!(
                "run '{}' was started with a different config; refusing to resume",
                run_id
            )));
        }
        Ok(run)
    }

    /// Advance the run phase. Regressions are ignored so the phase stays
    /// monotonic.
    pub fn update_phase(&self, run: &mut MigrationRun, phase: RunPhase) -> Result<()> {
        if phase > run.phase {
            run.phase = phase;
            self.touch(run)?;
        }
        Ok(())
    }

    /// Mark a query started.
    pub fn start_query(&self, run: &mut MigrationRun, query_id: &str) -> Result<()> {
        let progress = self.query_mut(run, query_id)?;
        progress.status = QueryStatus::InProgress;
        progress.started_at = Some(Utc::now());
        self.touch(run)
    }

    /// Record the planned row and batch counts for a query, once its
    /// source rows are known.
    pub fn plan_query(
        &self,
        run: &mut MigrationRun,
        query_id: &str,
        rows_total: u64,
        batches_total: u64,
    ) -> Result<()> {
        let progress = self.query_mut(run, query_id)?;
        progress.rows_total = rows_total;
        progress.batches_total = batches_total;
        run.total_rows_estimate = run.queries.values().map(|q| q.rows_total).sum();
        self.touch(run)
    }

    /// Record one completed batch.
    pub fn update_batch_progress(
        &self,
        run: &mut MigrationRun,
        query_id: &str,
        rows_inserted: u64,
    ) -> Result<()> {
        let progress = self.query_mut(run, query_id)?;
        progress.batches_done += 1;
        progress.rows_inserted += rows_inserted;
        self.touch(run)
    }

    /// Mark a query completed with final counters.
    pub fn complete_query(
        &self,
        run: &mut MigrationRun,
        query_id: &str,
        rows_read: u64,
        rows_deleted: u64,
    ) -> Result<()> {
        let progress = self.query_mut(run, query_id)?;
        progress.status = QueryStatus::Completed;
        progress.rows_read = rows_read;
        progress.rows_deleted = rows_deleted;
        progress.finished_at = Some(Utc::now());
        self.touch(run)
    }

    /// Mark a query failed.
    pub fn fail_query(
        &self,
        run: &mut MigrationRun,
        query_id: &str,
        error: &str,
    ) -> Result<()> {
        let progress = self.query_mut(run, query_id)?;
        progress.status = QueryStatus::Failed;
        progress.error = Some(error.to_string());
        progress.finished_at = Some(Utc::now());
        self.touch(run)
    }

    /// Mark the whole run completed.
    pub fn complete_run(&self, run: &mut MigrationRun) -> Result<()> {
        run.status = RunStatus::Completed;
        run.finished_at = Some(Utc::now());
        self.touch(run)
    }

    /// Mark the whole run failed.
    pub fn fail_run(&self, run: &mut MigrationRun, error: &str) -> Result<()> {
        run.status = RunStatus::Failed;
        run.error = Some(error.to_string());
        run.finished_at = Some(Utc::now());
        self.touch(run)
    }

    fn query_mut<'a>(
        &self,
        run: &'a mut MigrationRun,
        query_id: &str,
    ) -> Result<&'a mut QueryProgress> {
        run.queries.get_mut(query_id).ok_or_else(|| {
            MigrateError::Resume(format!(
                "query '{}' is not part of run '{}'",
                query_id, run.id
            ))
        })
    }

    fn touch(&self, run: &mut MigrationRun) -> Result<()> {
        run.updated_at = Utc::now();
        self.save(run)
    }
}
