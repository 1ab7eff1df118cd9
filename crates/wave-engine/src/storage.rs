//! SQLite state store.
//!
//! Persists pipeline runs, per-step states, the append-only event log, and
//! artifact descriptors. Step rows are written with UPSERT keyed on
//! `(run_id, step_id)` so concurrent runs with distinct run ids can never
//! collide. Migrations are embedded and versioned.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;
use wave_core::{
    ArtifactRecord, ArtifactType, Id, ProgressEvent, Run, RunStatus, StepEventKind, StepState,
    StepStatus, TokenUsage,
};

/// Embedded migrations applied in order. Each entry is recorded in
/// `schema_migrations` after it runs.
const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("../migrations/0001_init.sql"))];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("step not found: {run_id}/{step_id}")]
    StepNotFound { run_id: String, step_id: String },
    #[error("unknown status value in store: {0}")]
    UnknownStatus(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend over a single SQLite file (`.wave/state.db`).
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Open (creating if needed) the database at the given path.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // WAL keeps readers unblocked while the single writer commits.
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    /// Apply embedded migrations that have not run yet.
    pub async fn migrate(&self) -> Result<()> {
        // The migrations table itself is created by the first migration, so
        // probe for it instead of assuming it exists.
        let applied = self.applied_versions().await.unwrap_or_default();

        for (version, sql) in MIGRATIONS {
            if applied.contains(version) {
                continue;
            }

            let cleaned: String = sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match sqlx::query(trimmed).execute(&self.pool).await {
                    Ok(_) => {}
                    Err(e) => {
                        let msg = e.to_string();
                        // Idempotent re-application is fine.
                        if !msg.contains("duplicate column") && !msg.contains("already exists") {
                            return Err(e.into());
                        }
                    }
                }
            }

            sqlx::query(
                "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            )
            .bind(version)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Versions recorded in `schema_migrations`.
    pub async fn applied_versions(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT version FROM schema_migrations ORDER BY version")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Latest embedded migration version.
    pub fn latest_version() -> i64 {
        MIGRATIONS.last().map_or(0, |(v, _)| *v)
    }

    // --- Run operations ---

    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (id, pipeline, input, status, started_at, completed_at,
                                       total_tokens, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&run.id)
        .bind(&run.pipeline)
        .bind(&run.input)
        .bind(run.status.as_str())
        .bind(run.started_at.timestamp_millis())
        .bind(run.completed_at.map(|t| t.timestamp_millis()))
        .bind(run.total_tokens as i64)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_run(&self, id: &str) -> Result<Run> {
        let row = sqlx::query_as::<_, RunRow>("SELECT * FROM pipeline_runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::RunNotFound(id.to_string()))?;
        row.into_run()
    }

    pub async fn list_runs(&self, pipeline: Option<&str>) -> Result<Vec<Run>> {
        let rows = match pipeline {
            Some(name) => {
                sqlx::query_as::<_, RunRow>(
                    "SELECT * FROM pipeline_runs WHERE pipeline = ?1 ORDER BY started_at DESC",
                )
                .bind(name)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, RunRow>("SELECT * FROM pipeline_runs ORDER BY started_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(RunRow::into_run).collect()
    }

    pub async fn update_run_status(&self, id: &str, status: RunStatus) -> Result<()> {
        let result = sqlx::query("UPDATE pipeline_runs SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Seal a run: terminal status, completion time, token total, and an
    /// optional error summary.
    pub async fn seal_run(
        &self,
        id: &str,
        status: RunStatus,
        total_tokens: u64,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE pipeline_runs SET status = ?1, completed_at = ?2, total_tokens = ?3, \
             error = ?4 WHERE id = ?5",
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(total_tokens as i64)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::RunNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete a run and all dependent rows.
    pub async fn delete_run(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM artifacts WHERE run_id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM event_log WHERE run_id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM step_states WHERE run_id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM pipeline_runs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Step state operations ---

    /// Insert or update the state row for `(run_id, step_id)`.
    pub async fn upsert_step_state(&self, state: &StepState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO step_states (run_id, step_id, status, started_at, completed_at,
                                     retry_count, error, tokens_input, tokens_output,
                                     tokens_cache_read, tokens_cache_creation, workspace_path)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT (run_id, step_id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                retry_count = excluded.retry_count,
                error = excluded.error,
                tokens_input = excluded.tokens_input,
                tokens_output = excluded.tokens_output,
                tokens_cache_read = excluded.tokens_cache_read,
                tokens_cache_creation = excluded.tokens_cache_creation,
                workspace_path = excluded.workspace_path
            "#,
        )
        .bind(&state.run_id)
        .bind(&state.step_id)
        .bind(state.status.as_str())
        .bind(state.started_at.map(|t| t.timestamp_millis()))
        .bind(state.completed_at.map(|t| t.timestamp_millis()))
        .bind(state.retry_count as i64)
        .bind(&state.error)
        .bind(state.tokens.input as i64)
        .bind(state.tokens.output as i64)
        .bind(state.tokens.cache_read as i64)
        .bind(state.tokens.cache_creation as i64)
        .bind(&state.workspace_path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_step_state(&self, run_id: &str, step_id: &str) -> Result<StepState> {
        let row = sqlx::query_as::<_, StepStateRow>(
            "SELECT * FROM step_states WHERE run_id = ?1 AND step_id = ?2",
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::StepNotFound {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
        })?;

        row.into_state()
    }

    pub async fn list_step_states(&self, run_id: &str) -> Result<Vec<StepState>> {
        let rows = sqlx::query_as::<_, StepStateRow>(
            "SELECT * FROM step_states WHERE run_id = ?1 ORDER BY started_at ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepStateRow::into_state).collect()
    }

    // --- Event operations ---

    /// Append a progress event to the log. Append-only; events are never
    /// updated or deleted while the run exists.
    pub async fn append_event(&self, event: &ProgressEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO event_log (id, run_id, step_id, kind, persona, adapter, model, message,
                                   tool_name, tool_target, tokens_delta, estimated_time_ms, ts)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(Id::new().as_ref())
        .bind(&event.run_id)
        .bind(&event.step_id)
        .bind(event.kind.as_str())
        .bind(&event.persona)
        .bind(&event.adapter)
        .bind(&event.model)
        .bind(&event.message)
        .bind(&event.tool_name)
        .bind(&event.tool_target)
        .bind(event.tokens_delta.map(|d| d as i64))
        .bind(event.estimated_time_ms as i64)
        .bind(event.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_events(&self, run_id: &str) -> Result<Vec<ProgressEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM event_log WHERE run_id = ?1 ORDER BY ts ASC, id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    pub async fn list_events_for_step(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Vec<ProgressEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM event_log WHERE run_id = ?1 AND step_id = ?2 ORDER BY ts ASC, id ASC",
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    // --- Artifact operations ---

    /// Record an artifact. Re-materialization after a retry replaces the
    /// previous row for the same `(run_id, step_id, name)`.
    pub async fn upsert_artifact(&self, artifact: &ArtifactRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO artifacts (id, run_id, step_id, name, path, artifact_type, required,
                                   checksum)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (run_id, step_id, name) DO UPDATE SET
                path = excluded.path,
                artifact_type = excluded.artifact_type,
                required = excluded.required,
                checksum = excluded.checksum
            "#,
        )
        .bind(artifact.id.as_ref())
        .bind(&artifact.run_id)
        .bind(&artifact.step_id)
        .bind(&artifact.name)
        .bind(&artifact.path)
        .bind(artifact.artifact_type.as_str())
        .bind(artifact.required)
        .bind(&artifact.checksum)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_artifacts(&self, run_id: &str) -> Result<Vec<ArtifactRecord>> {
        let rows = sqlx::query_as::<_, ArtifactRow>(
            "SELECT * FROM artifacts WHERE run_id = ?1 ORDER BY step_id, name",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ArtifactRow::into_record).collect()
    }

    pub async fn list_artifacts_for_step(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Vec<ArtifactRecord>> {
        let rows = sqlx::query_as::<_, ArtifactRow>(
            "SELECT * FROM artifacts WHERE run_id = ?1 AND step_id = ?2 ORDER BY name",
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ArtifactRow::into_record).collect()
    }
}

fn parse_run_status(s: &str) -> Result<RunStatus> {
    match s {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        other => Err(StorageError::UnknownStatus(other.to_string())),
    }
}

fn parse_step_status(s: &str) -> Result<StepStatus> {
    match s {
        "not_started" => Ok(StepStatus::NotStarted),
        "running" => Ok(StepStatus::Running),
        "retrying" => Ok(StepStatus::Retrying),
        "completed" => Ok(StepStatus::Completed),
        "failed" => Ok(StepStatus::Failed),
        "failed_optional" => Ok(StepStatus::FailedOptional),
        "skipped" => Ok(StepStatus::Skipped),
        other => Err(StorageError::UnknownStatus(other.to_string())),
    }
}

fn parse_event_kind(s: &str) -> Result<StepEventKind> {
    match s {
        "running" => Ok(StepEventKind::Running),
        "stream_activity" => Ok(StepEventKind::StreamActivity),
        "retrying" => Ok(StepEventKind::Retrying),
        "completed" => Ok(StepEventKind::Completed),
        "failed" => Ok(StepEventKind::Failed),
        "failed_optional" => Ok(StepEventKind::FailedOptional),
        "skipped" => Ok(StepEventKind::Skipped),
        other => Err(StorageError::UnknownStatus(other.to_string())),
    }
}

fn parse_artifact_type(s: &str) -> ArtifactType {
    match s {
        "json" => ArtifactType::Json,
        "markdown" => ArtifactType::Markdown,
        "code" => ArtifactType::Code,
        "binary" => ArtifactType::Binary,
        _ => ArtifactType::Text,
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    pipeline: String,
    input: String,
    status: String,
    started_at: i64,
    completed_at: Option<i64>,
    total_tokens: i64,
    error: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            pipeline: self.pipeline,
            input: self.input,
            status: parse_run_status(&self.status)?,
            started_at: DateTime::from_timestamp_millis(self.started_at).unwrap_or_default(),
            completed_at: self.completed_at.and_then(DateTime::from_timestamp_millis),
            total_tokens: self.total_tokens as u64,
            error: self.error,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepStateRow {
    run_id: String,
    step_id: String,
    status: String,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    retry_count: i64,
    error: Option<String>,
    tokens_input: i64,
    tokens_output: i64,
    tokens_cache_read: i64,
    tokens_cache_creation: i64,
    workspace_path: Option<String>,
}

impl StepStateRow {
    fn into_state(self) -> Result<StepState> {
        Ok(StepState {
            run_id: self.run_id,
            step_id: self.step_id,
            status: parse_step_status(&self.status)?,
            started_at: self.started_at.and_then(DateTime::from_timestamp_millis),
            completed_at: self.completed_at.and_then(DateTime::from_timestamp_millis),
            retry_count: self.retry_count as u32,
            error: self.error,
            tokens: TokenUsage {
                input: self.tokens_input as u64,
                output: self.tokens_output as u64,
                cache_read: self.tokens_cache_read as u64,
                cache_creation: self.tokens_cache_creation as u64,
            },
            workspace_path: self.workspace_path,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    #[allow(dead_code)]
    id: String,
    run_id: String,
    step_id: String,
    kind: String,
    persona: String,
    adapter: String,
    model: Option<String>,
    message: Option<String>,
    tool_name: Option<String>,
    tool_target: Option<String>,
    tokens_delta: Option<i64>,
    estimated_time_ms: i64,
    ts: i64,
}

impl EventRow {
    fn into_event(self) -> Result<ProgressEvent> {
        Ok(ProgressEvent {
            run_id: self.run_id,
            step_id: self.step_id,
            kind: parse_event_kind(&self.kind)?,
            persona: self.persona,
            adapter: self.adapter,
            model: self.model,
            message: self.message,
            tool_name: self.tool_name,
            tool_target: self.tool_target,
            tokens_delta: self.tokens_delta.map(|d| d as u64),
            estimated_time_ms: self.estimated_time_ms as u64,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: String,
    run_id: String,
    step_id: String,
    name: String,
    path: String,
    artifact_type: String,
    required: bool,
    checksum: Option<String>,
}

impl ArtifactRow {
    fn into_record(self) -> Result<ArtifactRecord> {
        Ok(ArtifactRecord {
            id: Id::from_string(self.id),
            run_id: self.run_id,
            step_id: self.step_id,
            name: self.name,
            path: self.path,
            artifact_type: parse_artifact_type(&self.artifact_type),
            required: self.required,
            checksum: self.checksum,
        })
    }
}
