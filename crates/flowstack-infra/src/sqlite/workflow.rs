//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `flowstack-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs alongside indexed
//! columns; the aggregate columns (`run_count`, `last_run`, ...) are
//! authoritative and overlaid onto the blob on read, so `finish_run` never
//! has to rewrite the definition.
//!
//! `finish_run` performs the run's terminal update and the parent workflow's
//! aggregate update inside one transaction on the single-writer pool -- a
//! dashboard can never observe a half-updated pair.

use flowstack_core::repository::workflow::WorkflowStore;
use flowstack_types::error::RepositoryError;
use flowstack_types::workflow::{RunStatus, TriggerConfig, WorkflowDefinition, WorkflowRun};
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStore`.
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    definition: String,
    run_count: i64,
    last_run: Option<String>,
    last_run_status: Option<String>,
    last_run_error: Option<String>,
}

impl WorkflowRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
            run_count: row.try_get("run_count")?,
            last_run: row.try_get("last_run")?,
            last_run_status: row.try_get("last_run_status")?,
            last_run_error: row.try_get("last_run_error")?,
        })
    }

    /// Deserialize the blob and overlay the authoritative aggregate columns.
    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        let mut def: WorkflowDefinition = serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))?;
        def.run_count = self.run_count.max(0) as u64;
        def.last_run = self.last_run.as_deref().map(parse_datetime).transpose()?;
        def.last_run_status = self
            .last_run_status
            .as_deref()
            .map(parse_status)
            .transpose()?;
        def.last_run_error = self.last_run_error;
        Ok(def)
    }
}

struct RunRow {
    id: String,
    workflow_id: String,
    workflow_name: String,
    status: String,
    trigger_type: String,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    output: Option<String>,
    error: Option<String>,
    error_step: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            trigger_type: row.try_get("trigger_type")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            error_step: row.try_get("error_step")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let output = self
            .output
            .as_deref()
            .map(|s| {
                serde_json::from_str(s)
                    .map_err(|e| RepositoryError::Query(format!("invalid output JSON: {e}")))
            })
            .transpose()?;

        Ok(WorkflowRun {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_name: self.workflow_name,
            status: parse_status(&self.status)?,
            trigger_type: self.trigger_type,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_datetime)
                .transpose()?,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            output,
            error: self.error,
            error_step: self.error_step,
        })
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(s).map_err(|e| RepositoryError::Query(format!("invalid uuid: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid timestamp: {e}")))
}

fn parse_status(s: &str) -> Result<RunStatus, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid run status: {s}")))
}

fn status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Success => "success",
        RunStatus::Error => "error",
    }
}

// ---------------------------------------------------------------------------
// WorkflowStore implementation
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn save_workflow(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;

        sqlx::query(
            "INSERT INTO workflows (id, name, organization_id, active, definition,
                                    run_count, last_run, last_run_status, last_run_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 organization_id = excluded.organization_id,
                 active = excluded.active,
                 definition = excluded.definition",
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(&def.organization_id)
        .bind(def.active)
        .bind(definition)
        .bind(def.run_count as i64)
        .bind(def.last_run.map(|t| t.to_rfc3339()))
        .bind(def.last_run_status.map(status_str))
        .bind(&def.last_run_error)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_workflow(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT definition, run_count, last_run, last_run_status, last_run_error
             FROM workflows WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|r| WorkflowRow::from_row(&r))
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .map(WorkflowRow::into_definition)
            .transpose()
    }

    async fn list_scheduled(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT definition, run_count, last_run, last_run_status, last_run_error
             FROM workflows WHERE active = 1",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut scheduled = Vec::new();
        for row in &rows {
            let def = WorkflowRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_definition()?;
            let has_timer = def.triggers.iter().any(|t| {
                matches!(t, TriggerConfig::Cron { .. } | TriggerConfig::Poll { .. })
            });
            if has_timer {
                scheduled.push(def);
            }
        }
        Ok(scheduled)
    }

    async fn delete_workflow(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO workflow_runs (id, workflow_id, workflow_name, status, trigger_type,
                                        started_at, completed_at, duration_ms, output, error, error_step)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, NULL, NULL, NULL)",
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(&run.workflow_name)
        .bind(status_str(run.status))
        .bind(&run.trigger_type)
        .bind(run.started_at.to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn finish_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let output = run
            .output
            .as_ref()
            .map(|v| serde_json::to_string(v))
            .transpose()
            .map_err(|e| RepositoryError::Query(format!("serialize output: {e}")))?;

        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        // Terminal update is one-way: only a running row may be finished.
        let updated = sqlx::query(
            "UPDATE workflow_runs
             SET status = ?2, completed_at = ?3, duration_ms = ?4,
                 output = ?5, error = ?6, error_step = ?7
             WHERE id = ?1 AND status = 'running'",
        )
        .bind(run.id.to_string())
        .bind(status_str(run.status))
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .bind(run.duration_ms.map(|d| d as i64))
        .bind(output)
        .bind(&run.error)
        .bind(&run.error_step)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if updated.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "run {} is not in running state",
                run.id
            )));
        }

        sqlx::query(
            "UPDATE workflows
             SET run_count = run_count + 1,
                 last_run = ?2,
                 last_run_status = ?3,
                 last_run_error = ?4
             WHERE id = ?1",
        )
        .bind(run.workflow_id.to_string())
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .bind(status_str(run.status))
        .bind(&run.error)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(
            run_id = %run.id,
            workflow_id = %run.workflow_id,
            status = ?run.status,
            "terminal run state persisted"
        );
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?1")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|r| RunRow::from_row(&r))
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .map(RunRow::into_run)
            .transpose()
    }

    async fn list_runs(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE workflow_id = ?1
             ORDER BY started_at DESC LIMIT ?2",
        )
        .bind(workflow_id.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|r| {
                RunRow::from_row(r)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_run()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
