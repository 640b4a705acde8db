//! Persistence for `sync_executions` and `sync_stages`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use crate::domain::{ExecutionStatus, StageStatus, SyncExecution, SyncStage};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, FromRow)]
struct ExecutionRow {
    id: String,
    stage: String,
    trigger_kind: String,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    records_processed: i64,
    records_failed: i64,
    progress: Option<String>,
    error_summary: Option<String>,
    triggered_by: Option<String>,
}

impl TryFrom<ExecutionRow> for SyncExecution {
    type Error = SyncError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            stage: row.stage,
            trigger: row.trigger_kind.parse()?,
            status: row.status.parse()?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            records_processed: row.records_processed,
            records_failed: row.records_failed,
            progress: row.progress.as_deref().map(serde_json::from_str).transpose()?,
            error_summary: row.error_summary,
            triggered_by: row.triggered_by,
        })
    }
}

#[derive(Debug, FromRow)]
struct StageRow {
    name: String,
    ordering: i64,
    label: String,
    one_time: bool,
    last_run_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    status: String,
    last_error: Option<String>,
}

impl TryFrom<StageRow> for SyncStage {
    type Error = SyncError;

    fn try_from(row: StageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            name: row.name,
            ordering: row.ordering,
            label: row.label,
            one_time: row.one_time,
            last_run_at: row.last_run_at,
            last_success_at: row.last_success_at,
            status: row.status.parse()?,
            last_error: row.last_error,
        })
    }
}

const EXECUTION_COLUMNS: &str = "id, stage, trigger_kind, status, started_at, completed_at, duration_ms, \
     records_processed, records_failed, progress, error_summary, triggered_by";

const STAGE_COLUMNS: &str = "name, ordering, label, one_time, last_run_at, last_success_at, status, last_error";

pub struct ExecutionRepository {
    pool: Arc<SqlitePool>,
}

impl ExecutionRepository {
    pub const fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Id of the running execution of `stage`, if any
    pub async fn find_running(&self, stage: &str) -> SyncResult<Option<String>> {
        let id = sqlx::query_scalar(
            "SELECT id FROM sync_executions WHERE stage = ? AND status = 'running' ORDER BY started_at DESC LIMIT 1",
        )
        .bind(stage)
        .fetch_optional(&*self.pool)
        .await?;
        Ok(id)
    }

    pub async fn insert(&self, execution: &SyncExecution) -> SyncResult<()> {
        let progress = execution.progress.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r"
            INSERT INTO sync_executions (
                id, stage, trigger_kind, status, started_at, completed_at, duration_ms,
                records_processed, records_failed, progress, error_summary, triggered_by
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&execution.id)
        .bind(&execution.stage)
        .bind(execution.trigger.as_str())
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.duration_ms)
        .bind(execution.records_processed)
        .bind(execution.records_failed)
        .bind(progress)
        .bind(&execution.error_summary)
        .bind(&execution.triggered_by)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn status(&self, id: &str) -> SyncResult<Option<ExecutionStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM sync_executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;
        status.map(|s| s.parse()).transpose()
    }

    /// Progress write; only touches executions that are still running
    pub async fn update_progress(
        &self,
        id: &str,
        processed: i64,
        failed: i64,
        payload: Option<&serde_json::Value>,
    ) -> SyncResult<bool> {
        let payload = payload.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r"
            UPDATE sync_executions
            SET records_processed = ?, records_failed = ?, progress = COALESCE(?, progress)
            WHERE id = ? AND status = 'running'
            ",
        )
        .bind(processed)
        .bind(failed)
        .bind(payload)
        .bind(id)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Final counts; unlike progress writes this ignores the status
    pub async fn record_totals(&self, id: &str, processed: i64, failed: i64) -> SyncResult<()> {
        sqlx::query("UPDATE sync_executions SET records_processed = ?, records_failed = ? WHERE id = ?")
            .bind(processed)
            .bind(failed)
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    /// Writes the terminal state. Guarded by `completed_at IS NULL` so an
    /// execution is finalized at most once; returns whether this call won.
    pub async fn finalize(
        &self,
        id: &str,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        error_summary: Option<&str>,
    ) -> SyncResult<bool> {
        let started_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT started_at FROM sync_executions WHERE id = ?")
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;
        let duration_ms = started_at.map(|start| (completed_at - start).num_milliseconds().max(0));

        let result = sqlx::query(
            r"
            UPDATE sync_executions
            SET status = ?, completed_at = ?, duration_ms = ?, error_summary = COALESCE(?, error_summary)
            WHERE id = ? AND completed_at IS NULL
            ",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(duration_ms)
        .bind(error_summary)
        .bind(id)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// External cancel: `running -> cancelled`, `completed_at` left for the owner
    pub async fn mark_cancelled(&self, id: &str) -> SyncResult<bool> {
        let result = sqlx::query("UPDATE sync_executions SET status = 'cancelled' WHERE id = ? AND status = 'running'")
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Every execution still marked running, oldest first
    pub async fn running(&self) -> SyncResult<Vec<SyncExecution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM sync_executions WHERE status = 'running' ORDER BY started_at"
        );
        let rows: Vec<ExecutionRow> = sqlx::query_as(&sql).fetch_all(&*self.pool).await?;
        rows.into_iter().map(SyncExecution::try_from).collect()
    }

    pub async fn get(&self, id: &str) -> SyncResult<Option<SyncExecution>> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM sync_executions WHERE id = ?");
        let row: Option<ExecutionRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&*self.pool).await?;
        row.map(SyncExecution::try_from).transpose()
    }

    pub async fn latest_for_stage(&self, stage: &str) -> SyncResult<Option<SyncExecution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM sync_executions WHERE stage = ? ORDER BY started_at DESC LIMIT 1"
        );
        let row: Option<ExecutionRow> = sqlx::query_as(&sql).bind(stage).fetch_optional(&*self.pool).await?;
        row.map(SyncExecution::try_from).transpose()
    }

    pub async fn mark_stage_running(&self, stage: &str, at: DateTime<Utc>) -> SyncResult<()> {
        sqlx::query("UPDATE sync_stages SET status = 'running', last_run_at = ? WHERE name = ?")
            .bind(at)
            .bind(stage)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    /// Stage summary after an execution ends. `last_success_at` only moves on
    /// completion; `last_error` is cleared on completion.
    pub async fn mark_stage_finished(
        &self,
        stage: &str,
        status: StageStatus,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> SyncResult<()> {
        let succeeded = status == StageStatus::Completed;
        sqlx::query(
            r"
            UPDATE sync_stages
            SET status = ?,
                last_run_at = ?,
                last_success_at = CASE WHEN ? THEN ? ELSE last_success_at END,
                last_error = CASE WHEN ? THEN NULL ELSE COALESCE(?, last_error) END
            WHERE name = ?
            ",
        )
        .bind(status.as_str())
        .bind(at)
        .bind(succeeded)
        .bind(at)
        .bind(succeeded)
        .bind(error)
        .bind(stage)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn stages(&self) -> SyncResult<Vec<SyncStage>> {
        let sql = format!("SELECT {STAGE_COLUMNS} FROM sync_stages ORDER BY ordering");
        let rows: Vec<StageRow> = sqlx::query_as(&sql).fetch_all(&*self.pool).await?;
        rows.into_iter().map(SyncStage::try_from).collect()
    }

    pub async fn stage(&self, name: &str) -> SyncResult<Option<SyncStage>> {
        let sql = format!("SELECT {STAGE_COLUMNS} FROM sync_stages WHERE name = ?");
        let row: Option<StageRow> = sqlx::query_as(&sql).bind(name).fetch_optional(&*self.pool).await?;
        row.map(SyncStage::try_from).transpose()
    }
}
