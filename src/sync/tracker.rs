//! Execution lifecycle tracking and cooperative cancellation.
//!
//! Tracker writes are best effort: a failed insert or progress write is logged
//! and the sync keeps going. Only the cancellation signal and the
//! one-running-execution check surface as errors.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{ExecutionStatus, StageStatus, SyncExecution, SyncStage, TriggerKind};
use crate::error::{SyncError, SyncResult};
use crate::infrastructure::ExecutionRepository;

/// Summary text written when a crash left an execution behind
pub const INTERRUPTED_SUMMARY: &str = "interrupted";

/// Counters are stored as SQLite integers; values past `i64::MAX` saturate
fn stored_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

struct LiveExecution {
    stage: String,
    token: CancellationToken,
}

pub struct ExecutionTracker {
    repository: ExecutionRepository,
    live: Mutex<HashMap<String, LiveExecution>>,
}

impl ExecutionTracker {
    pub fn new(repository: ExecutionRepository) -> Self {
        Self {
            repository,
            live: Mutex::new(HashMap::new()),
        }
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, LiveExecution>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts an execution of `stage` and returns its id.
    ///
    /// Fails with `AlreadyRunning` when a running execution of the stage
    /// exists. The check is read-before-write, not a lock.
    pub async fn start(&self, stage: &str, trigger: TriggerKind, triggered_by: Option<&str>) -> SyncResult<String> {
        self.start_with_parent(stage, trigger, triggered_by, None).await
    }

    /// Like [`start`](Self::start); cancelling `parent` also cancels this execution
    pub async fn start_with_parent(
        &self,
        stage: &str,
        trigger: TriggerKind,
        triggered_by: Option<&str>,
        parent: Option<&CancellationToken>,
    ) -> SyncResult<String> {
        match self.repository.find_running(stage).await {
            Ok(Some(existing)) => {
                warn!("⚠️ Stage '{}' already running as {}", stage, existing);
                return Err(SyncError::AlreadyRunning(stage.to_string()));
            }
            Ok(None) => {}
            Err(e) => warn!("Could not check running executions of '{}': {}", stage, e),
        }

        let now = Utc::now();
        let execution = SyncExecution {
            id: Uuid::new_v4().to_string(),
            stage: stage.to_string(),
            trigger,
            status: ExecutionStatus::Running,
            started_at: now,
            completed_at: None,
            duration_ms: None,
            records_processed: 0,
            records_failed: 0,
            progress: None,
            error_summary: None,
            triggered_by: triggered_by.map(str::to_string),
        };

        if let Err(e) = self.repository.insert(&execution).await {
            error!("Failed to record start of {} ({}): {}", stage, execution.id, e);
        }
        if let Err(e) = self.repository.mark_stage_running(stage, now).await {
            error!("Failed to mark stage '{}' running: {}", stage, e);
        }

        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        self.live().insert(
            execution.id.clone(),
            LiveExecution {
                stage: stage.to_string(),
                token,
            },
        );

        info!("🚀 Started {} execution {} ({})", stage, execution.id, trigger.as_str());
        Ok(execution.id)
    }

    /// Cancellation token of a live execution
    pub fn token(&self, execution_id: &str) -> Option<CancellationToken> {
        self.live().get(execution_id).map(|live| live.token.clone())
    }

    /// True if the in-process token fired or the stored status was flipped
    /// to `cancelled`. A failed read counts as not cancelled.
    pub async fn is_cancelled(&self, execution_id: &str) -> bool {
        if self.token(execution_id).is_some_and(|t| t.is_cancelled()) {
            return true;
        }
        match self.repository.status(execution_id).await {
            Ok(status) => status == Some(ExecutionStatus::Cancelled),
            Err(e) => {
                warn!("Could not read status of {}: {}", execution_id, e);
                false
            }
        }
    }

    /// Records progress, or returns `Cancelled` if the execution was cancelled
    pub async fn report_progress(
        &self,
        execution_id: &str,
        processed: u64,
        failed: u64,
        payload: Option<serde_json::Value>,
    ) -> SyncResult<()> {
        if self.is_cancelled(execution_id).await {
            info!("🛑 Execution {} observed cancellation", execution_id);
            return Err(SyncError::Cancelled);
        }
        if let Err(e) = self
            .repository
            .update_progress(execution_id, stored_count(processed), stored_count(failed), payload.as_ref())
            .await
        {
            warn!("Failed to record progress of {}: {}", execution_id, e);
        }
        Ok(())
    }

    /// Finalizes an execution and propagates the outcome to its stage row
    pub async fn complete(&self, execution_id: &str, status: ExecutionStatus, error_summary: Option<&str>) {
        let now = Utc::now();
        let live = self.live().remove(execution_id);

        match self.repository.finalize(execution_id, status, now, error_summary).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Execution {} was already finalized", execution_id);
                return;
            }
            Err(e) => error!("Failed to finalize {}: {}", execution_id, e),
        }

        let stage = match live {
            Some(live) => Some(live.stage),
            None => match self.repository.get(execution_id).await {
                Ok(found) => found.map(|e| e.stage),
                Err(e) => {
                    warn!("Could not resolve stage of {}: {}", execution_id, e);
                    None
                }
            },
        };

        if let Some(stage) = stage {
            if let Err(e) = self
                .repository
                .mark_stage_finished(&stage, StageStatus::from(status), now, error_summary)
                .await
            {
                error!("Failed to update stage '{}': {}", stage, e);
            }
            info!("🏁 {} execution {} finished as {}", stage, execution_id, status);
        }
    }

    /// Writes final counts regardless of status, then finalizes
    pub async fn complete_with_counts(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        processed: u64,
        failed: u64,
        error_summary: Option<&str>,
    ) {
        if let Err(e) = self
            .repository
            .record_totals(execution_id, stored_count(processed), stored_count(failed))
            .await
        {
            warn!("Failed to record totals of {}: {}", execution_id, e);
        }
        self.complete(execution_id, status, error_summary).await;
    }

    /// Requests cancellation; the owning worker observes it at its next
    /// progress report and finalizes the execution.
    pub async fn cancel(&self, execution_id: &str) -> SyncResult<bool> {
        let token_fired = self.token(execution_id).is_some_and(|token| {
            token.cancel();
            true
        });
        let flipped = self.repository.mark_cancelled(execution_id).await?;
        if token_fired || flipped {
            info!("🛑 Cancellation requested for {}", execution_id);
        }
        Ok(token_fired || flipped)
    }

    /// Cancels every execution owned by this process
    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.live().keys().cloned().collect();
        let mut cancelled = 0;
        for id in ids {
            match self.cancel(&id).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to cancel {}: {}", id, e),
            }
        }
        cancelled
    }

    /// Fails `running` executions this process does not own. Run once at
    /// startup so a crash does not block its stages forever.
    pub async fn recover_interrupted(&self) -> SyncResult<usize> {
        let orphans: Vec<SyncExecution> = {
            let running = self.repository.running().await?;
            let live = self.live();
            running.into_iter().filter(|e| !live.contains_key(&e.id)).collect()
        };

        for orphan in &orphans {
            warn!("♻️ Recovering interrupted {} execution {}", orphan.stage, orphan.id);
            self.complete(&orphan.id, ExecutionStatus::Failed, Some(INTERRUPTED_SUMMARY))
                .await;
        }
        Ok(orphans.len())
    }

    pub async fn get(&self, execution_id: &str) -> SyncResult<Option<SyncExecution>> {
        self.repository.get(execution_id).await
    }

    pub async fn latest_execution(&self, stage: &str) -> SyncResult<Option<SyncExecution>> {
        self.repository.latest_for_stage(stage).await
    }

    pub async fn stage(&self, name: &str) -> SyncResult<Option<SyncStage>> {
        self.repository.stage(name).await
    }

    pub async fn stages(&self) -> SyncResult<Vec<SyncStage>> {
        self.repository.stages().await
    }

    /// Number of executions currently owned by this process
    pub fn live_count(&self) -> usize {
        self.live().len()
    }
}
