//! # Sync Orchestrator
//!
//! Runs an ordered list of stage definitions as one tracked execution of the
//! `orchestrator` stage. Required stages stop the run when they fail, optional
//! stages only mark it unsuccessful. One-time stages run until they have
//! succeeded once.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::{ExecutionStatus, ProgressStatus, ProgressUpdate, TriggerKind};
use crate::error::{SyncError, SyncResult};
use crate::sync::stages::{StageRunResult, StageRunner, StageWorker};

pub const ORCHESTRATOR_STAGE: &str = "orchestrator";

/// Global checkpoint written after every successful full run
pub const FULL_SYNC_COMPLETED_KEY: &str = "full_sync_last_completed_at";

/// Errors kept in a run result
pub const MAX_REPORTED_ERRORS: usize = 5;

/// One entry of the ordered stage list
#[derive(Clone)]
pub struct StageDefinition {
    pub worker: Arc<dyn StageWorker>,
    /// A failure stops the run
    pub required: bool,
    /// Skipped once the stage has a recorded success
    pub one_time: bool,
}

impl StageDefinition {
    pub fn required(worker: Arc<dyn StageWorker>) -> Self {
        Self {
            worker,
            required: true,
            one_time: false,
        }
    }

    pub fn optional(worker: Arc<dyn StageWorker>) -> Self {
        Self {
            worker,
            required: false,
            one_time: false,
        }
    }

    #[must_use]
    pub const fn one_time(mut self) -> Self {
        self.one_time = true;
        self
    }

    pub fn name(&self) -> &str {
        self.worker.name()
    }
}

/// Options of one full run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    pub include_one_time: bool,
    /// Stage names left out of this run
    pub skip: Vec<String>,
    pub trigger: TriggerKind,
    pub triggered_by: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            include_one_time: true,
            skip: Vec::new(),
            trigger: TriggerKind::Programmatic,
            triggered_by: None,
        }
    }
}

/// Structured result of a full run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunResult {
    pub execution_id: String,
    pub success: bool,
    pub duration_ms: u64,
    /// Totals of the stages that completed. Partial counts of a failed or
    /// cancelled stage are reported on its entry in `stages`.
    pub records_processed: u64,
    pub records_failed: u64,
    /// First few error messages, `stage: message`
    pub errors: Vec<String>,
    pub stages: Vec<StageRunResult>,
    pub skipped: Vec<String>,
}

pub struct Orchestrator {
    runner: StageRunner,
    stages: Vec<StageDefinition>,
}

impl Orchestrator {
    pub fn new(runner: StageRunner, stages: Vec<StageDefinition>) -> Self {
        Self { runner, stages }
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    async fn should_skip(&self, definition: &StageDefinition, options: &RunOptions) -> Option<&'static str> {
        if options.skip.iter().any(|s| s == definition.name()) {
            return Some("skip list");
        }
        if !definition.one_time {
            return None;
        }
        if !options.include_one_time {
            return Some("one-time stages excluded");
        }
        match self.runner.tracker.stage(definition.name()).await {
            Ok(Some(row)) if row.last_success_at.is_some() => Some("already completed once"),
            Ok(_) => None,
            Err(e) => {
                warn!("Could not read stage row of {}: {}; running it", definition.name(), e);
                None
            }
        }
    }

    /// Runs the filtered stage list in order. Fails without running anything
    /// when another orchestrator run is in progress.
    pub async fn run(&self, options: &RunOptions) -> SyncResult<SyncRunResult> {
        let started = Instant::now();
        let tracker = &self.runner.tracker;
        let broadcaster = &self.runner.broadcaster;

        let execution_id = tracker
            .start(ORCHESTRATOR_STAGE, options.trigger, options.triggered_by.as_deref())
            .await?;
        let token = tracker.token(&execution_id).unwrap_or_else(CancellationToken::new);
        broadcaster.publish(ProgressUpdate::new(
            &execution_id,
            ORCHESTRATOR_STAGE,
            "Full sync",
            ProgressStatus::Started,
        ));
        info!("🎬 Full sync {} started", execution_id);

        let mut planned = Vec::new();
        let mut skipped = Vec::new();
        for definition in &self.stages {
            match self.should_skip(definition, options).await {
                Some(reason) => {
                    info!("⏭️ Skipping {} ({})", definition.name(), reason);
                    skipped.push(definition.name().to_string());
                }
                None => planned.push(definition),
            }
        }

        let mut result = SyncRunResult {
            execution_id: execution_id.clone(),
            success: false,
            duration_ms: 0,
            records_processed: 0,
            records_failed: 0,
            errors: Vec::new(),
            stages: Vec::new(),
            skipped,
        };
        let mut all_errors: Vec<String> = Vec::new();
        let total = planned.len() as u64;

        for (index, definition) in planned.into_iter().enumerate() {
            if token.is_cancelled() || tracker.is_cancelled(&execution_id).await {
                all_errors.push(format!("{ORCHESTRATOR_STAGE}: {}", SyncError::Cancelled));
                break;
            }

            let stage_result = self
                .runner
                .run(
                    definition.worker.as_ref(),
                    options.trigger,
                    options.triggered_by.as_deref(),
                    Some(&token),
                )
                .await;

            let stop = match stage_result.status {
                ExecutionStatus::Completed => {
                    result.records_processed += stage_result.processed;
                    result.records_failed += stage_result.failed;
                    false
                }
                ExecutionStatus::Cancelled => {
                    warn!("🛑 {} was cancelled; stopping full sync", definition.name());
                    all_errors.push(format!("{}: {}", definition.name(), SyncError::Cancelled));
                    true
                }
                ExecutionStatus::Failed | ExecutionStatus::Running => {
                    let message = stage_result.error.clone().unwrap_or_else(|| "unknown error".into());
                    all_errors.push(format!("{}: {}", definition.name(), message));
                    if definition.required {
                        error!("💥 Required stage {} failed; stopping full sync", definition.name());
                        true
                    } else {
                        warn!("Optional stage {} failed; continuing", definition.name());
                        false
                    }
                }
            };

            broadcaster.publish(
                ProgressUpdate::new(&execution_id, ORCHESTRATOR_STAGE, "Full sync", ProgressStatus::Progress)
                    .with_step(format!("{} {}", definition.name(), stage_result.status))
                    .with_counts(result.records_processed, result.records_failed)
                    .with_total(total)
                    .with_position(index + 1)
                    .with_metadata(json!({ "stage_execution_id": &stage_result.execution_id })),
            );
            result.stages.push(stage_result);

            if stop {
                break;
            }
        }

        result.success = all_errors.is_empty();
        result.errors = all_errors.iter().take(MAX_REPORTED_ERRORS).cloned().collect();
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if result.success {
            if let Err(e) = self
                .runner
                .checkpoints
                .set(FULL_SYNC_COMPLETED_KEY, &Utc::now().to_rfc3339())
                .await
            {
                warn!("Failed to record {}: {}", FULL_SYNC_COMPLETED_KEY, e);
            }
        }

        let (status, summary) = if result.success {
            (ExecutionStatus::Completed, None)
        } else {
            (ExecutionStatus::Failed, Some(all_errors.join("; ")))
        };
        tracker
            .complete_with_counts(
                &execution_id,
                status,
                result.records_processed,
                result.records_failed,
                summary.as_deref(),
            )
            .await;

        let mut update = ProgressUpdate::new(
            &execution_id,
            ORCHESTRATOR_STAGE,
            "Full sync",
            if result.success { ProgressStatus::Completed } else { ProgressStatus::Failed },
        )
        .with_counts(result.records_processed, result.records_failed)
        .with_duration_ms(result.duration_ms);
        if let Some(summary) = summary {
            update = update.with_error(summary);
        }
        broadcaster.publish(update);
        broadcaster.schedule_cleanup(&execution_id, self.runner.cleanup_grace);

        info!(
            "🏁 Full sync {} finished: success={} processed={} failed={} in {}ms",
            execution_id, result.success, result.records_processed, result.records_failed, result.duration_ms
        );
        Ok(result)
    }
}
