//! Stage workers and the runner that wraps one stage run in an execution.
//!
//! - `asset_stage`: one-time backfill over four partition sub-streams
//! - `sale_stage`: incremental import after the freshest stored sale
//! - `listing_stage`: full refresh of current listings
//! - `valuation_stage`: batched recompute of derived valuations

pub mod asset_stage;
pub mod listing_stage;
pub mod sale_stage;
pub mod valuation_stage;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use asset_stage::AssetStage;
pub use listing_stage::ListingStage;
pub use sale_stage::SaleStage;
pub use valuation_stage::ValuationStage;

use crate::domain::{ExecutionStatus, ProgressStatus, ProgressUpdate, TriggerKind};
use crate::error::{SyncError, SyncResult};
use crate::infrastructure::CheckpointStore;
use crate::sync::broadcaster::ProgressBroadcaster;
use crate::sync::retry::RetryPolicy;
use crate::sync::tracker::ExecutionTracker;

/// What a stage worker reports when it finishes without a fatal error
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub processed: u64,
    pub failed: u64,
    /// Page-level errors that did not abort the stage
    pub page_errors: Vec<String>,
}

/// Running totals shared by every sub-stream of one execution
#[derive(Debug, Default)]
pub struct StageCounters {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl StageCounters {
    pub fn add(&self, processed: u64, failed: u64) {
        self.processed.fetch_add(processed, Ordering::Relaxed);
        self.failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (self.processed.load(Ordering::Relaxed), self.failed.load(Ordering::Relaxed))
    }
}

/// Everything a worker needs during one execution
#[derive(Clone)]
pub struct StageContext {
    pub execution_id: String,
    pub stage: String,
    pub label: String,
    pub tracker: Arc<ExecutionTracker>,
    pub broadcaster: ProgressBroadcaster,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub retry: RetryPolicy,
    pub max_consecutive_page_errors: u32,
    pub counters: Arc<StageCounters>,
    pub started: Instant,
}

impl StageContext {
    /// Persists the running totals and publishes a progress event. Returns
    /// `Cancelled` when the execution was cancelled; callers propagate it.
    pub async fn report(
        &self,
        step: impl Into<String> + Send,
        position: Option<i64>,
        metadata: serde_json::Value,
    ) -> SyncResult<()> {
        let (processed, failed) = self.counters.snapshot();
        let step = step.into();
        self.tracker
            .report_progress(
                &self.execution_id,
                processed,
                failed,
                Some(serde_json::json!({ "step": &step, "position": position, "detail": &metadata })),
            )
            .await?;

        let mut update = ProgressUpdate::new(&self.execution_id, &self.stage, &self.label, ProgressStatus::Progress)
            .with_step(step)
            .with_counts(processed, failed)
            .with_duration_ms(self.elapsed_ms())
            .with_metadata(metadata);
        if let Some(position) = position {
            update = update.with_position(position);
        }
        self.broadcaster.publish(update);
        Ok(())
    }

    /// Checkpoint write; failures are logged, the next run resumes earlier
    pub async fn save_checkpoint(&self, key: &str, value: i64) {
        if let Err(e) = self.checkpoints.set_i64(key, value).await {
            warn!("⚠️ Failed to persist checkpoint {}={}: {}", key, value, e);
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[async_trait]
pub trait StageWorker: Send + Sync {
    /// Stage row name (`sales`, `assets`, ...)
    fn name(&self) -> &str;

    fn label(&self) -> &str;

    async fn run(&self, ctx: &StageContext) -> SyncResult<StageReport>;
}

/// Outcome of one stage execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRunResult {
    pub execution_id: String,
    pub stage: String,
    pub status: ExecutionStatus,
    pub processed: u64,
    pub failed: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub page_errors: Vec<String>,
}

impl StageRunResult {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Shared dependencies for running stage workers
#[derive(Clone)]
pub struct StageRunner {
    pub tracker: Arc<ExecutionTracker>,
    pub broadcaster: ProgressBroadcaster,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub retry: RetryPolicy,
    pub max_consecutive_page_errors: u32,
    pub cleanup_grace: Duration,
}

impl StageRunner {
    /// Starts the execution (fails on `AlreadyRunning`) and opens its
    /// progress channel without running it
    pub async fn begin(
        &self,
        worker: &dyn StageWorker,
        trigger: TriggerKind,
        triggered_by: Option<&str>,
        parent: Option<&CancellationToken>,
    ) -> SyncResult<String> {
        let execution_id = self
            .tracker
            .start_with_parent(worker.name(), trigger, triggered_by, parent)
            .await?;
        self.broadcaster.open(&execution_id);
        Ok(execution_id)
    }

    /// Drives a started execution to its terminal state
    pub async fn drive(&self, worker: &dyn StageWorker, execution_id: String) -> StageRunResult {
        let ctx = StageContext {
            execution_id,
            stage: worker.name().to_string(),
            label: worker.label().to_string(),
            tracker: Arc::clone(&self.tracker),
            broadcaster: self.broadcaster.clone(),
            checkpoints: Arc::clone(&self.checkpoints),
            retry: self.retry.clone(),
            max_consecutive_page_errors: self.max_consecutive_page_errors,
            counters: Arc::new(StageCounters::default()),
            started: Instant::now(),
        };

        self.broadcaster.publish(ProgressUpdate::new(
            &ctx.execution_id,
            &ctx.stage,
            &ctx.label,
            ProgressStatus::Started,
        ));
        info!("▶️ {} ({}) started", ctx.label, ctx.execution_id);

        let outcome = worker.run(&ctx).await;
        let (processed, failed) = ctx.counters.snapshot();
        let duration_ms = ctx.elapsed_ms();

        let (status, error, page_errors) = match outcome {
            Ok(report) => (ExecutionStatus::Completed, None, report.page_errors),
            Err(SyncError::Cancelled) => (ExecutionStatus::Cancelled, Some(SyncError::Cancelled.to_string()), Vec::new()),
            Err(e) => {
                error!("❌ {} failed: {}", ctx.label, e);
                (ExecutionStatus::Failed, Some(e.to_string()), Vec::new())
            }
        };

        self.tracker
            .complete_with_counts(&ctx.execution_id, status, processed, failed, error.as_deref())
            .await;

        let final_status = if status == ExecutionStatus::Completed {
            ProgressStatus::Completed
        } else {
            ProgressStatus::Failed
        };
        let mut update = ProgressUpdate::new(&ctx.execution_id, &ctx.stage, &ctx.label, final_status)
            .with_counts(processed, failed)
            .with_duration_ms(duration_ms);
        if let Some(error) = &error {
            update = update.with_error(error.clone());
        }
        self.broadcaster.publish(update);
        self.broadcaster.schedule_cleanup(&ctx.execution_id, self.cleanup_grace);

        info!(
            "⏹️ {} finished as {} in {}ms (processed {}, failed {})",
            ctx.label, status, duration_ms, processed, failed
        );

        StageRunResult {
            execution_id: ctx.execution_id,
            stage: ctx.stage,
            status,
            processed,
            failed,
            duration_ms,
            error,
            page_errors,
        }
    }

    /// `begin` + `drive`; a refused start is reported as a failed result
    pub async fn run(
        &self,
        worker: &dyn StageWorker,
        trigger: TriggerKind,
        triggered_by: Option<&str>,
        parent: Option<&CancellationToken>,
    ) -> StageRunResult {
        match self.begin(worker, trigger, triggered_by, parent).await {
            Ok(execution_id) => self.drive(worker, execution_id).await,
            Err(e) => StageRunResult {
                execution_id: String::new(),
                stage: worker.name().to_string(),
                status: ExecutionStatus::Failed,
                processed: 0,
                failed: 0,
                duration_ms: 0,
                error: Some(e.to_string()),
                page_errors: Vec::new(),
            },
        }
    }
}
