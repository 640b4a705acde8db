//! Control surface for an embedding host.
//!
//! `SyncService` wires the stores, the tracker, the broadcaster and the four
//! stage workers together and exposes start/cancel/subscribe/status.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;

use crate::domain::{MarketSource, SyncExecution, SyncStage, TriggerKind};
use crate::error::{SyncError, SyncResult};
use crate::infrastructure::config::SyncConfig;
use crate::infrastructure::{CheckpointStore, ExecutionRepository, SqliteCheckpointStore, SyncRepository};
use crate::sync::broadcaster::{ProgressBroadcaster, ProgressStream};
use crate::sync::orchestrator::{FULL_SYNC_COMPLETED_KEY, Orchestrator, RunOptions, StageDefinition, SyncRunResult};
use crate::sync::repair::DependencyRepairer;
use crate::sync::retry::RetryPolicy;
use crate::sync::stages::{AssetStage, ListingStage, SaleStage, StageRunner, ValuationStage};
use crate::sync::tracker::ExecutionTracker;

/// Stage row plus its most recent execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatusSummary {
    pub stage: SyncStage,
    pub latest_execution: Option<SyncExecution>,
}

pub struct SyncService {
    runner: StageRunner,
    orchestrator: Orchestrator,
}

impl SyncService {
    /// Default pipeline: assets (required, one-time), sales (required),
    /// listings and valuations (optional)
    pub fn new(pool: Arc<SqlitePool>, source: Arc<dyn MarketSource>, config: &SyncConfig) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let repository = Arc::new(SyncRepository::new(Arc::clone(&pool)));
        let repairer = Arc::new(DependencyRepairer::new(
            Arc::clone(&source),
            Arc::clone(&repository),
            retry.clone(),
        ));

        let stages = vec![
            StageDefinition::required(Arc::new(AssetStage::new(
                Arc::clone(&source),
                Arc::clone(&repository),
                config.asset_page_size,
                config.asset_page_delay(),
                config.concurrent_asset_streams,
            )))
            .one_time(),
            StageDefinition::required(Arc::new(SaleStage::new(
                Arc::clone(&source),
                Arc::clone(&repository),
                Arc::clone(&repairer),
                config.page_size,
                config.page_delay(),
            ))),
            StageDefinition::optional(Arc::new(ListingStage::new(
                Arc::clone(&source),
                Arc::clone(&repository),
                Arc::clone(&repairer),
                config.page_size,
                config.page_delay(),
            ))),
            StageDefinition::optional(Arc::new(ValuationStage::new(
                Arc::clone(&repository),
                config.valuation_batch_size,
            ))),
        ];

        let runner = StageRunner {
            tracker: Arc::new(ExecutionTracker::new(ExecutionRepository::new(Arc::clone(&pool)))),
            broadcaster: ProgressBroadcaster::new(),
            checkpoints: Arc::new(SqliteCheckpointStore::new(pool)),
            retry,
            max_consecutive_page_errors: config.max_consecutive_page_errors,
            cleanup_grace: config.progress_cleanup_grace(),
        };

        Self::with_stages(runner, stages)
    }

    /// Custom stage list over an existing runner
    pub fn with_stages(runner: StageRunner, stages: Vec<StageDefinition>) -> Self {
        Self {
            orchestrator: Orchestrator::new(runner.clone(), stages),
            runner,
        }
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.runner.tracker
    }

    pub fn broadcaster(&self) -> &ProgressBroadcaster {
        &self.runner.broadcaster
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.runner.checkpoints
    }

    /// Starts one stage in the background and returns its execution id.
    /// Refused with `AlreadyRunning` while the stage has a running execution.
    pub async fn start_stage(
        &self,
        name: &str,
        trigger: TriggerKind,
        triggered_by: Option<&str>,
    ) -> SyncResult<String> {
        let worker = self
            .orchestrator
            .stages()
            .iter()
            .find(|d| d.name() == name)
            .map(|d| Arc::clone(&d.worker))
            .ok_or_else(|| SyncError::UnknownStage(name.to_string()))?;

        let execution_id = self.runner.begin(worker.as_ref(), trigger, triggered_by, None).await?;

        let runner = self.runner.clone();
        let id = execution_id.clone();
        tokio::spawn(async move {
            runner.drive(worker.as_ref(), id).await;
        });

        info!("📨 {} started in background as {}", name, execution_id);
        Ok(execution_id)
    }

    /// Runs the full stage list in the caller's task
    pub async fn run_full_sync(&self, options: &RunOptions) -> SyncResult<SyncRunResult> {
        self.orchestrator.run(options).await
    }

    pub async fn cancel(&self, execution_id: &str) -> SyncResult<bool> {
        self.runner.tracker.cancel(execution_id).await
    }

    /// Cancels everything this process is running
    pub async fn cancel_all(&self) -> usize {
        self.runner.tracker.cancel_all().await
    }

    /// Buffered and live progress of one execution
    pub fn subscribe_progress(&self, execution_id: &str) -> ProgressStream {
        self.runner.broadcaster.subscribe_stream(execution_id)
    }

    pub async fn get_status(&self) -> SyncResult<Vec<StageStatusSummary>> {
        let stages = self.runner.tracker.stages().await?;
        let mut summaries = Vec::with_capacity(stages.len());
        for stage in stages {
            let latest_execution = self.runner.tracker.latest_execution(&stage.name).await?;
            summaries.push(StageStatusSummary {
                stage,
                latest_execution,
            });
        }
        Ok(summaries)
    }

    /// Fails executions a previous process left `running`
    pub async fn recover_interrupted(&self) -> SyncResult<usize> {
        self.runner.tracker.recover_interrupted().await
    }

    /// RFC 3339 timestamp of the last successful full sync
    pub async fn last_full_sync(&self) -> SyncResult<Option<String>> {
        self.runner.checkpoints.get(FULL_SYNC_COMPLETED_KEY).await
    }
}
