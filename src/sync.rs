//! Sync core: retry, execution tracking, progress fan-out, dependency
//! repair, the paginated pipeline, stage workers and their orchestration.

pub mod broadcaster;
pub mod orchestrator;
pub mod pipeline;
pub mod repair;
pub mod retry;
pub mod service;
pub mod stages;
pub mod tracker;

pub use broadcaster::{ProgressBroadcaster, ProgressCallback, ProgressStream, Subscription};
pub use orchestrator::{Orchestrator, RunOptions, StageDefinition, SyncRunResult};
pub use pipeline::{CursorStrategy, PageSource, PageStats, run_pages};
pub use repair::{DependencyRepairer, RepairReport};
pub use retry::{RetryPolicy, with_retry};
pub use service::{StageStatusSummary, SyncService};
pub use stages::{StageContext, StageReport, StageRunResult, StageRunner, StageWorker};
pub use tracker::ExecutionTracker;
