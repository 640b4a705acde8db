//! Progress events fanned out to live observers. Never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    Progress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub execution_id: String,
    pub stage: String,
    pub stage_label: String,
    pub status: ProgressStatus,
    pub step: Option<String>,
    pub processed: u64,
    pub failed: u64,
    pub total: Option<u64>,
    /// Pagination position (cursor) after this step
    pub position: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressUpdate {
    pub fn new(
        execution_id: impl Into<String>,
        stage: impl Into<String>,
        stage_label: impl Into<String>,
        status: ProgressStatus,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            stage: stage.into(),
            stage_label: stage_label.into(),
            status,
            step: None,
            processed: 0,
            failed: 0,
            total: None,
            position: None,
            duration_ms: 0,
            metadata: serde_json::Value::Null,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    #[must_use]
    pub const fn with_counts(mut self, processed: u64, failed: u64) -> Self {
        self.processed = processed;
        self.failed = failed;
        self
    }

    #[must_use]
    pub const fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    #[must_use]
    pub fn with_position(mut self, position: impl ToString) -> Self {
        self.position = Some(position.to_string());
        self
    }

    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Completed and failed updates close a run
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self.status, ProgressStatus::Completed | ProgressStatus::Failed)
    }
}
