//! One-time asset backfill.
//!
//! The asset feed is split into four partitions by `retired` and `burned`.
//! Each partition is an independent sub-stream with its own checkpoint, so an
//! interrupted backfill resumes every partition where it stopped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use crate::domain::{AssetPartition, AssetRecord, MarketSource, RawAsset};
use crate::error::{SyncError, SyncResult};
use crate::infrastructure::SyncRepository;
use crate::sync::pipeline::{CursorStrategy, PageSource, PageStats, run_pages};
use crate::sync::stages::{StageContext, StageReport, StageWorker};

pub const STAGE_NAME: &str = "assets";

/// One partition of the asset feed
pub struct AssetFeed {
    source: Arc<dyn MarketSource>,
    repository: Arc<SyncRepository>,
    partition: AssetPartition,
    page_size: u32,
    page_delay: Duration,
}

#[async_trait]
impl PageSource for AssetFeed {
    type Raw = RawAsset;
    type Record = AssetRecord;

    fn feed_name(&self) -> String {
        format!("assets[{}]", self.partition.label())
    }

    fn cursor_strategy(&self) -> CursorStrategy {
        CursorStrategy::Checkpoint
    }

    fn checkpoint_key(&self) -> String {
        self.partition.checkpoint_key()
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_delay(&self) -> Duration {
        self.page_delay
    }

    fn look_ahead(&self) -> bool {
        true
    }

    async fn fetch(&self, after: Option<i64>, limit: u32) -> SyncResult<Vec<RawAsset>> {
        self.source.fetch_assets(self.partition, after, limit).await
    }

    fn raw_id(&self, raw: &RawAsset) -> i64 {
        raw.id
    }

    fn transform(&self, page: &[RawAsset]) -> Vec<AssetRecord> {
        page.iter().map(AssetRecord::from_raw).collect()
    }

    async fn write(&self, records: &[AssetRecord]) -> SyncResult<u64> {
        self.repository.upsert_assets(records).await
    }
}

pub struct AssetStage {
    source: Arc<dyn MarketSource>,
    repository: Arc<SyncRepository>,
    page_size: u32,
    page_delay: Duration,
    concurrent: bool,
}

impl AssetStage {
    pub fn new(
        source: Arc<dyn MarketSource>,
        repository: Arc<SyncRepository>,
        page_size: u32,
        page_delay: Duration,
        concurrent: bool,
    ) -> Self {
        Self {
            source,
            repository,
            page_size,
            page_delay,
            concurrent,
        }
    }

    fn feeds(&self) -> Vec<AssetFeed> {
        AssetPartition::ALL
            .iter()
            .map(|partition| AssetFeed {
                source: Arc::clone(&self.source),
                repository: Arc::clone(&self.repository),
                partition: *partition,
                page_size: self.page_size,
                page_delay: self.page_delay,
            })
            .collect()
    }
}

#[async_trait]
impl StageWorker for AssetStage {
    fn name(&self) -> &str {
        STAGE_NAME
    }

    fn label(&self) -> &str {
        "Asset import"
    }

    async fn run(&self, ctx: &StageContext) -> SyncResult<StageReport> {
        let feeds = self.feeds();

        let results: Vec<SyncResult<PageStats>> = if self.concurrent {
            join_all(feeds.iter().map(|feed| run_pages(feed, ctx))).await
        } else {
            let mut results = Vec::with_capacity(feeds.len());
            for feed in &feeds {
                let result = run_pages(feed, ctx).await;
                let cancelled = matches!(result, Err(SyncError::Cancelled));
                results.push(result);
                if cancelled {
                    break;
                }
            }
            results
        };

        let mut report = StageReport::default();
        let mut first_error: Option<SyncError> = None;
        for (feed, result) in feeds.iter().zip(results) {
            match result {
                Ok(stats) => {
                    report.processed += stats.processed;
                    report.failed += stats.failed;
                    report.page_errors.extend(stats.errors);
                }
                Err(e) => {
                    warn!("{} ended with error: {}", feed.feed_name(), e);
                    if first_error.is_none() || e.is_cancelled() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        info!("🧩 Asset backfill finished: {} assets stored", report.processed);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RawAsset;
    use crate::infrastructure::CheckpointStore;
    use crate::test_utils::{FakeMarketSource, TestDatabase, fixtures};

    fn partitioned(id: i64, retired: bool, burned: bool) -> RawAsset {
        RawAsset {
            retired,
            burned,
            ..fixtures::asset(id)
        }
    }

    #[tokio::test]
    async fn every_partition_gets_its_own_checkpoint() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = TestDatabase::open_in(dir.path()).await?;
        let source = Arc::new(FakeMarketSource::new().with_assets(vec![
            partitioned(1, false, false),
            partitioned(2, false, false),
            partitioned(3, false, false),
            partitioned(4, true, false),
            partitioned(5, false, true),
            partitioned(6, true, true),
        ]));
        let repository = Arc::new(db.sync_repository());
        let stage = AssetStage::new(source, Arc::clone(&repository), 2, Duration::ZERO, true);
        let (ctx, checkpoints) = db.stage_context(STAGE_NAME).await?;

        let report = stage.run(&ctx).await?;

        assert_eq!(report.processed, 6);
        assert_eq!(repository.count_assets().await?, 6);
        assert_eq!(checkpoints.get_i64("last_asset_id_imported:active:held").await?, Some(3));
        assert_eq!(checkpoints.get_i64("last_asset_id_imported:retired:held").await?, Some(4));
        assert_eq!(checkpoints.get_i64("last_asset_id_imported:active:burned").await?, Some(5));
        assert_eq!(checkpoints.get_i64("last_asset_id_imported:retired:burned").await?, Some(6));
        Ok(())
    }

    #[tokio::test]
    async fn failing_partition_fails_stage_but_keeps_others() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = TestDatabase::open_in(dir.path()).await?;
        let source = Arc::new(
            FakeMarketSource::new()
                .with_assets(vec![partitioned(1, false, false), partitioned(2, true, true)])
                .failing_partition(AssetPartition::new(true, true), SyncError::Decode("bad json".into())),
        );
        let repository = Arc::new(db.sync_repository());
        let stage = AssetStage::new(source, Arc::clone(&repository), 10, Duration::ZERO, false);
        let (ctx, checkpoints) = db.stage_context(STAGE_NAME).await?;

        let err = stage.run(&ctx).await.unwrap_err();

        assert!(matches!(err, SyncError::TooManyErrors { .. }));
        assert_eq!(checkpoints.get_i64("last_asset_id_imported:active:held").await?, Some(1));
        assert_eq!(repository.count_assets().await?, 1);
        Ok(())
    }
}
