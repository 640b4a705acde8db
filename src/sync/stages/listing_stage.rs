//! Current listings refresh.
//!
//! Listings have no history, so every run clears the table and walks the
//! whole feed again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::domain::{ListingRecord, MarketSource, RawListing};
use crate::error::SyncResult;
use crate::infrastructure::SyncRepository;
use crate::sync::pipeline::{CursorStrategy, PageSource, run_pages};
use crate::sync::repair::DependencyRepairer;
use crate::sync::stages::{StageContext, StageReport, StageWorker};

pub const STAGE_NAME: &str = "listings";

pub const CHECKPOINT_KEY: &str = "last_listing_id_synced";

pub struct ListingStage {
    source: Arc<dyn MarketSource>,
    repository: Arc<SyncRepository>,
    repairer: Arc<DependencyRepairer>,
    page_size: u32,
    page_delay: Duration,
}

impl ListingStage {
    pub fn new(
        source: Arc<dyn MarketSource>,
        repository: Arc<SyncRepository>,
        repairer: Arc<DependencyRepairer>,
        page_size: u32,
        page_delay: Duration,
    ) -> Self {
        Self {
            source,
            repository,
            repairer,
            page_size,
            page_delay,
        }
    }
}

#[async_trait]
impl PageSource for ListingStage {
    type Raw = RawListing;
    type Record = ListingRecord;

    fn feed_name(&self) -> String {
        STAGE_NAME.to_string()
    }

    fn cursor_strategy(&self) -> CursorStrategy {
        CursorStrategy::FullPass
    }

    fn checkpoint_key(&self) -> String {
        CHECKPOINT_KEY.to_string()
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page_delay(&self) -> Duration {
        self.page_delay
    }

    async fn fetch(&self, after: Option<i64>, limit: u32) -> SyncResult<Vec<RawListing>> {
        self.source.fetch_listings(after, limit).await
    }

    fn raw_id(&self, raw: &RawListing) -> i64 {
        raw.id
    }

    fn transform(&self, page: &[RawListing]) -> Vec<ListingRecord> {
        page.iter().filter_map(ListingRecord::from_raw).collect()
    }

    async fn write(&self, records: &[ListingRecord]) -> SyncResult<u64> {
        self.repairer
            .write_with_repair(records, || self.repository.upsert_listings(records))
            .await
    }
}

#[async_trait]
impl StageWorker for ListingStage {
    fn name(&self) -> &str {
        STAGE_NAME
    }

    fn label(&self) -> &str {
        "Current listings"
    }

    async fn run(&self, ctx: &StageContext) -> SyncResult<StageReport> {
        let cleared = self.repository.clear_current_listings().await?;
        info!("🧽 Cleared {} stale listings", cleared);

        let stats = run_pages(self, ctx).await?;
        Ok(StageReport {
            processed: stats.processed,
            failed: stats.failed,
            page_errors: stats.errors,
        })
    }
}
