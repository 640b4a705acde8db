//! Incremental sale import.
//!
//! The cursor is the highest sale id already stored, so a run only asks the
//! API for sales it has not seen. Only settled sales are kept. Sales that
//! reference an asset we do not have yet go through dependency repair.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{MarketSource, RawSale, SaleRecord};
use crate::error::SyncResult;
use crate::infrastructure::SyncRepository;
use crate::sync::pipeline::{CursorStrategy, PageSource, run_pages};
use crate::sync::repair::DependencyRepairer;
use crate::sync::stages::{StageContext, StageReport, StageWorker};

pub const STAGE_NAME: &str = "sales";

/// Telemetry checkpoint; resumption uses the stored sales themselves
pub const CHECKPOINT_KEY: &str = "last_sale_id_synced";

pub struct SaleStage {
    source: Arc<dyn MarketSource>,
    repository: Arc<SyncRepository>,
    repairer: Arc<DependencyRepairer>,
    page_size: u32,
    page_delay: Duration,
}

impl SaleStage {
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
impl PageSource for SaleStage {
    type Raw = RawSale;
    type Record = SaleRecord;

    fn feed_name(&self) -> String {
        STAGE_NAME.to_string()
    }

    fn cursor_strategy(&self) -> CursorStrategy {
        CursorStrategy::LiveMax
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

    async fn live_cursor(&self) -> SyncResult<Option<i64>> {
        self.repository.max_sale_id().await
    }

    async fn fetch(&self, after: Option<i64>, limit: u32) -> SyncResult<Vec<RawSale>> {
        self.source.fetch_sales(after, limit).await
    }

    fn raw_id(&self, raw: &RawSale) -> i64 {
        raw.id
    }

    fn transform(&self, page: &[RawSale]) -> Vec<SaleRecord> {
        page.iter().filter_map(SaleRecord::from_raw).collect()
    }

    async fn write(&self, records: &[SaleRecord]) -> SyncResult<u64> {
        self.repairer
            .write_with_repair(records, || self.repository.upsert_sales(records))
            .await
    }
}

#[async_trait]
impl StageWorker for SaleStage {
    fn name(&self) -> &str {
        STAGE_NAME
    }

    fn label(&self) -> &str {
        "Sales sync"
    }

    async fn run(&self, ctx: &StageContext) -> SyncResult<StageReport> {
        let stats = run_pages(self, ctx).await?;
        Ok(StageReport {
            processed: stats.processed,
            failed: stats.failed,
            page_errors: stats.errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AssetRecord;
    use crate::sync::retry::RetryPolicy;
    use crate::infrastructure::CheckpointStore;
    use crate::test_utils::{FakeMarketSource, TestDatabase, fixtures};

    #[tokio::test]
    async fn imports_settled_sales_after_freshest_stored() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = TestDatabase::open_in(dir.path()).await?;
        let repository = Arc::new(db.sync_repository());
        repository.upsert_assets(&[AssetRecord::from_raw(&fixtures::asset(1))]).await?;
        repository.upsert_sales(&[SaleRecord::from_raw(&fixtures::sale(2, 1)).unwrap()]).await?;

        let mut offer = fixtures::sale(4, 1);
        offer.status = "offer".into();
        let source = Arc::new(FakeMarketSource::new().with_sales(vec![
            fixtures::sale(1, 1),
            fixtures::sale(2, 1),
            fixtures::sale(3, 1),
            offer,
            fixtures::sale(5, 1),
        ]));
        let repairer = Arc::new(DependencyRepairer::new(
            source.clone(),
            Arc::clone(&repository),
            RetryPolicy::default(),
        ));
        let stage = SaleStage::new(source.clone(), Arc::clone(&repository), repairer, 10, Duration::ZERO);
        let (ctx, checkpoints) = db.stage_context(STAGE_NAME).await?;

        let report = stage.run(&ctx).await?;

        assert_eq!(report.processed, 2);
        assert_eq!(repository.count_sales().await?, 3);
        assert_eq!(repository.max_sale_id().await?, Some(5));
        assert_eq!(checkpoints.get_i64(CHECKPOINT_KEY).await?, Some(5));
        assert_eq!(source.sale_cursors(), vec![Some(2)]);
        Ok(())
    }
}
