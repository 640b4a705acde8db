//! Valuation recompute. Not page based: the store-side procedure is called
//! in fixed-size batches until a batch comes back short.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::error::SyncResult;
use crate::infrastructure::SyncRepository;
use crate::sync::retry::with_retry;
use crate::sync::stages::{StageContext, StageReport, StageWorker};

pub const STAGE_NAME: &str = "valuations";

pub const CHECKPOINT_KEY: &str = "last_valuation_offset";

pub struct ValuationStage {
    repository: Arc<SyncRepository>,
    batch_size: u32,
}

impl ValuationStage {
    pub fn new(repository: Arc<SyncRepository>, batch_size: u32) -> Self {
        Self {
            repository,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl StageWorker for ValuationStage {
    fn name(&self) -> &str {
        STAGE_NAME
    }

    fn label(&self) -> &str {
        "Valuations"
    }

    async fn run(&self, ctx: &StageContext) -> SyncResult<StageReport> {
        let mut report = StageReport::default();
        let mut offset: u64 = 0;
        let mut updated: u64 = 0;
        let mut batches: u64 = 0;

        loop {
            let label = format!("valuation batch at {offset}");
            let batch = with_retry(&ctx.retry, &label, || {
                self.repository.compute_valuations(self.batch_size, offset)
            })
            .await?;

            batches += 1;
            updated += batch.updated;
            let ok = batch.processed.saturating_sub(batch.errors);
            report.processed += ok;
            report.failed += batch.errors;
            ctx.counters.add(ok, batch.errors);

            offset += batch.processed;
            ctx.save_checkpoint(CHECKPOINT_KEY, i64::try_from(offset).unwrap_or(i64::MAX))
                .await;
            ctx.report(
                format!("valuations: batch {batches}"),
                Some(i64::try_from(offset).unwrap_or(i64::MAX)),
                json!({ "updated": batch.updated, "errors": batch.errors }),
            )
            .await?;

            if batch.processed < u64::from(self.batch_size) {
                break;
            }
        }

        info!("📈 Valuations recomputed: {} assets scanned, {} updated", offset, updated);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AssetRecord, SaleRecord};
    use crate::infrastructure::CheckpointStore;
    use crate::test_utils::{TestDatabase, fixtures};

    #[tokio::test]
    async fn walks_all_assets_in_batches() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = TestDatabase::open_in(dir.path()).await?;
        let repository = Arc::new(db.sync_repository());
        let assets: Vec<_> = (1..=5).map(|id| AssetRecord::from_raw(&fixtures::asset(id))).collect();
        repository.upsert_assets(&assets).await?;
        repository
            .upsert_sales(&[
                SaleRecord::from_raw(&fixtures::sale(1, 1)).unwrap(),
                SaleRecord::from_raw(&fixtures::sale(2, 5)).unwrap(),
            ])
            .await?;

        let stage = ValuationStage::new(Arc::clone(&repository), 2);
        let (ctx, checkpoints) = db.stage_context(STAGE_NAME).await?;
        let report = stage.run(&ctx).await?;

        assert_eq!(report.processed, 5);
        assert_eq!(report.failed, 0);
        assert_eq!(repository.count_valuations().await?, 2);
        assert_eq!(checkpoints.get_i64(CHECKPOINT_KEY).await?, Some(5));
        Ok(())
    }
}
