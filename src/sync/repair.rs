//! Lazy dependency repair for writes that reference missing assets.
//!
//! Sales and listings may arrive before the asset they point at has been
//! imported. When a batch write hits a foreign-key violation, the missing
//! assets are fetched one by one, stored, and the batch is replayed once.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{AssetRecord, AssetReference, MarketSource};
use crate::error::{SyncError, SyncResult};
use crate::infrastructure::SyncRepository;
use crate::sync::retry::{RetryPolicy, with_retry};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Distinct asset ids referenced by the failed batch
    pub referenced: usize,
    pub missing: usize,
    pub imported: usize,
    pub not_found: Vec<i64>,
    pub failed: Vec<i64>,
}

pub struct DependencyRepairer {
    source: Arc<dyn MarketSource>,
    repository: Arc<SyncRepository>,
    retry: RetryPolicy,
}

impl DependencyRepairer {
    pub fn new(source: Arc<dyn MarketSource>, repository: Arc<SyncRepository>, retry: RetryPolicy) -> Self {
        Self {
            source,
            repository,
            retry,
        }
    }

    /// Fetches and stores every referenced asset that is not stored yet
    pub async fn repair_missing_assets<R: AssetReference>(&self, records: &[R]) -> SyncResult<RepairReport> {
        let referenced: BTreeSet<i64> = records.iter().map(AssetReference::referenced_asset_id).collect();
        let ids: Vec<i64> = referenced.iter().copied().collect();
        let existing = self.repository.existing_asset_ids(&ids).await?;

        let mut report = RepairReport {
            referenced: ids.len(),
            ..RepairReport::default()
        };

        for id in ids.into_iter().filter(|id| !existing.contains(id)) {
            report.missing += 1;

            let label = format!("asset {id} lookup");
            let fetched = with_retry(&self.retry, &label, || self.source.fetch_asset(id)).await;
            let raw = match fetched {
                Ok(raw) => raw,
                Err(SyncError::NotFound(_)) => {
                    warn!("🔍 Referenced asset {} does not exist upstream", id);
                    report.not_found.push(id);
                    continue;
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    warn!("Failed to fetch referenced asset {}: {}", id, e);
                    report.failed.push(id);
                    continue;
                }
            };

            match self.repository.upsert_assets(&[AssetRecord::from_raw(&raw)]).await {
                Ok(_) => report.imported += 1,
                Err(e) => {
                    warn!("Failed to store referenced asset {}: {}", id, e);
                    report.failed.push(id);
                }
            }
        }

        if report.missing > 0 {
            info!(
                "🩹 Dependency repair: {} missing, {} imported, {} not found, {} failed",
                report.missing,
                report.imported,
                report.not_found.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    /// Runs `write`; on a foreign-key violation repairs the references of
    /// `records` and runs `write` exactly once more. If nothing could be
    /// imported the original violation is returned without a replay.
    pub async fn write_with_repair<R, F, Fut>(&self, records: &[R], mut write: F) -> SyncResult<u64>
    where
        R: AssetReference + Sync,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = SyncResult<u64>> + Send,
    {
        match write().await {
            Err(SyncError::ForeignKeyViolation(message)) => {
                warn!("🔗 Batch of {} hit a missing reference: {}", records.len(), message);
                let report = self.repair_missing_assets(records).await?;
                if report.imported == 0 {
                    return Err(SyncError::ForeignKeyViolation(message));
                }
                write().await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SaleRecord;
    use crate::test_utils::{FakeMarketSource, TestDatabase, fixtures};

    #[tokio::test]
    async fn missing_asset_is_imported_and_batch_replayed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = TestDatabase::open_in(dir.path()).await?;
        let repository = Arc::new(db.sync_repository());
        repository.upsert_assets(&[AssetRecord::from_raw(&fixtures::asset(1))]).await?;

        let source = Arc::new(FakeMarketSource::new().with_catalog_assets(vec![fixtures::asset(2)]));
        let repairer = DependencyRepairer::new(source.clone(), Arc::clone(&repository), RetryPolicy::default());

        let sales = vec![
            SaleRecord::from_raw(&fixtures::sale(10, 1)).unwrap(),
            SaleRecord::from_raw(&fixtures::sale(11, 2)).unwrap(),
        ];
        let written = repairer
            .write_with_repair(&sales, || repository.upsert_sales(&sales))
            .await?;

        assert_eq!(written, 2);
        assert_eq!(repository.count_sales().await?, 2);
        assert_eq!(source.asset_lookups(), vec![2]);
        Ok(())
    }

    #[tokio::test]
    async fn nothing_imported_means_no_replay() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = TestDatabase::open_in(dir.path()).await?;
        let repository = Arc::new(db.sync_repository());
        let source = Arc::new(FakeMarketSource::new());
        let repairer = DependencyRepairer::new(source.clone(), Arc::clone(&repository), RetryPolicy::default());

        let sales = vec![SaleRecord::from_raw(&fixtures::sale(10, 404)).unwrap()];
        let mut writes = 0;
        let result = repairer
            .write_with_repair(&sales, || {
                writes += 1;
                repository.upsert_sales(&sales)
            })
            .await;

        assert!(matches!(result, Err(SyncError::ForeignKeyViolation(_))));
        assert_eq!(writes, 1);
        assert_eq!(source.asset_lookups(), vec![404]);
        Ok(())
    }
}
