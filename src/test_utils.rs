//! Test utilities for collection-sync
//!
//! Provides an on-disk test database, an in-memory market source with a call
//! log and injectable failures, and fixture builders. Compiled into the
//! library so integration tests under `tests/` can use it too.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::domain::{AssetPartition, MarketSource, RawAsset, RawListing, RawSale, TriggerKind};
use crate::error::{SyncError, SyncResult};
use crate::infrastructure::config::{RetryConfig, SyncConfig};
use crate::infrastructure::{
    DatabaseConnection, ExecutionRepository, InMemoryCheckpointStore, SqliteCheckpointStore, SyncRepository,
};
use crate::sync::broadcaster::ProgressBroadcaster;
use crate::sync::retry::RetryPolicy;
use crate::sync::stages::{StageContext, StageCounters, StageRunner};
use crate::sync::tracker::ExecutionTracker;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Millisecond-scale retry policy without jitter
#[must_use]
pub fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        jitter_range: Duration::ZERO,
    }
}

/// Sync settings with no inter-page delay and millisecond retries
#[must_use]
pub fn fast_sync_config() -> SyncConfig {
    SyncConfig {
        page_size: 2,
        asset_page_size: 2,
        page_delay_ms: 0,
        asset_page_delay_ms: 0,
        max_consecutive_page_errors: 3,
        concurrent_asset_streams: true,
        valuation_batch_size: 2,
        progress_cleanup_grace_seconds: 60,
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 10,
            jitter_range_ms: 0,
        },
    }
}

/// Migrated SQLite database in a caller-owned directory
pub struct TestDatabase {
    pub connection: DatabaseConnection,
    pool: Arc<SqlitePool>,
}

impl TestDatabase {
    /// Creates `sync.db` inside `dir` and runs the migrations.
    ///
    /// Use an on-disk file rather than `sqlite::memory:` so every pooled
    /// connection sees the same data.
    pub async fn open_in(dir: &Path) -> Result<Self> {
        let url = format!("sqlite:{}", dir.join("sync.db").display());
        let connection = DatabaseConnection::new(&url).await?;
        connection.migrate().await?;
        let pool = Arc::new(connection.pool().clone());
        Ok(Self { connection, pool })
    }

    pub fn pool(&self) -> Arc<SqlitePool> {
        Arc::clone(&self.pool)
    }

    pub fn sync_repository(&self) -> SyncRepository {
        SyncRepository::new(self.pool())
    }

    pub fn execution_repository(&self) -> ExecutionRepository {
        ExecutionRepository::new(self.pool())
    }

    pub fn checkpoint_store(&self) -> SqliteCheckpointStore {
        SqliteCheckpointStore::new(self.pool())
    }

    /// A fresh tracker, as a new process would have
    pub fn tracker(&self) -> Arc<ExecutionTracker> {
        Arc::new(ExecutionTracker::new(self.execution_repository()))
    }

    /// Runner with SQLite checkpoints and fast retries
    pub fn stage_runner(&self) -> StageRunner {
        StageRunner {
            tracker: self.tracker(),
            broadcaster: ProgressBroadcaster::new(),
            checkpoints: Arc::new(self.checkpoint_store()),
            retry: fast_retry_policy(),
            max_consecutive_page_errors: 3,
            cleanup_grace: Duration::from_secs(60),
        }
    }

    /// Context of a freshly started execution of `stage`, with in-memory
    /// checkpoints the test can inspect
    pub async fn stage_context(&self, stage: &str) -> Result<(StageContext, Arc<InMemoryCheckpointStore>)> {
        let tracker = self.tracker();
        let execution_id = tracker.start(stage, TriggerKind::Manual, Some("test")).await?;
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let ctx = StageContext {
            execution_id,
            stage: stage.to_string(),
            label: stage.to_string(),
            tracker,
            broadcaster: ProgressBroadcaster::new(),
            checkpoints: checkpoints.clone(),
            retry: fast_retry_policy(),
            max_consecutive_page_errors: 3,
            counters: Arc::new(StageCounters::default()),
            started: Instant::now(),
        };
        Ok((ctx, checkpoints))
    }
}

#[derive(Default)]
struct CallLog {
    asset_pages: Vec<(AssetPartition, Option<i64>)>,
    asset_lookups: Vec<i64>,
    sale_cursors: Vec<Option<i64>>,
    listing_cursors: Vec<Option<i64>>,
}

/// In-memory market API.
///
/// Feeds are kept sorted by id and paged exactly like the real endpoints.
/// Every call is logged; failures can be injected per partition, for the
/// next few list calls, or as a standing outage.
#[derive(Default)]
pub struct FakeMarketSource {
    assets: Mutex<Vec<RawAsset>>,
    catalog: Mutex<HashMap<i64, RawAsset>>,
    sales: Mutex<Vec<RawSale>>,
    listings: Mutex<Vec<RawListing>>,
    failing_partitions: HashMap<AssetPartition, SyncError>,
    queued_failures: Mutex<Vec<SyncError>>,
    outage: Mutex<Option<SyncError>>,
    calls: Mutex<CallLog>,
}

fn page<T: Clone>(records: &[T], id: impl Fn(&T) -> i64, after: Option<i64>, limit: u32) -> Vec<T> {
    records
        .iter()
        .filter(|r| after.is_none_or(|a| id(r) > a))
        .take(limit as usize)
        .cloned()
        .collect()
}

impl FakeMarketSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assets served by the partitioned feed and by single lookups
    #[must_use]
    pub fn with_assets(self, assets: Vec<RawAsset>) -> Self {
        {
            let mut catalog = lock(&self.catalog);
            for asset in &assets {
                catalog.insert(asset.id, asset.clone());
            }
        }
        {
            let mut feed = lock(&self.assets);
            feed.extend(assets);
            feed.sort_by_key(|a| a.id);
        }
        self
    }

    /// Assets only reachable through single lookups
    #[must_use]
    pub fn with_catalog_assets(self, assets: Vec<RawAsset>) -> Self {
        {
            let mut catalog = lock(&self.catalog);
            for asset in assets {
                catalog.insert(asset.id, asset);
            }
        }
        self
    }

    #[must_use]
    pub fn with_sales(self, sales: Vec<RawSale>) -> Self {
        self.add_sales(sales);
        self
    }

    #[must_use]
    pub fn with_listings(self, listings: Vec<RawListing>) -> Self {
        {
            let mut feed = lock(&self.listings);
            feed.extend(listings);
            feed.sort_by_key(|l| l.id);
        }
        self
    }

    /// Every page fetch of `partition` fails with `error`
    #[must_use]
    pub fn failing_partition(mut self, partition: AssetPartition, error: SyncError) -> Self {
        self.failing_partitions.insert(partition, error);
        self
    }

    /// Upstream grows after the source was handed out
    pub fn add_sales(&self, sales: Vec<RawSale>) {
        let mut feed = lock(&self.sales);
        feed.extend(sales);
        feed.sort_by_key(|s| s.id);
    }

    /// The next list calls fail with these errors, in order
    pub fn fail_next(&self, errors: Vec<SyncError>) {
        let mut queued = lock(&self.queued_failures);
        queued.extend(errors);
    }

    /// While set, every list call fails with `error`
    pub fn set_outage(&self, error: Option<SyncError>) {
        *lock(&self.outage) = error;
    }

    pub fn asset_lookups(&self) -> Vec<i64> {
        lock(&self.calls).asset_lookups.clone()
    }

    pub fn asset_pages(&self) -> Vec<(AssetPartition, Option<i64>)> {
        lock(&self.calls).asset_pages.clone()
    }

    pub fn sale_cursors(&self) -> Vec<Option<i64>> {
        lock(&self.calls).sale_cursors.clone()
    }

    pub fn listing_cursors(&self) -> Vec<Option<i64>> {
        lock(&self.calls).listing_cursors.clone()
    }

    fn injected_failure(&self) -> SyncResult<()> {
        if let Some(error) = lock(&self.outage).clone() {
            return Err(error);
        }
        let mut queued = lock(&self.queued_failures);
        if queued.is_empty() {
            Ok(())
        } else {
            Err(queued.remove(0))
        }
    }
}

#[async_trait]
impl MarketSource for FakeMarketSource {
    async fn fetch_assets(
        &self,
        partition: AssetPartition,
        after: Option<i64>,
        limit: u32,
    ) -> SyncResult<Vec<RawAsset>> {
        lock(&self.calls).asset_pages.push((partition, after));
        if let Some(error) = self.failing_partitions.get(&partition) {
            return Err(error.clone());
        }
        self.injected_failure()?;
        let feed = lock(&self.assets);
        let in_partition: Vec<RawAsset> = feed
            .iter()
            .filter(|a| a.retired == partition.retired && a.burned == partition.burned)
            .cloned()
            .collect();
        Ok(page(&in_partition, |a| a.id, after, limit))
    }

    async fn fetch_asset(&self, id: i64) -> SyncResult<RawAsset> {
        lock(&self.calls).asset_lookups.push(id);
        lock(&self.catalog)
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("asset {id}")))
    }

    async fn fetch_sales(&self, after: Option<i64>, limit: u32) -> SyncResult<Vec<RawSale>> {
        lock(&self.calls).sale_cursors.push(after);
        self.injected_failure()?;
        Ok(page(&lock(&self.sales), |s| s.id, after, limit))
    }

    async fn fetch_listings(&self, after: Option<i64>, limit: u32) -> SyncResult<Vec<RawListing>> {
        lock(&self.calls).listing_cursors.push(after);
        self.injected_failure()?;
        Ok(page(&lock(&self.listings), |l| l.id, after, limit))
    }
}

/// Fixture builders
pub mod fixtures {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Utc};

    use crate::domain::{RawAsset, RawListing, RawSale};

    /// 2024-05-01T10:00:00Z
    fn fixed_time() -> DateTime<Utc> {
        DateTime::from_timestamp(1_714_557_600, 0).unwrap_or_default()
    }

    /// Active, held midfielder with two ratings
    #[must_use]
    pub fn asset(id: i64) -> RawAsset {
        RawAsset {
            id,
            name: format!("Asset {id}"),
            retired: false,
            burned: false,
            owner: Some(format!("owner-{id}")),
            primary_position: "MID".to_string(),
            position_ratings: BTreeMap::from([("MID".to_string(), 70.0), ("DEF".to_string(), 64.0)]),
        }
    }

    /// Settled sale
    #[must_use]
    pub fn sale(id: i64, asset_id: i64) -> RawSale {
        RawSale {
            id,
            asset_id,
            price: 10.0 + id as f64,
            currency: "USD".to_string(),
            status: "bought".to_string(),
            buyer: Some("buyer".to_string()),
            seller: Some("seller".to_string()),
            occurred_at: fixed_time(),
        }
    }

    #[must_use]
    pub fn listing(id: i64, asset_id: i64) -> RawListing {
        RawListing {
            id,
            asset_id,
            price: 25.0,
            currency: Some("usd".to_string()),
            seller: Some("seller".to_string()),
            listed_at: fixed_time(),
        }
    }
}
