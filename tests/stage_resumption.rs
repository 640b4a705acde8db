//! Stage runs end to end against a real SQLite file: paging, idempotent
//! reruns, resuming after an outage, dependency repair and cancellation.

use std::sync::Arc;
use std::time::Duration;

use collection_sync::domain::{AssetRecord, ExecutionStatus, ProgressStatus, ProgressUpdate, RawSale, StageStatus, TriggerKind};
use collection_sync::error::SyncError;
use collection_sync::infrastructure::{CheckpointStore, SyncRepository};
use collection_sync::sync::stages::SaleStage;
use collection_sync::sync::stages::sale_stage::CHECKPOINT_KEY;
use collection_sync::sync::DependencyRepairer;
use collection_sync::test_utils::{FakeMarketSource, TestDatabase, fast_retry_policy, fixtures};

fn sales(ids: std::ops::RangeInclusive<i64>, asset_id: i64) -> Vec<RawSale> {
    ids.map(|id| fixtures::sale(id, asset_id)).collect()
}

fn sale_stage(source: &Arc<FakeMarketSource>, repository: &Arc<SyncRepository>) -> SaleStage {
    let repairer = Arc::new(DependencyRepairer::new(
        source.clone(),
        Arc::clone(repository),
        fast_retry_policy(),
    ));
    SaleStage::new(source.clone(), Arc::clone(repository), repairer, 2, Duration::ZERO)
}

async fn seeded(db: &TestDatabase) -> anyhow::Result<Arc<SyncRepository>> {
    let repository = Arc::new(db.sync_repository());
    repository.upsert_assets(&[AssetRecord::from_raw(&fixtures::asset(1))]).await?;
    Ok(repository)
}

#[tokio::test]
async fn five_sales_in_pages_of_two() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = TestDatabase::open_in(dir.path()).await?;
    let repository = seeded(&db).await?;
    let source = Arc::new(FakeMarketSource::new().with_sales(sales(1..=5, 1)));
    let runner = db.stage_runner();

    let result = runner
        .run(&sale_stage(&source, &repository), TriggerKind::Manual, None, None)
        .await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!((result.processed, result.failed), (5, 0));
    assert_eq!(source.sale_cursors(), vec![None, Some(2), Some(4)]);

    let positions: Vec<String> = runner
        .broadcaster
        .history(&result.execution_id)
        .into_iter()
        .filter(|u| u.status == ProgressStatus::Progress)
        .filter_map(|u| u.position)
        .collect();
    assert_eq!(positions, vec!["2", "4", "5"]);
    assert_eq!(db.checkpoint_store().get_i64(CHECKPOINT_KEY).await?, Some(5));
    Ok(())
}

#[tokio::test]
async fn rerun_without_new_upstream_data_is_a_no_op() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = TestDatabase::open_in(dir.path()).await?;
    let repository = seeded(&db).await?;
    let source = Arc::new(FakeMarketSource::new().with_sales(sales(1..=5, 1)));
    let runner = db.stage_runner();
    let stage = sale_stage(&source, &repository);

    let first = runner.run(&stage, TriggerKind::Manual, None, None).await;
    assert!(first.succeeded());

    let second = runner.run(&stage, TriggerKind::Scheduled, None, None).await;
    assert!(second.succeeded());
    assert_eq!(second.processed, 0);
    assert_eq!(repository.count_sales().await?, 5);
    assert_eq!(db.checkpoint_store().get_i64(CHECKPOINT_KEY).await?, Some(5));
    assert_eq!(source.sale_cursors().last(), Some(&Some(5)));
    Ok(())
}

#[tokio::test]
async fn outage_mid_run_resumes_from_stored_position() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = TestDatabase::open_in(dir.path()).await?;
    let repository = seeded(&db).await?;
    let source = Arc::new(FakeMarketSource::new().with_sales(sales(1..=6, 1)));
    let runner = db.stage_runner();
    let stage = sale_stage(&source, &repository);

    let execution_id = runner.begin(&stage, TriggerKind::Manual, None, None).await?;
    let outage_source = Arc::clone(&source);
    let _subscription = runner.broadcaster.subscribe(
        &execution_id,
        Arc::new(move |update: &ProgressUpdate| -> anyhow::Result<()> {
            if update.position.as_deref() == Some("2") {
                outage_source.set_outage(Some(SyncError::Network("connection reset".into())));
            }
            Ok(())
        }),
    );

    let interrupted = runner.drive(&stage, execution_id).await;
    assert_eq!(interrupted.status, ExecutionStatus::Failed);
    assert_eq!(interrupted.processed, 2);
    assert_eq!(repository.count_sales().await?, 2);

    source.set_outage(None);
    let resumed = runner.run(&stage, TriggerKind::Manual, None, None).await;

    assert!(resumed.succeeded(), "{:?}", resumed.error);
    assert_eq!(resumed.processed, 4);
    assert_eq!(repository.count_sales().await?, 6);
    assert_eq!(repository.max_sale_id().await?, Some(6));
    Ok(())
}

#[tokio::test]
async fn sale_for_unknown_asset_pulls_the_asset_in() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = TestDatabase::open_in(dir.path()).await?;
    let repository = seeded(&db).await?;
    let source = Arc::new(
        FakeMarketSource::new()
            .with_catalog_assets(vec![fixtures::asset(9)])
            .with_sales(vec![fixtures::sale(1, 1), fixtures::sale(2, 9)]),
    );

    let result = db
        .stage_runner()
        .run(&sale_stage(&source, &repository), TriggerKind::Manual, None, None)
        .await;

    assert!(result.succeeded());
    assert_eq!(result.processed, 2);
    assert_eq!(source.asset_lookups(), vec![9]);
    assert_eq!(repository.count_assets().await?, 2);
    assert_eq!(repository.count_sales().await?, 2);
    Ok(())
}

#[tokio::test]
async fn cancellation_is_observed_at_the_next_page() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = TestDatabase::open_in(dir.path()).await?;
    let repository = seeded(&db).await?;
    let source = Arc::new(FakeMarketSource::new().with_sales(sales(1..=6, 1)));
    let runner = db.stage_runner();
    let stage = sale_stage(&source, &repository);

    let execution_id = runner.begin(&stage, TriggerKind::Manual, None, None).await?;
    let token = runner.tracker.token(&execution_id).unwrap();
    let _subscription = runner.broadcaster.subscribe(
        &execution_id,
        Arc::new(move |update: &ProgressUpdate| -> anyhow::Result<()> {
            if update.status == ProgressStatus::Progress {
                token.cancel();
            }
            Ok(())
        }),
    );

    let result = runner.drive(&stage, execution_id.clone()).await;

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    // the page in flight when the token fires is still written
    assert_eq!(result.processed, 4);
    assert_eq!(repository.count_sales().await?, 4);

    let stored = runner.tracker.get(&execution_id).await?.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);
    assert_eq!(stored.records_processed, 4);
    let row = runner.tracker.stage("sales").await?.unwrap();
    assert_eq!(row.status, StageStatus::Cancelled);
    assert!(row.last_success_at.is_none());

    let history = runner.broadcaster.history(&execution_id);
    assert_eq!(history.last().map(|u| u.status), Some(ProgressStatus::Failed));
    Ok(())
}
