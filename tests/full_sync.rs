//! Full runs through `SyncService` plus the backoff curves seen from outside.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use collection_sync::domain::{AssetPartition, ExecutionStatus, StageStatus};
use collection_sync::error::SyncError;
use collection_sync::sync::{RetryPolicy, RunOptions, SyncService, with_retry};
use collection_sync::test_utils::{FakeMarketSource, TestDatabase, fast_sync_config, fixtures};

#[tokio::test]
async fn full_sync_then_incremental_run() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = TestDatabase::open_in(dir.path()).await?;
    let source = Arc::new(
        FakeMarketSource::new()
            .with_assets((1..=3).map(fixtures::asset).collect())
            .with_sales(vec![fixtures::sale(1, 1), fixtures::sale(2, 2), fixtures::sale(3, 3)])
            .with_listings(vec![fixtures::listing(1, 1), fixtures::listing(2, 3)]),
    );
    let service = SyncService::new(db.pool(), source.clone(), &fast_sync_config());

    let first = service.run_full_sync(&RunOptions::default()).await?;
    assert!(first.success, "{:?}", first.errors);
    let stage_names: Vec<&str> = first.stages.iter().map(|s| s.stage.as_str()).collect();
    assert_eq!(stage_names, vec!["assets", "sales", "listings", "valuations"]);

    let repository = db.sync_repository();
    assert_eq!(repository.count_assets().await?, 3);
    assert_eq!(repository.count_sales().await?, 3);
    assert_eq!(repository.count_listings().await?, 2);
    assert_eq!(repository.count_valuations().await?, 3);

    source.add_sales(vec![fixtures::sale(4, 2)]);
    let second = service.run_full_sync(&RunOptions::default()).await?;
    assert!(second.success, "{:?}", second.errors);
    assert_eq!(second.skipped, vec!["assets".to_string()]);
    let sales = second.stages.iter().find(|s| s.stage == "sales").unwrap();
    assert_eq!(sales.processed, 1);
    assert_eq!(repository.count_sales().await?, 4);

    let status = service.get_status().await?;
    let orchestrator = status.iter().find(|s| s.stage.name == "orchestrator").unwrap();
    assert_eq!(orchestrator.stage.status, StageStatus::Completed);
    assert!(service.last_full_sync().await?.is_some());
    Ok(())
}

#[tokio::test]
async fn failed_required_stage_stops_the_run() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = TestDatabase::open_in(dir.path()).await?;
    let source = Arc::new(
        FakeMarketSource::new()
            .with_assets(vec![fixtures::asset(1)])
            .with_sales(vec![fixtures::sale(1, 1)])
            .failing_partition(AssetPartition::new(true, false), SyncError::Decode("truncated body".into())),
    );
    let service = SyncService::new(db.pool(), source.clone(), &fast_sync_config());

    let result = service.run_full_sync(&RunOptions::default()).await?;

    assert!(!result.success);
    assert_eq!(result.stages.len(), 1);
    assert_eq!(result.stages[0].status, ExecutionStatus::Failed);
    assert!(result.errors[0].starts_with("assets: "));
    assert!(source.sale_cursors().is_empty());
    assert!(service.last_full_sync().await?.is_none());

    let stored = service.tracker().get(&result.execution_id).await?.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn failed_optional_stage_lets_later_stages_run() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = TestDatabase::open_in(dir.path()).await?;
    let source = Arc::new(
        FakeMarketSource::new()
            .with_assets(vec![fixtures::asset(1)])
            .with_sales(vec![fixtures::sale(1, 1)])
            .with_listings(vec![fixtures::listing(1, 1)]),
    );
    let service = SyncService::new(db.pool(), source.clone(), &fast_sync_config());
    assert!(service.run_full_sync(&RunOptions::default()).await?.success);

    // valuations never touch the API, so only the listing stage sees the outage
    source.set_outage(Some(SyncError::Decode("bad listing page".into())));
    let options = RunOptions {
        skip: vec!["sales".into()],
        ..RunOptions::default()
    };
    let result = service.run_full_sync(&options).await?;

    assert!(!result.success);
    let statuses: Vec<(&str, ExecutionStatus)> = result.stages.iter().map(|s| (s.stage.as_str(), s.status)).collect();
    assert_eq!(
        statuses,
        vec![("listings", ExecutionStatus::Failed), ("valuations", ExecutionStatus::Completed)]
    );
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("listings: "));
    assert_eq!(result.records_processed, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rate_limit_backoff_grows_faster_than_generic() {
    let policy = RetryPolicy {
        max_attempts: 4,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(600),
        jitter_range: Duration::ZERO,
    };

    async fn gaps(policy: &RetryPolicy, error: SyncError) -> Vec<Duration> {
        let stamps = Mutex::new(Vec::new());
        let _ = with_retry(policy, "probe", || {
            stamps.lock().unwrap().push(tokio::time::Instant::now());
            let error = error.clone();
            async move { Err::<(), _>(error) }
        })
        .await;
        let stamps = stamps.into_inner().unwrap();
        stamps.windows(2).map(|w| w[1] - w[0]).collect()
    }

    let throttled = gaps(
        &policy,
        SyncError::RateLimited {
            message: "429".into(),
            retry_after: None,
        },
    )
    .await;
    let generic = gaps(&policy, SyncError::Network("reset".into())).await;

    assert_eq!(throttled, vec![Duration::from_secs(1), Duration::from_secs(3), Duration::from_secs(9)]);
    assert_eq!(generic, vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]);
    assert!(throttled.windows(2).all(|w| w[1] > w[0]));
}
