//! collection-sync host binary: one full sync, result printed as JSON.
//!
//! Usage: `collection-sync [--config <path>] [--skip <stage>]... [--no-one-time]`

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use collection_sync::domain::TriggerKind;
use collection_sync::infrastructure::{
    ConfigManager, DatabaseConnection, MarketApiClient, flush_logging, init_logging_with_config,
};
use collection_sync::{RunOptions, SyncService};

#[derive(Debug, Parser)]
#[command(name = "collection-sync", version, about = "Run one full marketplace sync", long_about = None)]
struct CliArgs {
    /// Config file instead of the one in the user config directory
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stage to leave out; repeatable
    #[arg(long)]
    skip: Vec<String>,

    /// Skip one-time stages even if they never completed
    #[arg(long)]
    no_one_time: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = CliArgs::parse();
    let outcome = run(args).await;
    flush_logging();
    outcome
}

async fn run(args: CliArgs) -> Result<ExitCode> {
    let manager = match &args.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let config = manager.load_layered().await?;
    init_logging_with_config(&config.logging)?;
    info!("🚀 collection-sync {} starting", env!("CARGO_PKG_VERSION"));

    let database_url = config.database_url()?;
    let db = DatabaseConnection::with_max_connections(&database_url, config.database.max_connections).await?;
    db.migrate().await.context("Failed to migrate database")?;
    info!("✅ Database ready at {}", database_url);

    let client = MarketApiClient::new(&config.api).context("Failed to build market API client")?;
    let service = Arc::new(SyncService::new(
        Arc::new(db.pool().clone()),
        Arc::new(client),
        &config.sync,
    ));

    let recovered = service.recover_interrupted().await?;
    if recovered > 0 {
        warn!("♻️ Recovered {} interrupted executions", recovered);
    }

    let signal_service = Arc::clone(&service);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let cancelled = signal_service.cancel_all().await;
            warn!("🛑 Ctrl-C received; cancelled {} executions", cancelled);
        }
    });

    let options = RunOptions {
        include_one_time: !args.no_one_time,
        skip: args.skip,
        trigger: TriggerKind::Manual,
        triggered_by: Some("cli".to_string()),
    };
    let result = service.run_full_sync(&options).await?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        error!("❌ Full sync failed: {:?}", result.errors);
        return Ok(ExitCode::FAILURE);
    }
    info!("🎉 Full sync finished in {}ms", result.duration_ms);
    Ok(ExitCode::SUCCESS)
}
