//! Configuration infrastructure
//!
//! Configuration is organized into four sections:
//! 1. `api` - market API endpoint and client limits
//! 2. `database` - SQLite location and pool size
//! 3. `sync` - page sizes, inter-page delays, retry policy, error thresholds
//! 4. `logging` - log level and outputs
//!
//! The JSON file in the user config directory is the base layer; environment
//! variables prefixed with `COLLECTION_SYNC__` override it
//! (e.g. `COLLECTION_SYNC__SYNC__PAGE_SIZE=50`).

#![allow(clippy::derivable_impls)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "COLLECTION_SYNC";

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

/// Market API client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the market API, without trailing slash
    pub base_url: String,

    pub user_agent: String,

    /// Request timeout in seconds
    pub timeout_seconds: u64,

    /// Token-bucket limit applied before every request
    pub max_requests_per_second: u32,
}

/// Database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection url; empty means `<data dir>/collection-sync.db`
    pub url: String,

    pub max_connections: u32,
}

/// Stage loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Page size for sale and listing feeds
    pub page_size: u32,

    /// Page size for the asset feed
    pub asset_page_size: u32,

    /// Delay after every sale/listing page, sized below the provider quota
    pub page_delay_ms: u64,

    /// Delay after every asset page (more generous quota on that endpoint)
    pub asset_page_delay_ms: u64,

    /// Consecutive page-level errors that abort a stage
    pub max_consecutive_page_errors: u32,

    /// Run the four asset sub-streams concurrently
    pub concurrent_asset_streams: bool,

    /// Rows per valuation procedure call
    pub valuation_batch_size: u32,

    /// How long progress history stays available after a run ends
    pub progress_cleanup_grace_seconds: u64,

    pub retry: RetryConfig,
}

/// Retry/backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_range_ms: u64,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted file logs
    pub json_format: bool,

    pub console_output: bool,

    pub file_output: bool,

    /// Number of log files to keep (older files are deleted at startup)
    pub max_files: u32,

    /// Module-specific log level filters (e.g., "sqlx": "warn")
    pub module_filters: HashMap<String, String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::API_BASE_URL.to_string(),
            user_agent: format!("collection-sync/{}", env!("CARGO_PKG_VERSION")),
            timeout_seconds: defaults::REQUEST_TIMEOUT_SECONDS,
            max_requests_per_second: defaults::MAX_REQUESTS_PER_SECOND,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: defaults::DB_MAX_CONNECTIONS,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: defaults::PAGE_SIZE,
            asset_page_size: defaults::ASSET_PAGE_SIZE,
            page_delay_ms: defaults::PAGE_DELAY_MS,
            asset_page_delay_ms: defaults::ASSET_PAGE_DELAY_MS,
            max_consecutive_page_errors: defaults::MAX_CONSECUTIVE_PAGE_ERRORS,
            concurrent_asset_streams: true,
            valuation_batch_size: defaults::VALUATION_BATCH_SIZE,
            progress_cleanup_grace_seconds: defaults::PROGRESS_CLEANUP_GRACE_SECONDS,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            jitter_range_ms: defaults::RETRY_JITTER_RANGE_MS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
            max_files: defaults::LOG_MAX_FILES,
            module_filters: {
                let mut filters = HashMap::new();
                filters.insert("sqlx".to_string(), "warn".to_string());
                filters.insert("reqwest".to_string(), "info".to_string());
                filters.insert("hyper".to_string(), "warn".to_string());
                filters.insert("collection_sync".to_string(), "info".to_string());
                filters
            },
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    #[must_use]
    pub const fn asset_page_delay(&self) -> Duration {
        Duration::from_millis(self.asset_page_delay_ms)
    }

    #[must_use]
    pub const fn progress_cleanup_grace(&self) -> Duration {
        Duration::from_secs(self.progress_cleanup_grace_seconds)
    }
}

impl AppConfig {
    /// Resolve the database url, falling back to the data directory
    pub fn database_url(&self) -> Result<String> {
        if !self.database.url.trim().is_empty() {
            return Ok(self.database.url.clone());
        }
        let path = ConfigManager::get_app_data_dir()?
            .join("database")
            .join("collection-sync.db");
        Ok(format!("sqlite:{}", path.display()))
    }

    /// Sanity checks that would otherwise surface as confusing runtime errors
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.api.base_url.trim().is_empty(), "api.base_url must be set");
        anyhow::ensure!(self.api.max_requests_per_second > 0, "api.max_requests_per_second must be > 0");
        anyhow::ensure!(self.sync.page_size > 0, "sync.page_size must be > 0");
        anyhow::ensure!(self.sync.asset_page_size > 0, "sync.asset_page_size must be > 0");
        anyhow::ensure!(self.sync.valuation_batch_size > 0, "sync.valuation_batch_size must be > 0");
        anyhow::ensure!(self.sync.retry.max_attempts > 0, "sync.retry.max_attempts must be > 0");
        Ok(())
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("collection-sync");
        Ok(config_dir)
    }

    /// Get application data directory
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join("collection-sync");
        Ok(data_dir)
    }

    /// Create a configuration manager pointing at the default location
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join("config.json");
        Ok(Self { config_path })
    }

    /// Use an explicit config file (tests, `--config`)
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file, creating default if it doesn't exist.
    ///
    /// An unparseable file is backed up as `*.json.corrupted` and replaced
    /// with defaults.
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!("🎉 Configuration file not found, creating default: {:?}", self.config_path);
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read configuration file")?;

        match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                info!("Loaded configuration from: {:?}", self.config_path);
                Ok(config)
            }
            Err(parse_error) => {
                warn!("⚠️  Configuration file could not be parsed: {}", parse_error);

                let backup_path = self.config_path.with_extension("json.corrupted");
                if let Err(e) = fs::copy(&self.config_path, &backup_path).await {
                    warn!("Failed to create backup of corrupted config: {}", e);
                } else {
                    info!("Backed up corrupted config to: {:?}", backup_path);
                }

                let default_config = AppConfig::default();
                self.save_config(&default_config)
                    .await
                    .context("Failed to save default configuration")?;
                info!("✅ Reset to default configuration");
                Ok(default_config)
            }
        }
    }

    /// File layer plus `COLLECTION_SYNC__*` environment overrides
    pub async fn load_layered(&self) -> Result<AppConfig> {
        self.load_layered_with_env(None).await
    }

    /// Like [`load_layered`](Self::load_layered), reading overrides from
    /// `env` instead of the process environment when given
    async fn load_layered_with_env(&self, env: Option<config::Map<String, String>>) -> Result<AppConfig> {
        let file_config = self.load_config().await?;
        let base = serde_json::to_string(&file_config).context("Failed to serialize configuration")?;

        let layered = config::Config::builder()
            .add_source(config::File::from_str(&base, config::FileFormat::Json))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("Failed to layer configuration sources")?;

        let config: AppConfig = layered
            .try_deserialize()
            .context("Failed to deserialize layered configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Update the sync section in place
    pub async fn update_sync_config<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut SyncConfig),
    {
        let mut config = self.load_config().await?;
        updater(&mut config.sync);
        self.save_config(&config).await
    }
}

/// Default configuration values
pub mod defaults {
    pub const API_BASE_URL: &str = "https://api.market.example/v1";

    pub const REQUEST_TIMEOUT_SECONDS: u64 = 30;

    /// Provider quota is 120 requests/minute; stay under it
    pub const MAX_REQUESTS_PER_SECOND: u32 = 2;

    pub const DB_MAX_CONNECTIONS: u32 = 5;

    pub const PAGE_SIZE: u32 = 100;

    pub const ASSET_PAGE_SIZE: u32 = 200;

    pub const PAGE_DELAY_MS: u64 = 1000;

    pub const ASSET_PAGE_DELAY_MS: u64 = 250;

    pub const MAX_CONSECUTIVE_PAGE_ERRORS: u32 = 3;

    pub const VALUATION_BATCH_SIZE: u32 = 500;

    pub const PROGRESS_CLEANUP_GRACE_SECONDS: u64 = 300;

    pub const RETRY_MAX_ATTEMPTS: u32 = 5;

    pub const RETRY_BASE_DELAY_MS: u64 = 1000;

    pub const RETRY_MAX_DELAY_MS: u64 = 120_000;

    pub const RETRY_JITTER_RANGE_MS: u64 = 250;

    pub const LOG_LEVEL: &str = "info";

    pub const LOG_MAX_FILES: u32 = 5;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn creates_default_config_on_first_load() -> Result<()> {
        let dir = tempdir()?;
        let manager = ConfigManager::with_path(dir.path().join("nested").join("config.json"));

        let config = manager.load_config().await?;
        assert_eq!(config.sync.page_size, defaults::PAGE_SIZE);
        assert!(manager.config_path().exists());
        Ok(())
    }

    #[tokio::test]
    async fn corrupted_config_is_backed_up_and_reset() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json")?;

        let manager = ConfigManager::with_path(&path);
        let config = manager.load_config().await?;

        assert_eq!(config.sync.retry.max_attempts, defaults::RETRY_MAX_ATTEMPTS);
        assert!(dir.path().join("config.json.corrupted").exists());
        Ok(())
    }

    #[tokio::test]
    async fn partial_file_fills_missing_sections_with_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "sync": { "page_size": 25 } }"#)?;

        let config = ConfigManager::with_path(&path).load_config().await?;
        assert_eq!(config.sync.page_size, 25);
        assert_eq!(config.sync.asset_page_size, defaults::ASSET_PAGE_SIZE);
        assert_eq!(config.api.max_requests_per_second, defaults::MAX_REQUESTS_PER_SECOND);
        Ok(())
    }

    #[tokio::test]
    async fn update_sync_config_persists() -> Result<()> {
        let dir = tempdir()?;
        let manager = ConfigManager::with_path(dir.path().join("config.json"));
        manager.update_sync_config(|s| s.page_delay_ms = 10).await?;

        let reloaded = manager.load_config().await?;
        assert_eq!(reloaded.sync.page_delay_ms, 10);
        Ok(())
    }

    #[tokio::test]
    async fn environment_overrides_file_and_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "sync": { "page_size": 25, "page_delay_ms": 5 } }"#)?;

        let env = config::Map::from_iter([
            ("COLLECTION_SYNC__SYNC__PAGE_SIZE".to_string(), "40".to_string()),
            ("COLLECTION_SYNC__SYNC__RETRY__MAX_ATTEMPTS".to_string(), "7".to_string()),
            ("SYNC__PAGE_DELAY_MS".to_string(), "999".to_string()),
        ]);
        let config = ConfigManager::with_path(&path).load_layered_with_env(Some(env)).await?;

        assert_eq!(config.sync.page_size, 40);
        assert_eq!(config.sync.retry.max_attempts, 7);
        // unprefixed variables are ignored; the file value stands
        assert_eq!(config.sync.page_delay_ms, 5);
        assert_eq!(config.sync.asset_page_size, defaults::ASSET_PAGE_SIZE);
        Ok(())
    }

    #[tokio::test]
    async fn layered_load_without_overrides_matches_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "sync": { "page_size": 25 } }"#)?;

        let config = ConfigManager::with_path(&path)
            .load_layered_with_env(Some(config::Map::new()))
            .await?;
        assert_eq!(config.sync.page_size, 25);
        Ok(())
    }

    #[test]
    fn validate_rejects_zero_page_size() {
        let mut config = AppConfig::default();
        config.sync.page_size = 0;
        assert!(config.validate().is_err());
    }
}
