//! Infrastructure layer: configuration, logging, the SQLite stores and the
//! HTTP adapter to the market API.

pub mod checkpoint_store;
pub mod config;
pub mod database_connection;
pub mod execution_repository;
pub mod http_client;
pub mod logging;
pub mod sync_repository;

pub use checkpoint_store::{CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore};
pub use config::{AppConfig, ConfigManager, SyncConfig};
pub use database_connection::DatabaseConnection;
pub use execution_repository::ExecutionRepository;
pub use http_client::MarketApiClient;
pub use logging::{flush_logging, get_log_directory, init_logging, init_logging_with_config};
pub use sync_repository::{SyncRepository, ValuationBatch};
