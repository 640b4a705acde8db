// Database connection and pool management
// This module handles SQLite database connections using sqlx

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

/// Stage rows seeded at bootstrap: (name, ordering, label, one_time)
pub const SEEDED_STAGES: &[(&str, i64, &str, bool)] = &[
    ("orchestrator", 0, "Full sync", false),
    ("assets", 1, "Asset import", true),
    ("sales", 2, "Sales sync", false),
    ("listings", 3, "Current listings", false),
    ("valuations", 4, "Valuations", false),
];

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_max_connections(database_url, 5).await
    }

    pub async fn with_max_connections(database_url: &str, max_connections: u32) -> Result<Self> {
        let db_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url: {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .context("Failed to open SQLite pool")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        let statements = [
            r"
            CREATE TABLE IF NOT EXISTS sync_checkpoints (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS sync_stages (
                name TEXT PRIMARY KEY,
                ordering INTEGER NOT NULL,
                label TEXT NOT NULL,
                one_time BOOLEAN NOT NULL DEFAULT 0,
                last_run_at DATETIME,
                last_success_at DATETIME,
                status TEXT NOT NULL DEFAULT 'idle',
                last_error TEXT
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS sync_executions (
                id TEXT PRIMARY KEY,
                stage TEXT NOT NULL,
                trigger_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at DATETIME NOT NULL,
                completed_at DATETIME,
                duration_ms INTEGER,
                records_processed INTEGER NOT NULL DEFAULT 0,
                records_failed INTEGER NOT NULL DEFAULT 0,
                progress TEXT,
                error_summary TEXT,
                triggered_by TEXT
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS assets (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                retired BOOLEAN NOT NULL DEFAULT 0,
                burned BOOLEAN NOT NULL DEFAULT 0,
                owner TEXT,
                primary_position TEXT NOT NULL,
                primary_rating REAL,
                best_position TEXT,
                best_rating REAL,
                rating_delta REAL,
                fit_rank INTEGER,
                position_ratings TEXT NOT NULL DEFAULT '{}',
                synced_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS sales (
                id INTEGER PRIMARY KEY,
                asset_id INTEGER NOT NULL REFERENCES assets (id),
                price REAL NOT NULL,
                currency TEXT NOT NULL,
                buyer TEXT,
                seller TEXT,
                occurred_at DATETIME NOT NULL,
                synced_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS current_listings (
                id INTEGER PRIMARY KEY,
                asset_id INTEGER NOT NULL REFERENCES assets (id),
                price REAL NOT NULL,
                currency TEXT NOT NULL,
                seller TEXT,
                listed_at DATETIME NOT NULL,
                synced_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS asset_valuations (
                asset_id INTEGER PRIMARY KEY REFERENCES assets (id),
                estimated_value REAL,
                sale_count INTEGER NOT NULL DEFAULT 0,
                floor_price REAL,
                computed_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            ",
            "CREATE INDEX IF NOT EXISTS idx_executions_stage_status ON sync_executions (stage, status)",
            "CREATE INDEX IF NOT EXISTS idx_sales_asset_id ON sales (asset_id)",
            "CREATE INDEX IF NOT EXISTS idx_listings_asset_id ON current_listings (asset_id)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        for (name, ordering, label, one_time) in SEEDED_STAGES {
            sqlx::query(
                "INSERT OR IGNORE INTO sync_stages (name, ordering, label, one_time, status) VALUES (?, ?, ?, ?, 'idle')",
            )
            .bind(*name)
            .bind(*ordering)
            .bind(*label)
            .bind(*one_time)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_database_connection_creates_file() -> Result<()> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("nested").join("test.db");
        let database_url = format!("sqlite:{}", db_path.display());

        let db = DatabaseConnection::new(&database_url).await?;

        assert!(!db.pool().is_closed());
        assert!(db_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_migration_is_idempotent_and_seeds_stages() -> Result<()> {
        let temp_dir = tempdir()?;
        let database_url = format!("sqlite:{}", temp_dir.path().join("m.db").display());

        let db = DatabaseConnection::new(&database_url).await?;
        db.migrate().await?;
        db.migrate().await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_stages")
            .fetch_one(db.pool())
            .await?;
        assert_eq!(count, SEEDED_STAGES.len() as i64);
        Ok(())
    }

    #[tokio::test]
    async fn test_foreign_keys_are_enforced() -> Result<()> {
        let temp_dir = tempdir()?;
        let database_url = format!("sqlite:{}", temp_dir.path().join("fk.db").display());
        let db = DatabaseConnection::new(&database_url).await?;
        db.migrate().await?;

        let result = sqlx::query(
            "INSERT INTO sales (id, asset_id, price, currency, occurred_at) VALUES (1, 999, 1.0, 'USD', CURRENT_TIMESTAMP)",
        )
        .execute(db.pool())
        .await;

        let err = result.expect_err("dangling asset reference must be rejected");
        assert!(matches!(
            crate::error::SyncError::from(err),
            crate::error::SyncError::ForeignKeyViolation(_)
        ));
        Ok(())
    }
}
