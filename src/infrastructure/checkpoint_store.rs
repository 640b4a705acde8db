//! Key/value checkpoint persistence.
//!
//! Checkpoints hold resumable cursors (`last_sale_id_synced`, ...) and global
//! flags. Last write wins; there is no history.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::SyncResult;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, key: &str) -> SyncResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> SyncResult<()>;

    /// Cursor read; an unparseable stored value is logged and treated as absent
    async fn get_i64(&self, key: &str) -> SyncResult<Option<i64>> {
        Ok(self.get(key).await?.and_then(|raw| match raw.trim().parse::<i64>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("⚠️ Ignoring unparseable checkpoint {}='{}': {}", key, raw, e);
                None
            }
        }))
    }

    async fn set_i64(&self, key: &str, value: i64) -> SyncResult<()> {
        self.set(key, &value.to_string()).await
    }
}

/// Checkpoints in the `sync_checkpoints` table
pub struct SqliteCheckpointStore {
    pool: Arc<SqlitePool>,
}

impl SqliteCheckpointStore {
    pub const fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM sync_checkpoints WHERE key = ?")
            .bind(key)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        sqlx::query(
            r"
            INSERT INTO sync_checkpoints (key, value, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            ",
        )
        .bind(key)
        .bind(value)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }
}

/// Process-local store for tests and dry runs
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    values: RwLock<HashMap<String, String>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.values.read().await.clone()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, key: &str) -> SyncResult<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> SyncResult<()> {
        self.values.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::DatabaseConnection;

    #[tokio::test]
    async fn sqlite_store_last_write_wins() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = DatabaseConnection::new(&format!("sqlite:{}", dir.path().join("cp.db").display())).await?;
        db.migrate().await?;
        let store = SqliteCheckpointStore::new(Arc::new(db.pool().clone()));

        assert_eq!(store.get("last_sale_id_synced").await?, None);
        store.set_i64("last_sale_id_synced", 10).await?;
        store.set_i64("last_sale_id_synced", 25).await?;
        assert_eq!(store.get_i64("last_sale_id_synced").await?, Some(25));
        Ok(())
    }

    #[tokio::test]
    async fn garbage_cursor_reads_as_absent() {
        let store = InMemoryCheckpointStore::new();
        store.set("last_listing_id_synced", "not-a-number").await.unwrap();
        assert_eq!(store.get_i64("last_listing_id_synced").await.unwrap(), None);
        assert_eq!(
            store.get("last_listing_id_synced").await.unwrap().as_deref(),
            Some("not-a-number")
        );
    }
}
