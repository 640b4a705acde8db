//! SQLite access for the synchronized domain tables.
//!
//! Batch writes run inside one transaction: a foreign-key violation on any
//! row rolls the whole batch back, so the caller can repair the missing
//! assets and replay the batch unchanged.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, warn};

use crate::domain::{AssetRecord, ListingRecord, SaleRecord};
use crate::error::SyncResult;

/// Sales considered per asset when estimating its value
const VALUATION_SALE_WINDOW: i64 = 10;

/// Outcome of one call of the valuation batch procedure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuationBatch {
    pub processed: u64,
    pub updated: u64,
    pub errors: u64,
}

pub struct SyncRepository {
    pool: Arc<SqlitePool>,
}

impl SyncRepository {
    pub const fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn upsert_assets(&self, assets: &[AssetRecord]) -> SyncResult<u64> {
        if assets.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for asset in assets {
            let ratings = serde_json::to_string(&asset.position_ratings)?;
            sqlx::query(
                r"
                INSERT INTO assets (
                    id, name, retired, burned, owner, primary_position, primary_rating,
                    best_position, best_rating, rating_delta, fit_rank, position_ratings, synced_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    retired = excluded.retired,
                    burned = excluded.burned,
                    owner = excluded.owner,
                    primary_position = excluded.primary_position,
                    primary_rating = excluded.primary_rating,
                    best_position = excluded.best_position,
                    best_rating = excluded.best_rating,
                    rating_delta = excluded.rating_delta,
                    fit_rank = excluded.fit_rank,
                    position_ratings = excluded.position_ratings,
                    synced_at = excluded.synced_at
                ",
            )
            .bind(asset.id)
            .bind(&asset.name)
            .bind(asset.retired)
            .bind(asset.burned)
            .bind(&asset.owner)
            .bind(&asset.primary_position)
            .bind(asset.primary_rating)
            .bind(&asset.best_position)
            .bind(asset.best_rating)
            .bind(asset.rating_delta)
            .bind(asset.fit_rank.map(i64::from))
            .bind(ratings)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("Upserted {} assets", assets.len());
        Ok(assets.len() as u64)
    }

    pub async fn upsert_sales(&self, sales: &[SaleRecord]) -> SyncResult<u64> {
        if sales.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for sale in sales {
            sqlx::query(
                r"
                INSERT INTO sales (id, asset_id, price, currency, buyer, seller, occurred_at, synced_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(id) DO UPDATE SET
                    asset_id = excluded.asset_id,
                    price = excluded.price,
                    currency = excluded.currency,
                    buyer = excluded.buyer,
                    seller = excluded.seller,
                    occurred_at = excluded.occurred_at,
                    synced_at = excluded.synced_at
                ",
            )
            .bind(sale.id)
            .bind(sale.asset_id)
            .bind(sale.price)
            .bind(&sale.currency)
            .bind(&sale.buyer)
            .bind(&sale.seller)
            .bind(sale.occurred_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("Upserted {} sales", sales.len());
        Ok(sales.len() as u64)
    }

    pub async fn upsert_listings(&self, listings: &[ListingRecord]) -> SyncResult<u64> {
        if listings.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for listing in listings {
            sqlx::query(
                r"
                INSERT INTO current_listings (id, asset_id, price, currency, seller, listed_at, synced_at)
                VALUES (?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(id) DO UPDATE SET
                    asset_id = excluded.asset_id,
                    price = excluded.price,
                    currency = excluded.currency,
                    seller = excluded.seller,
                    listed_at = excluded.listed_at,
                    synced_at = excluded.synced_at
                ",
            )
            .bind(listing.id)
            .bind(listing.asset_id)
            .bind(listing.price)
            .bind(&listing.currency)
            .bind(&listing.seller)
            .bind(listing.listed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("Upserted {} listings", listings.len());
        Ok(listings.len() as u64)
    }

    /// Subset of `ids` already present in `assets`
    pub async fn existing_asset_ids(&self, ids: &[i64]) -> SyncResult<HashSet<i64>> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT id FROM assets WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let found: Vec<i64> = builder.build_query_scalar().fetch_all(&*self.pool).await?;
        Ok(found.into_iter().collect())
    }

    /// Highest stored sale id; the live cursor of the sale stage
    pub async fn max_sale_id(&self) -> SyncResult<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM sales")
            .fetch_one(&*self.pool)
            .await?;
        Ok(max)
    }

    pub async fn clear_current_listings(&self) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM current_listings").execute(&*self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn count_assets(&self) -> SyncResult<i64> {
        self.count("SELECT COUNT(*) FROM assets").await
    }

    pub async fn count_sales(&self) -> SyncResult<i64> {
        self.count("SELECT COUNT(*) FROM sales").await
    }

    pub async fn count_listings(&self) -> SyncResult<i64> {
        self.count("SELECT COUNT(*) FROM current_listings").await
    }

    pub async fn count_valuations(&self) -> SyncResult<i64> {
        self.count("SELECT COUNT(*) FROM asset_valuations").await
    }

    async fn count(&self, sql: &'static str) -> SyncResult<i64> {
        Ok(sqlx::query_scalar(sql).fetch_one(&*self.pool).await?)
    }

    /// Bulk valuation recompute over `batch_size` assets starting at `offset`.
    ///
    /// The estimate is the mean of the most recent sales of each asset; the
    /// floor is its cheapest current listing. Assets with neither are counted
    /// as processed but not updated. A failing row is counted in `errors` and
    /// does not stop the batch.
    pub async fn compute_valuations(&self, batch_size: u32, offset: u64) -> SyncResult<ValuationBatch> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM assets ORDER BY id LIMIT ? OFFSET ?")
            .bind(i64::from(batch_size))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;

        let mut batch = ValuationBatch {
            processed: ids.len() as u64,
            ..ValuationBatch::default()
        };

        for asset_id in ids {
            match self.value_asset(asset_id).await {
                Ok(true) => batch.updated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Valuation failed for asset {}: {}", asset_id, e);
                    batch.errors += 1;
                }
            }
        }

        Ok(batch)
    }

    async fn value_asset(&self, asset_id: i64) -> SyncResult<bool> {
        let (sale_count, estimated_value): (i64, Option<f64>) = sqlx::query_as(
            r"
            SELECT COUNT(*), AVG(price) FROM (
                SELECT price FROM sales WHERE asset_id = ? ORDER BY occurred_at DESC LIMIT ?
            )
            ",
        )
        .bind(asset_id)
        .bind(VALUATION_SALE_WINDOW)
        .fetch_one(&*self.pool)
        .await?;

        let floor_price: Option<f64> =
            sqlx::query_scalar("SELECT MIN(price) FROM current_listings WHERE asset_id = ?")
                .bind(asset_id)
                .fetch_one(&*self.pool)
                .await?;

        if sale_count == 0 && floor_price.is_none() {
            return Ok(false);
        }

        sqlx::query(
            r"
            INSERT INTO asset_valuations (asset_id, estimated_value, sale_count, floor_price, computed_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(asset_id) DO UPDATE SET
                estimated_value = excluded.estimated_value,
                sale_count = excluded.sale_count,
                floor_price = excluded.floor_price,
                computed_at = excluded.computed_at
            ",
        )
        .bind(asset_id)
        .bind(estimated_value)
        .bind(sale_count)
        .bind(floor_price)
        .execute(&*self.pool)
        .await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::test_utils::{TestDatabase, fixtures};

    #[tokio::test]
    async fn upsert_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = TestDatabase::open_in(dir.path()).await?;
        let repo = db.sync_repository();

        let assets: Vec<_> = (1..=3).map(|id| AssetRecord::from_raw(&fixtures::asset(id))).collect();
        repo.upsert_assets(&assets).await?;
        repo.upsert_assets(&assets).await?;

        assert_eq!(repo.count_assets().await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn dangling_sale_rolls_back_whole_batch() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = TestDatabase::open_in(dir.path()).await?;
        let repo = db.sync_repository();
        repo.upsert_assets(&[AssetRecord::from_raw(&fixtures::asset(1))]).await?;

        let sales = vec![
            SaleRecord::from_raw(&fixtures::sale(10, 1)).unwrap(),
            SaleRecord::from_raw(&fixtures::sale(11, 99)).unwrap(),
        ];
        let err = repo.upsert_sales(&sales).await.unwrap_err();

        assert!(matches!(err, SyncError::ForeignKeyViolation(_)));
        assert_eq!(repo.count_sales().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn existing_ids_and_max_sale() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = TestDatabase::open_in(dir.path()).await?;
        let repo = db.sync_repository();

        assert_eq!(repo.max_sale_id().await?, None);
        repo.upsert_assets(&[AssetRecord::from_raw(&fixtures::asset(1)), AssetRecord::from_raw(&fixtures::asset(3))])
            .await?;
        repo.upsert_sales(&[SaleRecord::from_raw(&fixtures::sale(7, 3)).unwrap()]).await?;

        let existing = repo.existing_asset_ids(&[1, 2, 3]).await?;
        assert_eq!(existing, HashSet::from([1, 3]));
        assert_eq!(repo.max_sale_id().await?, Some(7));
        Ok(())
    }

    #[tokio::test]
    async fn valuations_cover_assets_with_market_data() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = TestDatabase::open_in(dir.path()).await?;
        let repo = db.sync_repository();

        let assets: Vec<_> = (1..=3).map(|id| AssetRecord::from_raw(&fixtures::asset(id))).collect();
        repo.upsert_assets(&assets).await?;
        repo.upsert_sales(&[
            SaleRecord::from_raw(&fixtures::sale(1, 1)).unwrap(),
            SaleRecord::from_raw(&fixtures::sale(2, 1)).unwrap(),
        ])
        .await?;
        repo.upsert_listings(&[ListingRecord::from_raw(&fixtures::listing(1, 2)).unwrap()]).await?;

        let first = repo.compute_valuations(2, 0).await?;
        assert_eq!(first, ValuationBatch { processed: 2, updated: 2, errors: 0 });

        let second = repo.compute_valuations(2, 2).await?;
        assert_eq!(second, ValuationBatch { processed: 1, updated: 0, errors: 0 });

        assert_eq!(repo.count_valuations().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn clearing_listings_reports_rows() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = TestDatabase::open_in(dir.path()).await?;
        let repo = db.sync_repository();
        repo.upsert_assets(&[AssetRecord::from_raw(&fixtures::asset(1))]).await?;
        repo.upsert_listings(&[
            ListingRecord::from_raw(&fixtures::listing(1, 1)).unwrap(),
            ListingRecord::from_raw(&fixtures::listing(2, 1)).unwrap(),
        ])
        .await?;

        assert_eq!(repo.clear_current_listings().await?, 2);
        assert_eq!(repo.count_listings().await?, 0);
        Ok(())
    }
}
