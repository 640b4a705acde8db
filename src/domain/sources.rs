//! External market API seam.
//!
//! All list endpoints are sorted ascending by id and return records with an id
//! strictly greater than `after`. A page shorter than `limit` means there is
//! nothing more to read.

use async_trait::async_trait;

use super::asset::{AssetPartition, RawAsset};
use super::listing::RawListing;
use super::sale::RawSale;
use crate::error::SyncResult;

#[async_trait]
pub trait MarketSource: Send + Sync {
    async fn fetch_assets(
        &self,
        partition: AssetPartition,
        after: Option<i64>,
        limit: u32,
    ) -> SyncResult<Vec<RawAsset>>;

    /// Single asset lookup used by dependency repair
    async fn fetch_asset(&self, id: i64) -> SyncResult<RawAsset>;

    async fn fetch_sales(&self, after: Option<i64>, limit: u32) -> SyncResult<Vec<RawSale>>;

    async fn fetch_listings(&self, after: Option<i64>, limit: u32) -> SyncResult<Vec<RawListing>>;
}
