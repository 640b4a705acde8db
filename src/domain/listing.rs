//! Current listings. Listings have no durable history: an asset that is no
//! longer in the listing feed is simply not listed anymore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::asset::AssetReference;

/// Active listing as returned by the market API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub id: i64,
    pub asset_id: i64,
    pub price: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub seller: Option<String>,
    pub listed_at: DateTime<Utc>,
}

/// Storage form of a listing (conflict key: `id`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub id: i64,
    pub asset_id: i64,
    pub price: f64,
    pub currency: String,
    pub seller: Option<String>,
    pub listed_at: DateTime<Utc>,
}

impl ListingRecord {
    #[must_use]
    pub fn from_raw(raw: &RawListing) -> Option<Self> {
        if !raw.price.is_finite() || raw.price < 0.0 {
            return None;
        }
        Some(Self {
            id: raw.id,
            asset_id: raw.asset_id,
            price: raw.price,
            currency: raw
                .currency
                .as_deref()
                .unwrap_or("USD")
                .to_ascii_uppercase(),
            seller: raw.seller.clone(),
            listed_at: raw.listed_at,
        })
    }
}

impl AssetReference for ListingRecord {
    fn referenced_asset_id(&self) -> i64 {
        self.asset_id
    }
}
