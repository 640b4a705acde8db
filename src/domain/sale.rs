//! Sales (transactions) on assets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::asset::AssetReference;

fn default_currency() -> String {
    "USD".to_string()
}

/// Sale event as returned by the market API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSale {
    pub id: i64,
    pub asset_id: i64,
    pub price: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub buyer: Option<String>,
    #[serde(default)]
    pub seller: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl RawSale {
    /// Only settled purchases are stored; offers, cancellations etc. are skipped
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self.status.to_ascii_lowercase().as_str(), "bought" | "completed")
    }
}

/// Storage form of a sale (conflict key: `id`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub id: i64,
    pub asset_id: i64,
    pub price: f64,
    pub currency: String,
    pub buyer: Option<String>,
    pub seller: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl SaleRecord {
    #[must_use]
    pub fn from_raw(raw: &RawSale) -> Option<Self> {
        if !raw.is_completed() || !raw.price.is_finite() {
            return None;
        }
        Some(Self {
            id: raw.id,
            asset_id: raw.asset_id,
            price: raw.price,
            currency: raw.currency.to_ascii_uppercase(),
            buyer: raw.buyer.clone(),
            seller: raw.seller.clone(),
            occurred_at: raw.occurred_at,
        })
    }
}

impl AssetReference for SaleRecord {
    fn referenced_asset_id(&self) -> i64 {
        self.asset_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(status: &str) -> RawSale {
        RawSale {
            id: 1,
            asset_id: 10,
            price: 12.5,
            currency: "usd".into(),
            status: status.into(),
            buyer: Some("b".into()),
            seller: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn keeps_only_settled_sales() {
        assert!(SaleRecord::from_raw(&raw("bought")).is_some());
        assert!(SaleRecord::from_raw(&raw("COMPLETED")).is_some());
        assert!(SaleRecord::from_raw(&raw("offer")).is_none());
        assert!(SaleRecord::from_raw(&raw("cancelled")).is_none());
    }

    #[test]
    fn currency_is_normalized() {
        let record = SaleRecord::from_raw(&raw("bought")).unwrap();
        assert_eq!(record.currency, "USD");
        assert_eq!(record.referenced_asset_id(), 10);
    }

    #[test]
    fn currency_defaults_when_missing() {
        let json = r#"{"id":3,"asset_id":4,"price":1.0,"status":"bought","occurred_at":"2024-05-01T10:00:00Z"}"#;
        let sale: RawSale = serde_json::from_str(json).unwrap();
        assert_eq!(sale.currency, "USD");
    }
}
