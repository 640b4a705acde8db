//! Assets are the primary entity of the market feed.
//!
//! The feed is partitioned by two flags (`retired`, `burned`); every partition
//! is imported by its own sub-stream with its own checkpoint. When an asset is
//! stored we also derive its positional fit: which position it rates best at,
//! how far that is above its primary position and where the primary position
//! ranks among all of its ratings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One of the four asset feed partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetPartition {
    pub retired: bool,
    pub burned: bool,
}

impl AssetPartition {
    pub const ALL: [Self; 4] = [
        Self { retired: false, burned: false },
        Self { retired: false, burned: true },
        Self { retired: true, burned: false },
        Self { retired: true, burned: true },
    ];

    #[must_use]
    pub const fn new(retired: bool, burned: bool) -> Self {
        Self { retired, burned }
    }

    /// `active/held`, `retired/burned`, ...
    #[must_use]
    pub fn label(self) -> String {
        format!(
            "{}/{}",
            if self.retired { "retired" } else { "active" },
            if self.burned { "burned" } else { "held" }
        )
    }

    /// Checkpoint key holding the last imported asset id of this partition
    #[must_use]
    pub fn checkpoint_key(self) -> String {
        format!("last_asset_id_imported:{}", self.label().replace('/', ":"))
    }
}

/// Asset as returned by the market API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAsset {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub retired: bool,
    #[serde(default)]
    pub burned: bool,
    #[serde(default)]
    pub owner: Option<String>,
    pub primary_position: String,
    #[serde(default)]
    pub position_ratings: BTreeMap<String, f64>,
}

/// Derived positional fit of an asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionalFit {
    pub best_position: String,
    pub best_rating: f64,
    pub primary_rating: Option<f64>,
    /// `best_rating - primary_rating`, never negative
    pub delta: Option<f64>,
    /// 1-based competition rank of the primary position
    pub primary_rank: Option<u32>,
}

impl PositionalFit {
    /// Computes the fit from the per-position ratings.
    ///
    /// Non-finite ratings are ignored. Ties on the best rating prefer the
    /// primary position, then the alphabetically first position.
    #[must_use]
    pub fn compute(primary_position: &str, ratings: &BTreeMap<String, f64>) -> Option<Self> {
        let valid: Vec<(&String, f64)> = ratings
            .iter()
            .filter(|(_, r)| r.is_finite())
            .map(|(p, r)| (p, *r))
            .collect();

        let max = valid.iter().map(|(_, r)| *r).fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return None;
        }

        let primary_rating = valid
            .iter()
            .find(|(p, _)| p.as_str() == primary_position)
            .map(|(_, r)| *r);

        let best_position = match primary_rating {
            Some(r) if r >= max => primary_position.to_string(),
            _ => valid
                .iter()
                .find(|(_, r)| *r >= max)
                .map(|(p, _)| (*p).clone())?,
        };

        let primary_rank = primary_rating.map(|pr| {
            let better = valid.iter().filter(|(_, r)| *r > pr).count();
            better as u32 + 1
        });

        Some(Self {
            best_position,
            best_rating: max,
            primary_rating,
            delta: primary_rating.map(|pr| max - pr),
            primary_rank,
        })
    }
}

/// Storage form of an asset (conflict key: `id`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: i64,
    pub name: String,
    pub retired: bool,
    pub burned: bool,
    pub owner: Option<String>,
    pub primary_position: String,
    pub primary_rating: Option<f64>,
    pub best_position: Option<String>,
    pub best_rating: Option<f64>,
    pub rating_delta: Option<f64>,
    pub fit_rank: Option<u32>,
    pub position_ratings: BTreeMap<String, f64>,
}

impl AssetRecord {
    /// Essential-fields transform shared by the asset stage and dependency repair
    #[must_use]
    pub fn from_raw(raw: &RawAsset) -> Self {
        let fit = PositionalFit::compute(&raw.primary_position, &raw.position_ratings);
        Self {
            id: raw.id,
            name: raw.name.trim().to_string(),
            retired: raw.retired,
            burned: raw.burned,
            owner: raw.owner.clone().filter(|o| !o.trim().is_empty()),
            primary_position: raw.primary_position.clone(),
            primary_rating: fit.as_ref().and_then(|f| f.primary_rating),
            best_position: fit.as_ref().map(|f| f.best_position.clone()),
            best_rating: fit.as_ref().map(|f| f.best_rating),
            rating_delta: fit.as_ref().and_then(|f| f.delta),
            fit_rank: fit.as_ref().and_then(|f| f.primary_rank),
            position_ratings: raw.position_ratings.clone(),
        }
    }
}

/// Records that point at an asset through a foreign key
pub trait AssetReference {
    fn referenced_asset_id(&self) -> i64;
}
