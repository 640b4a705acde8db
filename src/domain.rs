//! Domain module - records being synchronized and the sync bookkeeping types
//!
//! - `asset`, `sale`, `listing`: raw API payloads and their storage form
//! - `execution`: execution/stage lifecycle rows
//! - `progress`: ephemeral progress events
//! - `sources`: the external market API seam

pub mod asset;
pub mod execution;
pub mod listing;
pub mod progress;
pub mod sale;
pub mod sources;

pub use asset::{AssetPartition, AssetRecord, AssetReference, PositionalFit, RawAsset};
pub use execution::{ExecutionStatus, StageStatus, SyncExecution, SyncStage, TriggerKind};
pub use listing::{ListingRecord, RawListing};
pub use progress::{ProgressStatus, ProgressUpdate};
pub use sale::{RawSale, SaleRecord};
pub use sources::MarketSource;
