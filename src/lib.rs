//! collection-sync - resumable synchronization of a rate-limited market API
//!
//! Assets, sales and current listings are pulled page by page into SQLite,
//! then valuations are recomputed. Every stage run is a tracked execution with
//! persisted checkpoints, so an interrupted sync picks up where it stopped.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod sync;
pub mod test_utils;

pub use error::{SyncError, SyncResult};
pub use sync::{RunOptions, SyncRunResult, SyncService};
