//! The one paginated fetch -> transform -> upsert loop every page-based
//! stage runs through.
//!
//! A [`PageSource`] describes a feed: how to fetch a page after a cursor, how
//! to turn raw records into storage records, how to write them and where the
//! loop starts. [`run_pages`] owns the rest: retries, the terminal-page rule,
//! checkpointing, progress, inter-page delay and the consecutive error limit.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::sync::retry::with_retry;
use crate::sync::stages::StageContext;

/// Where a feed resumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorStrategy {
    /// Resume after the stored checkpoint
    Checkpoint,
    /// Resume after the freshest stored record; the checkpoint is telemetry
    LiveMax,
    /// Start from the beginning every run; the checkpoint is telemetry
    FullPass,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    type Raw: Send + Sync;
    type Record: Send + Sync;

    /// Feed name used in logs and progress steps
    fn feed_name(&self) -> String;

    fn cursor_strategy(&self) -> CursorStrategy;

    /// Key the tail id of every processed page is written to
    fn checkpoint_key(&self) -> String;

    fn page_size(&self) -> u32;

    fn page_delay(&self) -> Duration;

    /// Overlap processing of page N with the fetch of page N+1
    fn look_ahead(&self) -> bool {
        false
    }

    /// Cursor for [`CursorStrategy::LiveMax`]
    async fn live_cursor(&self) -> SyncResult<Option<i64>> {
        Ok(None)
    }

    /// Records with id strictly greater than `after`, ascending by id
    async fn fetch(&self, after: Option<i64>, limit: u32) -> SyncResult<Vec<Self::Raw>>;

    fn raw_id(&self, raw: &Self::Raw) -> i64;

    /// Raw records that should not be stored are simply left out
    fn transform(&self, page: &[Self::Raw]) -> Vec<Self::Record>;

    async fn write(&self, records: &[Self::Record]) -> SyncResult<u64>;
}

/// Counters of one feed run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageStats {
    pub pages: u64,
    pub processed: u64,
    pub failed: u64,
    /// Raw records dropped by the transform
    pub skipped: u64,
    /// Checkpoint written after each processed page, in order
    pub page_cursors: Vec<i64>,
    pub errors: Vec<String>,
}

impl PageStats {
    #[must_use]
    pub fn last_cursor(&self) -> Option<i64> {
        self.page_cursors.last().copied()
    }
}

struct PageOutcome {
    attempted: u64,
    skipped: u64,
    result: SyncResult<u64>,
}

async fn process_page<S: PageSource + ?Sized>(source: &S, page: &[S::Raw]) -> PageOutcome {
    let records = source.transform(page);
    let attempted = records.len() as u64;
    let skipped = (page.len() - records.len()) as u64;
    let result = if records.is_empty() {
        Ok(0)
    } else {
        source.write(&records).await
    };
    PageOutcome {
        attempted,
        skipped,
        result,
    }
}

async fn fetch_page<S: PageSource + ?Sized>(
    source: &S,
    ctx: &StageContext,
    after: Option<i64>,
    limit: u32,
) -> SyncResult<Vec<S::Raw>> {
    let label = format!("{} page after {:?}", source.feed_name(), after);
    with_retry(&ctx.retry, &label, || source.fetch(after, limit)).await
}

fn page_error(ctx: &StageContext, stats: &mut PageStats, consecutive: u32, error: &SyncError) -> SyncResult<()> {
    stats.errors.push(error.to_string());
    let limit = ctx.max_consecutive_page_errors.max(1);
    if consecutive >= limit {
        return Err(SyncError::TooManyErrors {
            stage: ctx.stage.clone(),
            count: consecutive,
            last_error: error.to_string(),
        });
    }
    Ok(())
}

async fn initial_cursor<S: PageSource + ?Sized>(source: &S, ctx: &StageContext) -> SyncResult<Option<i64>> {
    match source.cursor_strategy() {
        CursorStrategy::Checkpoint => match ctx.checkpoints.get_i64(&source.checkpoint_key()).await {
            Ok(cursor) => Ok(cursor),
            Err(e) => {
                warn!("Could not read checkpoint {}: {}; starting from scratch", source.checkpoint_key(), e);
                Ok(None)
            }
        },
        CursorStrategy::LiveMax => source.live_cursor().await,
        CursorStrategy::FullPass => Ok(None),
    }
}

/// Runs one feed to its terminal page.
///
/// A page that fails to fetch (after retries) is fetched again from the same
/// cursor; a page that fails to write counts its records as failed and the
/// cursor still moves past it. Either kind of error in a row, up to the
/// configured limit, aborts with `TooManyErrors`.
pub async fn run_pages<S: PageSource + ?Sized>(source: &S, ctx: &StageContext) -> SyncResult<PageStats> {
    let name = source.feed_name();
    let key = source.checkpoint_key();
    let limit = source.page_size().max(1);
    let delay = source.page_delay();

    let mut cursor = initial_cursor(source, ctx).await?;
    info!("📄 {} starting after {:?} (page size {})", name, cursor, limit);

    let mut stats = PageStats::default();
    let mut consecutive_errors: u32 = 0;
    let mut prefetched: Option<SyncResult<Vec<S::Raw>>> = None;

    loop {
        let fetched = match prefetched.take() {
            Some(result) => result,
            None => fetch_page(source, ctx, cursor, limit).await,
        };

        let page = match fetched {
            Ok(page) => page,
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => {
                consecutive_errors += 1;
                warn!("⚠️ {} fetch after {:?} failed ({} in a row): {}", name, cursor, consecutive_errors, e);
                page_error(ctx, &mut stats, consecutive_errors, &e)?;
                ctx.report(format!("{name}: fetch failed"), cursor, json!({ "error": e.to_string() }))
                    .await?;
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        if page.is_empty() {
            debug!("{} reached an empty page", name);
            break;
        }

        let is_last = page.len() < limit as usize;
        let tail = page.iter().map(|raw| source.raw_id(raw)).max().unwrap_or_default();
        if cursor.is_some_and(|previous| tail <= previous) {
            warn!("{} returned ids not after cursor {:?}; stopping", name, cursor);
            break;
        }

        let outcome = if source.look_ahead() && !is_last {
            let (outcome, next) = tokio::join!(process_page(source, &page), async {
                tokio::time::sleep(delay).await;
                fetch_page(source, ctx, Some(tail), limit).await
            });
            prefetched = Some(next);
            outcome
        } else {
            process_page(source, &page).await
        };

        stats.pages += 1;
        stats.skipped += outcome.skipped;
        match outcome.result {
            Ok(written) => {
                consecutive_errors = 0;
                stats.processed += written;
                ctx.counters.add(written, 0);
            }
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => {
                consecutive_errors += 1;
                warn!("⚠️ {} write of page ending at {} failed: {}", name, tail, e);
                stats.failed += outcome.attempted;
                ctx.counters.add(0, outcome.attempted);
                page_error(ctx, &mut stats, consecutive_errors, &e)?;
            }
        }

        cursor = Some(tail);
        ctx.save_checkpoint(&key, tail).await;
        stats.page_cursors.push(tail);
        ctx.report(
            format!("{name}: page {}", stats.pages),
            cursor,
            json!({ "page_records": page.len(), "skipped": outcome.skipped }),
        )
        .await?;

        if is_last {
            break;
        }
        if prefetched.is_none() {
            tokio::time::sleep(delay).await;
        }
    }

    info!(
        "✅ {} done: {} pages, {} processed, {} failed, {} skipped",
        name, stats.pages, stats.processed, stats.failed, stats.skipped
    );
    Ok(stats)
}
