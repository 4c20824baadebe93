//! Manual orphan cleanup
//!
//! `cleanup_orphaned` finds the gaps between the ranges this node owns and
//! purges at most one gap that still holds documents per call. Callers
//! repeat until `remaining_ranges` reaches zero.
//!
//! A gap overlapping a pending range or a queued deletion task is left
//! alone: pending data may be about to become owned again, and queued data
//! is already someone's responsibility.

use ferry_core::{CollectionId, FerryResult, KeyRange};
use tracing::{debug, info};

use crate::context::NodeContext;
use crate::ownership::Classification;

/// Result of one cleanup call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOrphanedResponse {
    /// Unowned, unblocked ranges inspected
    pub examined_ranges: usize,
    /// Blocked ranges (pending or queued) left alone
    pub skipped_ranges: usize,
    /// Range purged by this call
    pub range_deleted: Option<KeyRange>,
    /// Documents deleted by this call
    pub docs_deleted: u64,
    /// Inspected ranges still holding documents after this call
    pub remaining_ranges: usize,
}

pub(crate) fn cleanup_orphaned(
    ctx: &NodeContext,
    collection: &CollectionId,
) -> FerryResult<CleanupOrphanedResponse> {
    ctx.ownership.check_serving(collection)?;
    ctx.ownership.refresh(ctx.authority.as_ref(), collection)?;
    let Some(gaps) = ctx.ownership.unowned_ranges(collection) else {
        return Ok(CleanupOrphanedResponse {
            examined_ranges: 0,
            skipped_ranges: 0,
            range_deleted: None,
            docs_deleted: 0,
            remaining_ranges: 0,
        });
    };

    let mut blocked = ctx.ownership.pending_ranges(collection);
    for task in ctx.deleter.queue().tasks(collection) {
        if !blocked.contains(&task.range) {
            blocked.push(task.range);
        }
    }
    let candidates: Vec<KeyRange> = gaps.iter().flat_map(|g| g.subtract(&blocked)).collect();

    let batch = ctx.config.range_deleter_batch_size.max(1);
    let mut range_deleted = None;
    let mut docs_deleted = 0u64;
    if let Some(target) = candidates
        .iter()
        .find(|r| ctx.store.count_in_range(collection, r) > 0)
    {
        loop {
            let n = ctx
                .store
                .delete_range_batch(collection, target, batch, |key| {
                    ctx.ownership.classify(collection, key) != Classification::Orphaned
                        || blocked.iter().any(|b| b.contains(key))
                });
            docs_deleted += n as u64;
            if n < batch {
                break;
            }
            debug!(target: "ferry::node", collection = %collection, range = %target, deleted = docs_deleted, "Orphan cleanup batch");
        }
        range_deleted = Some(target.clone());
    }

    let remaining_ranges = candidates
        .iter()
        .filter(|r| ctx.store.count_in_range(collection, r) > 0)
        .count();
    let response = CleanupOrphanedResponse {
        examined_ranges: candidates.len(),
        skipped_ranges: blocked.len(),
        range_deleted,
        docs_deleted,
        remaining_ranges,
    };
    info!(
        target: "ferry::node",
        collection = %collection,
        examined = response.examined_ranges,
        skipped = response.skipped_ranges,
        deleted = response.docs_deleted,
        remaining = response.remaining_ranges,
        "Orphan cleanup pass"
    );
    Ok(response)
}
