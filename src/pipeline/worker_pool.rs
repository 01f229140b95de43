//! Bounded concurrent processing of one chunk's items.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info};

use crate::annotator::Annotator;
use crate::storage::{AnnotationStatus, ResultSink, WorkItem};

/// Tally of one chunk's attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Items attempted (skipped items are not counted).
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Items skipped because a completed record already existed.
    pub skipped: u64,
}

/// Runs every item of a chunk through the annotator, at most `max_workers`
/// at a time, upserting each record as soon as its item finishes.
///
/// Items already completed for this backend are skipped unless
/// `force_rerun` is set. The function returns only after every item has
/// been attempted and its record handed to the sink, so the caller may
/// checkpoint the chunk afterwards.
pub async fn process_chunk(
    annotator: Arc<Annotator>,
    sink: Arc<dyn ResultSink>,
    items: Vec<WorkItem>,
    max_workers: usize,
    force_rerun: bool,
) -> ChunkOutcome {
    let backend = annotator.backend_id().to_string();
    let mut outcome = ChunkOutcome::default();

    let items = if force_rerun {
        items
    } else {
        let ids: Vec<i64> = items.iter().map(|item| item.id).collect();
        let done = sink.completed_ids(&ids, &backend).await;
        if !done.is_empty() {
            debug!(
                backend = %backend,
                skipped = done.len(),
                "Skipping items with completed records"
            );
        }
        outcome.skipped = done.len() as u64;
        items
            .into_iter()
            .filter(|item| !done.contains(&item.id))
            .collect()
    };

    let workers = max_workers.max(1);
    let mut results = stream::iter(items.into_iter().map(|item| {
        let annotator = Arc::clone(&annotator);
        async move { annotator.annotate(&item).await }
    }))
    .buffer_unordered(workers);

    while let Some(record) = results.next().await {
        outcome.processed += 1;
        match record.status {
            AnnotationStatus::Completed => outcome.succeeded += 1,
            AnnotationStatus::Failed => outcome.failed += 1,
        }
        // Per-item durability: the record lands before the next completion
        // is tallied, never batched until chunk end.
        sink.upsert(record).await;
    }

    info!(
        backend = %backend,
        processed = outcome.processed,
        succeeded = outcome.succeeded,
        failed = outcome.failed,
        skipped = outcome.skipped,
        "Chunk complete"
    );
    outcome
}
