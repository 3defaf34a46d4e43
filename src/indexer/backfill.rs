use anyhow::Result;
use std::collections::HashSet;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::storage::BlockStore;
use crate::storage::window::WindowHandle;

/// Persist window records the store does not have yet, in one batch.
///
/// A record whose existence check fails is written anyway. Returns the number
/// of rows the store accepted.
pub async fn backfill_window<S>(window: &WindowHandle, store: &S) -> Result<usize>
where
    S: BlockStore + ?Sized,
{
    let snapshot = window.snapshot().await?;
    let mut seen = HashSet::new();
    let mut missing = Vec::new();

    for block in snapshot {
        if !seen.insert(block.block_id.clone()) {
            continue;
        }
        match store.exists(&block.block_id).await {
            Ok(true) => {}
            Ok(false) => missing.push(block),
            Err(e) => {
                warn!(
                    "Existence check for block {} failed during backfill, including it: {}",
                    block.block_id, e
                );
                missing.push(block);
            }
        }
    }

    if missing.is_empty() {
        info!("Backfill found nothing to write");
        return Ok(0);
    }

    let start = Instant::now();
    let result = store.insert_batch(&missing).await;
    if let Some(metrics) = Metrics::global() {
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics.record_store_operation("insert_batch", outcome, start.elapsed().as_secs_f64());
        metrics.record_store_batch_size(missing.len());
    }

    let written = result?;
    info!(
        "Backfilled {} blocks from the window into {}",
        written,
        store.backend_type()
    );
    Ok(written)
}
