use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::indexer::feed::{AdvanceSignal, BlockFeed, IngestOutcome};
use crate::indexer::live::LiveChannel;
use crate::indexer::transformations::blocks::BlockTransformer;
use crate::metrics::Metrics;
use crate::models::datasets::blocks::{BlockEvent, RawBlockPayload};
use crate::storage::window::WindowHandle;
use crate::storage::{DurableStore, PersistOutcome, persist_if_new};

/// Runs once per delivered payload: normalize, push to the window, persist,
/// publish. Holds no per-block state; everything lives in the window and the store.
#[derive(Clone)]
pub struct Coordinator {
    window: WindowHandle,
    store: Arc<dyn DurableStore>,
    live: LiveChannel,
    skipped: Arc<AtomicU64>,
}

impl Coordinator {
    pub fn new(window: WindowHandle, store: Arc<dyn DurableStore>, live: LiveChannel) -> Self {
        Self {
            window,
            store,
            live,
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of malformed payloads skipped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Handle one payload. Never fails: every outcome becomes an [`AdvanceSignal`].
    pub async fn on_block(&self, payload: RawBlockPayload) -> AdvanceSignal {
        let start = Instant::now();
        let metrics = Metrics::global();
        if let Some(metrics) = metrics {
            metrics.record_block_received();
        }

        let block = match payload.transform_block(Utc::now()) {
            Ok(block) => block,
            Err(e) => {
                let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Skipping malformed payload ({} skipped so far): {}", skipped, e);
                if let Some(metrics) = metrics {
                    metrics.record_block_malformed();
                }
                return AdvanceSignal::new(IngestOutcome::Malformed);
            }
        };

        // Window and store are independent; neither waits on the other
        let (pushed, persisted) = tokio::join!(
            self.window.push(block.clone()),
            persist_if_new(self.store.as_ref(), &block)
        );

        match pushed {
            Ok(Some(evicted)) => debug!(
                "Evicted block {} (height {}) from the window",
                evicted.block_id, evicted.block_height
            ),
            Ok(None) => {}
            Err(e) => error!("Failed to push block {} into the window: {}", block.block_id, e),
        }

        let outcome = match persisted {
            Ok(PersistOutcome::Inserted) => IngestOutcome::Inserted,
            Ok(PersistOutcome::AlreadyExists) => IngestOutcome::AlreadyExists,
            Err(e) => {
                error!(
                    "Failed to persist block {} (height {}): {}",
                    block.block_id, block.block_height, e
                );
                IngestOutcome::StoreFailed
            }
        };

        let block_height = block.block_height;
        self.live.publish(BlockEvent::new_block(block, true));

        if let Some(metrics) = metrics {
            metrics.record_block_processed(block_height, start.elapsed().as_secs_f64());
        }

        AdvanceSignal::new(outcome)
    }

    /// Drive `feed` until it ends or `shutdown` fires. The feed is advanced
    /// exactly once per delivered payload. Returns the number of payloads handled.
    pub async fn run<F>(&self, feed: &mut F, mut shutdown: broadcast::Receiver<()>) -> Result<u64>
    where
        F: BlockFeed + ?Sized,
    {
        info!("Starting ingestion from {} feed", feed.name());
        let mut handled = 0u64;
        let mut listening = true;

        loop {
            let next = tokio::select! {
                signal = shutdown.recv(), if listening => match signal {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        info!("Shutdown signal received, stopping ingestion");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // No signal can arrive any more; keep ingesting until the feed ends
                        warn!("Shutdown channel closed without a signal, ingestion continues");
                        listening = false;
                        continue;
                    }
                },
                next = feed.next_block() => next?,
            };

            let Some(payload) = next else {
                info!("Feed exhausted");
                break;
            };

            // A payload in flight is finished before shutdown is honoured
            let signal = self.on_block(payload).await;
            feed.advance(signal).await?;
            handled += 1;
        }

        info!(
            "Ingestion stopped after {} payloads ({} malformed)",
            handled,
            self.skipped()
        );
        Ok(handled)
    }
}
