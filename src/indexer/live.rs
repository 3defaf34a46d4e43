use tokio::sync::broadcast;
use tracing::trace;

use crate::metrics::Metrics;
use crate::models::datasets::blocks::BlockEvent;

/// Fan-out of `new_block` events to live dashboard subscribers.
///
/// Publishing never waits: with no subscribers the event is dropped, and a
/// subscriber that falls behind skips the events it missed.
#[derive(Clone, Debug)]
pub struct LiveChannel {
    tx: broadcast::Sender<BlockEvent>,
}

impl LiveChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of subscribers the event reached.
    pub fn publish(&self, event: BlockEvent) -> usize {
        let block_id = event.block.block_id.clone();
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!("Published block {} to {} live subscribers", block_id, delivered);
        if let Some(metrics) = Metrics::global() {
            metrics.record_live_event();
        }
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BlockEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
