use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::metrics::Metrics;
use crate::models::common::DEFAULT_WINDOW_CAPACITY;
use crate::models::datasets::blocks::CanonicalBlock;
use crate::models::errors::WindowError;

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Fixed-capacity, newest-first sequence of recent blocks.
///
/// Pushes never look at `block_id`; a redelivered block shows up twice.
#[derive(Debug)]
pub struct BlockWindow {
    blocks: VecDeque<CanonicalBlock>,
    capacity: usize,
}

impl BlockWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            blocks: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Prepend a block. Returns the oldest block if the window overflowed.
    pub fn push(&mut self, block: CanonicalBlock) -> Option<CanonicalBlock> {
        self.blocks.push_front(block);
        if self.blocks.len() > self.capacity {
            self.blocks.pop_back()
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> Vec<CanonicalBlock> {
        self.blocks.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn size(&self) -> usize {
        self.blocks.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for BlockWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

enum WindowCommand {
    Push {
        block: CanonicalBlock,
        reply: oneshot::Sender<Option<CanonicalBlock>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<CanonicalBlock>>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    Size {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the task that owns the [`BlockWindow`].
///
/// Every operation is a message to that single task, so concurrent producers
/// are serialized and snapshots are never torn. The task exits once the last
/// handle is dropped.
#[derive(Clone, Debug)]
pub struct WindowHandle {
    tx: mpsc::Sender<WindowCommand>,
}

impl std::fmt::Debug for WindowCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowCommand::Push { block, .. } => write!(f, "Push({})", block.block_id),
            WindowCommand::Snapshot { .. } => write!(f, "Snapshot"),
            WindowCommand::Clear { .. } => write!(f, "Clear"),
            WindowCommand::Size { .. } => write!(f, "Size"),
        }
    }
}

impl WindowHandle {
    pub fn spawn(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        tokio::spawn(run_window(BlockWindow::new(capacity), rx));
        Self { tx }
    }

    pub async fn push(&self, block: CanonicalBlock) -> Result<Option<CanonicalBlock>, WindowError> {
        let (reply, rx) = oneshot::channel();
        self.send(WindowCommand::Push { block, reply }).await?;
        rx.await.map_err(|_| WindowError::Closed)
    }

    pub async fn snapshot(&self) -> Result<Vec<CanonicalBlock>, WindowError> {
        let (reply, rx) = oneshot::channel();
        self.send(WindowCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| WindowError::Closed)
    }

    pub async fn clear(&self) -> Result<(), WindowError> {
        let (reply, rx) = oneshot::channel();
        self.send(WindowCommand::Clear { reply }).await?;
        rx.await.map_err(|_| WindowError::Closed)
    }

    pub async fn size(&self) -> Result<usize, WindowError> {
        let (reply, rx) = oneshot::channel();
        self.send(WindowCommand::Size { reply }).await?;
        rx.await.map_err(|_| WindowError::Closed)
    }

    async fn send(&self, command: WindowCommand) -> Result<(), WindowError> {
        self.tx.send(command).await.map_err(|_| WindowError::Closed)
    }
}

async fn run_window(mut window: BlockWindow, mut rx: mpsc::Receiver<WindowCommand>) {
    debug!("Block window started with capacity {}", window.capacity());

    while let Some(command) = rx.recv().await {
        // A dropped reply receiver only means the caller went away
        match command {
            WindowCommand::Push { block, reply } => {
                let evicted = window.push(block);
                if let Some(metrics) = Metrics::global() {
                    metrics.record_window(window.size(), evicted.is_some());
                }
                let _ = reply.send(evicted);
            }
            WindowCommand::Snapshot { reply } => {
                let _ = reply.send(window.snapshot());
            }
            WindowCommand::Clear { reply } => {
                window.clear();
                if let Some(metrics) = Metrics::global() {
                    metrics.record_window(0, false);
                }
                let _ = reply.send(());
            }
            WindowCommand::Size { reply } => {
                let _ = reply.send(window.size());
            }
        }
    }

    debug!("Block window shut down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn block(n: u64) -> CanonicalBlock {
        CanonicalBlock {
            block_id: format!("block-{n}"),
            block_height: n,
            block_slot: n * 20,
            block_size: 1024,
            issuer: "pool1".to_string(),
            tx_count: 0,
            ada_output: 0,
            fees: 0,
            date_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_window_keeps_newest_first() {
        let mut window = BlockWindow::default();
        let mut evictions = Vec::new();
        for n in 1..=13 {
            if let Some(evicted) = window.push(block(n)) {
                evictions.push(evicted.block_height);
            }
        }

        assert_eq!(window.size(), 10);
        assert_eq!(evictions, vec![1, 2, 3]);
        let heights: Vec<u64> = window.snapshot().iter().map(|b| b.block_height).collect();
        assert_eq!(heights, (4..=13).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_window_accepts_duplicates() {
        let mut window = BlockWindow::new(3);
        assert!(window.push(block(1)).is_none());
        assert!(window.push(block(1)).is_none());
        assert_eq!(window.size(), 2);
        assert!(window.snapshot().iter().all(|b| b.block_id == "block-1"));
    }

    #[tokio::test]
    async fn test_handle_push_snapshot_clear() -> anyhow::Result<()> {
        let handle = WindowHandle::spawn(10);
        let mut evictions = 0;
        for n in 1..=25 {
            if handle.push(block(n)).await?.is_some() {
                evictions += 1;
            }
        }

        assert_eq!(evictions, 15);
        assert_eq!(handle.size().await?, 10);

        let snapshot = handle.snapshot().await?;
        assert_eq!(snapshot.first().map(|b| b.block_height), Some(25));
        assert_eq!(snapshot.last().map(|b| b.block_height), Some(16));

        // Snapshots do not mutate
        assert_eq!(handle.snapshot().await?, snapshot);

        handle.clear().await?;
        assert_eq!(handle.size().await?, 0);
        assert!(handle.snapshot().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_producers_are_serialized() -> anyhow::Result<()> {
        let handle = WindowHandle::spawn(10);
        let mut tasks = Vec::new();
        for producer in 0..4u64 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let mut evicted = 0usize;
                for n in 0..50 {
                    if handle.push(block(producer * 1000 + n)).await?.is_some() {
                        evicted += 1;
                    }
                }
                Ok::<usize, WindowError>(evicted)
            }));
        }

        let mut total_evicted = 0;
        for task in futures::future::join_all(tasks).await {
            total_evicted += task??;
        }

        assert_eq!(total_evicted, 200 - 10);
        assert_eq!(handle.size().await?, 10);
        Ok(())
    }
}
