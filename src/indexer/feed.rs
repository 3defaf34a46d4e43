use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::datasets::blocks::RawBlockPayload;

/// How one delivered payload was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    AlreadyExists,
    StoreFailed,
    Malformed,
}

/// Acknowledgment handed back to the feed once per delivered payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceSignal {
    pub outcome: IngestOutcome,
}

impl AdvanceSignal {
    pub fn new(outcome: IngestOutcome) -> Self {
        Self { outcome }
    }
}

/// Upstream chain-sync feed. The transport behind it is external; this is
/// the delivery/acknowledgment contract the coordinator drives.
#[async_trait]
pub trait BlockFeed: Send {
    /// Next decoded payload, or `None` once the feed has ended.
    async fn next_block(&mut self) -> Result<Option<RawBlockPayload>>;

    /// Called exactly once per payload returned by `next_block`.
    async fn advance(&mut self, signal: AdvanceSignal) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Newline-delimited JSON payloads, e.g. piped from a chain-sync bridge.
pub struct JsonLinesFeed<R> {
    reader: R,
    line: String,
    line_number: u64,
    delivered: u64,
    acknowledged: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesFeed<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_number: 0,
            delivered: 0,
            acknowledged: 0,
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn acknowledged(&self) -> u64 {
        self.acknowledged
    }
}

impl JsonLinesFeed<BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl JsonLinesFeed<BufReader<tokio::fs::File>> {
    pub async fn open(path: &str) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open feed file '{path}'"))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> BlockFeed for JsonLinesFeed<R> {
    async fn next_block(&mut self) -> Result<Option<RawBlockPayload>> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_line(&mut self.line)
                .await
                .context("failed to read from block feed")?;
            if read == 0 {
                info!(
                    "Block feed ended after {} lines ({} payloads delivered)",
                    self.line_number, self.delivered
                );
                return Ok(None);
            }
            self.line_number += 1;

            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<RawBlockPayload>(line) {
                Ok(payload) => {
                    self.delivered += 1;
                    return Ok(Some(payload));
                }
                Err(e) => {
                    // Not a payload at all, so nothing to acknowledge
                    warn!(
                        "Skipping undecodable feed line {}: {}",
                        self.line_number, e
                    );
                }
            }
        }
    }

    async fn advance(&mut self, signal: AdvanceSignal) -> Result<()> {
        self.acknowledged += 1;
        debug!(
            "Feed advanced past line {} ({:?})",
            self.line_number, signal.outcome
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "json-lines"
    }
}

/// In-process feed backed by an mpsc channel. Acknowledgments are forwarded to
/// `acks` when one is attached.
pub struct ChannelFeed {
    rx: mpsc::Receiver<RawBlockPayload>,
    acks: Option<mpsc::UnboundedSender<AdvanceSignal>>,
}

impl ChannelFeed {
    pub fn new(rx: mpsc::Receiver<RawBlockPayload>) -> Self {
        Self { rx, acks: None }
    }

    pub fn with_acks(
        rx: mpsc::Receiver<RawBlockPayload>,
        acks: mpsc::UnboundedSender<AdvanceSignal>,
    ) -> Self {
        Self {
            rx,
            acks: Some(acks),
        }
    }
}

#[async_trait]
impl BlockFeed for ChannelFeed {
    async fn next_block(&mut self) -> Result<Option<RawBlockPayload>> {
        Ok(self.rx.recv().await)
    }

    async fn advance(&mut self, signal: AdvanceSignal) -> Result<()> {
        if let Some(acks) = &self.acks {
            acks.send(signal)
                .map_err(|_| anyhow::anyhow!("acknowledgment receiver dropped"))?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}
