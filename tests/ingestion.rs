use std::sync::Arc;

use anyhow::Result;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

use cardano_block_indexer::indexer::{
    AdvanceSignal, ChannelFeed, Coordinator, IngestOutcome, LiveChannel, backfill_window,
};
use cardano_block_indexer::models::datasets::blocks::RawBlockPayload;
use cardano_block_indexer::storage::memory::InMemoryStore;
use cardano_block_indexer::storage::reader::AggregationReader;
use cardano_block_indexer::storage::window::WindowHandle;

fn b1_payload() -> RawBlockPayload {
    RawBlockPayload(json!({
        "id": "b1",
        "height": 10_512_033,
        "slot": 131_452_800,
        "size": 4_096,
        "issuer": "pool123",
        "transactions": [
            {
                "fee": 100000,
                "outputs": [
                    { "value": { "ada": { "lovelace": 2000000 } } },
                    { "value": { "ada": { "lovelace": 3000000 } } }
                ]
            },
            {
                "fee": "200000",
                "outputs": [{ "value": 3000000 }]
            }
        ]
    }))
}

fn numbered_payload(height: u64) -> RawBlockPayload {
    RawBlockPayload(json!({
        "id": format!("block-{height}"),
        "height": height,
        "slot": height * 20,
        "issuer": { "poolId": format!("pool{}", height % 3), "vrfVerificationKey": "vrf" },
        "transactions": []
    }))
}

struct Harness {
    coordinator: Coordinator,
    store: Arc<InMemoryStore>,
    window: WindowHandle,
    live: LiveChannel,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let window = WindowHandle::spawn(10);
    let live = LiveChannel::new(64);
    let coordinator = Coordinator::new(window.clone(), store.clone(), live.clone());
    Harness {
        coordinator,
        store,
        window,
        live,
    }
}

async fn run_feed(harness: &Harness, payloads: Vec<RawBlockPayload>) -> Result<Vec<AdvanceSignal>> {
    let (tx, rx) = mpsc::channel(payloads.len().max(1));
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
    let mut feed = ChannelFeed::with_acks(rx, ack_tx);
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let delivered = payloads.len() as u64;
    for payload in payloads {
        tx.send(payload).await?;
    }
    drop(tx);

    let handled = harness.coordinator.run(&mut feed, shutdown_rx).await?;
    assert_eq!(handled, delivered);

    let mut signals = Vec::new();
    while let Ok(signal) = ack_rx.try_recv() {
        signals.push(signal);
    }
    Ok(signals)
}

#[tokio::test]
async fn test_b1_delivered_twice() -> Result<()> {
    let harness = harness();
    let mut events = harness.live.subscribe();

    let first = harness.coordinator.on_block(b1_payload()).await;
    assert_eq!(first.outcome, IngestOutcome::Inserted);

    let event = events.recv().await?;
    assert_eq!(event.block.block_id, "b1");
    assert_eq!(event.block.tx_count, 2);
    assert_eq!(event.block.fees, 300_000);
    assert_eq!(event.block.ada_output, 8_000_000);
    assert_eq!(event.block.issuer, "pool123");

    let second = harness.coordinator.on_block(b1_payload()).await;
    assert_eq!(second.outcome, IngestOutcome::AlreadyExists);

    assert_eq!(harness.store.row_count().await, 1);
    assert_eq!(harness.store.insert_calls(), 1);

    let window = harness.window.snapshot().await?;
    assert_eq!(window.len(), 2);
    assert!(window.iter().all(|block| block.block_id == "b1"));
    Ok(())
}

#[tokio::test]
async fn test_feed_advances_once_per_payload_for_every_outcome() -> Result<()> {
    let harness = harness();

    let mut signals = run_feed(
        &harness,
        vec![b1_payload(), RawBlockPayload(json!({ "id": "bad" })), b1_payload()],
    )
    .await?;

    harness.store.fail_writes(true);
    signals.extend(run_feed(&harness, vec![numbered_payload(7)]).await?);

    let outcomes: Vec<IngestOutcome> = signals.iter().map(|signal| signal.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            IngestOutcome::Inserted,
            IngestOutcome::Malformed,
            IngestOutcome::AlreadyExists,
            IngestOutcome::StoreFailed,
        ]
    );

    // The block whose write failed is still on display
    let window = harness.window.snapshot().await?;
    assert_eq!(window.first().map(|block| block.block_id.as_str()), Some("block-7"));
    assert_eq!(harness.coordinator.skipped(), 1);
    Ok(())
}

#[tokio::test]
async fn test_window_keeps_ten_newest_and_backfill_recovers_failed_writes() -> Result<()> {
    let harness = harness();
    let mut events = harness.live.subscribe();

    harness.store.fail_writes(true);
    let payloads = (1..=15).map(numbered_payload).collect();
    let signals = run_feed(&harness, payloads).await?;
    assert!(signals.iter().all(|signal| signal.outcome == IngestOutcome::StoreFailed));
    assert_eq!(harness.store.row_count().await, 0);

    let window = harness.window.snapshot().await?;
    let heights: Vec<u64> = window.iter().map(|block| block.block_height).collect();
    assert_eq!(heights, (6..=15).rev().collect::<Vec<_>>());
    assert_eq!(window[0].issuer, "pool0");

    let mut published = 0;
    while events.try_recv().is_ok() {
        published += 1;
    }
    assert_eq!(published, 15);

    harness.store.fail_writes(false);
    let written = backfill_window(&harness.window, harness.store.as_ref()).await?;
    assert_eq!(written, 10);

    let reader = AggregationReader::new(harness.store.clone());
    let stats = reader.stats().await;
    assert_eq!(stats.total_blocks, 10);
    assert_eq!(stats.latest_height, 15);

    let latest = reader.latest(3).await;
    let latest_heights: Vec<u64> = latest.iter().map(|row| row.block.block_height).collect();
    assert_eq!(latest_heights, vec![15, 14, 13]);

    let stored: Value = serde_json::to_value(&latest[0])?;
    assert_eq!(stored["block_id"], json!("block-15"));
    assert!(stored.get("inserted_at").is_some());
    Ok(())
}
