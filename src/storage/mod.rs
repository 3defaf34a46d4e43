pub mod bigquery;
pub mod memory;
pub mod reader;
pub mod window;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::models::common::{StoreBackend, StoreConfig};
use crate::models::datasets::blocks::{CanonicalBlock, StoredBlock};
use crate::models::datasets::stats::{BlockPage, BlockStats, DailyStats, IssuerStats};
use crate::models::errors::StoreError;
use crate::utils::truncate_to_seconds;

pub const MAX_PAGE_SIZE: u64 = 100;

/// Result of a deduplicating write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted,
    AlreadyExists,
}

/// Write side of the durable store. `block_id` is the natural key, but the
/// store itself does not enforce uniqueness.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn exists(&self, block_id: &str) -> Result<bool, StoreError>;

    /// Write one block. Implementations stamp `inserted_at` and make sure both
    /// timestamps carry no sub-second component.
    async fn insert(&self, block: &CanonicalBlock) -> Result<StoredBlock, StoreError>;

    /// Bulk path for backfills. Returns the number of rows accepted.
    async fn insert_batch(&self, blocks: &[CanonicalBlock]) -> Result<usize, StoreError>;

    fn backend_type(&self) -> &'static str;
}

/// Read-only aggregate queries. Ordered by `block_height` descending unless noted.
#[async_trait]
pub trait BlockReader: Send + Sync {
    async fn stats(&self) -> Result<BlockStats, StoreError>;

    /// `page` is 1-based.
    async fn paginated(&self, page: u64, page_size: u64) -> Result<BlockPage, StoreError>;

    /// Inclusive on both ends.
    async fn by_height_range(&self, from: u64, to: u64) -> Result<Vec<StoredBlock>, StoreError>;

    async fn by_issuer(&self, issuer: &str, limit: u64) -> Result<Vec<StoredBlock>, StoreError>;

    /// Filters on `date_time`, inclusive on both ends.
    async fn by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredBlock>, StoreError>;

    async fn latest(&self, limit: u64) -> Result<Vec<StoredBlock>, StoreError>;

    async fn by_id(&self, block_id: &str) -> Result<Option<StoredBlock>, StoreError>;

    /// Issuers ordered by block count descending.
    async fn issuer_distribution(&self, limit: u64) -> Result<Vec<IssuerStats>, StoreError>;

    /// One row per day of `date_time` for the last `days` days, newest day first.
    async fn daily_stats(&self, days: u64) -> Result<Vec<DailyStats>, StoreError>;
}

/// A store usable for both ingestion and dashboard reads.
pub trait DurableStore: BlockStore + BlockReader {}

impl<T: BlockStore + BlockReader> DurableStore for T {}

/// Check-then-insert by `block_id`.
///
/// Not atomic against other writers of the same block. When the existence
/// check itself fails, the insert is attempted anyway: a duplicate row can be
/// cleaned up later, a dropped block cannot.
pub async fn persist_if_new<S>(store: &S, block: &CanonicalBlock) -> Result<PersistOutcome, StoreError>
where
    S: BlockStore + ?Sized,
{
    let start = Instant::now();
    match store.exists(&block.block_id).await {
        Ok(true) => {
            record_store_metric("exists", "hit", start);
            debug!(
                "Block {} (height {}) already stored in {}, skipping insert",
                block.block_id,
                block.block_height,
                store.backend_type()
            );
            return Ok(PersistOutcome::AlreadyExists);
        }
        Ok(false) => record_store_metric("exists", "miss", start),
        Err(e) => {
            record_store_metric("exists", "error", start);
            warn!(
                "Existence check for block {} failed, inserting anyway: {}",
                block.block_id, e
            );
        }
    }

    let start = Instant::now();
    match store.insert(block).await {
        Ok(stored) => {
            record_store_metric("insert", "ok", start);
            info!(
                "Stored block {} (height {}) at {}",
                stored.block.block_id, stored.block.block_height, stored.inserted_at
            );
            Ok(PersistOutcome::Inserted)
        }
        Err(e) => {
            record_store_metric("insert", "error", start);
            Err(e)
        }
    }
}

/// Stamp a block for writing: `inserted_at` is now, both timestamps truncated to seconds.
pub fn prepare_row(block: &CanonicalBlock, inserted_at: DateTime<Utc>) -> StoredBlock {
    let mut block = block.clone();
    block.date_time = truncate_to_seconds(block.date_time);
    StoredBlock {
        block,
        inserted_at: truncate_to_seconds(inserted_at),
    }
}

pub fn clamp_page(page: u64, page_size: u64) -> (u64, u64) {
    (page.max(1), page_size.clamp(1, MAX_PAGE_SIZE))
}

fn record_store_metric(operation: &'static str, outcome: &'static str, start: Instant) {
    if let Some(metrics) = Metrics::global() {
        metrics.record_store_operation(operation, outcome, start.elapsed().as_secs_f64());
    }
}

/// Build the configured store. BigQuery datasets and tables are created if missing.
pub async fn initialize_storage(chain_name: &str, config: &StoreConfig) -> anyhow::Result<Arc<dyn DurableStore>> {
    info!(
        "Initializing {:?} storage for chain: {}",
        config.backend, chain_name
    );

    let store: Arc<dyn DurableStore> = match config.backend {
        StoreBackend::BigQuery => {
            let store = bigquery::BigQueryStore::connect(config).await?;
            store.create_dataset(&config.dataset_location).await?;
            store.create_table().await?;
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; blocks will not survive a restart");
            Arc::new(memory::InMemoryStore::new())
        }
    };

    info!("Storage initialized successfully ({})", store.backend_type());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    use crate::storage::memory::InMemoryStore;

    fn block(id: &str) -> CanonicalBlock {
        CanonicalBlock {
            block_id: id.to_string(),
            block_height: 7,
            block_slot: 140,
            block_size: 512,
            issuer: "pool123".to_string(),
            tx_count: 2,
            ada_output: 8_000_000,
            fees: 300_000,
            date_time: Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_persist_if_new_is_idempotent() -> anyhow::Result<()> {
        let store = InMemoryStore::new();

        assert_eq!(persist_if_new(&store, &block("b1")).await?, PersistOutcome::Inserted);
        assert_eq!(
            persist_if_new(&store, &block("b1")).await?,
            PersistOutcome::AlreadyExists
        );

        assert_eq!(store.row_count().await, 1);
        assert_eq!(store.insert_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_lookup_failure_still_inserts() -> anyhow::Result<()> {
        let store = InMemoryStore::new();
        store.fail_lookups(true);

        assert_eq!(persist_if_new(&store, &block("b1")).await?, PersistOutcome::Inserted);
        // Still uncertain on the second delivery, so a duplicate row is accepted
        assert_eq!(persist_if_new(&store, &block("b1")).await?, PersistOutcome::Inserted);
        assert_eq!(store.row_count().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let store = InMemoryStore::new();
        store.fail_writes(true);

        let err = persist_if_new(&store, &block("b1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert_eq!(store.row_count().await, 0);
    }

    #[test]
    fn test_prepare_row_truncates_timestamps() {
        let mut raw = block("b1");
        raw.date_time = raw.date_time.with_nanosecond(250_000_123).unwrap();
        let inserted_at = Utc
            .with_ymd_and_hms(2024, 6, 1, 8, 0, 3)
            .unwrap()
            .with_nanosecond(999_999_000)
            .unwrap();

        let row = prepare_row(&raw, inserted_at);
        assert_eq!(row.block.date_time.nanosecond(), 0);
        assert_eq!(row.inserted_at.nanosecond(), 0);
        assert_eq!(row.inserted_at.second(), 3);
    }

    #[test]
    fn test_clamp_page() {
        assert_eq!(clamp_page(0, 0), (1, 1));
        assert_eq!(clamp_page(3, 500), (3, MAX_PAGE_SIZE));
        assert_eq!(clamp_page(2, 25), (2, 25));
    }
}
