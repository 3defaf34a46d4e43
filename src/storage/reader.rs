use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

use crate::models::datasets::blocks::StoredBlock;
use crate::models::datasets::stats::{BlockPage, BlockStats, DailyStats, IssuerStats};
use crate::models::errors::StoreError;
use crate::storage::{BlockReader, DurableStore, clamp_page};

/// Dashboard-facing read path. Store failures are logged and rendered as
/// empty or zero-valued results so viewers never see an error.
#[derive(Clone)]
pub struct AggregationReader {
    store: Arc<dyn DurableStore>,
}

fn or_empty<T: Default>(query: &str, result: Result<T, StoreError>) -> T {
    result.unwrap_or_else(|e| {
        warn!("Dashboard query '{}' failed, returning empty result: {}", query, e);
        T::default()
    })
}

impl AggregationReader {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub async fn stats(&self) -> BlockStats {
        or_empty("stats", self.store.stats().await)
    }

    pub async fn paginated(&self, page: u64, page_size: u64) -> BlockPage {
        let (page, page_size) = clamp_page(page, page_size);
        self.store
            .paginated(page, page_size)
            .await
            .unwrap_or_else(|e| {
                warn!("Dashboard query 'paginated' failed, returning empty page: {}", e);
                BlockPage {
                    items: Vec::new(),
                    page,
                    page_size,
                    total: 0,
                }
            })
    }

    pub async fn by_height_range(&self, from: u64, to: u64) -> Vec<StoredBlock> {
        if from > to {
            return Vec::new();
        }
        or_empty("by_height_range", self.store.by_height_range(from, to).await)
    }

    pub async fn by_issuer(&self, issuer: &str, limit: u64) -> Vec<StoredBlock> {
        or_empty("by_issuer", self.store.by_issuer(issuer, limit).await)
    }

    pub async fn by_date_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<StoredBlock> {
        if from > to {
            return Vec::new();
        }
        or_empty("by_date_range", self.store.by_date_range(from, to).await)
    }

    pub async fn latest(&self, limit: u64) -> Vec<StoredBlock> {
        or_empty("latest", self.store.latest(limit).await)
    }

    pub async fn by_id(&self, block_id: &str) -> Option<StoredBlock> {
        or_empty("by_id", self.store.by_id(block_id).await)
    }

    pub async fn issuer_distribution(&self, limit: u64) -> Vec<IssuerStats> {
        or_empty(
            "issuer_distribution",
            self.store.issuer_distribution(limit).await,
        )
    }

    pub async fn daily_stats(&self, days: u64) -> Vec<DailyStats> {
        or_empty("daily_stats", self.store.daily_stats(days).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BlockStore;
    use crate::storage::memory::InMemoryStore;
    use chrono::TimeZone;

    use crate::models::datasets::blocks::CanonicalBlock;

    #[tokio::test]
    async fn test_failures_degrade_to_empty() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert(&CanonicalBlock {
                block_id: "b1".to_string(),
                block_height: 1,
                block_slot: 1,
                block_size: 1,
                issuer: "p".to_string(),
                tx_count: 1,
                ada_output: 1,
                fees: 1,
                date_time: Utc::now(),
            })
            .await
            .unwrap();
        store.fail_reads(true);

        let reader = AggregationReader::new(store.clone());
        assert_eq!(reader.stats().await, BlockStats::default());
        assert!(reader.latest(10).await.is_empty());
        assert!(reader.by_id("b1").await.is_none());
        assert!(reader.issuer_distribution(5).await.is_empty());
        assert!(reader.daily_stats(7).await.is_empty());

        let page = reader.paginated(0, 1000).await;
        assert_eq!((page.page, page.page_size, page.total), (1, 100, 0));

        store.fail_reads(false);
        assert_eq!(reader.stats().await.total_blocks, 1);
        assert!(reader.by_id("b1").await.is_some());
    }

    #[tokio::test]
    async fn test_out_of_range_page_is_empty() {
        let reader = AggregationReader::new(Arc::new(InMemoryStore::new()));
        let page = reader.paginated(u64::MAX, 100).await;
        assert!(page.items.is_empty());
        assert_eq!((page.page, page.page_size, page.total), (u64::MAX, 100, 0));
    }

    #[tokio::test]
    async fn test_inverted_ranges_are_empty() {
        let reader = AggregationReader::new(Arc::new(InMemoryStore::new()));
        assert!(reader.by_height_range(10, 1).await.is_empty());
        let later = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(reader.by_date_range(later, earlier).await.is_empty());
    }
}
