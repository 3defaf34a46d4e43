use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::models::datasets::blocks::{CanonicalBlock, StoredBlock};
use crate::models::datasets::stats::{BlockPage, BlockStats, DailyStats, IssuerStats};
use crate::models::errors::StoreError;
use crate::storage::{BlockReader, BlockStore, clamp_page, prepare_row};

const TABLE: &str = "memory.blocks";

/// Process-local store. Used for local runs without BigQuery credentials and in tests,
/// where write and lookup failures can be switched on.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: RwLock<Vec<StoredBlock>>,
    insert_calls: AtomicUsize,
    fail_writes: AtomicBool,
    fail_lookups: AtomicBool,
    fail_reads: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of insert and insert_batch calls that reached the store.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn rows(&self) -> Vec<StoredBlock> {
        self.rows.read().await.clone()
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::query("in-memory store is unavailable"));
        }
        Ok(())
    }

    async fn sorted_by_height(&self) -> Vec<StoredBlock> {
        let mut rows = self.rows.read().await.clone();
        rows.sort_by(|a, b| b.block.block_height.cmp(&a.block.block_height));
        rows
    }
}

#[async_trait]
impl BlockStore for InMemoryStore {
    async fn exists(&self, block_id: &str) -> Result<bool, StoreError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::lookup(block_id, "in-memory store is unavailable"));
        }
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .any(|row| row.block.block_id == block_id))
    }

    async fn insert(&self, block: &CanonicalBlock) -> Result<StoredBlock, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::write(TABLE, "in-memory store is unavailable"));
        }
        let row = prepare_row(block, Utc::now());
        self.rows.write().await.push(row.clone());
        Ok(row)
    }

    async fn insert_batch(&self, blocks: &[CanonicalBlock]) -> Result<usize, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::write(TABLE, "in-memory store is unavailable"));
        }
        let inserted_at = Utc::now();
        let mut rows = self.rows.write().await;
        rows.extend(blocks.iter().map(|block| prepare_row(block, inserted_at)));
        Ok(blocks.len())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl BlockReader for InMemoryStore {
    async fn stats(&self) -> Result<BlockStats, StoreError> {
        self.check_reads()?;
        let rows = self.rows.read().await;
        if rows.is_empty() {
            return Ok(BlockStats::default());
        }

        let total_blocks = rows.len() as u64;
        let total_transactions = saturating_sum(rows.iter().map(|r| r.block.tx_count));
        let total_fees = saturating_sum(rows.iter().map(|r| r.block.fees));
        let total_ada_output = saturating_sum(rows.iter().map(|r| r.block.ada_output));
        let total_size = saturating_sum(rows.iter().map(|r| r.block.block_size));
        let unique_issuers = rows
            .iter()
            .map(|r| r.block.issuer.as_str())
            .collect::<HashSet<_>>()
            .len() as u64;
        let latest_height = rows.iter().map(|r| r.block.block_height).max().unwrap_or(0);

        Ok(BlockStats {
            total_blocks,
            total_transactions,
            total_fees,
            total_ada_output,
            unique_issuers,
            latest_height,
            avg_block_size: total_size as f64 / total_blocks as f64,
            avg_tx_per_block: total_transactions as f64 / total_blocks as f64,
            avg_fees_per_block: total_fees as f64 / total_blocks as f64,
        })
    }

    async fn paginated(&self, page: u64, page_size: u64) -> Result<BlockPage, StoreError> {
        self.check_reads()?;
        let (page, page_size) = clamp_page(page, page_size);
        let rows = self.sorted_by_height().await;
        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(usize::try_from((page - 1).saturating_mul(page_size)).unwrap_or(usize::MAX))
            .take(page_size as usize)
            .collect();

        Ok(BlockPage {
            items,
            page,
            page_size,
            total,
        })
    }

    async fn by_height_range(&self, from: u64, to: u64) -> Result<Vec<StoredBlock>, StoreError> {
        self.check_reads()?;
        Ok(self
            .sorted_by_height()
            .await
            .into_iter()
            .filter(|r| (from..=to).contains(&r.block.block_height))
            .collect())
    }

    async fn by_issuer(&self, issuer: &str, limit: u64) -> Result<Vec<StoredBlock>, StoreError> {
        self.check_reads()?;
        Ok(self
            .sorted_by_height()
            .await
            .into_iter()
            .filter(|r| r.block.issuer == issuer)
            .take(limit as usize)
            .collect())
    }

    async fn by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredBlock>, StoreError> {
        self.check_reads()?;
        Ok(self
            .sorted_by_height()
            .await
            .into_iter()
            .filter(|r| r.block.date_time >= from && r.block.date_time <= to)
            .collect())
    }

    async fn latest(&self, limit: u64) -> Result<Vec<StoredBlock>, StoreError> {
        self.check_reads()?;
        Ok(self
            .sorted_by_height()
            .await
            .into_iter()
            .take(limit as usize)
            .collect())
    }

    async fn by_id(&self, block_id: &str) -> Result<Option<StoredBlock>, StoreError> {
        self.check_reads()?;
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .find(|r| r.block.block_id == block_id)
            .cloned())
    }

    async fn issuer_distribution(&self, limit: u64) -> Result<Vec<IssuerStats>, StoreError> {
        self.check_reads()?;
        let rows = self.rows.read().await;

        // issuer -> (blocks, fees, txs, size)
        let mut grouped: HashMap<&str, (u64, u64, u64, u64)> = HashMap::new();
        for row in rows.iter() {
            let entry = grouped.entry(row.block.issuer.as_str()).or_default();
            entry.0 += 1;
            entry.1 = entry.1.saturating_add(row.block.fees);
            entry.2 = entry.2.saturating_add(row.block.tx_count);
            entry.3 = entry.3.saturating_add(row.block.block_size);
        }

        let mut stats: Vec<IssuerStats> = grouped
            .into_iter()
            .map(|(issuer, (blocks, fees, txs, size))| IssuerStats {
                issuer: issuer.to_string(),
                block_count: blocks,
                total_fees: fees,
                avg_tx_count: txs as f64 / blocks as f64,
                avg_block_size: size as f64 / blocks as f64,
            })
            .collect();
        stats.sort_by(|a, b| {
            b.block_count
                .cmp(&a.block_count)
                .then_with(|| a.issuer.cmp(&b.issuer))
        });
        stats.truncate(limit as usize);
        Ok(stats)
    }

    async fn daily_stats(&self, days: u64) -> Result<Vec<DailyStats>, StoreError> {
        self.check_reads()?;
        // A window reaching past the earliest representable date keeps every row
        let cutoff = i64::try_from(days)
            .ok()
            .and_then(Duration::try_days)
            .and_then(|span| Utc::now().checked_sub_signed(span))
            .map(|start| start.date_naive());
        let rows = self.rows.read().await;

        let mut grouped: BTreeMap<NaiveDate, DailyStats> = BTreeMap::new();
        for row in rows.iter() {
            let day = row.block.date_time.date_naive();
            if cutoff.is_some_and(|cutoff| day <= cutoff) {
                continue;
            }
            let entry = grouped.entry(day).or_insert_with(|| DailyStats {
                day,
                block_count: 0,
                tx_count: 0,
                total_fees: 0,
                total_ada_output: 0,
            });
            entry.block_count += 1;
            entry.tx_count = entry.tx_count.saturating_add(row.block.tx_count);
            entry.total_fees = entry.total_fees.saturating_add(row.block.fees);
            entry.total_ada_output = entry.total_ada_output.saturating_add(row.block.ada_output);
        }

        Ok(grouped.into_values().rev().collect())
    }
}

// Totals clamp at u64::MAX rather than overflow
fn saturating_sum(values: impl Iterator<Item = u64>) -> u64 {
    values.fold(0, u64::saturating_add)
}
