use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::datasets::blocks::StoredBlock;

/// Chain-wide totals over every stored block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockStats {
    pub total_blocks: u64,
    pub total_transactions: u64,
    pub total_fees: u64,
    pub total_ada_output: u64,
    pub unique_issuers: u64,
    pub latest_height: u64,
    pub avg_block_size: f64,
    pub avg_tx_per_block: f64,
    pub avg_fees_per_block: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssuerStats {
    pub issuer: String,
    pub block_count: u64,
    pub total_fees: u64,
    pub avg_tx_count: f64,
    pub avg_block_size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub day: NaiveDate,
    pub block_count: u64,
    pub tx_count: u64,
    pub total_fees: u64,
    pub total_ada_output: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockPage {
    pub items: Vec<StoredBlock>,
    pub page: u64,
    pub page_size: u64,
    pub total: u64,
}
