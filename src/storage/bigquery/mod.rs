mod schema;
mod sql;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use google_cloud_bigquery::client::{Client, ClientConfig};
use google_cloud_bigquery::http::{
    dataset::{Dataset, DatasetReference},
    error::Error as BigQueryError,
    job::query::QueryRequest,
    table::{Table as BigQueryTable, TableReference},
    tabledata::{
        insert_all::{InsertAllRequest, Row as TableRow},
        list::{Tuple, Value},
    },
};
use once_cell::sync::OnceCell;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::models::common::StoreConfig;
use crate::models::datasets::blocks::{CanonicalBlock, StoredBlock};
use crate::models::datasets::stats::{BlockPage, BlockStats, DailyStats, IssuerStats};
use crate::models::errors::StoreError;
use crate::storage::bigquery::schema::{block_clustering, block_partitioning, block_schema};
use crate::storage::bigquery::sql::Statement;
use crate::storage::{BlockReader, BlockStore, clamp_page, prepare_row};
use crate::utils::{
    retry::{RetryConfig, retry},
    strip_html,
};

// Define a static OnceCell to hold the shared Client and Project ID
static BIGQUERY_CLIENT: OnceCell<Arc<(Client, String)>> = OnceCell::new();

// BigQuery hard limit & safety margins for streaming inserts
const BQ_MAX_BYTES: usize = 10_000_000; // 10 MiB
const SAFETY_MARGIN: usize = 512_000; // 0.5 MiB head room
const MAX_BATCH_BYTES: usize = BQ_MAX_BYTES - SAFETY_MARGIN;
const ROW_OVERHEAD: usize = 200; // rough JSON envelope per row

// Initializes and returns the shared BigQuery Client and Project ID.
// This function ensures that the Client is initialized only once.
pub async fn get_client() -> Result<Arc<(Client, String)>> {
    if let Some(client) = BIGQUERY_CLIENT.get() {
        return Ok(client.clone());
    }

    let (config, project_id_option) = ClientConfig::new_with_auth().await?;
    let client = Client::new(config).await?;
    let project_id = project_id_option.ok_or_else(|| anyhow::anyhow!("Project ID not found"))?;

    let client_arc = Arc::new((client, project_id));

    // Another task may have won the race; either way a client is cached now
    let _ = BIGQUERY_CLIENT.set(client_arc.clone());
    let cached = BIGQUERY_CLIENT.get().cloned().unwrap_or(client_arc);
    info!(
        "Initialized and cached BigQuery client for Project ID: {}",
        cached.1
    );
    Ok(cached)
}

/// Durable store backed by a single month-partitioned BigQuery table.
pub struct BigQueryStore {
    client: Arc<(Client, String)>,
    dataset_id: String,
    table_id: String,
    timeout: Duration,
}

impl BigQueryStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        Ok(Self {
            client: get_client().await?,
            dataset_id: config.dataset_id.clone(),
            table_id: config.table_id.clone(),
            timeout: Duration::from_millis(config.request_timeout_ms),
        })
    }

    fn client(&self) -> &Client {
        &self.client.0
    }

    fn project_id(&self) -> &str {
        &self.client.1
    }

    fn qualified_table(&self) -> String {
        format!(
            "`{}.{}.{}`",
            self.project_id(),
            self.dataset_id,
            self.table_id
        )
    }

    // Verify that the dataset exists and is accessible
    async fn verify_dataset(&self) -> Result<bool> {
        match self
            .client()
            .dataset()
            .get(self.project_id(), &self.dataset_id)
            .await
        {
            Ok(_) => Ok(true),
            Err(BigQueryError::Response(resp)) if resp.message.contains("Not found") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // Verify that the table exists and is accessible
    async fn verify_table(&self) -> Result<bool> {
        match self
            .client()
            .table()
            .get(self.project_id(), &self.dataset_id, &self.table_id)
            .await
        {
            Ok(_) => Ok(true),
            Err(BigQueryError::Response(resp)) if resp.message.contains("Not found") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create_dataset(&self, dataset_location: &str) -> Result<()> {
        if self.verify_dataset().await? {
            info!(
                "Dataset '{}' already exists and is accessible",
                self.dataset_id
            );
            return Ok(());
        }

        let metadata = Dataset {
            dataset_reference: DatasetReference {
                project_id: self.project_id().to_string(),
                dataset_id: self.dataset_id.clone(),
            },
            location: dataset_location.to_string(),
            ..Default::default()
        };

        let dataset_client = self.client().dataset();
        retry(
            || async {
                match dataset_client.create(&metadata).await {
                    Ok(_) => {
                        info!(
                            "Dataset '{}' successfully created in project {}",
                            self.dataset_id,
                            self.project_id()
                        );
                        Ok(())
                    }
                    Err(BigQueryError::Response(resp)) if resp.message.contains("Already Exists") => {
                        info!("Dataset '{}' already exists", self.dataset_id);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            },
            is_transient,
            &RetryConfig::default(),
            "create_dataset",
        )
        .await
    }

    pub async fn create_table(&self) -> Result<()> {
        if self.verify_table().await? {
            info!(
                "Table '{}.{}' already exists and is accessible",
                self.dataset_id, self.table_id
            );
            return Ok(());
        }

        let metadata = BigQueryTable {
            table_reference: TableReference {
                project_id: self.project_id().to_string(),
                dataset_id: self.dataset_id.clone(),
                table_id: self.table_id.clone(),
            },
            schema: Some(block_schema()),
            time_partitioning: Some(block_partitioning()),
            clustering: Some(block_clustering()),
            ..Default::default()
        };

        let table_client = self.client().table();
        retry(
            || async {
                match table_client.create(&metadata).await {
                    Ok(_) => {
                        info!(
                            "Table '{}' successfully created in dataset '{}'",
                            self.table_id, self.dataset_id
                        );
                        Ok(())
                    }
                    Err(BigQueryError::Response(resp)) if resp.message.contains("Already Exists") => {
                        info!(
                            "Table '{}' already exists in dataset '{}'",
                            self.table_id, self.dataset_id
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            },
            is_transient,
            &RetryConfig::default(),
            "create_table",
        )
        .await
    }

    async fn run_query(&self, operation: &str, statement: Statement) -> Result<Vec<Tuple>, StoreError> {
        debug!("BigQuery {}: {}", operation, statement.sql);
        let request = QueryRequest {
            query: statement.sql,
            parameter_mode: (!statement.params.is_empty()).then(|| "NAMED".to_string()),
            query_parameters: statement.params,
            ..Default::default()
        };

        timed(self.timeout, operation, async {
            let response = self
                .client()
                .job()
                .query(self.project_id(), &request)
                .await
                .map_err(|e| StoreError::query(strip_html(&e.to_string())))?;

            if !response.job_complete {
                return Err(StoreError::query(format!(
                    "{operation} did not complete within the request deadline"
                )));
            }
            Ok(response.rows.unwrap_or_default())
        })
        .await
    }

    async fn query_blocks(&self, operation: &str, statement: Statement) -> Result<Vec<StoredBlock>, StoreError> {
        self.run_query(operation, statement)
            .await?
            .iter()
            .map(row_to_stored_block)
            .collect()
    }

    // Send one insertAll request. Each row carries `block_id` as its insertId so
    // BigQuery's best-effort dedup backs up the existence check.
    async fn insert_rows(&self, rows: &[StoredBlock]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let request = InsertAllRequest {
            skip_invalid_rows: Some(false),
            ignore_unknown_values: Some(false),
            template_suffix: None,
            rows: rows
                .iter()
                .map(|row| TableRow {
                    insert_id: Some(row.block.block_id.clone()),
                    json: row,
                })
                .collect(),
            trace_id: None,
        };

        let table = format!("{}.{}", self.dataset_id, self.table_id);
        timed(self.timeout, "insert", async {
            let response = self
                .client()
                .tabledata()
                .insert(self.project_id(), &self.dataset_id, &self.table_id, &request)
                .await
                .map_err(|e| StoreError::write(&table, strip_html(&e.to_string())))?;

            match response.insert_errors {
                Some(errors) if !errors.is_empty() => {
                    Err(StoreError::write(&table, format!("Insert errors: {errors:?}")))
                }
                _ => Ok(()),
            }
        })
        .await
        .map_err(|e| timeout_as_write(&table, e))
    }
}

#[async_trait]
impl BlockStore for BigQueryStore {
    async fn exists(&self, block_id: &str) -> Result<bool, StoreError> {
        let rows = self
            .run_query("exists", sql::exists(&self.qualified_table(), block_id))
            .await
            .map_err(|e| StoreError::lookup(block_id, e))?;
        Ok(!rows.is_empty())
    }

    async fn insert(&self, block: &CanonicalBlock) -> Result<StoredBlock, StoreError> {
        let row = prepare_row(block, Utc::now());
        self.insert_rows(std::slice::from_ref(&row)).await?;
        Ok(row)
    }

    async fn insert_batch(&self, blocks: &[CanonicalBlock]) -> Result<usize, StoreError> {
        if blocks.is_empty() {
            return Ok(0);
        }

        let batch_start = std::time::Instant::now();
        let inserted_at = Utc::now();
        let rows = blocks
            .iter()
            .map(|block| prepare_row(block, inserted_at))
            .collect();
        let batches = split_batches(rows, MAX_BATCH_BYTES)?;

        let table = self.qualified_table();
        let store = self;
        let batches_sent =
            send_batches(batches, &table, move |batch| async move { store.insert_rows(&batch).await })
                .await?;

        info!(
            "Successfully inserted {} rows into {} in {} batches (took {:.2?})",
            blocks.len(),
            table,
            batches_sent,
            batch_start.elapsed()
        );
        Ok(blocks.len())
    }

    fn backend_type(&self) -> &'static str {
        "bigquery"
    }
}

#[async_trait]
impl BlockReader for BigQueryStore {
    async fn stats(&self) -> Result<BlockStats, StoreError> {
        let rows = self
            .run_query("stats", sql::stats(&self.qualified_table()))
            .await?;
        let Some(row) = rows.first() else {
            return Ok(BlockStats::default());
        };

        Ok(BlockStats {
            total_blocks: cell_u64(row, 0)?,
            total_transactions: cell_u64(row, 1)?,
            total_fees: cell_u64(row, 2)?,
            total_ada_output: cell_u64(row, 3)?,
            unique_issuers: cell_u64(row, 4)?,
            latest_height: cell_u64(row, 5)?,
            avg_block_size: cell_f64(row, 6)?,
            avg_tx_per_block: cell_f64(row, 7)?,
            avg_fees_per_block: cell_f64(row, 8)?,
        })
    }

    async fn paginated(&self, page: u64, page_size: u64) -> Result<BlockPage, StoreError> {
        let (page, page_size) = clamp_page(page, page_size);
        let table = self.qualified_table();

        let total = match self.run_query("count", sql::count(&table)).await?.first() {
            Some(row) => cell_u64(row, 0)?,
            None => 0,
        };
        let items = self
            .query_blocks("paginated", sql::page(&table, page, page_size))
            .await?;

        Ok(BlockPage {
            items,
            page,
            page_size,
            total,
        })
    }

    async fn by_height_range(&self, from: u64, to: u64) -> Result<Vec<StoredBlock>, StoreError> {
        self.query_blocks(
            "by_height_range",
            sql::by_height_range(&self.qualified_table(), from, to),
        )
        .await
    }

    async fn by_issuer(&self, issuer: &str, limit: u64) -> Result<Vec<StoredBlock>, StoreError> {
        self.query_blocks(
            "by_issuer",
            sql::by_issuer(&self.qualified_table(), issuer, limit),
        )
        .await
    }

    async fn by_date_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<StoredBlock>, StoreError> {
        self.query_blocks(
            "by_date_range",
            sql::by_date_range(&self.qualified_table(), from, to),
        )
        .await
    }

    async fn latest(&self, limit: u64) -> Result<Vec<StoredBlock>, StoreError> {
        self.query_blocks("latest", sql::latest(&self.qualified_table(), limit))
            .await
    }

    async fn by_id(&self, block_id: &str) -> Result<Option<StoredBlock>, StoreError> {
        Ok(self
            .query_blocks("by_id", sql::by_id(&self.qualified_table(), block_id))
            .await?
            .into_iter()
            .next())
    }

    async fn issuer_distribution(&self, limit: u64) -> Result<Vec<IssuerStats>, StoreError> {
        self.run_query(
            "issuer_distribution",
            sql::issuer_distribution(&self.qualified_table(), limit),
        )
        .await?
        .iter()
        .map(|row| {
            Ok(IssuerStats {
                issuer: cell_str(row, 0)?.unwrap_or_default().to_string(),
                block_count: cell_u64(row, 1)?,
                total_fees: cell_u64(row, 2)?,
                avg_tx_count: cell_f64(row, 3)?,
                avg_block_size: cell_f64(row, 4)?,
            })
        })
        .collect()
    }

    async fn daily_stats(&self, days: u64) -> Result<Vec<DailyStats>, StoreError> {
        self.run_query(
            "daily_stats",
            sql::daily_stats(&self.qualified_table(), days),
        )
        .await?
        .iter()
        .map(|row| {
            let day = cell_str(row, 0)?.ok_or_else(|| StoreError::query("daily_stats returned a NULL day"))?;
            Ok(DailyStats {
                day: NaiveDate::parse_from_str(day, "%Y-%m-%d")
                    .map_err(|e| StoreError::query(format!("invalid day '{day}': {e}")))?,
                block_count: cell_u64(row, 1)?,
                tx_count: cell_u64(row, 2)?,
                total_fees: cell_u64(row, 3)?,
                total_ada_output: cell_u64(row, 4)?,
            })
        })
        .collect()
    }
}

/////////////////////////////////// Request helpers ////////////////////////////////////

// Setup calls are retried only for throttling, server-side and transport failures.
// Anything else (permissions, invalid names) fails start-up immediately.
fn is_transient(error: &BigQueryError) -> bool {
    match error {
        BigQueryError::Response(resp) => resp.code == 429 || resp.code >= 500,
        BigQueryError::HttpClient(_) | BigQueryError::HttpMiddleware(_) => true,
        _ => false,
    }
}

/// Bound a store call by `timeout`. Expiry yields [`StoreError::Timeout`].
async fn timed<T, F>(timeout: Duration, operation: &str, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| StoreError::Timeout {
            operation: operation.to_string(),
            after_ms: timeout.as_millis() as u64,
        })?
}

// A write that timed out is a failed write to its caller
fn timeout_as_write(table: &str, error: StoreError) -> StoreError {
    match error {
        StoreError::Timeout { .. } => StoreError::write(table, error),
        other => other,
    }
}

// Split rows into insertAll requests that stay under the request size limit
fn split_batches(rows: Vec<StoredBlock>, max_batch_bytes: usize) -> Result<Vec<Vec<StoredBlock>>, StoreError> {
    let mut batches = Vec::new();
    let mut current_batch: Vec<StoredBlock> = Vec::new();
    let mut current_size: usize = 0;

    for row in rows {
        let estimated_size = serde_json::to_string(&row)?.len() + ROW_OVERHEAD;

        // If adding this row would exceed the request limit, start a new batch
        if current_size + estimated_size > max_batch_bytes && !current_batch.is_empty() {
            batches.push(std::mem::take(&mut current_batch));
            current_size = 0;
        }

        current_size += estimated_size;
        current_batch.push(row);
    }

    if !current_batch.is_empty() {
        batches.push(current_batch);
    }
    Ok(batches)
}

/// Send batches in order. Returns the number of batches sent; a failure
/// reports how many rows had already been written.
async fn send_batches<F, Fut>(batches: Vec<Vec<StoredBlock>>, table: &str, mut send: F) -> Result<usize, StoreError>
where
    F: FnMut(Vec<StoredBlock>) -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let total: usize = batches.iter().map(Vec::len).sum();
    let mut written = 0;
    let mut batches_sent = 0;

    for batch in batches {
        let rows = batch.len();
        if let Err(e) = send(batch).await {
            error!(
                "Batch insert into {} failed after {} of {} rows were written in {} batches: {}",
                table, written, total, batches_sent, e
            );
            return Err(StoreError::write(
                table,
                format!("{e} ({written} of {total} rows already written)"),
            ));
        }
        written += rows;
        batches_sent += 1;
    }
    Ok(batches_sent)
}

///////////////////////////////////// Row mapping //////////////////////////////////////

fn cell_str(row: &Tuple, index: usize) -> Result<Option<&str>, StoreError> {
    let cell = row
        .f
        .get(index)
        .ok_or_else(|| StoreError::query(format!("row is missing column {index}")))?;
    match &cell.v {
        Value::Null => Ok(None),
        Value::String(value) => Ok(Some(value.as_str())),
        other => Err(StoreError::query(format!(
            "column {index} is not a scalar: {other:?}"
        ))),
    }
}

// NULL aggregates over an empty table read as zero
fn cell_u64(row: &Tuple, index: usize) -> Result<u64, StoreError> {
    match cell_str(row, index)? {
        None => Ok(0),
        Some(value) => value
            .parse::<u64>()
            .map_err(|e| StoreError::query(format!("column {index} value '{value}': {e}"))),
    }
}

fn cell_f64(row: &Tuple, index: usize) -> Result<f64, StoreError> {
    match cell_str(row, index)? {
        None => Ok(0.0),
        Some(value) => value
            .parse::<f64>()
            .map_err(|e| StoreError::query(format!("column {index} value '{value}': {e}"))),
    }
}

fn cell_timestamp(row: &Tuple, index: usize) -> Result<DateTime<Utc>, StoreError> {
    let seconds = cell_str(row, index)?
        .ok_or_else(|| StoreError::query(format!("column {index} is NULL")))?
        .parse::<i64>()
        .map_err(|e| StoreError::query(format!("column {index}: {e}")))?;
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| StoreError::query(format!("column {index}: timestamp {seconds} out of range")))
}

fn row_to_stored_block(row: &Tuple) -> Result<StoredBlock, StoreError> {
    Ok(StoredBlock {
        block: CanonicalBlock {
            block_id: cell_str(row, 0)?
                .ok_or_else(|| StoreError::query("block_id is NULL"))?
                .to_string(),
            block_height: cell_u64(row, 1)?,
            block_slot: cell_u64(row, 2)?,
            block_size: cell_u64(row, 3)?,
            issuer: cell_str(row, 4)?.unwrap_or_default().to_string(),
            tx_count: cell_u64(row, 5)?,
            ada_output: cell_u64(row, 6)?,
            fees: cell_u64(row, 7)?,
            date_time: cell_timestamp(row, 8)?,
        },
        inserted_at: cell_timestamp(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_cloud_bigquery::http::error::ErrorResponse;
    use google_cloud_bigquery::http::tabledata::list::Cell;

    fn tuple(values: &[Option<&str>]) -> Tuple {
        Tuple {
            f: values
                .iter()
                .map(|v| Cell {
                    v: match v {
                        Some(s) => Value::String(s.to_string()),
                        None => Value::Null,
                    },
                })
                .collect(),
        }
    }

    #[test]
    fn test_row_to_stored_block() {
        let row = tuple(&[
            Some("b1"),
            Some("10"),
            Some("200"),
            Some("2048"),
            Some("pool123"),
            Some("2"),
            Some("8000000"),
            Some("300000"),
            Some("1704067200"),
            Some("1704067203"),
        ]);

        let stored = row_to_stored_block(&row).unwrap();
        assert_eq!(stored.block.block_id, "b1");
        assert_eq!(stored.block.fees, 300_000);
        assert_eq!(stored.block.ada_output, 8_000_000);
        assert_eq!(stored.block.date_time.timestamp(), 1_704_067_200);
        assert_eq!(stored.inserted_at.timestamp(), 1_704_067_203);
    }

    #[test]
    fn test_null_aggregates_read_as_zero() {
        let row = tuple(&[Some("0"), None, None]);
        assert_eq!(cell_u64(&row, 0).unwrap(), 0);
        assert_eq!(cell_u64(&row, 1).unwrap(), 0);
        assert_eq!(cell_f64(&row, 2).unwrap(), 0.0);
        assert!(cell_u64(&row, 3).is_err());
    }

    #[test]
    fn test_bad_cell_is_query_error() {
        let row = tuple(&[Some("not-a-number")]);
        assert!(matches!(cell_u64(&row, 0), Err(StoreError::Query { .. })));
    }

    fn response_error(code: u16, message: &str) -> BigQueryError {
        BigQueryError::Response(ErrorResponse {
            code,
            errors: None,
            message: message.to_string(),
        })
    }

    fn stored(id: &str) -> StoredBlock {
        prepare_row(
            &CanonicalBlock {
                block_id: id.to_string(),
                block_height: 1,
                block_slot: 1,
                block_size: 1,
                issuer: "pool1".to_string(),
                tx_count: 0,
                ada_output: 0,
                fees: 0,
                date_time: Utc::now(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_only_throttling_and_server_errors_are_transient() {
        assert!(is_transient(&response_error(429, "Rate limit exceeded")));
        assert!(is_transient(&response_error(503, "Backend error")));
        assert!(!is_transient(&response_error(403, "Permission denied")));
        assert!(!is_transient(&response_error(400, "Invalid dataset ID")));
    }

    #[tokio::test]
    async fn test_timed_store_call_times_out() {
        let result: Result<(), StoreError> =
            timed(Duration::from_millis(10), "insert", std::future::pending()).await;
        let err = result.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Timeout { ref operation, after_ms: 10 } if operation == "insert"
        ));

        // Insert timeouts reach callers as write failures
        let err = timeout_as_write("cardano.blocks", err);
        assert!(matches!(err, StoreError::Write { ref table, .. } if table == "cardano.blocks"));
        assert!(err.to_string().contains("timed out after 10ms"));
    }

    #[test]
    fn test_timeout_as_write_keeps_other_errors() {
        let err = timeout_as_write("cardano.blocks", StoreError::query("bad response"));
        assert!(matches!(err, StoreError::Query { .. }));
    }

    #[test]
    fn test_split_batches_respects_size_limit() -> anyhow::Result<()> {
        let rows: Vec<StoredBlock> = (0..5).map(|n| stored(&format!("b{n}"))).collect();
        let row_size = serde_json::to_string(&rows[0])?.len() + ROW_OVERHEAD;

        let batches = split_batches(rows.clone(), row_size * 2)?;
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        assert_eq!(split_batches(rows, MAX_BATCH_BYTES)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_send_batches_reports_rows_already_written() {
        let batches = vec![vec![stored("b1"), stored("b2")], vec![stored("b3")], vec![stored("b4")]];
        let mut calls = 0;
        let result = send_batches(batches, "cardano.blocks", |_batch| {
            calls += 1;
            let fail = calls == 2;
            async move {
                if fail {
                    Err(StoreError::write("cardano.blocks", "quota exceeded"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert!(err.to_string().contains("2 of 4 rows already written"));
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_send_batches_counts_batches() {
        let batches = vec![vec![stored("b1")], vec![stored("b2")]];
        let sent = send_batches(batches, "cardano.blocks", |_batch| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(sent, 2);
    }
}
