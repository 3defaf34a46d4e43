use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use axum::{Router, http::StatusCode, routing::get};
use once_cell::sync::OnceCell;
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, MeterProvider};
use opentelemetry_sdk::metrics::{MetricError, SdkMeterProvider};
use prometheus::{Encoder, TextEncoder};
use tracing::{error, info};

static METRICS: OnceCell<Metrics> = OnceCell::new();

pub struct Metrics {
    registry: Arc<prometheus::Registry>,
    _provider: SdkMeterProvider,
    pub chain_name: String,

    // Block processing metrics
    pub blocks_received: Counter<u64>,
    pub blocks_malformed: Counter<u64>,
    pub latest_block_height: Gauge<u64>,
    pub latest_block_processing_time: Gauge<f64>,

    // Store metrics
    pub store_operations: Counter<u64>,
    pub store_latency: Histogram<f64>,
    pub store_batch_size: Histogram<f64>,

    // Window metrics
    pub window_size: Gauge<u64>,
    pub window_evictions: Counter<u64>,

    // Live channel metrics
    pub live_events_published: Counter<u64>,
}

impl Metrics {
    pub fn new(chain_name: String) -> Result<Self, MetricError> {
        // Create a new prometheus registry
        let registry = prometheus::Registry::new();

        // Configure OpenTelemetry to use this registry
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        // Set up a meter to create instruments
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let meter = provider.meter("indexer_metrics");

        let blocks_received = meter
            .u64_counter("indexer_blocks_received")
            .with_description("Total number of block payloads delivered by the feed")
            .build();

        let blocks_malformed = meter
            .u64_counter("indexer_blocks_malformed")
            .with_description("Number of payloads skipped because they could not be normalized")
            .build();

        let latest_block_height = meter
            .u64_gauge("indexer_latest_block_height")
            .with_description("Height of the latest normalized block")
            .build();

        let latest_block_processing_time = meter
            .f64_gauge("indexer_latest_block_processing")
            .with_description("Time spent processing the latest block")
            .with_unit("s")
            .build();

        let store_operations = meter
            .u64_counter("indexer_store_operations")
            .with_description("Durable store operations by operation and outcome")
            .build();

        let store_latency = meter
            .f64_histogram("indexer_store_latency")
            .with_description("Durable store request latency")
            .with_boundaries(vec![
                0.025, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.5, 1.0, 5.0, 10.0,
            ])
            .with_unit("s")
            .build();

        let store_batch_size = meter
            .f64_histogram("indexer_store_batch_size")
            .with_description("Number of rows per batch insert")
            .with_boundaries(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0])
            .build();

        let window_size = meter
            .u64_gauge("indexer_window_size")
            .with_description("Number of blocks held in the real-time window")
            .build();

        let window_evictions = meter
            .u64_counter("indexer_window_evictions")
            .with_description("Blocks evicted from the real-time window")
            .build();

        let live_events_published = meter
            .u64_counter("indexer_live_events_published")
            .with_description("Block events published to live subscribers")
            .build();

        Ok(Self {
            registry: Arc::new(registry),
            _provider: provider,
            chain_name,
            blocks_received,
            blocks_malformed,
            latest_block_height,
            latest_block_processing_time,
            store_operations,
            store_latency,
            store_batch_size,
            window_size,
            window_evictions,
            live_events_published,
        })
    }

    /// Install the process-wide metrics instance. Only the first call wins.
    pub fn init_global(chain_name: String) -> Result<&'static Metrics> {
        let metrics = Metrics::new(chain_name)?;
        if METRICS.set(metrics).is_err() {
            info!("Metrics already initialized, keeping the existing instance");
        }
        METRICS
            .get()
            .ok_or_else(|| anyhow!("Metrics failed to initialize"))
    }

    pub fn global() -> Option<&'static Metrics> {
        METRICS.get()
    }

    fn chain_attr(&self) -> KeyValue {
        KeyValue::new("chain", self.chain_name.clone())
    }

    pub fn record_block_received(&self) {
        self.blocks_received.add(1, &[self.chain_attr()]);
    }

    pub fn record_block_malformed(&self) {
        self.blocks_malformed.add(1, &[self.chain_attr()]);
    }

    pub fn record_block_processed(&self, block_height: u64, duration_secs: f64) {
        self.latest_block_height
            .record(block_height, &[self.chain_attr()]);
        self.latest_block_processing_time
            .record(duration_secs, &[self.chain_attr()]);
    }

    pub fn record_store_operation(&self, operation: &'static str, outcome: &'static str, duration_secs: f64) {
        let attrs = [
            self.chain_attr(),
            KeyValue::new("op", operation),
            KeyValue::new("outcome", outcome),
        ];
        self.store_operations.add(1, &attrs);
        self.store_latency.record(duration_secs, &attrs[..2]);
    }

    pub fn record_store_batch_size(&self, rows: usize) {
        self.store_batch_size
            .record(rows as f64, &[self.chain_attr()]);
    }

    pub fn record_window(&self, size: usize, evicted: bool) {
        self.window_size.record(size as u64, &[self.chain_attr()]);
        if evicted {
            self.window_evictions.add(1, &[self.chain_attr()]);
        }
    }

    pub fn record_live_event(&self) {
        self.live_events_published.add(1, &[self.chain_attr()]);
    }

    pub async fn start_metrics_server(&self, addr: &str, port: u16) -> Result<()> {
        let addr = format!("{addr}:{port}").parse::<SocketAddr>()?;
        let registry = self.registry.clone();

        let app = Router::new().route("/metrics", get(move || metrics_handler(registry.clone())));

        // Determine the access URL based on the binding address. Only used for logging.
        let access_url = if addr.ip().is_unspecified() {
            format!("http://localhost:{port}/metrics")
        } else {
            format!("http://{}:{port}/metrics", addr.ip())
        };

        info!(
            "Starting metrics server - binding to {} (accessible at {})",
            addr, access_url
        );

        let listener = tokio::net::TcpListener::bind(addr).await?;

        // Spawn the server in a separate task
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Metrics server error: {}", e);
            }
        });

        Ok(())
    }
}

async fn metrics_handler(registry: Arc<prometheus::Registry>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
