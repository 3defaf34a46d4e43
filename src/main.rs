use anyhow::{Result, anyhow};
use tokio::{signal, sync::broadcast};
use tracing::{error, info};
use tracing_subscriber::{self, EnvFilter};

use cardano_block_indexer::api::{self, AppState};
use cardano_block_indexer::indexer::{Coordinator, JsonLinesFeed, LiveChannel};
use cardano_block_indexer::metrics::Metrics;
use cardano_block_indexer::storage::initialize_storage;
use cardano_block_indexer::storage::window::WindowHandle;
use cardano_block_indexer::utils::load_config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    println!();
    info!("=========================== INITIALIZING ===========================");

    // Load config
    let config = match load_config("config.yml") {
        Ok(config) => {
            info!("Config loaded successfully");
            config
        }
        Err(e) => {
            error!("Failed to load config: {}", e);
            return Err(anyhow!(e));
        }
    };

    let chain_name = config.chain_name.clone();

    // Initialize optional metrics
    if config.metrics.enabled {
        let metrics = Metrics::init_global(chain_name.clone())?;
        metrics
            .start_metrics_server(&config.metrics.address, config.metrics.port)
            .await?;
    } else {
        info!("Metrics are disabled");
    }

    let store = initialize_storage(&chain_name, &config.store).await?;
    let window = WindowHandle::spawn(config.window.capacity);
    let live = LiveChannel::new(config.live.channel_capacity);

    if config.api.enabled {
        let state = AppState::new(store.clone(), window.clone(), live.clone());
        api::start_api_server(&config.api, state).await?;
    } else {
        info!("Dashboard API is disabled");
    }

    // Create a shutdown signal handler
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal, initiating shutdown...");
                if shutdown_tx.send(()).is_err() {
                    error!("Ingestion already stopped before shutdown could be signalled");
                }
            }
            Err(e) => error!("Failed to listen for Ctrl+C, shutdown must come from the feed ending: {}", e),
        }
    });

    let coordinator = Coordinator::new(window, store, live);

    println!();
    info!("========================= STARTING INDEXER =========================");

    let handled = if config.feed.source == "stdin" {
        let mut feed = JsonLinesFeed::stdin();
        coordinator.run(&mut feed, shutdown_rx).await?
    } else {
        let mut feed = JsonLinesFeed::open(&config.feed.source).await?;
        coordinator.run(&mut feed, shutdown_rx).await?
    };

    info!(
        "Indexer stopped after {} payloads ({} malformed)",
        handled,
        coordinator.skipped()
    );
    Ok(())
}
