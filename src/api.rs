use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::indexer::backfill::backfill_window;
use crate::indexer::live::LiveChannel;
use crate::models::common::ApiConfig;
use crate::models::datasets::blocks::{BlockEvent, CanonicalBlock, StoredBlock};
use crate::models::datasets::stats::{BlockPage, BlockStats, DailyStats, IssuerStats};
use crate::storage::DurableStore;
use crate::storage::reader::AggregationReader;
use crate::storage::window::WindowHandle;

const DEFAULT_LIMIT: u64 = 10;
const MAX_LIMIT: u64 = 100;
const DEFAULT_DAYS: u64 = 7;
const MAX_DAYS: u64 = 366;

#[derive(Clone)]
pub struct AppState {
    pub reader: AggregationReader,
    pub window: WindowHandle,
    pub store: Arc<dyn DurableStore>,
    pub live: LiveChannel,
}

impl AppState {
    pub fn new(store: Arc<dyn DurableStore>, window: WindowHandle, live: LiveChannel) -> Self {
        Self {
            reader: AggregationReader::new(store.clone()),
            window,
            store,
            live,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub page: Option<u64>,
    pub page_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct HeightParams {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Deserialize)]
pub struct DateParams {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct DaysParams {
    pub days: Option<u64>,
}

fn limit_or_default(limit: Option<u64>) -> u64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/window", get(window_snapshot))
        .route("/api/blocks", get(blocks_page))
        .route("/api/blocks/latest", get(latest_blocks))
        .route("/api/blocks/height", get(blocks_by_height))
        .route("/api/blocks/dates", get(blocks_by_date))
        .route("/api/blocks/issuer/{issuer}", get(blocks_by_issuer))
        .route("/api/blocks/{id}", get(block_by_id))
        .route("/api/stats", get(stats))
        .route("/api/stats/issuers", get(issuer_stats))
        .route("/api/stats/daily", get(daily_stats))
        .route("/api/live", get(live_events))
        .route("/api/admin/backfill", post(backfill))
        .route("/api/admin/window/clear", post(clear_window))
        .with_state(state)
}

pub async fn start_api_server(config: &ApiConfig, state: AppState) -> Result<()> {
    let addr = format!("{}:{}", config.address, config.port).parse::<SocketAddr>()?;
    let app = router(state);

    let access_url = if addr.ip().is_unspecified() {
        format!("http://localhost:{}/api", config.port)
    } else {
        format!("http://{}:{}/api", addr.ip(), config.port)
    };
    info!(
        "Starting dashboard API - binding to {} (accessible at {})",
        addr, access_url
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Dashboard API server error: {}", e);
        }
    });

    Ok(())
}

pub async fn window_snapshot(
    State(state): State<AppState>,
) -> Result<Json<Vec<CanonicalBlock>>, StatusCode> {
    state.window.snapshot().await.map(Json).map_err(|e| {
        error!("Failed to read the block window: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })
}

pub async fn blocks_page(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Json<BlockPage> {
    let page = params.page.unwrap_or(1);
    let page_size = params.page_size.unwrap_or(20);
    Json(state.reader.paginated(page, page_size).await)
}

pub async fn latest_blocks(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Json<Vec<StoredBlock>> {
    Json(state.reader.latest(limit_or_default(params.limit)).await)
}

pub async fn block_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Option<StoredBlock>> {
    Json(state.reader.by_id(&id).await)
}

pub async fn blocks_by_height(
    State(state): State<AppState>,
    Query(params): Query<HeightParams>,
) -> Json<Vec<StoredBlock>> {
    Json(state.reader.by_height_range(params.from, params.to).await)
}

pub async fn blocks_by_issuer(
    State(state): State<AppState>,
    Path(issuer): Path<String>,
    Query(params): Query<LimitParams>,
) -> Json<Vec<StoredBlock>> {
    Json(
        state
            .reader
            .by_issuer(&issuer, limit_or_default(params.limit))
            .await,
    )
}

pub async fn blocks_by_date(
    State(state): State<AppState>,
    Query(params): Query<DateParams>,
) -> Json<Vec<StoredBlock>> {
    Json(state.reader.by_date_range(params.from, params.to).await)
}

pub async fn stats(State(state): State<AppState>) -> Json<BlockStats> {
    Json(state.reader.stats().await)
}

pub async fn issuer_stats(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Json<Vec<IssuerStats>> {
    Json(
        state
            .reader
            .issuer_distribution(limit_or_default(params.limit))
            .await,
    )
}

pub async fn daily_stats(
    State(state): State<AppState>,
    Query(params): Query<DaysParams>,
) -> Json<Vec<DailyStats>> {
    let days = params.days.unwrap_or(DEFAULT_DAYS).clamp(1, MAX_DAYS);
    Json(state.reader.daily_stats(days).await)
}

pub async fn live_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(
        "Live subscriber connected ({} active)",
        state.live.subscriber_count() + 1
    );
    Sse::new(event_stream(state.live.subscribe())).keep_alive(KeepAlive::default())
}

/// Turn a broadcast subscription into SSE events. Missed events are skipped.
fn event_stream(
    rx: broadcast::Receiver<BlockEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(block_event) => match Event::default()
                    .event(block_event.event.clone())
                    .json_data(&block_event)
                {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(e) => warn!("Failed to encode live event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Live subscriber lagged, skipped {} events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

pub async fn backfill(State(state): State<AppState>) -> Result<Json<Value>, (StatusCode, String)> {
    match backfill_window(&state.window, state.store.as_ref()).await {
        Ok(written) => Ok(Json(json!({ "backfilled": written }))),
        Err(e) => {
            error!("Backfill failed: {}", e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn clear_window(State(state): State<AppState>) -> Result<StatusCode, StatusCode> {
    state.window.clear().await.map_err(|e| {
        error!("Failed to clear the block window: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    info!("Block window cleared");
    Ok(StatusCode::NO_CONTENT)
}
