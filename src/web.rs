use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::Config;
use crate::events::TrackerSnapshot;
use crate::models::SessionSummary;
use crate::prices::{pinned_price, PriceStatus};
use crate::service::{ServiceHealth, TrackerService};
use crate::storage::{summarize, HistorySummary, StoreError};
use crate::tracker::Tracker;

const DEFAULT_SESSION_COUNT: usize = 20;

type ApiError = (StatusCode, String);

pub fn router(service: TrackerService) -> Router {
    Router::new()
        .route("/api/state", get(api_state))
        .route("/api/init", post(api_init))
        .route("/api/display-mode", post(api_display_mode))
        .route("/api/reset-session", post(api_reset_session))
        .route("/api/reset", post(api_reset))
        .route("/api/investment", post(api_investment))
        .route("/api/sessions", get(api_sessions))
        .route("/api/sessions/summary", get(api_sessions_summary))
        .route("/api/sessions/:id", delete(api_delete_session))
        .route("/api/prices", get(api_prices).post(api_set_price))
        .route("/api/config", get(api_config).post(api_update_config))
        .route("/api/health", get(api_health))
        .with_state(service)
}

/// Serve the API until Ctrl-C.
pub async fn serve(addr: String, service: TrackerService) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "API listening on http://{}", addr);
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    info!("Shutting down");
}

// ── Engine ────────────────────────────────────────────────────────────

async fn api_state(State(service): State<TrackerService>) -> Json<TrackerSnapshot> {
    Json(service.snapshot())
}

async fn api_init(State(service): State<TrackerService>) -> Json<TrackerSnapshot> {
    Json(service.with_engine(|engine| {
        engine.request_initialization();
        engine.snapshot()
    }))
}

#[derive(Deserialize)]
struct DisplayModeReq {
    mode: String,
}

/// Unknown modes are ignored and the unchanged snapshot is returned.
async fn api_display_mode(
    State(service): State<TrackerService>,
    Json(payload): Json<DisplayModeReq>,
) -> Json<TrackerSnapshot> {
    Json(service.with_engine(|engine| {
        engine.set_display_mode(&payload.mode);
        engine.snapshot()
    }))
}

async fn api_reset_session(State(service): State<TrackerService>) -> Json<TrackerSnapshot> {
    Json(service.with_engine(|engine| {
        engine.reset_session();
        engine.snapshot()
    }))
}

async fn api_reset(State(service): State<TrackerService>) -> Json<TrackerSnapshot> {
    Json(service.with_engine(|engine| {
        engine.reset_all();
        engine.snapshot()
    }))
}

#[derive(Deserialize)]
struct InvestmentReq {
    value: f64,
}

async fn api_investment(
    State(service): State<TrackerService>,
    Json(payload): Json<InvestmentReq>,
) -> Result<Json<TrackerSnapshot>, ApiError> {
    if !payload.value.is_finite() || payload.value < 0.0 {
        return Err(api_err("Investment must be a non-negative number"));
    }
    service.with_engine(|engine| {
        if engine.set_investment(payload.value) {
            Ok(Json(engine.snapshot()))
        } else {
            Err((StatusCode::CONFLICT, "Not in a map".to_string()))
        }
    })
}

// ── History ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SessionsQuery {
    count: Option<usize>,
}

async fn api_sessions(
    State(service): State<TrackerService>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let count = query.count.unwrap_or(DEFAULT_SESSION_COUNT);
    let store = service.store();
    let sessions = blocking(move || store.recent(count)).await?;
    Ok(Json(sessions.iter().map(|s| s.summary()).collect()))
}

async fn api_sessions_summary(
    State(service): State<TrackerService>,
) -> Result<Json<HistorySummary>, ApiError> {
    let store = service.store();
    let sessions = blocking(move || store.recent(usize::MAX)).await?;
    Ok(Json(summarize(&sessions)))
}

#[derive(Debug, Serialize)]
struct DeleteResp {
    deleted: String,
}

async fn api_delete_session(
    State(service): State<TrackerService>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResp>, ApiError> {
    let store = service.store();
    let lookup = id.clone();
    if !blocking(move || store.delete(&lookup)).await? {
        return Err((StatusCode::NOT_FOUND, "Session not found".to_string()));
    }
    Ok(Json(DeleteResp { deleted: id }))
}

// ── Prices ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct PriceView {
    item_id: String,
    name: String,
    price: f64,
    price_with_tax: Option<f64>,
    status: PriceStatus,
    age_secs: Option<i64>,
    updated_at: DateTime<Utc>,
}

fn price_view(engine: &Tracker, item_id: &str) -> Option<PriceView> {
    let prices = engine.prices();
    let record = prices.records().get(item_id)?;
    Some(PriceView {
        item_id: item_id.to_string(),
        name: engine.catalog().name(item_id),
        price: record.price,
        price_with_tax: prices.get_price_with_tax(item_id),
        status: prices.price_status(item_id),
        age_secs: prices.price_age_secs(item_id),
        updated_at: record.updated_at,
    })
}

async fn api_prices(State(service): State<TrackerService>) -> Json<Vec<PriceView>> {
    let mut views: Vec<PriceView> = service.with_engine(|engine| {
        engine
            .prices()
            .records()
            .keys()
            .filter_map(|id| price_view(engine, id))
            .collect()
    });
    views.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.item_id.cmp(&b.item_id)));
    Json(views)
}

#[derive(Deserialize)]
struct PriceReq {
    item_id: String,
    price: f64,
}

async fn api_set_price(
    State(service): State<TrackerService>,
    Json(payload): Json<PriceReq>,
) -> Result<Json<PriceView>, ApiError> {
    let item_id = payload.item_id.trim();
    if item_id.is_empty() {
        return Err(api_err("item_id is required"));
    }
    if !payload.price.is_finite() || payload.price < 0.0 {
        return Err(api_err("Price must be a non-negative number"));
    }
    if pinned_price(item_id).is_some() {
        return Err(api_err("Price of this item is fixed"));
    }
    service.set_price(item_id, payload.price);
    service
        .with_engine(|engine| price_view(engine, item_id))
        .map(Json)
        .ok_or_else(|| (StatusCode::INTERNAL_SERVER_ERROR, "Price not stored".to_string()))
}

// ── Config & health ───────────────────────────────────────────────────

async fn api_config(State(service): State<TrackerService>) -> Json<Config> {
    Json(service.config())
}

async fn api_update_config(
    State(service): State<TrackerService>,
    Json(config): Json<Config>,
) -> Result<Json<Config>, ApiError> {
    service
        .update_config(config)
        .map_err(|e| api_err(&e.to_string()))?;
    Ok(Json(service.config()))
}

async fn api_health(State(service): State<TrackerService>) -> Json<ServiceHealth> {
    Json(service.health())
}

/// Store calls may wait on the session writer; keep them off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(store_err)
}

fn store_err(err: StoreError) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn api_err(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, message.to_string())
}
