use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::{sync::Arc, time::Instant};
use tracing::error;

use crate::catalog::pair_key;
use crate::feed::{ConnectionState, EngineMetricsSummary, SyncEngine};
use crate::query::{BookView, FeedStale, QueryMetricsSummary, QueryOutcome, QueryService};

const RETRY_MESSAGE: &str = "Subscribing... please retry";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub queries: Arc<QueryService>,
    pub engine: Arc<SyncEngine>,
    pub started_at: DateTime<Utc>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/subscribe/:coin/:basecoin", get(subscribe))
        .route("/book/:coin/:basecoin", get(get_book))
        .with_state(state)
}

// ===== Route Handlers =====

async fn subscribe(
    State(state): State<AppState>,
    Path((coin, basecoin)): Path<(String, String)>,
) -> ApiResponse {
    let pair = pair_key(&coin, &basecoin);
    match state.queries.ensure_subscribed(&pair) {
        QueryOutcome::Ready(()) | QueryOutcome::Requested => ApiResponse::Subscribed,
        QueryOutcome::NotYetSubscribed | QueryOutcome::Throttled => ApiResponse::RetryLater,
        QueryOutcome::NotFound(pair) => ApiResponse::NotFound(pair),
    }
}

async fn get_book(
    State(state): State<AppState>,
    Path((coin, basecoin)): Path<(String, String)>,
) -> ApiResponse {
    let pair = pair_key(&coin, &basecoin);
    match state.queries.get_book(&pair) {
        Ok(QueryOutcome::Ready(book)) => ApiResponse::Book(book),
        Ok(QueryOutcome::Requested | QueryOutcome::NotYetSubscribed | QueryOutcome::Throttled) => {
            ApiResponse::RetryLater
        }
        Ok(QueryOutcome::NotFound(pair)) => ApiResponse::NotFound(pair),
        Err(stale) => terminate_on_stale(stale),
    }
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = state.queries.store();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        connection: state.engine.connection_state(),
        markets: store.len(),
        subscribed_markets: store.subscribed_count(),
        last_delta_age_ms: store.since_last_delta(Instant::now()).as_millis() as u64,
        started_at: state.started_at,
        engine: state.engine.metrics().summary(),
        queries: state.queries.metrics().summary(),
    })
}

/// The feed is presumed dead; a supervisor restarts us from a clean slate.
pub fn terminate_on_stale(stale: FeedStale) -> ! {
    error!(
        silent_for_secs = stale.silent_for.as_secs(),
        "Market feed stale, terminating process"
    );
    std::process::exit(1)
}

// ===== Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    connection: ConnectionState,
    markets: usize,
    subscribed_markets: usize,
    last_delta_age_ms: u64,
    started_at: DateTime<Utc>,
    engine: EngineMetricsSummary,
    queries: QueryMetricsSummary,
}

#[derive(Debug)]
pub enum ApiResponse {
    Subscribed,
    Book(BookView),
    RetryLater,
    NotFound(String),
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        match self {
            ApiResponse::Subscribed => Json(json!({ "success": 1 })).into_response(),
            ApiResponse::Book(book) => Json(book).into_response(),
            ApiResponse::RetryLater => Json(json!({ "error": RETRY_MESSAGE })).into_response(),
            ApiResponse::NotFound(pair) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("market {} not found", pair) })),
            )
                .into_response(),
        }
    }
}
