use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::Method;
use axum::http::StatusCode;
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::indexer::IndexStatus;
use crate::state::{AppState, ChainSummary};

mod donations;
mod upload;

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([ACCEPT, CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    let donations_router = donations::router().with_state(state.clone());
    let pinata_router = upload::router(max_upload_bytes).with_state(state.clone());
    Router::new()
        .route("/health", get(health_live))
        .route("/health/ready", get(health_ready))
        .nest("/donations", donations_router)
        .nest("/pinata", pinata_router)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_live(State(state): State<AppState>) -> Result<Json<HealthResponse>, HttpError> {
    let response = HealthResponse {
        status: "live",
        uptime_seconds: state.start_time.elapsed().as_secs(),
    };
    Ok(Json(response))
}

async fn health_ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>, HttpError> {
    let rpc_timeout_ms = u64::try_from(state.rpc_timeout.as_millis()).map_err(|_| {
        HttpError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "RPC timeout exceeds u64 bounds".to_string(),
        )
    })?;

    let indexer = state.index.as_ref().map(|index| index.status());
    let status = match &indexer {
        Some(index) if !index.ready => "syncing",
        Some(index) if index.stale => "stale",
        _ => "ready",
    };

    let response = ReadyResponse {
        status,
        chain: state.chain.clone(),
        contract_configured: state.donations.is_some(),
        pinning_configured: state.publisher.is_some(),
        indexer,
        rpc_timeout_ms,
        cache_entries: CacheSummary {
            donations: state.cache.donation_entries(),
            pinned_files: state.cache.pinned_files.entry_count(),
        },
    };
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    status: &'static str,
    chain: ChainSummary,
    contract_configured: bool,
    pinning_configured: bool,
    indexer: Option<IndexStatus>,
    rpc_timeout_ms: u64,
    cache_entries: CacheSummary,
}

#[derive(Debug, Serialize)]
struct CacheSummary {
    donations: u64,
    pinned_files: u64,
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: String) -> Self {
        assert!(status != StatusCode::OK, "Error status cannot be 200");
        assert!(!message.is_empty(), "Error message cannot be empty");
        Self { status, message }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.to_string())
    }

    pub fn internal(message: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message.to_string())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        info!(status = self.status.as_u16(), "HTTP error: {}", self.message);
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}
