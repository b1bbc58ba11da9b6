//! Stats and control endpoints.
//!
//! - GET /health
//! - GET /v1/cache/stats
//! - GET /metrics
//! - POST /v1/cache/invalidate
//!
//! Cached content is never served over HTTP.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::stats::StatsSnapshot;
use crate::server::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}

/// Exactly one of `key` or `prefix`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvalidateRequest {
    pub key: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.cache.stats())
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.render(&state.cache.stats()) {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn invalidate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InvalidateRequest>,
) -> impl IntoResponse {
    let removed = match (req.key, req.prefix) {
        (Some(key), None) => usize::from(state.cache.invalidate(key).await),
        (None, Some(prefix)) => state.cache.invalidate_prefix(prefix.as_bytes()).await,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: "expected exactly one of `key` or `prefix`".to_string(),
                }),
            )
                .into_response();
        }
    };
    info!(removed, "Invalidation via API");
    (StatusCode::OK, Json(InvalidateResponse { removed })).into_response()
}
