//! HTTP server exposing cache statistics to dashboards.
//!
//! - [`stats_api`]: route handlers
//! - [`metrics`]: Prometheus text rendering of the stats snapshot

pub mod metrics;
pub mod stats_api;

use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cache::coordinator::Coordinator;
use crate::server::metrics::Metrics;

/// Application state shared across handlers.
pub struct AppState {
    pub cache: Arc<Coordinator>,
    pub metrics: Metrics,
    pub start_time: Instant,
}

/// Build the axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(stats_api::health))
        .route("/v1/cache/stats", get(stats_api::cache_stats))
        .route("/v1/cache/invalidate", post(stats_api::invalidate))
        .route("/metrics", get(stats_api::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
