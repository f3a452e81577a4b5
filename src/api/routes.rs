//! HTTP API route definitions.

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::market::MarketDataSource;
use crate::server::ServerState;

use super::handlers::{health, ready, ws_upgrade};

/// Create the API router.
pub fn create_router<S: MarketDataSource>(state: Arc<ServerState<S>>) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health))
        .route("/ready", get(ready::<S>))
        // Order book stream
        .route("/ws", get(ws_upgrade::<S>))
        // Browser dashboards connect from other origins
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
