//! HTTP API handlers.

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::market::MarketDataSource;
use crate::server::connection::run_session;
use crate::server::ServerState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Status: "ok".
    pub status: &'static str,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Whether the server accepts subscriptions.
    pub ready: bool,
    /// Open WebSocket connections.
    pub connections: usize,
    /// Markets with at least one subscriber.
    pub active_markets: usize,
}

/// Health check handler - always returns 200.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Readiness check handler - returns 200 if ready, 503 otherwise.
pub async fn ready<S: MarketDataSource>(
    State(state): State<Arc<ServerState<S>>>,
) -> impl IntoResponse {
    let is_ready = state.is_ready();

    let response = ReadyResponse {
        ready: is_ready,
        connections: state.registry().connection_count(),
        active_markets: state.registry().active_markets().len(),
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// WebSocket upgrade handler for the order book stream.
pub async fn ws_upgrade<S: MarketDataSource>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState<S>>>,
) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state))
}
