//! HTTP API module for health, readiness and the WebSocket endpoint.

pub mod handlers;
pub mod routes;

pub use routes::create_router;
