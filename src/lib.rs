//! Real-time order book distribution.
//!
//! A server polls market data sources, normalizes each book into a bounded
//! price ladder and pushes a full snapshot to every WebSocket subscriber
//! whenever the ladder changes. A companion client keeps one subscription
//! alive across disconnects and mirrors the latest snapshot locally.
//!
//! # Modules
//!
//! - [`config`]: Configuration loading from environment
//! - [`error`]: Unified error types
//! - [`market`]: Market metadata, data sources and the single-flight cache
//! - [`orderbook`]: Aggregation, normalization and fingerprints
//! - [`protocol`]: JSON wire messages
//! - [`server`]: Subscription registry, change detector, heartbeat and sessions
//! - [`client`]: Reconnecting subscriber
//! - [`api`]: HTTP routes for health, readiness and the stream endpoint
//! - [`metrics`]: Prometheus metrics
//! - [`utils`]: Utility functions

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod market;
pub mod metrics;
pub mod orderbook;
pub mod protocol;
pub mod server;
pub mod utils;

pub use config::Config;
pub use error::{Result, ServiceError};
