//! Unified error types for the order book stream service.

use thiserror::Error;

use crate::market::MarketId;
use crate::server::ConnectionId;

/// Unified error type for the service and its binary.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration loading error.
    #[error("configuration error: {0}")]
    Config(#[from] envy::Error),

    /// Configuration loaded but failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The listening socket could not be bound. This is the only fatal
    /// condition of a running server.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Market metadata could not be loaded.
    #[error("market error: {0}")]
    MarketLoad(#[from] MarketLoadError),

    /// Wire protocol violation.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Client-side WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by a market data source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The source has no market with this id.
    #[error("market {0} not found")]
    NotFound(MarketId),

    /// The source could not be reached or answered with an error.
    #[error("market data source unavailable: {0}")]
    Unavailable(String),
}

/// A market could not be loaded into the cache. Never cached; the next
/// request retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to load market {market_id}: {cause}")]
pub struct MarketLoadError {
    /// Market that failed to load.
    pub market_id: MarketId,
    /// What the source reported.
    #[source]
    pub cause: SourceError,
}

/// Failures while producing the current snapshot of a market.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Market metadata was unavailable.
    #[error(transparent)]
    Load(#[from] MarketLoadError),

    /// The book fetch itself failed.
    #[error("failed to fetch book for {market_id}: {cause}")]
    Source {
        /// Market being fetched.
        market_id: MarketId,
        /// What the source reported.
        cause: SourceError,
    },

    /// The fetch did not complete within one polling interval.
    #[error("fetch for {market_id} timed out after {timeout_ms}ms")]
    Timeout {
        /// Market being fetched.
        market_id: MarketId,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The snapshot could not be serialized.
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Wire protocol errors. Reported back to the peer; the connection stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Input could not be parsed as a known message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Channel other than `orderbook`.
    #[error("unsupported channel: {0}")]
    UnsupportedChannel(String),

    /// Binary frames are not part of the protocol.
    #[error("binary frames are not supported")]
    BinaryFrame,
}

/// Per-connection send failure. Isolated to that connection.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The bounded outbound queue is full (slow consumer).
    #[error("send queue full for connection {0}")]
    QueueFull(ConnectionId),

    /// The connection's writer has gone away.
    #[error("connection {0} closed")]
    Closed(ConnectionId),
}

/// Client-side WebSocket connection and message errors.
#[derive(Error, Debug)]
pub enum WsError {
    /// Endpoint URL could not be parsed or has the wrong scheme.
    #[error("invalid websocket url {url}: {reason}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Send failed.
    #[error("failed to send websocket message: {0}")]
    SendFailed(String),

    /// Tungstenite error.
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_load_error_names_market_and_cause() {
        let err = MarketLoadError {
            market_id: "M1".to_string(),
            cause: SourceError::Unavailable("rpc timeout".to_string()),
        };

        let text = err.to_string();
        assert!(text.contains("M1"));
        assert!(text.contains("rpc timeout"));
    }

    #[test]
    fn fetch_error_is_transparent_over_load_error() {
        let load = MarketLoadError {
            market_id: "M1".to_string(),
            cause: SourceError::NotFound("M1".to_string()),
        };
        let fetch: FetchError = load.clone().into();

        assert_eq!(fetch.to_string(), load.to_string());
    }
}
