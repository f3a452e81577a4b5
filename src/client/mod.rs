//! Self-healing subscriber for the order book stream.
//!
//! [`ReconnectMachine`] holds the pure connection logic; [`MarketFeedClient`]
//! runs it against a real WebSocket.

pub mod machine;
pub mod state;
pub mod websocket;

pub use machine::{Action, ReconnectMachine, ReconnectPolicy};
pub use state::{BookView, ConnectionState};
pub use websocket::MarketFeedClient;
