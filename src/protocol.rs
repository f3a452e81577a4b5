//! JSON wire protocol shared by the server and the client.
//!
//! Client to server:
//! ```text
//! {"type":"subscribe","channel":"orderbook","market":"<id>"}
//! {"type":"unsubscribe","channel":"orderbook","market":"<id>"}
//! ```
//!
//! Server to client:
//! ```text
//! {"type":"orderbook","market":"<id>","bids":[["20.44","100.5"]],"asks":[["20.46","80.3"]]}
//! {"type":"error","message":"..."}
//! ```
//!
//! Prices and sizes travel as decimal strings so no precision is lost.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::ProtocolError;
use crate::market::MarketId;
use crate::orderbook::{OrderBookSnapshot, PriceLevel};

/// Subscription channels. Only order books are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Full order book snapshots.
    Orderbook,
}

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Start receiving snapshots for a market.
    Subscribe {
        /// Channel name, always `orderbook`.
        channel: String,
        /// Market id.
        market: MarketId,
    },
    /// Stop receiving snapshots for a market.
    Unsubscribe {
        /// Channel name, always `orderbook`.
        channel: String,
        /// Market id.
        market: MarketId,
    },
}

impl ClientMessage {
    /// Subscribe to the order book of `market`.
    pub fn subscribe(market: impl Into<MarketId>) -> Self {
        Self::Subscribe {
            channel: Channel::Orderbook.to_string(),
            market: market.into(),
        }
    }

    /// Unsubscribe from the order book of `market`.
    pub fn unsubscribe(market: impl Into<MarketId>) -> Self {
        Self::Unsubscribe {
            channel: Channel::Orderbook.to_string(),
            market: market.into(),
        }
    }

    /// Parse a text frame, rejecting unknown channels.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let message: Self = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
        message.channel()?;
        Ok(message)
    }

    /// Validated channel of this message.
    pub fn channel(&self) -> Result<Channel, ProtocolError> {
        let name = match self {
            Self::Subscribe { channel, .. } | Self::Unsubscribe { channel, .. } => channel,
        };
        name.parse()
            .map_err(|_| ProtocolError::UnsupportedChannel(name.clone()))
    }

    /// Market this message refers to.
    pub fn market(&self) -> &str {
        match self {
            Self::Subscribe { market, .. } | Self::Unsubscribe { market, .. } => market,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One `[price, size]` pair on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireLevel(
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
    #[serde(with = "rust_decimal::serde::str")] pub Decimal,
);

impl From<&PriceLevel> for WireLevel {
    fn from(level: &PriceLevel) -> Self {
        Self(level.price, level.size)
    }
}

impl From<WireLevel> for PriceLevel {
    fn from(level: WireLevel) -> Self {
        PriceLevel::new(level.0, level.1)
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Full order book snapshot for one market.
    Orderbook {
        /// Market id.
        market: MarketId,
        /// Bids, best first.
        bids: Vec<WireLevel>,
        /// Asks, best first.
        asks: Vec<WireLevel>,
    },
    /// Request could not be served. The connection stays open.
    Error {
        /// Human readable reason.
        message: String,
    },
}

impl ServerMessage {
    /// Build the wire form of a snapshot.
    pub fn from_snapshot(snapshot: &OrderBookSnapshot) -> Self {
        Self::Orderbook {
            market: snapshot.market_id.clone(),
            bids: snapshot.bids.iter().map(WireLevel::from).collect(),
            asks: snapshot.asks.iter().map(WireLevel::from).collect(),
        }
    }

    /// Build an error frame.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }
}
