//! Order book types and data structures.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::aggregator::mid_price;
use crate::market::MarketId;

/// Single price level in an order book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PriceLevel {
    /// Price at this level.
    pub price: Decimal,
    /// Total size available at this price.
    pub size: Decimal,
}

impl PriceLevel {
    /// Create a new price level.
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Side of the book. Determines sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Side {
    /// Buy side, best (highest) price first.
    Bid,
    /// Sell side, best (lowest) price first.
    Ask,
}

impl Side {
    /// Sort levels best-first for this side.
    pub fn sort(self, levels: &mut [PriceLevel]) {
        match self {
            Side::Bid => levels.sort_by(|a, b| b.price.cmp(&a.price)),
            Side::Ask => levels.sort_by(|a, b| a.price.cmp(&b.price)),
        }
    }
}

/// Book as reported by a market data source: unsorted, possibly with
/// duplicate or off-tick prices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBook {
    /// Raw bid levels.
    pub bids: Vec<PriceLevel>,
    /// Raw ask levels.
    pub asks: Vec<PriceLevel>,
}

impl RawBook {
    /// Create a raw book from both sides.
    pub fn new(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> Self {
        Self { bids, asks }
    }
}

/// Normalized, depth-limited order book for one market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookSnapshot {
    /// Market this book belongs to.
    pub market_id: MarketId,
    /// Bid levels sorted by price descending.
    pub bids: Vec<PriceLevel>,
    /// Ask levels sorted by price ascending.
    pub asks: Vec<PriceLevel>,
}

impl OrderBookSnapshot {
    /// Get the best bid price.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Get the best ask price.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Midpoint between best bid and best ask.
    pub fn mid_price(&self) -> Option<Decimal> {
        mid_price(self.best_bid()?, self.best_ask()?)
    }

    /// Get the spread between best bid and ask.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => ask.checked_sub(bid),
            _ => None,
        }
    }

    /// Check if the book is crossed (best_bid >= best_ask).
    ///
    /// Crossed books are passed through as received.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }
}
