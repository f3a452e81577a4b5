//! Market metadata types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Opaque market identifier (an on-chain address for ledger-backed markets).
pub type MarketId = String;

/// One side of a trading pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInfo {
    /// Ticker symbol (e.g., "SOL").
    pub symbol: String,
    /// Native decimals of the asset.
    pub decimals: u8,
}

impl AssetInfo {
    /// Create an asset descriptor.
    pub fn new(symbol: impl Into<String>, decimals: u8) -> Self {
        Self {
            symbol: symbol.into(),
            decimals,
        }
    }
}

/// Tradable market metadata. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    /// Market identifier.
    pub id: MarketId,
    /// Base asset.
    pub base: AssetInfo,
    /// Quote asset.
    pub quote: AssetInfo,
    /// Price tick of this market, if the source reports one.
    pub tick_size: Option<Decimal>,
}

impl Market {
    /// Pair symbol (e.g., "SOL/USDC").
    pub fn symbol(&self) -> String {
        format!("{}/{}", self.base.symbol, self.quote.symbol)
    }

    /// Tick size used for aggregation. Non-positive ticks fall back to `default`.
    pub fn tick_size_or(&self, default: Decimal) -> Decimal {
        match self.tick_size {
            Some(tick) if tick > Decimal::ZERO => tick,
            _ => default,
        }
    }
}
