//! Read interface to the authoritative market data (ledger or exchange).

use std::future::Future;

use tokio::sync::broadcast;

use crate::error::SourceError;
use crate::orderbook::RawBook;

use super::types::{Market, MarketId};

/// Trait implemented by every market data backend.
///
/// The server never writes to a source. Implementations must be cheap to
/// share across tasks; the server holds one behind an `Arc`.
pub trait MarketDataSource: Send + Sync + 'static {
    /// Load the metadata of one market.
    fn load(&self, market_id: &str) -> impl Future<Output = Result<Market, SourceError>> + Send;

    /// Fetch the current raw book of one market.
    fn fetch_book(
        &self,
        market_id: &str,
    ) -> impl Future<Output = Result<RawBook, SourceError>> + Send;

    /// Optional push feed of market ids whose book changed.
    ///
    /// Sources without one are polled only.
    fn changes(&self) -> Option<broadcast::Receiver<MarketId>> {
        None
    }
}
