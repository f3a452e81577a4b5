//! In-memory market data source.
//!
//! Used by the tests and by the `serve` command, which runs against a seeded
//! demo market when no ledger connection is configured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::broadcast;

use crate::error::SourceError;
use crate::orderbook::{PriceLevel, RawBook};

use super::source::MarketDataSource;
use super::types::{AssetInfo, Market, MarketId};

#[derive(Debug, Default)]
struct MockState {
    markets: Mutex<HashMap<MarketId, Market>>,
    books: Mutex<HashMap<MarketId, RawBook>>,
    fail_load: AtomicBool,
    fail_fetch: AtomicBool,
    latency_ms: AtomicU64,
    load_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

/// Mock market data source. Clones share state.
#[derive(Debug, Clone)]
pub struct MockMarketSource {
    state: Arc<MockState>,
    changes: broadcast::Sender<MarketId>,
    change_feed: bool,
}

impl MockMarketSource {
    /// Demo SOL/USDC market address.
    pub const DEMO_MARKET: &'static str = "HWHvQhFmJB3NUcu1aihKmrKegfVxBEHzwVX6yZCKEsi1";

    /// Create an empty source without a change feed.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            state: Arc::new(MockState::default()),
            changes,
            change_feed: false,
        }
    }

    /// Expose a change feed through [`MarketDataSource::changes`].
    pub fn with_change_feed(mut self) -> Self {
        self.change_feed = true;
        self
    }

    /// Source seeded with the demo SOL/USDC market and its sample book.
    pub fn demo() -> Self {
        let source = Self::new();
        source.add_market(Market {
            id: Self::DEMO_MARKET.to_string(),
            base: AssetInfo::new("SOL", 9),
            quote: AssetInfo::new("USDC", 6),
            tick_size: Some(dec!(0.01)),
        });
        source.set_book(
            Self::DEMO_MARKET,
            MockBookBuilder::new()
                .bid(dec!(20.44), dec!(100.5))
                .bid(dec!(20.43), dec!(50.2))
                .bid(dec!(20.42), dec!(75.8))
                .ask(dec!(20.46), dec!(80.3))
                .ask(dec!(20.47), dec!(45.6))
                .ask(dec!(20.48), dec!(120.1))
                .build(),
        );
        source
    }

    /// Register a market.
    pub fn add_market(&self, market: Market) {
        let mut markets = self
            .state
            .markets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        markets.insert(market.id.clone(), market);
    }

    /// Replace the book of a market.
    pub fn set_book(&self, market_id: &str, book: RawBook) {
        let mut books = self
            .state
            .books
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        books.insert(market_id.to_string(), book);
    }

    /// Current raw book of a market, if one was set.
    pub fn book(&self, market_id: &str) -> Option<RawBook> {
        self.state
            .books
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(market_id)
            .cloned()
    }

    /// Publish a change notification. Returns false if nobody listens.
    pub fn notify_change(&self, market_id: &str) -> bool {
        self.changes.send(market_id.to_string()).is_ok()
    }

    /// Make market loads fail.
    pub fn set_fail_load(&self, fail: bool) {
        self.state.fail_load.store(fail, Ordering::SeqCst);
    }

    /// Make book fetches fail.
    pub fn set_fail_fetch(&self, fail: bool) {
        self.state.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Simulated latency applied to every call.
    pub fn set_latency_ms(&self, latency_ms: u64) {
        self.state.latency_ms.store(latency_ms, Ordering::SeqCst);
    }

    /// Number of `load` calls received.
    pub fn load_calls(&self) -> usize {
        self.state.load_calls.load(Ordering::SeqCst)
    }

    /// Number of `fetch_book` calls received.
    pub fn fetch_calls(&self) -> usize {
        self.state.fetch_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency_ms = self.state.latency_ms.load(Ordering::SeqCst);
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }
    }
}

impl Default for MockMarketSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketDataSource for MockMarketSource {
    async fn load(&self, market_id: &str) -> Result<Market, SourceError> {
        self.state.load_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if self.state.fail_load.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("mock load failure".to_string()));
        }

        self.state
            .markets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(market_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(market_id.to_string()))
    }

    async fn fetch_book(&self, market_id: &str) -> Result<RawBook, SourceError> {
        self.state.fetch_calls.fetch_add(1, Ordering::SeqCst);

        // Book is read at request time, latency applies to the response
        let known = self
            .state
            .markets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(market_id);
        let book = self.book(market_id);
        self.simulate_latency().await;

        if self.state.fail_fetch.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("mock fetch failure".to_string()));
        }
        if !known {
            return Err(SourceError::NotFound(market_id.to_string()));
        }

        // Markets without a configured book are empty
        Ok(book.unwrap_or_default())
    }

    fn changes(&self) -> Option<broadcast::Receiver<MarketId>> {
        self.change_feed.then(|| self.changes.subscribe())
    }
}

/// Builder for raw books with common patterns.
#[derive(Debug, Default)]
pub struct MockBookBuilder {
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
}

impl MockBookBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bid level.
    pub fn bid(mut self, price: Decimal, size: Decimal) -> Self {
        self.bids.push(PriceLevel::new(price, size));
        self
    }

    /// Add an ask level.
    pub fn ask(mut self, price: Decimal, size: Decimal) -> Self {
        self.asks.push(PriceLevel::new(price, size));
        self
    }

    /// Two levels per side around the given best prices.
    pub fn with_spread(mut self, best_bid: Decimal, best_ask: Decimal, size: Decimal) -> Self {
        let tick = Decimal::new(1, 2);
        self.bids = vec![
            PriceLevel::new(best_bid, size),
            PriceLevel::new(best_bid - tick, size * Decimal::TWO),
        ];
        self.asks = vec![
            PriceLevel::new(best_ask, size),
            PriceLevel::new(best_ask + tick, size * Decimal::TWO),
        ];
        self
    }

    /// Build the raw book. Levels keep insertion order.
    pub fn build(self) -> RawBook {
        RawBook::new(self.bids, self.asks)
    }
}
