//! Market module.
//!
//! This module handles:
//! - Market metadata types
//! - The market data source interface
//! - The single-flight metadata cache
//! - An in-memory source for tests and the demo server

pub mod cache;
pub mod mock;
pub mod source;
pub mod types;

pub use cache::MarketCache;
pub use mock::{MockBookBuilder, MockMarketSource};
pub use source::MarketDataSource;
pub use types::{AssetInfo, Market, MarketId};
