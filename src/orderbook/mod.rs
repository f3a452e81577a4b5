//! Order book module.
//!
//! This module handles:
//! - Order book types and data structures
//! - Tick bucketing and depth-limited aggregation
//! - Content fingerprints used to suppress unchanged broadcasts

pub mod aggregator;
pub mod fingerprint;
pub mod types;

pub use aggregator::{aggregate, bucket_price, mid_price, normalize, DEFAULT_DEPTH};
pub use fingerprint::fingerprint;
pub use types::{OrderBookSnapshot, PriceLevel, RawBook, Side};
