//! Lazily populated market metadata cache.
//!
//! Each market id maps to its own [`OnceCell`], so concurrent requests for the
//! same unloaded market share one in-flight source call while requests for
//! different markets proceed independently. Failed loads leave the cell
//! empty; the next request retries.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::MarketLoadError;
use crate::metrics;

use super::source::MarketDataSource;
use super::types::{Market, MarketId};

/// Memoizing front of a [`MarketDataSource`].
pub struct MarketCache<S> {
    source: Arc<S>,
    entries: DashMap<MarketId, Arc<OnceCell<Market>>>,
}

impl<S: MarketDataSource> MarketCache<S> {
    /// Create an empty cache over `source`.
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            entries: DashMap::new(),
        }
    }

    /// Underlying source.
    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Return the market, loading it from the source on first use.
    pub async fn load(&self, market_id: &str) -> Result<Market, MarketLoadError> {
        let cell = self
            .entries
            .entry(market_id.to_string())
            .or_default()
            .value()
            .clone();

        if let Some(market) = cell.get() {
            return Ok(market.clone());
        }

        let loaded = cell
            .get_or_try_init(|| async {
                debug!(market_id, "Loading market from source");
                metrics::inc_market_loads();

                match self.source.load(market_id).await {
                    Ok(market) => {
                        info!(market_id, symbol = %market.symbol(), "Market loaded");
                        Ok(market)
                    }
                    Err(cause) => {
                        warn!(market_id, error = %cause, "Market load failed");
                        metrics::inc_market_load_failures();
                        Err(MarketLoadError {
                            market_id: market_id.to_string(),
                            cause,
                        })
                    }
                }
            })
            .await;

        match loaded {
            Ok(market) => Ok(market.clone()),
            Err(e) => {
                // Only drop the cell this call created; a concurrent retry may
                // have replaced it already
                self.entries.remove_if(market_id, |_, current| {
                    Arc::ptr_eq(current, &cell) && !current.initialized()
                });
                Err(e)
            }
        }
    }

    /// Check if a market is loaded.
    pub fn is_loaded(&self, market_id: &str) -> bool {
        self.entries
            .get(market_id)
            .is_some_and(|cell| cell.initialized())
    }

    /// Drop a cached market so the next request reloads it.
    pub fn evict(&self, market_id: &str) -> bool {
        let removed = self.entries.remove(market_id).is_some();
        if removed {
            debug!(market_id, "Market evicted");
        }
        removed
    }

    /// Number of loaded markets.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().initialized()).count()
    }

    /// Check if no market is loaded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
