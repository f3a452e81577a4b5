//! Shared server state and the subscription workflow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::MarketLoadError;
use crate::market::{MarketCache, MarketDataSource};
use crate::metrics;

use super::detector::{ChangeDetector, FingerprintStore};
use super::heartbeat::HeartbeatMonitor;
use super::registry::{ConnectionHandle, ConnectionId, Outbound, SubscribeOutcome, SubscriptionRegistry};
use super::ServerSettings;

/// Everything a connection session and the background tasks share.
pub struct ServerState<S> {
    settings: ServerSettings,
    cache: Arc<MarketCache<S>>,
    registry: Arc<SubscriptionRegistry>,
    detector: Arc<ChangeDetector<S>>,
    heartbeat: Arc<HeartbeatMonitor>,
    shutdown: CancellationToken,
    ready: AtomicBool,
}

impl<S> ServerState<S> {
    /// Token cancelled when the server stops.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Set ready state.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Check if ready.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl<S: MarketDataSource> ServerState<S> {
    /// Wire up cache, registry, detector and heartbeat over `source`.
    pub fn new(source: Arc<S>, settings: ServerSettings) -> Self {
        let cache = Arc::new(MarketCache::new(source));
        let registry = Arc::new(SubscriptionRegistry::new());
        let store = Arc::new(FingerprintStore::default());
        let detector = Arc::new(ChangeDetector::new(
            cache.clone(),
            registry.clone(),
            store.clone(),
            settings.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            store,
            settings.heartbeat_interval,
            settings.heartbeat_grace,
        ));

        Self {
            settings,
            cache,
            registry,
            detector,
            heartbeat,
            shutdown: CancellationToken::new(),
            ready: AtomicBool::new(false),
        }
    }

    /// Server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Market metadata cache.
    pub fn cache(&self) -> &Arc<MarketCache<S>> {
        &self.cache
    }

    /// Connection and subscription registry.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Change detector.
    pub fn detector(&self) -> &Arc<ChangeDetector<S>> {
        &self.detector
    }

    /// Heartbeat monitor.
    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    /// Register a new connection and return its handle and outbound queue.
    pub fn open_connection(&self) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
        let id = self.registry.next_connection_id();
        let (handle, outbound) =
            ConnectionHandle::channel(id, self.settings.send_queue_capacity, &self.shutdown);
        self.registry.register(handle.clone());
        metrics::inc_connections_opened();
        (handle, outbound)
    }

    /// Subscribe a connection to a market and push it the current snapshot.
    ///
    /// The market is loaded first; on failure nothing is registered and the
    /// error is returned for the caller to report. A repeated subscribe is a
    /// no-op.
    pub async fn subscribe(
        &self,
        conn: ConnectionId,
        market_id: &str,
    ) -> Result<SubscribeOutcome, MarketLoadError> {
        self.cache.load(market_id).await?;

        let outcome = self.registry.subscribe(conn, market_id);
        if let SubscribeOutcome::Added { first_for_market } = outcome {
            metrics::inc_subscriptions();
            debug!(conn, market_id, first_for_market, "Priming new subscriber");
            if let Err(e) = self.detector.prime(conn, market_id).await {
                // Subscription stays; the next poll delivers once the source recovers
                warn!(conn, market_id, error = %e, "Initial snapshot failed");
                if let Some(handle) = self.registry.handle(conn) {
                    handle.send_error(e.to_string());
                }
            }
        }
        Ok(outcome)
    }

    /// Remove one subscription. Returns true if the market went inactive.
    pub fn unsubscribe(&self, conn: ConnectionId, market_id: &str) -> bool {
        let emptied = self.registry.unsubscribe(conn, market_id);
        if emptied {
            self.detector.deactivate(market_id);
        }
        emptied
    }

    /// Forget a closed connection and everything it subscribed to.
    pub fn disconnect(&self, conn: ConnectionId) {
        for market_id in self.registry.purge(conn) {
            self.detector.deactivate(&market_id);
        }
        metrics::inc_connections_closed();
    }
}
