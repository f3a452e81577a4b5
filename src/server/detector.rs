//! Change detection loop.
//!
//! On every tick the detector fetches the book of each market that has at
//! least one subscriber, normalizes it, and publishes only when the content
//! fingerprint differs from the last broadcast one. Markets nobody watches
//! are never polled.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant as StdInstant;

use futures::future::join_all;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::FetchError;
use crate::market::{MarketCache, MarketDataSource, MarketId};
use crate::metrics;
use crate::orderbook::{fingerprint, normalize, OrderBookSnapshot};

use super::broadcaster::{Broadcaster, PublishReport};
use super::registry::{ConnectionId, SubscriptionRegistry};
use super::ServerSettings;

#[derive(Debug, Clone)]
struct Published {
    fingerprint: String,
    payload: Arc<str>,
}

/// Last broadcast fingerprint and payload per active market.
#[derive(Debug, Default)]
pub struct FingerprintStore {
    inner: Mutex<HashMap<MarketId, Published>>,
}

impl FingerprintStore {
    /// Store `fingerprint` if it differs from the current one.
    /// Returns true when the caller should broadcast.
    pub fn record_if_changed(&self, market_id: &str, fingerprint: String, payload: Arc<str>) -> bool {
        let mut inner = self.lock();
        if inner
            .get(market_id)
            .is_some_and(|p| p.fingerprint == fingerprint)
        {
            return false;
        }
        inner.insert(
            market_id.to_string(),
            Published {
                fingerprint,
                payload,
            },
        );
        true
    }

    /// Store a first baseline for a market that has none.
    /// Returns false, leaving the entry alone, when one already exists.
    pub fn record_if_absent(&self, market_id: &str, fingerprint: String, payload: Arc<str>) -> bool {
        match self.lock().entry(market_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Published {
                    fingerprint,
                    payload,
                });
                true
            }
        }
    }

    /// Last broadcast payload of a market.
    pub fn last_payload(&self, market_id: &str) -> Option<Arc<str>> {
        self.lock().get(market_id).map(|p| p.payload.clone())
    }

    /// Last broadcast fingerprint of a market.
    pub fn fingerprint_of(&self, market_id: &str) -> Option<String> {
        self.lock().get(market_id).map(|p| p.fingerprint.clone())
    }

    /// Forget a market. The next snapshot for it is always broadcast.
    pub fn discard(&self, market_id: &str) -> bool {
        self.lock().remove(market_id).is_some()
    }

    /// Number of markets tracked.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if no market is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MarketId, Published>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of polling one market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Content changed and was broadcast.
    Published(PublishReport),
    /// Fingerprint matched the last broadcast one.
    Unchanged,
    /// Market has no subscribers.
    Skipped,
}

/// Polls subscribed markets and broadcasts changed books.
pub struct ChangeDetector<S> {
    cache: Arc<MarketCache<S>>,
    registry: Arc<SubscriptionRegistry>,
    broadcaster: Broadcaster,
    store: Arc<FingerprintStore>,
    settings: ServerSettings,
}

impl<S: MarketDataSource> ChangeDetector<S> {
    /// Create a detector.
    pub fn new(
        cache: Arc<MarketCache<S>>,
        registry: Arc<SubscriptionRegistry>,
        store: Arc<FingerprintStore>,
        settings: ServerSettings,
    ) -> Self {
        Self {
            broadcaster: Broadcaster::new(registry.clone()),
            cache,
            registry,
            store,
            settings,
        }
    }

    /// Shared fingerprint store.
    pub fn store(&self) -> &Arc<FingerprintStore> {
        &self.store
    }

    /// Fetch and normalize the current book of a market.
    ///
    /// The fetch is bounded by one polling interval. Crossed books are
    /// returned as-is.
    pub async fn current_snapshot(&self, market_id: &str) -> Result<OrderBookSnapshot, FetchError> {
        let market = self.cache.load(market_id).await?;

        let start = StdInstant::now();
        let raw = timeout(
            self.settings.poll_interval,
            self.cache.source().fetch_book(market_id),
        )
        .await
        .map_err(|_| FetchError::Timeout {
            market_id: market_id.to_string(),
            timeout_ms: self.settings.poll_interval.as_millis() as u64,
        })?
        .map_err(|cause| FetchError::Source {
            market_id: market_id.to_string(),
            cause,
        })?;
        metrics::record_source_fetch_latency(start, market_id);

        let snapshot = normalize(
            market_id,
            &raw,
            market.tick_size_or(self.settings.default_tick_size),
            self.settings.depth,
        );

        if snapshot.is_crossed() {
            warn!(
                market_id,
                best_bid = ?snapshot.best_bid(),
                best_ask = ?snapshot.best_ask(),
                "Crossed book"
            );
        }

        Ok(snapshot)
    }

    /// Poll one market and broadcast if its content changed.
    #[instrument(skip(self))]
    pub async fn poll_market(&self, market_id: &str) -> Result<PollOutcome, FetchError> {
        if !self.registry.has_subscribers(market_id) {
            return Ok(PollOutcome::Skipped);
        }

        let snapshot = self.current_snapshot(market_id).await?;
        let fingerprint = fingerprint(&snapshot);
        let payload = Broadcaster::encode(&snapshot)?;

        if !self.store.record_if_changed(market_id, fingerprint, payload.clone()) {
            return Ok(PollOutcome::Unchanged);
        }

        // Last subscriber may have left while fetching
        if !self.registry.has_subscribers(market_id) {
            self.store.discard(market_id);
            return Ok(PollOutcome::Skipped);
        }

        Ok(PollOutcome::Published(
            self.broadcaster.publish(market_id, payload),
        ))
    }

    /// Poll every market with subscribers concurrently.
    /// Returns the number of markets that were broadcast.
    pub async fn poll_once(&self) -> usize {
        let markets = self.registry.active_markets();
        if markets.is_empty() {
            return 0;
        }

        let outcomes = join_all(markets.iter().map(|m| self.poll_market(m))).await;

        let mut published = 0;
        for (market_id, outcome) in markets.iter().zip(outcomes) {
            match outcome {
                Ok(PollOutcome::Published(_)) => published += 1,
                Ok(_) => {}
                Err(e) => warn!(market_id = %market_id, error = %e, "Poll failed"),
            }
        }
        published
    }

    /// Push the current snapshot to a connection that just subscribed.
    ///
    /// An active market answers from the last broadcast payload without a
    /// fetch. Otherwise the book is fetched and, if no baseline appeared
    /// meanwhile, broadcast to all subscribers as the first baseline. A
    /// baseline set by a concurrent poll wins and only `conn` is answered.
    pub async fn prime(&self, conn: ConnectionId, market_id: &str) -> Result<(), FetchError> {
        if let Some(payload) = self.store.last_payload(market_id) {
            debug!(conn, market_id, "Sending cached snapshot");
            let _ = self.broadcaster.send_to(conn, payload);
            return Ok(());
        }

        let snapshot = self.current_snapshot(market_id).await?;
        let payload = Broadcaster::encode(&snapshot)?;

        if self
            .store
            .record_if_absent(market_id, fingerprint(&snapshot), payload.clone())
        {
            self.broadcaster.publish(market_id, payload);
        } else {
            let newer = self.store.last_payload(market_id).unwrap_or(payload);
            let _ = self.broadcaster.send_to(conn, newer);
        }
        Ok(())
    }

    /// Stop tracking a market that lost its last subscriber.
    pub fn deactivate(&self, market_id: &str) {
        if self.store.discard(market_id) {
            debug!(market_id, "Market deactivated");
        }
    }

    /// Run the polling loop until `cancel` fires.
    ///
    /// If the source exposes a change feed, notifications for subscribed
    /// markets trigger an immediate poll; the timer keeps running either way.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut changes = self.cache.source().changes();

        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            change_feed = changes.is_some(),
            "Change detector started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let timer = metrics::timer_detector_poll();
                    let published = self.poll_once().await;
                    let elapsed_ms = timer.elapsed_ms();
                    if elapsed_ms > self.settings.poll_interval.as_secs_f64() * 1000.0 {
                        warn!(elapsed_ms, published, "Poll cycle overran its interval");
                    } else if published > 0 {
                        debug!(elapsed_ms, published, "Poll cycle");
                    }
                }
                market_id = next_change(&mut changes) => {
                    if let Err(e) = self.poll_market(&market_id).await {
                        warn!(market_id = %market_id, error = %e, "Poll after change failed");
                    }
                }
            }
        }

        info!("Change detector stopped");
    }
}

/// Next market id from the change feed. Pends forever without a feed.
async fn next_change(changes: &mut Option<broadcast::Receiver<MarketId>>) -> MarketId {
    loop {
        let received = match changes.as_mut() {
            Some(rx) => rx.recv().await,
            None => return std::future::pending().await,
        };

        match received {
            Ok(market_id) => return market_id,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Change feed lagged, polling covers the gap");
            }
            Err(RecvError::Closed) => {
                warn!("Change feed closed, falling back to polling");
                *changes = None;
            }
        }
    }
}
