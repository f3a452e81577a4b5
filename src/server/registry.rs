//! Connection and subscription registry.
//!
//! Tracks every open connection and the markets it subscribed to. All
//! mutations go through one mutex; callers clone handles out and do their
//! I/O after the lock is released.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SendError;
use crate::market::MarketId;
use crate::protocol::ServerMessage;

/// Unique connection identifier, assigned on accept.
pub type ConnectionId = u64;

/// Frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Pre-encoded JSON text frame, shared between all recipients.
    Text(Arc<str>),
    /// Transport-level liveness probe.
    Ping,
}

#[derive(Debug)]
struct Liveness {
    last_seen: Instant,
    suspect_since: Option<Instant>,
}

/// Server-side handle to one connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<Outbound>,
    liveness: Mutex<Liveness>,
    close: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle with a bounded outbound queue. The close token is a
    /// child of `shutdown`, so stopping the server closes every connection.
    pub fn channel(
        id: ConnectionId,
        capacity: usize,
        shutdown: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            sender,
            liveness: Mutex::new(Liveness {
                last_seen: Instant::now(),
                suspect_since: None,
            }),
            close: shutdown.child_token(),
        };
        (Arc::new(handle), receiver)
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue a frame without waiting. Fails when the queue is full or the
    /// writer is gone.
    pub fn try_send(&self, frame: Outbound) -> Result<(), SendError> {
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull(self.id),
            TrySendError::Closed(_) => SendError::Closed(self.id),
        })
    }

    /// Enqueue an error frame. The connection stays open either way.
    pub fn send_error(&self, message: impl Into<String>) {
        match ServerMessage::error(message).encode() {
            Ok(text) => {
                if let Err(e) = self.try_send(Outbound::Text(text.into())) {
                    debug!(conn = self.id, error = %e, "Dropped error frame");
                }
            }
            Err(e) => warn!(conn = self.id, error = %e, "Failed to encode error frame"),
        }
    }

    /// Record inbound traffic (pong or any client frame).
    pub fn record_activity(&self, now: Instant) {
        let mut liveness = self.liveness();
        liveness.last_seen = now;
        liveness.suspect_since = None;
    }

    /// Flag the connection for an early liveness check. Keeps the first mark.
    pub fn mark_suspect(&self, now: Instant) {
        let mut liveness = self.liveness();
        if liveness.suspect_since.is_none() {
            liveness.suspect_since = Some(now);
        }
    }

    /// Whether the connection is currently suspect.
    pub fn is_suspect(&self) -> bool {
        self.liveness().suspect_since.is_some()
    }

    /// A connection is dead when it has been silent longer than
    /// `interval + grace`, or when it was marked suspect and stayed silent
    /// for the grace window.
    pub fn is_dead(&self, now: Instant, interval: Duration, grace: Duration) -> bool {
        let liveness = self.liveness();
        let silent = now.saturating_duration_since(liveness.last_seen);
        if silent > interval + grace {
            return true;
        }
        liveness
            .suspect_since
            .is_some_and(|since| now.saturating_duration_since(since) >= grace)
    }

    /// Ask the connection's tasks to shut down.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Whether close was requested.
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Token cancelled when the connection should close.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    fn liveness(&self) -> MutexGuard<'_, Liveness> {
        self.liveness.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Subscription recorded.
    Added {
        /// The market had no subscribers before this one.
        first_for_market: bool,
    },
    /// The connection was already subscribed; nothing changed.
    AlreadySubscribed,
    /// No such connection (it closed meanwhile).
    UnknownConnection,
}

#[derive(Debug, Default)]
struct Inner {
    connections: HashMap<ConnectionId, Arc<ConnectionHandle>>,
    subscriptions: HashMap<ConnectionId, HashSet<MarketId>>,
    subscribers: HashMap<MarketId, BTreeSet<ConnectionId>>,
}

impl Inner {
    /// Remove one subscriber, returning true if the market became empty.
    fn detach(&mut self, conn: ConnectionId, market_id: &str) -> bool {
        let Some(subscribers) = self.subscribers.get_mut(market_id) else {
            return false;
        };
        subscribers.remove(&conn);
        if subscribers.is_empty() {
            self.subscribers.remove(market_id);
            true
        } else {
            false
        }
    }
}

/// Registry of connections and their market subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh connection id.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Track a newly accepted connection.
    pub fn register(&self, handle: Arc<ConnectionHandle>) {
        let mut inner = self.lock();
        inner.subscriptions.entry(handle.id()).or_default();
        inner.connections.insert(handle.id(), handle);
    }

    /// Subscribe a connection to a market. Idempotent.
    pub fn subscribe(&self, conn: ConnectionId, market_id: &str) -> SubscribeOutcome {
        let mut inner = self.lock();
        if !inner.connections.contains_key(&conn) {
            return SubscribeOutcome::UnknownConnection;
        }

        let added = inner
            .subscriptions
            .entry(conn)
            .or_default()
            .insert(market_id.to_string());
        if !added {
            return SubscribeOutcome::AlreadySubscribed;
        }

        let subscribers = inner.subscribers.entry(market_id.to_string()).or_default();
        let first_for_market = subscribers.is_empty();
        subscribers.insert(conn);

        debug!(conn, market_id, first_for_market, "Subscribed");
        SubscribeOutcome::Added { first_for_market }
    }

    /// Remove one subscription. Returns true if the market lost its last
    /// subscriber. Unsubscribing a non-member is a no-op.
    pub fn unsubscribe(&self, conn: ConnectionId, market_id: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner
            .subscriptions
            .get_mut(&conn)
            .is_some_and(|markets| markets.remove(market_id));
        if !removed {
            return false;
        }

        debug!(conn, market_id, "Unsubscribed");
        inner.detach(conn, market_id)
    }

    /// Drop a connection with all of its subscriptions and close it.
    ///
    /// Returns the markets that lost their last subscriber. Purging an
    /// unknown connection is a no-op.
    pub fn purge(&self, conn: ConnectionId) -> Vec<MarketId> {
        let mut inner = self.lock();
        let Some(handle) = inner.connections.remove(&conn) else {
            return Vec::new();
        };
        handle.close();

        let markets = inner.subscriptions.remove(&conn).unwrap_or_default();
        let mut emptied: Vec<MarketId> = markets
            .into_iter()
            .filter(|market_id| inner.detach(conn, market_id))
            .collect();
        emptied.sort();

        debug!(conn, emptied = emptied.len(), "Connection purged");
        emptied
    }

    /// Connection ids subscribed to a market.
    pub fn subscribers_of(&self, market_id: &str) -> BTreeSet<ConnectionId> {
        self.lock()
            .subscribers
            .get(market_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Handles of all subscribers of a market, cloned out of the lock.
    pub fn handles_for(&self, market_id: &str) -> Vec<Arc<ConnectionHandle>> {
        let inner = self.lock();
        inner
            .subscribers
            .get(market_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Handle of one connection.
    pub fn handle(&self, conn: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.lock().connections.get(&conn).cloned()
    }

    /// Handles of every open connection.
    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.lock().connections.values().cloned().collect()
    }

    /// Ids of every open connection, ascending.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.lock().connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Markets with at least one subscriber, sorted.
    pub fn active_markets(&self) -> Vec<MarketId> {
        let mut markets: Vec<MarketId> = self.lock().subscribers.keys().cloned().collect();
        markets.sort();
        markets
    }

    /// Markets a connection is subscribed to.
    pub fn subscriptions_of(&self, conn: ConnectionId) -> BTreeSet<MarketId> {
        self.lock()
            .subscriptions
            .get(&conn)
            .map(|markets| markets.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a market has any subscriber.
    pub fn has_subscribers(&self, market_id: &str) -> bool {
        self.lock().subscribers.contains_key(market_id)
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    /// Flag a connection for an early liveness check.
    pub fn mark_suspect(&self, conn: ConnectionId, now: Instant) -> bool {
        match self.handle(conn) {
            Some(handle) => {
                handle.mark_suspect(now);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
