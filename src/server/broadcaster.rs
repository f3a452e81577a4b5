//! Fan-out of encoded snapshots to subscriber queues.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SendError;
use crate::metrics;
use crate::protocol::ServerMessage;
use crate::orderbook::OrderBookSnapshot;

use super::registry::{ConnectionHandle, ConnectionId, Outbound, SubscriptionRegistry};

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Connections the payload was enqueued to.
    pub delivered: usize,
    /// Connections whose queue rejected the payload.
    pub failed: usize,
}

/// Pushes snapshots to every subscriber of a market.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<SubscriptionRegistry>,
}

impl Broadcaster {
    /// Create a broadcaster over `registry`.
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    /// Encode a snapshot once into a shareable payload.
    pub fn encode(snapshot: &OrderBookSnapshot) -> Result<Arc<str>, serde_json::Error> {
        Ok(ServerMessage::from_snapshot(snapshot).encode()?.into())
    }

    /// Enqueue `payload` to every subscriber of `market_id`.
    ///
    /// Handles are cloned out of the registry first; no lock is held while
    /// sending. A failed enqueue marks that connection suspect and delivery
    /// to the others continues.
    pub fn publish(&self, market_id: &str, payload: Arc<str>) -> PublishReport {
        let handles = self.registry.handles_for(market_id);
        let mut report = PublishReport::default();

        for handle in &handles {
            match deliver(handle, payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(_) => report.failed += 1,
            }
        }

        metrics::record_broadcast(report.delivered);
        debug!(
            market_id,
            delivered = report.delivered,
            failed = report.failed,
            "Snapshot published"
        );
        report
    }

    /// Enqueue `payload` to a single connection.
    pub fn send_to(&self, conn: ConnectionId, payload: Arc<str>) -> Result<(), SendError> {
        let handle = self.registry.handle(conn).ok_or(SendError::Closed(conn))?;
        deliver(&handle, payload)
    }
}

fn deliver(handle: &ConnectionHandle, payload: Arc<str>) -> Result<(), SendError> {
    handle.try_send(Outbound::Text(payload)).inspect_err(|e| {
        warn!(conn = handle.id(), error = %e, "Failed to enqueue payload");
        metrics::inc_send_failures();
        handle.mark_suspect(Instant::now());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};
    use tokio_util::sync::CancellationToken;

    use crate::orderbook::PriceLevel;

    fn snapshot() -> OrderBookSnapshot {
        OrderBookSnapshot {
            market_id: "M1".to_string(),
            bids: vec![PriceLevel::new(dec!(20.44), dec!(100.5))],
            asks: vec![PriceLevel::new(dec!(20.46), dec!(80.3))],
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_with_identical_payload() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let shutdown = CancellationToken::new();
        let (a, mut rx_a) = ConnectionHandle::channel(1, 4, &shutdown);
        let (b, mut rx_b) = ConnectionHandle::channel(2, 4, &shutdown);
        let (c, mut rx_c) = ConnectionHandle::channel(3, 4, &shutdown);
        for handle in [&a, &b, &c] {
            registry.register(handle.clone());
        }
        registry.subscribe(1, "M1");
        registry.subscribe(2, "M1");
        registry.subscribe(3, "M2");

        let broadcaster = Broadcaster::new(registry);
        let payload = Broadcaster::encode(&snapshot()).unwrap();
        let report = broadcaster.publish("M1", payload.clone());

        assert_eq!(report, PublishReport { delivered: 2, failed: 0 });
        assert_eq!(rx_a.recv().await, Some(Outbound::Text(payload.clone())));
        assert_eq!(rx_b.recv().await, Some(Outbound::Text(payload)));
        assert_err!(rx_c.try_recv());
    }

    #[tokio::test]
    async fn full_queue_is_isolated() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let shutdown = CancellationToken::new();
        let (slow, _rx_slow) = ConnectionHandle::channel(1, 1, &shutdown);
        let (fast, mut rx_fast) = ConnectionHandle::channel(2, 4, &shutdown);
        registry.register(slow.clone());
        registry.register(fast.clone());
        registry.subscribe(1, "M1");
        registry.subscribe(2, "M1");
        assert_ok!(slow.try_send(Outbound::Ping));

        let broadcaster = Broadcaster::new(registry);
        let report = broadcaster.publish("M1", Broadcaster::encode(&snapshot()).unwrap());

        assert_eq!(report, PublishReport { delivered: 1, failed: 1 });
        assert!(slow.is_suspect());
        assert!(!fast.is_suspect());
        assert!(matches!(rx_fast.recv().await, Some(Outbound::Text(_))));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_empty() {
        let broadcaster = Broadcaster::new(Arc::new(SubscriptionRegistry::new()));

        let report = broadcaster.publish("M1", Arc::from("{}"));

        assert_eq!(report, PublishReport::default());
    }

    #[tokio::test]
    async fn send_to_unknown_connection_fails() {
        let broadcaster = Broadcaster::new(Arc::new(SubscriptionRegistry::new()));

        assert_eq!(
            broadcaster.send_to(9, Arc::from("{}")),
            Err(SendError::Closed(9))
        );
    }

    #[test]
    fn encode_produces_orderbook_frame() {
        let payload = Broadcaster::encode(&snapshot()).unwrap();

        assert!(payload.starts_with(r#"{"type":"orderbook","market":"M1""#));
    }
}
