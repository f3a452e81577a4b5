//! Connection liveness probing.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics;

use super::detector::FingerprintStore;
use super::registry::{Outbound, SubscriptionRegistry};

/// Outcome of one heartbeat round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Connections probed.
    pub pinged: usize,
    /// Connections closed and purged.
    pub pruned: usize,
}

/// Pings every connection periodically and prunes the silent ones.
pub struct HeartbeatMonitor {
    registry: Arc<SubscriptionRegistry>,
    store: Arc<FingerprintStore>,
    interval: Duration,
    grace: Duration,
}

impl HeartbeatMonitor {
    /// Create a monitor.
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        store: Arc<FingerprintStore>,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            interval,
            grace,
        }
    }

    /// Run one round: prune dead connections, ping the rest.
    pub fn check(&self, now: Instant) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();

        for handle in self.registry.connections() {
            if handle.is_closed() || handle.is_dead(now, self.interval, self.grace) {
                info!(conn = handle.id(), "Pruning unresponsive connection");
                for market_id in self.registry.purge(handle.id()) {
                    self.store.discard(&market_id);
                }
                metrics::inc_connections_pruned();
                report.pruned += 1;
                continue;
            }

            if handle.try_send(Outbound::Ping).is_err() {
                handle.mark_suspect(now);
            }
            report.pinged += 1;
        }

        debug!(pinged = report.pinged, pruned = report.pruned, "Heartbeat round");
        report
    }

    /// Run rounds every interval until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_s = self.interval.as_secs(),
            grace_s = self.grace.as_secs(),
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check(Instant::now());
                }
            }
        }

        info!("Heartbeat monitor stopped");
    }
}
