//! Prometheus metrics for the distribution service and its client.
//!
//! This module provides metrics for:
//! - Connection lifecycle and heartbeat pruning
//! - Snapshot broadcasts and per-connection send failures
//! - Market data source latency and cache loads
//! - Client reconnects and received messages

use std::time::Instant;

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use tracing::debug;

// === Metric Name Constants ===

/// Connections accepted counter metric name.
pub const METRIC_CONNECTIONS_OPENED: &str = "ws_connections_opened_total";
/// Connections closed counter metric name.
pub const METRIC_CONNECTIONS_CLOSED: &str = "ws_connections_closed_total";
/// Currently open connections gauge metric name.
pub const METRIC_ACTIVE_CONNECTIONS: &str = "ws_active_connections";
/// Connections pruned by the heartbeat monitor.
pub const METRIC_CONNECTIONS_PRUNED: &str = "ws_connections_pruned_total";
/// Subscriptions added counter metric name.
pub const METRIC_SUBSCRIPTIONS: &str = "subscriptions_total";
/// Malformed inbound messages counter metric name.
pub const METRIC_MALFORMED_MESSAGES: &str = "malformed_messages_total";
/// Snapshots broadcast counter metric name.
pub const METRIC_SNAPSHOTS_BROADCAST: &str = "snapshots_broadcast_total";
/// Individual payload deliveries counter metric name.
pub const METRIC_PAYLOADS_SENT: &str = "payloads_sent_total";
/// Per-connection send failures counter metric name.
pub const METRIC_SEND_FAILURES: &str = "send_failures_total";
/// External market loads counter metric name.
pub const METRIC_MARKET_LOADS: &str = "market_loads_total";
/// Failed external market loads counter metric name.
pub const METRIC_MARKET_LOAD_FAILURES: &str = "market_load_failures_total";
/// Source book fetch latency metric name.
pub const METRIC_SOURCE_FETCH_LATENCY: &str = "source_fetch_latency_ms";
/// Detector poll cycle latency metric name.
pub const METRIC_DETECTOR_POLL_LATENCY: &str = "detector_poll_latency_ms";
/// Client messages received counter metric name.
pub const METRIC_CLIENT_MESSAGES_RECEIVED: &str = "client_messages_received_total";
/// Client reconnects counter metric name.
pub const METRIC_CLIENT_RECONNECTS: &str = "client_reconnects_total";

/// Initialize all metric descriptions.
/// Call this once at startup to register metrics with descriptions.
pub fn init_metrics() {
    describe_histogram!(
        METRIC_SOURCE_FETCH_LATENCY,
        "Market data source book fetch latency in milliseconds"
    );
    describe_histogram!(
        METRIC_DETECTOR_POLL_LATENCY,
        "Duration of one change detector cycle in milliseconds"
    );

    describe_gauge!(METRIC_ACTIVE_CONNECTIONS, "Currently open WebSocket connections");

    describe_counter!(METRIC_CONNECTIONS_OPENED, "Total WebSocket connections accepted");
    describe_counter!(METRIC_CONNECTIONS_CLOSED, "Total WebSocket connections closed");
    describe_counter!(
        METRIC_CONNECTIONS_PRUNED,
        "Total connections closed by the heartbeat monitor"
    );
    describe_counter!(METRIC_SUBSCRIPTIONS, "Total subscriptions added");
    describe_counter!(
        METRIC_MALFORMED_MESSAGES,
        "Total inbound messages that could not be parsed"
    );
    describe_counter!(
        METRIC_SNAPSHOTS_BROADCAST,
        "Total order book snapshots fanned out to subscribers"
    );
    describe_counter!(METRIC_PAYLOADS_SENT, "Total payloads enqueued to connections");
    describe_counter!(
        METRIC_SEND_FAILURES,
        "Total payloads that could not be enqueued to a connection"
    );
    describe_counter!(METRIC_MARKET_LOADS, "Total external market metadata loads");
    describe_counter!(
        METRIC_MARKET_LOAD_FAILURES,
        "Total external market metadata loads that failed"
    );
    describe_counter!(
        METRIC_CLIENT_MESSAGES_RECEIVED,
        "Total WebSocket messages received by the client"
    );
    describe_counter!(METRIC_CLIENT_RECONNECTS, "Total client reconnect attempts");

    debug!("Metrics initialized");
}

/// Record source book fetch latency.
pub fn record_source_fetch_latency(start: Instant, market_id: &str) {
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    histogram!(METRIC_SOURCE_FETCH_LATENCY, "market" => market_id.to_string()).record(latency_ms);
}

/// Record a connection being accepted.
pub fn inc_connections_opened() {
    counter!(METRIC_CONNECTIONS_OPENED).increment(1);
    gauge!(METRIC_ACTIVE_CONNECTIONS).increment(1.0);
}

/// Record a connection being closed.
pub fn inc_connections_closed() {
    counter!(METRIC_CONNECTIONS_CLOSED).increment(1);
    gauge!(METRIC_ACTIVE_CONNECTIONS).decrement(1.0);
}

/// Increment heartbeat pruned counter.
pub fn inc_connections_pruned() {
    counter!(METRIC_CONNECTIONS_PRUNED).increment(1);
}

/// Increment subscriptions counter.
pub fn inc_subscriptions() {
    counter!(METRIC_SUBSCRIPTIONS).increment(1);
}

/// Increment malformed messages counter.
pub fn inc_malformed_messages() {
    counter!(METRIC_MALFORMED_MESSAGES).increment(1);
}

/// Record one snapshot fanned out to `delivered` connections.
pub fn record_broadcast(delivered: usize) {
    counter!(METRIC_SNAPSHOTS_BROADCAST).increment(1);
    counter!(METRIC_PAYLOADS_SENT).increment(delivered as u64);
}

/// Increment send failures counter.
pub fn inc_send_failures() {
    counter!(METRIC_SEND_FAILURES).increment(1);
}

/// Increment external market loads counter.
pub fn inc_market_loads() {
    counter!(METRIC_MARKET_LOADS).increment(1);
}

/// Increment failed market loads counter.
pub fn inc_market_load_failures() {
    counter!(METRIC_MARKET_LOAD_FAILURES).increment(1);
}

/// Increment client messages received counter.
pub fn inc_client_messages_received() {
    counter!(METRIC_CLIENT_MESSAGES_RECEIVED).increment(1);
}

/// Increment client reconnects counter.
pub fn inc_client_reconnects() {
    counter!(METRIC_CLIENT_RECONNECTS).increment(1);
}

/// RAII guard for timing operations.
/// Automatically records latency when dropped.
pub struct LatencyTimer {
    start: Instant,
    metric_name: &'static str,
}

impl LatencyTimer {
    /// Create a new latency timer for the given metric.
    pub fn new(metric_name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            metric_name,
        }
    }

    /// Get elapsed time in milliseconds (without recording).
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        histogram!(self.metric_name).record(latency_ms);
    }
}

/// Create a latency timer for one detector cycle.
pub fn timer_detector_poll() -> LatencyTimer {
    LatencyTimer::new(METRIC_DETECTOR_POLL_LATENCY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn latency_timer_measures_time() {
        let timer = LatencyTimer::new("test_metric");
        sleep(Duration::from_millis(10));
        let elapsed = timer.elapsed_ms();
        assert!(elapsed >= 9.0); // Allow some tolerance
    }

    #[test]
    fn helpers_work_without_recorder() {
        init_metrics();
        inc_connections_opened();
        record_broadcast(3);
        inc_connections_closed();
    }
}
