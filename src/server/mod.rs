//! Order book distribution server.
//!
//! This module handles:
//! - Connection and subscription bookkeeping
//! - Change detection and snapshot fan-out
//! - Heartbeat probing of idle connections
//! - The WebSocket session loop and the service lifecycle

pub mod broadcaster;
pub mod connection;
pub mod detector;
pub mod heartbeat;
pub mod registry;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::api::create_router;
use crate::error::{Result, ServiceError};
use crate::market::MarketDataSource;

pub use broadcaster::{Broadcaster, PublishReport};
pub use detector::{ChangeDetector, FingerprintStore, PollOutcome};
pub use heartbeat::{HeartbeatMonitor, HeartbeatReport};
pub use registry::{ConnectionHandle, ConnectionId, Outbound, SubscribeOutcome, SubscriptionRegistry};
pub use state::ServerState;

/// Tunables of the distribution server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Change detector polling interval. Also bounds each source fetch.
    pub poll_interval: Duration,
    /// Time between heartbeat probes.
    pub heartbeat_interval: Duration,
    /// Extra silence tolerated before a connection is pruned.
    pub heartbeat_grace: Duration,
    /// Price levels kept per side.
    pub depth: usize,
    /// Tick size for markets that do not carry one.
    pub default_tick_size: Decimal,
    /// Outbound queue length per connection.
    pub send_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_grace: Duration::from_secs(10),
            depth: crate::orderbook::DEFAULT_DEPTH,
            default_tick_size: Decimal::new(1, 2),
            send_queue_capacity: 64,
        }
    }
}

/// Service object owning the listener task, the detector and the heartbeat.
pub struct MarketDataServer<S> {
    state: Arc<ServerState<S>>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl<S: MarketDataSource> MarketDataServer<S> {
    /// Create a stopped server over `source`.
    pub fn new(source: Arc<S>, settings: ServerSettings) -> Self {
        Self {
            state: Arc::new(ServerState::new(source, settings)),
            tasks: Vec::new(),
            local_addr: None,
        }
    }

    /// Shared state.
    pub fn state(&self) -> &Arc<ServerState<S>> {
        &self.state
    }

    /// Address the server listens on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listening socket. Failing here is fatal for the service.
    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| ServiceError::Bind {
                addr: addr.to_string(),
                source,
            })
    }

    /// Start serving on a bound listener and spawn the background tasks.
    pub fn start(&mut self, listener: TcpListener) -> Result<SocketAddr> {
        let local_addr = listener.local_addr()?;
        let shutdown = self.state.shutdown_token().clone();

        let router = create_router(self.state.clone());
        let http_shutdown = shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "HTTP server failed");
            }
        }));

        self.tasks.push(tokio::spawn(
            self.state.detector().clone().run(shutdown.clone()),
        ));
        self.tasks
            .push(tokio::spawn(self.state.heartbeat().clone().run(shutdown)));

        self.state.set_ready(true);
        self.local_addr = Some(local_addr);
        info!(%local_addr, "Market data server listening");
        Ok(local_addr)
    }

    /// Bind `addr` and start serving.
    pub async fn serve(&mut self, addr: &str) -> Result<SocketAddr> {
        let listener = Self::bind(addr).await?;
        self.start(listener)
    }

    /// Stop the detector, the heartbeat and every connection, then wait for
    /// all tasks to finish.
    pub async fn stop(mut self) {
        self.state.set_ready(false);
        self.state.shutdown_token().cancel();

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("Market data server stopped");
    }
}

impl<S> Drop for MarketDataServer<S> {
    fn drop(&mut self) {
        self.state.shutdown_token().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MockMarketSource;

    #[test]
    fn default_settings() {
        let settings = ServerSettings::default();

        assert_eq!(settings.poll_interval, Duration::from_millis(1000));
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(settings.depth, 20);
        assert_eq!(settings.send_queue_capacity, 64);
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let err = MarketDataServer::<MockMarketSource>::bind(&addr)
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Bind { .. }));
    }

    #[tokio::test]
    async fn start_and_stop() {
        let mut server = MarketDataServer::new(
            Arc::new(MockMarketSource::demo()),
            ServerSettings::default(),
        );

        let addr = server.serve("127.0.0.1:0").await.unwrap();

        assert_eq!(server.local_addr(), Some(addr));
        assert!(server.state().is_ready());

        let state = server.state().clone();
        server.stop().await;
        assert!(!state.is_ready());
        assert!(state.shutdown_token().is_cancelled());
    }
}
