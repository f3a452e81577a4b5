//! WebSocket driver for the reconnect state machine.
//!
//! One background task owns the socket, the reconnect timer and the
//! [`ReconnectMachine`]. Consumers read the reconstructed book through a
//! `watch` channel.

use std::collections::VecDeque;
use std::future::pending;

use futures::{SinkExt, StreamExt};
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::WsError;
use crate::market::MarketId;
use crate::metrics;

use super::machine::{Action, ReconnectMachine, ReconnectPolicy};
use super::state::{BookView, ConnectionState};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
enum Command {
    SetMarket(MarketId),
}

/// Self-healing subscription to one market's order book.
pub struct MarketFeedClient {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<BookView>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MarketFeedClient {
    /// Validate `url` and start the driver task.
    pub fn connect(
        url: &str,
        market: impl Into<MarketId>,
        policy: ReconnectPolicy,
    ) -> Result<Self, WsError> {
        let url = validate_url(url)?;
        let machine = ReconnectMachine::new(market, policy);

        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (view_tx, view_rx) = watch::channel(machine.view().clone());
        let (state_tx, state_rx) = watch::channel(machine.state());
        let cancel = CancellationToken::new();

        let driver = Driver {
            url,
            machine,
            commands: commands_rx,
            view: view_tx,
            state: state_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            commands: commands_tx,
            view: view_rx,
            state: state_rx,
            cancel,
            task: Some(task),
        })
    }

    /// Current book view.
    pub fn view(&self) -> BookView {
        self.view.borrow().clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver notified on every view change.
    pub fn updates(&self) -> watch::Receiver<BookView> {
        self.view.clone()
    }

    /// Receiver notified on every connection state change.
    pub fn state_updates(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Switch the subscription to another market.
    pub async fn set_market(&self, market: impl Into<MarketId>) -> Result<(), WsError> {
        self.commands
            .send(Command::SetMarket(market.into()))
            .await
            .map_err(|_| WsError::SendFailed("client driver stopped".to_string()))
    }

    /// Close the connection, cancel any pending reconnect and wait for the
    /// driver to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MarketFeedClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn validate_url(raw: &str) -> Result<String, WsError> {
    let url = Url::parse(raw).map_err(|e| WsError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "ws" | "wss" => Ok(url.into()),
        scheme => Err(WsError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {scheme}"),
        }),
    }
}

struct Driver {
    url: String,
    machine: ReconnectMachine,
    commands: mpsc::Receiver<Command>,
    view: watch::Sender<BookView>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let mut socket: Option<WsStream> = None;
        let mut reconnect_at: Option<Instant> = None;
        let mut pending_actions: VecDeque<Action> = self.machine.start().into();

        info!(url = %self.url, market = self.machine.market(), "Market feed client started");

        loop {
            while let Some(action) = pending_actions.pop_front() {
                self.publish();
                let follow_up = self
                    .execute(action, &mut socket, &mut reconnect_at)
                    .await;
                pending_actions.extend(follow_up);
            }
            self.publish();

            if self.machine.is_torn_down() {
                break;
            }

            let follow_up = tokio::select! {
                _ = self.cancel.cancelled() => self.machine.teardown(),
                command = self.commands.recv() => match command {
                    Some(Command::SetMarket(market)) => self.machine.set_market(market),
                    None => self.machine.teardown(),
                },
                _ = sleep_until_deadline(reconnect_at) => {
                    reconnect_at = None;
                    self.machine.on_reconnect_timer()
                }
                frame = next_frame(&mut socket) => self.on_frame(frame, &mut socket),
            };
            pending_actions.extend(follow_up);
        }

        info!(market = self.machine.market(), "Market feed client stopped");
    }

    async fn execute(
        &mut self,
        action: Action,
        socket: &mut Option<WsStream>,
        reconnect_at: &mut Option<Instant>,
    ) -> Vec<Action> {
        match action {
            Action::Connect => {
                debug!(url = %self.url, "Connecting");
                let result = tokio::select! {
                    _ = self.cancel.cancelled() => return self.machine.teardown(),
                    result = connect_async(self.url.as_str()) => result,
                };
                match result {
                    Ok((stream, _)) => {
                        *socket = Some(stream);
                        self.machine.on_open()
                    }
                    Err(e) => self.machine.on_connect_failed(&WsError::from(e).to_string()),
                }
            }
            Action::Send(message) => {
                let Some(stream) = socket.as_mut() else {
                    return Vec::new();
                };
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode client message");
                        return Vec::new();
                    }
                };
                match stream.send(Message::Text(text)).await {
                    Ok(()) => Vec::new(),
                    Err(e) => {
                        *socket = None;
                        self.machine.on_error(&WsError::from(e).to_string())
                    }
                }
            }
            Action::ScheduleReconnect(delay) => {
                metrics::inc_client_reconnects();
                *reconnect_at = Some(Instant::now() + delay);
                Vec::new()
            }
            Action::CloseConnection => {
                *reconnect_at = None;
                if let Some(mut stream) = socket.take() {
                    let _ = stream.close(None).await;
                }
                Vec::new()
            }
        }
    }

    fn on_frame(
        &mut self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        socket: &mut Option<WsStream>,
    ) -> Vec<Action> {
        match frame {
            Some(Ok(Message::Text(text))) => {
                metrics::inc_client_messages_received();
                self.machine.on_text(&text, OffsetDateTime::now_utc());
                Vec::new()
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(frame = ?frame, "Server closed the connection");
                *socket = None;
                self.machine.on_close()
            }
            // Pings are answered by tungstenite
            Some(Ok(_)) => Vec::new(),
            Some(Err(e)) => {
                *socket = None;
                self.machine.on_error(&e.to_string())
            }
            None => {
                *socket = None;
                self.machine.on_close()
            }
        }
    }

    fn publish(&self) {
        let view = self.machine.view();
        self.view.send_if_modified(|current| {
            if current == view {
                false
            } else {
                *current = view.clone();
                true
            }
        });

        let state = self.machine.state();
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket.as_mut() {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn validate_url_accepts_ws_schemes() {
        assert!(validate_url("ws://127.0.0.1:8080/ws").is_ok());
        assert!(validate_url("wss://example.com/ws").is_ok());
    }

    #[test]
    fn validate_url_rejects_other_schemes() {
        assert!(matches!(
            validate_url("http://127.0.0.1:8080/ws"),
            Err(WsError::InvalidUrl { .. })
        ));
        assert!(matches!(
            validate_url("not a url"),
            Err(WsError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_server_enters_reconnecting() {
        // Grab a free port and release it so nothing listens there
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = MarketFeedClient::connect(
            &format!("ws://{addr}/ws"),
            "M1",
            ReconnectPolicy::fixed(Duration::from_millis(50)),
        )
        .unwrap();
        let mut states = client.state_updates();

        let reached = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| *s == ConnectionState::Reconnecting),
        )
        .await;

        assert!(reached.is_ok());
        assert!(client.view().is_loading());

        // Release the watch read guard held by `reached` so the driver can
        // publish its final state during shutdown.
        drop(reached);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let client = MarketFeedClient::connect(
            "ws://127.0.0.1:9/ws",
            "M1",
            ReconnectPolicy::fixed(Duration::from_secs(60)),
        )
        .unwrap();
        let states = client.state_updates();

        client.shutdown().await;

        assert_eq!(*states.borrow(), ConnectionState::Closed);
    }
}
