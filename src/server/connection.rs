//! Per-connection session: one reader loop and one writer task.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::market::MarketDataSource;
use crate::metrics;
use crate::protocol::ClientMessage;

use super::registry::{ConnectionHandle, Outbound};
use super::state::ServerState;

/// Drive one accepted WebSocket until it closes, errors, is pruned, or the
/// server stops. Subscriptions are purged on exit.
pub async fn run_session<S: MarketDataSource>(socket: WebSocket, state: Arc<ServerState<S>>) {
    let (handle, mut outbound) = state.open_connection();
    let conn = handle.id();
    let close = handle.close_token();
    let (mut sink, mut stream) = socket.split();
    info!(conn, "Connection opened");

    let writer_close = close.clone();
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_close.cancelled() => break,
                frame = outbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let message = match frame {
                Outbound::Text(text) => Message::Text(text.to_string()),
                Outbound::Ping => Message::Ping(Vec::new()),
            };
            if let Err(e) = sink.send(message).await {
                debug!(conn, error = %e, "Write failed");
                break;
            }
        }

        let _ = sink.send(Message::Close(None)).await;
        writer_close.cancel();
    });

    loop {
        let received = tokio::select! {
            _ = close.cancelled() => break,
            received = stream.next() => received,
        };

        match received {
            Some(Ok(message)) => {
                handle.record_activity(Instant::now());
                if !handle_message(&state, &handle, message).await {
                    break;
                }
            }
            Some(Err(e)) => {
                debug!(conn, error = %e, "Read failed");
                break;
            }
            None => break,
        }
    }

    close.cancel();
    let _ = writer.await;
    state.disconnect(conn);
    info!(conn, "Connection closed");
}

/// Handle one inbound frame. Returns false when the peer closed.
async fn handle_message<S: MarketDataSource>(
    state: &ServerState<S>,
    handle: &ConnectionHandle,
    message: Message,
) -> bool {
    let conn = handle.id();

    match message {
        Message::Text(text) => match ClientMessage::parse(&text) {
            Ok(ClientMessage::Subscribe { market, .. }) => {
                if let Err(e) = state.subscribe(conn, &market).await {
                    handle.send_error(e.to_string());
                }
            }
            Ok(ClientMessage::Unsubscribe { market, .. }) => {
                state.unsubscribe(conn, &market);
            }
            Err(e) => reject(handle, e),
        },
        Message::Binary(_) => reject(handle, ProtocolError::BinaryFrame),
        Message::Close(_) => return false,
        // Pings are answered by the transport; pongs only refresh liveness
        Message::Ping(_) | Message::Pong(_) => {}
    }
    true
}

fn reject(handle: &ConnectionHandle, error: ProtocolError) {
    warn!(conn = handle.id(), error = %error, "Rejected client message");
    metrics::inc_malformed_messages();
    handle.send_error(error.to_string());
}

