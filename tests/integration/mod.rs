//! End-to-end tests for the order book stream.
//!
//! Each test runs a real server on a loopback port against the in-memory
//! demo source and talks to it over WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use rust_decimal_macros::dec;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use orderbook_stream::api::create_router;
use orderbook_stream::client::{ConnectionState, MarketFeedClient, ReconnectPolicy};
use orderbook_stream::market::{AssetInfo, Market, MockBookBuilder, MockMarketSource};
use orderbook_stream::protocol::{ClientMessage, ServerMessage};
use orderbook_stream::server::{MarketDataServer, ServerSettings};

const DEMO: &str = MockMarketSource::DEMO_MARKET;
const WAIT: Duration = Duration::from_secs(5);

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn settings() -> ServerSettings {
    ServerSettings {
        poll_interval: Duration::from_millis(50),
        ..ServerSettings::default()
    }
}

async fn start_server(
    source: Arc<MockMarketSource>,
    addr: &str,
) -> (MarketDataServer<MockMarketSource>, SocketAddr) {
    let mut server = MarketDataServer::new(source, settings());
    let addr = server.serve(addr).await.unwrap();
    (server, addr)
}

async fn raw_connect(addr: SocketAddr) -> RawSocket {
    let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    socket
}

async fn send(socket: &mut RawSocket, message: &ClientMessage) {
    socket
        .send(Message::Text(message.encode().unwrap()))
        .await
        .unwrap();
}

/// Next text frame decoded as a server message.
async fn next_message(socket: &mut RawSocket) -> ServerMessage {
    loop {
        let frame = timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return ServerMessage::parse(&text).unwrap();
        }
    }
}

fn client_policy() -> ReconnectPolicy {
    ReconnectPolicy::fixed(Duration::from_millis(100))
}

#[tokio::test]
async fn client_receives_demo_snapshot() {
    let (server, addr) = start_server(Arc::new(MockMarketSource::demo()), "127.0.0.1:0").await;

    let client =
        MarketFeedClient::connect(&format!("ws://{addr}/ws"), DEMO, client_policy()).unwrap();
    let mut updates = client.updates();

    let view = timeout(WAIT, updates.wait_for(|v| !v.is_loading()))
        .await
        .unwrap()
        .unwrap()
        .clone();

    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(view.mid_price(), Some(dec!(20.45)));
    assert_eq!(view.spread(), Some(dec!(0.02)));
    assert_eq!(view.bids().len(), 3);
    assert_eq!(view.asks().len(), 3);

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn book_changes_reach_subscribers() {
    let source = Arc::new(MockMarketSource::demo());
    let (server, addr) = start_server(source.clone(), "127.0.0.1:0").await;

    let mut socket = raw_connect(addr).await;
    send(&mut socket, &ClientMessage::subscribe(DEMO)).await;
    assert!(matches!(
        next_message(&mut socket).await,
        ServerMessage::Orderbook { .. }
    ));

    source.set_book(
        DEMO,
        MockBookBuilder::new()
            .with_spread(dec!(21.00), dec!(21.10), dec!(10))
            .build(),
    );

    match next_message(&mut socket).await {
        ServerMessage::Orderbook { market, bids, asks } => {
            assert_eq!(market, DEMO);
            assert_eq!(bids[0].0, dec!(21.00));
            assert_eq!(asks[0].0, dec!(21.10));
        }
        other => panic!("expected orderbook, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn malformed_message_keeps_connection_open() {
    let (server, addr) = start_server(Arc::new(MockMarketSource::demo()), "127.0.0.1:0").await;
    let mut socket = raw_connect(addr).await;

    socket
        .send(Message::Text("this is not json".to_string()))
        .await
        .unwrap();
    assert!(matches!(
        next_message(&mut socket).await,
        ServerMessage::Error { .. }
    ));

    socket
        .send(Message::Text(
            r#"{"type":"subscribe","channel":"trades","market":"M1"}"#.to_string(),
        ))
        .await
        .unwrap();
    assert!(matches!(
        next_message(&mut socket).await,
        ServerMessage::Error { .. }
    ));

    send(&mut socket, &ClientMessage::subscribe(DEMO)).await;
    match next_message(&mut socket).await {
        ServerMessage::Orderbook { market, .. } => assert_eq!(market, DEMO),
        other => panic!("expected orderbook, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn unknown_market_returns_error_frame() {
    let (server, addr) = start_server(Arc::new(MockMarketSource::demo()), "127.0.0.1:0").await;
    let mut socket = raw_connect(addr).await;

    send(&mut socket, &ClientMessage::subscribe("does-not-exist")).await;

    match next_message(&mut socket).await {
        ServerMessage::Error { message } => assert!(message.contains("does-not-exist")),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(server.state().registry().active_markets().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn disconnect_releases_subscriptions() {
    let (server, addr) = start_server(Arc::new(MockMarketSource::demo()), "127.0.0.1:0").await;
    let mut socket = raw_connect(addr).await;

    send(&mut socket, &ClientMessage::subscribe(DEMO)).await;
    next_message(&mut socket).await;
    assert!(server.state().registry().has_subscribers(DEMO));

    socket.close(None).await.unwrap();

    let registry = server.state().registry().clone();
    timeout(WAIT, async {
        while registry.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!registry.has_subscribers(DEMO));

    server.stop().await;
}

#[tokio::test]
async fn client_switches_market() {
    let source = Arc::new(MockMarketSource::demo());
    source.add_market(Market {
        id: "M2".to_string(),
        base: AssetInfo::new("BTC", 8),
        quote: AssetInfo::new("USDC", 6),
        tick_size: Some(dec!(1)),
    });
    source.set_book(
        "M2",
        MockBookBuilder::new()
            .with_spread(dec!(60000), dec!(60010), dec!(1))
            .build(),
    );

    let (server, addr) = start_server(source, "127.0.0.1:0").await;
    let client =
        MarketFeedClient::connect(&format!("ws://{addr}/ws"), DEMO, client_policy()).unwrap();
    let mut updates = client.updates();
    timeout(WAIT, updates.wait_for(|v| !v.is_loading()))
        .await
        .unwrap()
        .unwrap();

    client.set_market("M2").await.unwrap();

    let view = timeout(
        WAIT,
        updates.wait_for(|v| v.market() == "M2" && !v.is_loading()),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(view.best_bid(), Some(dec!(60000)));

    let registry = server.state().registry().clone();
    timeout(WAIT, async {
        while registry.has_subscribers(DEMO) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    client.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn client_resubscribes_after_server_restart() {
    let source = Arc::new(MockMarketSource::demo());
    let (server, addr) = start_server(source.clone(), "127.0.0.1:0").await;

    let client =
        MarketFeedClient::connect(&format!("ws://{addr}/ws"), DEMO, client_policy()).unwrap();
    let mut states = client.state_updates();
    let mut updates = client.updates();
    timeout(WAIT, updates.wait_for(|v| !v.is_loading()))
        .await
        .unwrap()
        .unwrap();

    server.stop().await;

    timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Reconnecting))
        .await
        .unwrap()
        .unwrap();
    assert!(client.view().is_loading());

    // Same port, so the client's URL stays valid
    let mut restarted = None;
    for _ in 0..50 {
        let mut server = MarketDataServer::new(source.clone(), settings());
        if server.serve(&addr.to_string()).await.is_ok() {
            restarted = Some(server);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let restarted = restarted.expect("could not rebind server port");

    let view = timeout(WAIT, updates.wait_for(|v| !v.is_loading()))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(view.mid_price(), Some(dec!(20.45)));
    assert_eq!(client.state(), ConnectionState::Open);
    assert!(restarted.state().registry().has_subscribers(DEMO));

    client.shutdown().await;
    restarted.stop().await;
}

#[tokio::test]
async fn started_server_reports_ready() {
    let (server, _addr) = start_server(Arc::new(MockMarketSource::demo()), "127.0.0.1:0").await;
    let app = create_router(server.state().clone());

    let response = app
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    server.stop().await;
}
