//! Order book stream entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use rust_decimal::Decimal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orderbook_stream::client::MarketFeedClient;
use orderbook_stream::config::Config;
use orderbook_stream::error::ServiceError;
use orderbook_stream::market::{MockBookBuilder, MockMarketSource};
use orderbook_stream::metrics;
use orderbook_stream::orderbook::RawBook;
use orderbook_stream::server::MarketDataServer;
use orderbook_stream::utils::{short_id, shutdown_signal};

/// Real-time order book distribution over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "orderbook-stream")]
#[command(about = "Streams aggregated order book snapshots to WebSocket subscribers")]
#[command(version)]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the distribution server against the demo market (default).
    Serve {
        /// Port override for the WebSocket and health endpoints.
        #[arg(short, long)]
        port: Option<u16>,

        /// Seconds between simulated book changes on the demo market.
        #[arg(long, default_value = "3")]
        demo_interval: u64,
    },

    /// Subscribe to a market and log every snapshot.
    Watch {
        /// Market to subscribe to.
        #[arg(default_value = MockMarketSource::DEMO_MARKET)]
        market: String,

        /// WebSocket endpoint, overrides WS_URL.
        #[arg(long)]
        url: Option<String>,
    },

    /// Check configuration validity.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load().map_err(ServiceError::from)?;
    init_tracing(&config, args.verbose);

    if config.metrics_enabled {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.metrics_port))
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(port = config.metrics_port, "Prometheus exporter listening");
    }
    metrics::init_metrics();

    match args.command {
        Some(Command::CheckConfig) => cmd_check_config(&config),
        Some(Command::Watch { market, url }) => cmd_watch(config, market, url).await,
        Some(Command::Serve {
            port,
            demo_interval,
        }) => cmd_serve(config, port, demo_interval).await,
        None => cmd_serve(config, None, 3).await,
    }
}

fn init_tracing(config: &Config, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("orderbook_stream=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.rust_log))
    };

    let json = config.log_json;
    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .with(filter)
        .init();
}

/// Check configuration validity.
fn cmd_check_config(config: &Config) -> anyhow::Result<()> {
    println!("======================================================================");
    println!("ORDERBOOK STREAM - CONFIGURATION CHECK");
    println!("======================================================================");

    print!("Validating configuration... ");
    match config.validate() {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(ServiceError::InvalidConfig(e).into());
        }
    }

    let settings = config.server_settings();
    let policy = config.reconnect_policy();

    println!("----------------------------------------------------------------------");
    println!("Configuration Summary:");
    println!("  Bind Address: {}", config.bind_addr());
    println!("  Poll Interval: {:?}", settings.poll_interval);
    println!(
        "  Heartbeat: every {:?}, grace {:?}",
        settings.heartbeat_interval, settings.heartbeat_grace
    );
    println!("  Book Depth: {} levels", settings.depth);
    println!("  Default Tick Size: {}", settings.default_tick_size);
    println!("  Send Queue: {} messages", settings.send_queue_capacity);
    println!("  Client URL: {}", config.ws_url);
    println!(
        "  Reconnect: {:?} initial, {:?} max",
        policy.initial_delay, policy.max_delay
    );
    println!(
        "  Metrics: {}",
        if config.metrics_enabled {
            format!("Enabled (port {})", config.metrics_port)
        } else {
            "Disabled".to_string()
        }
    );
    println!("======================================================================");
    println!("CONFIGURATION CHECK PASSED");
    println!("======================================================================");

    Ok(())
}

/// Run the distribution server until a shutdown signal arrives.
async fn cmd_serve(config: Config, port: Option<u16>, demo_interval: u64) -> anyhow::Result<()> {
    let mut config = config;
    if let Some(port) = port {
        config.port = port;
    }
    config.validate().map_err(ServiceError::InvalidConfig)?;

    let source = Arc::new(MockMarketSource::demo().with_change_feed());
    let mut server = MarketDataServer::new(source.clone(), config.server_settings());

    // Fail fast if the port is taken
    let listener = MarketDataServer::<MockMarketSource>::bind(&config.bind_addr()).await?;
    let addr = server.start(listener)?;

    info!("========================================");
    info!("ORDERBOOK STREAM STARTED");
    info!("========================================");
    info!("Listening: ws://{}/ws", addr);
    info!("Demo market: {}", MockMarketSource::DEMO_MARKET);
    info!("Poll interval: {}ms", config.poll_interval_ms);
    info!("========================================");

    let demo = tokio::spawn(run_demo_market(
        source,
        Duration::from_secs(demo_interval.max(1)),
        server.state().shutdown_token().clone(),
    ));

    shutdown_signal().await;

    server.stop().await;
    let _ = demo.await;

    info!("Shutdown complete");
    Ok(())
}

/// Nudge the demo book so subscribers see changes.
async fn run_demo_market(
    source: Arc<MockMarketSource>,
    period: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    let mut step: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                step = step.wrapping_add(1);
                let market = MockMarketSource::DEMO_MARKET;
                let Some(book) = source.book(market) else {
                    warn!(market, "Demo market has no book");
                    continue;
                };
                source.set_book(market, demo_book(&book, step));
                source.notify_change(market);
            }
        }
    }
}

/// Vary the best level sizes of `book` in a short cycle.
fn demo_book(book: &RawBook, step: u32) -> RawBook {
    let offset = Decimal::from(step % 5) * Decimal::new(5, 1);
    let mut builder = MockBookBuilder::new();

    for (i, level) in book.bids.iter().enumerate() {
        let size = if i == 0 { Decimal::new(1005, 1) + offset } else { level.size };
        builder = builder.bid(level.price, size);
    }
    for (i, level) in book.asks.iter().enumerate() {
        let size = if i == 0 { Decimal::new(803, 1) + offset } else { level.size };
        builder = builder.ask(level.price, size);
    }

    builder.build()
}

/// Subscribe to a market and log snapshots until a shutdown signal arrives.
async fn cmd_watch(config: Config, market: String, url: Option<String>) -> anyhow::Result<()> {
    let url = url.unwrap_or_else(|| config.ws_url.clone());
    let client = MarketFeedClient::connect(&url, market.clone(), config.reconnect_policy())
        .map_err(ServiceError::from)?;

    info!(url = %url, market = %short_id(&market), "Watching market");

    let mut updates = client.updates();
    let mut states = client.state_updates();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = states.changed() => {
                if changed.is_err() {
                    error!("Client driver stopped");
                    break;
                }
                let state = *states.borrow_and_update();
                info!(%state, "Connection state changed");
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    error!("Client driver stopped");
                    break;
                }
                let view = updates.borrow_and_update().clone();
                if view.is_loading() {
                    continue;
                }
                info!(
                    market = %short_id(view.market()),
                    best_bid = ?view.best_bid(),
                    best_ask = ?view.best_ask(),
                    mid = ?view.mid_price(),
                    spread = ?view.spread(),
                    levels = view.bids().len() + view.asks().len(),
                    "Order book update"
                );
            }
        }
    }

    client.shutdown().await;
    info!("Watch stopped");
    Ok(())
}
