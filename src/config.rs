//! Application configuration loaded from environment variables.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::client::ReconnectPolicy;
use crate::server::ServerSettings;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // === Server ===
    /// Address the WebSocket server binds to.
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Port for the WebSocket and health endpoints.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Change detector polling interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Seconds between heartbeat probes.
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,

    /// Extra seconds a connection may stay silent before it is pruned.
    #[serde(default = "default_heartbeat_grace_s")]
    pub heartbeat_grace_s: u64,

    /// Price levels kept per side after aggregation.
    #[serde(default = "default_book_depth")]
    pub book_depth: usize,

    /// Tick size used when a market does not carry its own.
    #[serde(default = "default_tick_size")]
    pub default_tick_size: Decimal,

    /// Bounded outbound queue length per connection.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    // === Client ===
    /// WebSocket endpoint used by the `watch` command.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Delay before a reconnect attempt in milliseconds.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Grow the reconnect delay exponentially instead of keeping it fixed.
    #[serde(default)]
    pub reconnect_backoff: bool,

    /// Cap for the exponential reconnect delay in seconds.
    #[serde(default = "default_reconnect_max_delay_s")]
    pub reconnect_max_delay_s: u64,

    // === Observability ===
    /// Install the Prometheus exporter.
    #[serde(default)]
    pub metrics_enabled: bool,

    /// Port for the Prometheus exporter.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub rust_log: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub log_json: bool,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_s() -> u64 {
    30
}

fn default_heartbeat_grace_s() -> u64 {
    10
}

fn default_book_depth() -> usize {
    20
}

fn default_tick_size() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_send_queue_capacity() -> usize {
    64
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_reconnect_max_delay_s() -> u64 {
    30
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            port: default_port(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_s: default_heartbeat_interval_s(),
            heartbeat_grace_s: default_heartbeat_grace_s(),
            book_depth: default_book_depth(),
            default_tick_size: default_tick_size(),
            send_queue_capacity: default_send_queue_capacity(),
            ws_url: default_ws_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_backoff: false,
            reconnect_max_delay_s: default_reconnect_max_delay_s(),
            metrics_enabled: false,
            metrics_port: default_metrics_port(),
            rust_log: default_log_level(),
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment, reading .env file first.
    pub fn load() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Check if the configuration is valid.
    pub fn validate(&self) -> Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("POLL_INTERVAL_MS must be greater than 0".to_string());
        }

        if self.heartbeat_interval_s == 0 {
            return Err("HEARTBEAT_INTERVAL_S must be greater than 0".to_string());
        }

        if self.book_depth == 0 {
            return Err("BOOK_DEPTH must be at least 1".to_string());
        }

        if self.default_tick_size <= Decimal::ZERO {
            return Err("DEFAULT_TICK_SIZE must be positive".to_string());
        }

        if self.send_queue_capacity == 0 {
            return Err("SEND_QUEUE_CAPACITY must be at least 1".to_string());
        }

        if !self.ws_url.starts_with("ws://") && !self.ws_url.starts_with("wss://") {
            return Err("WS_URL must start with ws:// or wss://".to_string());
        }

        Ok(())
    }

    /// Socket address string the server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    /// Settings for the distribution server.
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_s),
            heartbeat_grace: Duration::from_secs(self.heartbeat_grace_s),
            depth: self.book_depth,
            default_tick_size: self.default_tick_size,
            send_queue_capacity: self.send_queue_capacity,
        }
    }

    /// Reconnect policy for the client.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(self.reconnect_delay_ms));
        if self.reconnect_backoff {
            policy.with_backoff(Duration::from_secs(self.reconnect_max_delay_s))
        } else {
            policy
        }
    }
}
