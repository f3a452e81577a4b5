//! Sans-IO reconnect state machine.
//!
//! The machine consumes connection events and returns the [`Action`]s the
//! driver must perform. It never touches a socket or a timer itself, so every
//! transition is testable synchronously.

use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::market::MarketId;
use crate::orderbook::PriceLevel;
use crate::protocol::{ClientMessage, ServerMessage};

use super::state::{BookView, ConnectionState};

/// Delay schedule between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Growth factor per attempt. 1 keeps the delay fixed.
    pub multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl ReconnectPolicy {
    /// Same delay before every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1,
        }
    }

    /// Double the delay on each failed attempt, capped at `max_delay`.
    pub fn with_backoff(self, max_delay: Duration) -> Self {
        Self {
            max_delay: max_delay.max(self.initial_delay),
            multiplier: 2,
            ..self
        }
    }

    /// Calculate the delay before attempt number `attempt` (0-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if self.multiplier <= 1 {
            return self.initial_delay;
        }
        let factor = self.multiplier.saturating_pow(attempt);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Side effect requested by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open a new connection.
    Connect,
    /// Send a protocol message on the open connection.
    Send(ClientMessage),
    /// Arm the reconnect timer.
    ScheduleReconnect(Duration),
    /// Close the connection and cancel any pending reconnect.
    CloseConnection,
}

/// Reconnect-and-resubscribe state machine for one market view.
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    state: ConnectionState,
    view: BookView,
    policy: ReconnectPolicy,
    attempt: u32,
    torn_down: bool,
}

impl ReconnectMachine {
    /// Create a machine for `market`. Starts in `Connecting`.
    pub fn new(market: impl Into<MarketId>, policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Connecting,
            view: BookView::new(market),
            policy,
            attempt: 0,
            torn_down: false,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Market the client wants.
    pub fn market(&self) -> &str {
        self.view.market()
    }

    /// Local book view.
    pub fn view(&self) -> &BookView {
        &self.view
    }

    /// Reconnect policy.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Failed attempts since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether teardown happened.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Initial action.
    pub fn start(&mut self) -> Vec<Action> {
        if self.torn_down {
            return Vec::new();
        }
        self.state = ConnectionState::Connecting;
        vec![Action::Connect]
    }

    /// Connection established: subscribe to the desired market.
    pub fn on_open(&mut self) -> Vec<Action> {
        if self.torn_down {
            return vec![Action::CloseConnection];
        }
        info!(market = self.market(), attempts = self.attempt, "Connected");
        self.state = ConnectionState::Open;
        self.attempt = 0;
        vec![Action::Send(ClientMessage::subscribe(self.market()))]
    }

    /// Apply an inbound text frame. Returns true if the view changed.
    ///
    /// Snapshots for other markets and unknown frames are ignored.
    pub fn on_text(&mut self, text: &str, now: OffsetDateTime) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }

        match ServerMessage::parse(text) {
            Ok(ServerMessage::Orderbook { market, bids, asks }) if market == self.market() => {
                self.view.replace(
                    bids.into_iter().map(PriceLevel::from).collect(),
                    asks.into_iter().map(PriceLevel::from).collect(),
                    now,
                );
                true
            }
            Ok(ServerMessage::Orderbook { market, .. }) => {
                debug!(market = %market, "Ignoring snapshot for another market");
                false
            }
            Ok(ServerMessage::Error { message }) => {
                warn!(market = self.market(), error = %message, "Server reported an error");
                false
            }
            Err(e) => {
                debug!(error = %e, "Ignoring unparseable frame");
                false
            }
        }
    }

    /// The connection closed.
    pub fn on_close(&mut self) -> Vec<Action> {
        self.disconnected("connection closed")
    }

    /// The connection failed while open.
    pub fn on_error(&mut self, error: &str) -> Vec<Action> {
        self.disconnected(error)
    }

    /// A connection attempt failed.
    pub fn on_connect_failed(&mut self, error: &str) -> Vec<Action> {
        self.disconnected(error)
    }

    /// The reconnect delay elapsed.
    pub fn on_reconnect_timer(&mut self) -> Vec<Action> {
        if self.torn_down || self.state != ConnectionState::Reconnecting {
            return Vec::new();
        }
        self.state = ConnectionState::Connecting;
        vec![Action::Connect]
    }

    /// Change the desired market.
    ///
    /// While open the old market is unsubscribed before the new one is
    /// subscribed. Otherwise the next open subscribes to the new market.
    pub fn set_market(&mut self, market: impl Into<MarketId>) -> Vec<Action> {
        let market = market.into();
        if market == self.market() || self.torn_down {
            return Vec::new();
        }

        let previous = self.market().to_string();
        self.view.reset(market.clone());
        info!(from = %previous, to = %market, "Switching market");

        if self.state == ConnectionState::Open {
            vec![
                Action::Send(ClientMessage::unsubscribe(previous)),
                Action::Send(ClientMessage::subscribe(market)),
            ]
        } else {
            Vec::new()
        }
    }

    /// Close for good and cancel any pending reconnect.
    pub fn teardown(&mut self) -> Vec<Action> {
        if self.torn_down {
            return Vec::new();
        }
        self.torn_down = true;
        self.state = ConnectionState::Closed;
        vec![Action::CloseConnection]
    }

    fn disconnected(&mut self, reason: &str) -> Vec<Action> {
        if self.torn_down || self.state == ConnectionState::Reconnecting {
            return Vec::new();
        }

        let delay = self.policy.next_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.state = ConnectionState::Reconnecting;
        self.view.mark_stale();

        warn!(
            market = self.market(),
            reason,
            delay_ms = delay.as_millis() as u64,
            attempt = self.attempt,
            "Disconnected, scheduling reconnect"
        );
        vec![Action::ScheduleReconnect(delay)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    const SNAPSHOT: &str = r#"{"type":"orderbook","market":"M1","bids":[["20.44","100.5"],["20.43","50.2"]],"asks":[["20.46","80.3"],["20.47","45.6"]]}"#;

    fn open_machine() -> ReconnectMachine {
        let mut machine = ReconnectMachine::new("M1", ReconnectPolicy::default());
        machine.start();
        machine.on_open();
        machine
    }

    #[test]
    fn starts_connecting_and_subscribes_on_open() {
        let mut machine = ReconnectMachine::new("M1", ReconnectPolicy::default());
        assert_eq!(machine.state(), ConnectionState::Connecting);

        assert_eq!(machine.start(), vec![Action::Connect]);
        assert_eq!(
            machine.on_open(),
            vec![Action::Send(ClientMessage::subscribe("M1"))]
        );
        assert_eq!(machine.state(), ConnectionState::Open);
    }

    #[test]
    fn snapshot_replaces_view() {
        let mut machine = open_machine();

        assert!(machine.on_text(SNAPSHOT, OffsetDateTime::now_utc()));

        let view = machine.view();
        assert!(!view.is_loading());
        assert_eq!(view.best_bid(), Some(dec!(20.44)));
        assert_eq!(view.best_ask(), Some(dec!(20.46)));
        assert_eq!(view.mid_price(), Some(dec!(20.45)));
    }

    #[test]
    fn other_market_and_errors_are_ignored() {
        let mut machine = open_machine();
        let other = SNAPSHOT.replace("\"M1\"", "\"M2\"");

        assert!(!machine.on_text(&other, OffsetDateTime::now_utc()));
        assert!(!machine.on_text(
            r#"{"type":"error","message":"nope"}"#,
            OffsetDateTime::now_utc()
        ));
        assert!(!machine.on_text("garbage", OffsetDateTime::now_utc()));
        assert!(machine.view().is_loading());
    }

    #[test]
    fn close_schedules_reconnect_and_resubscribes() {
        let mut machine = open_machine();
        machine.on_text(SNAPSHOT, OffsetDateTime::now_utc());

        assert_eq!(
            machine.on_close(),
            vec![Action::ScheduleReconnect(Duration::from_secs(5))]
        );
        assert_eq!(machine.state(), ConnectionState::Reconnecting);
        assert!(machine.view().is_loading());

        // A second close while waiting does not double-schedule
        assert!(machine.on_error("again").is_empty());

        assert_eq!(machine.on_reconnect_timer(), vec![Action::Connect]);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(
            machine.on_open(),
            vec![Action::Send(ClientMessage::subscribe("M1"))]
        );
    }

    #[test]
    fn failed_connect_keeps_retrying() {
        let mut machine = ReconnectMachine::new("M1", ReconnectPolicy::default());
        machine.start();

        for _ in 0..3 {
            assert_eq!(
                machine.on_connect_failed("refused"),
                vec![Action::ScheduleReconnect(Duration::from_secs(5))]
            );
            assert_eq!(machine.on_reconnect_timer(), vec![Action::Connect]);
        }
        assert_eq!(machine.attempt(), 3);

        machine.on_open();
        assert_eq!(machine.attempt(), 0);
    }

    #[test]
    fn set_market_while_open_unsubscribes_first() {
        let mut machine = open_machine();
        machine.on_text(SNAPSHOT, OffsetDateTime::now_utc());

        assert_eq!(
            machine.set_market("M2"),
            vec![
                Action::Send(ClientMessage::unsubscribe("M1")),
                Action::Send(ClientMessage::subscribe("M2")),
            ]
        );
        assert_eq!(machine.market(), "M2");
        assert!(machine.view().is_loading());
        assert_eq!(machine.view().best_bid(), None);

        // Late snapshot for the old market is ignored
        assert!(!machine.on_text(SNAPSHOT, OffsetDateTime::now_utc()));
    }

    #[test]
    fn set_market_while_reconnecting_subscribes_on_open() {
        let mut machine = open_machine();
        machine.on_close();

        assert!(machine.set_market("M2").is_empty());
        machine.on_reconnect_timer();

        assert_eq!(
            machine.on_open(),
            vec![Action::Send(ClientMessage::subscribe("M2"))]
        );
    }

    #[test]
    fn set_same_market_is_noop() {
        let mut machine = open_machine();

        assert!(machine.set_market("M1").is_empty());
    }

    #[test]
    fn teardown_is_terminal() {
        let mut machine = open_machine();
        machine.on_close();

        assert_eq!(machine.teardown(), vec![Action::CloseConnection]);
        assert_eq!(machine.state(), ConnectionState::Closed);
        assert!(machine.on_reconnect_timer().is_empty());
        assert!(machine.on_close().is_empty());
        assert!(machine.teardown().is_empty());
        assert!(machine.start().is_empty());
    }

    #[test]
    fn fixed_policy_keeps_delay() {
        let policy = ReconnectPolicy::fixed(Duration::from_secs(5));

        assert_eq!(policy.next_delay(0), Duration::from_secs(5));
        assert_eq!(policy.next_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn backoff_policy_doubles_and_caps() {
        let policy =
            ReconnectPolicy::fixed(Duration::from_secs(1)).with_backoff(Duration::from_secs(30));

        assert_eq!(policy.next_delay(0), Duration::from_secs(1));
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(5), Duration::from_secs(30));
        assert_eq!(policy.next_delay(100), Duration::from_secs(30));
    }

    #[test]
    fn backoff_machine_grows_delay() {
        let policy =
            ReconnectPolicy::fixed(Duration::from_secs(1)).with_backoff(Duration::from_secs(30));
        let mut machine = ReconnectMachine::new("M1", policy);
        machine.start();

        assert_eq!(
            machine.on_connect_failed("x"),
            vec![Action::ScheduleReconnect(Duration::from_secs(1))]
        );
        machine.on_reconnect_timer();
        assert_eq!(
            machine.on_connect_failed("x"),
            vec![Action::ScheduleReconnect(Duration::from_secs(2))]
        );
    }
}
