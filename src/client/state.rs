//! Client-side connection state and the locally reconstructed book.

use rust_decimal::Decimal;
use strum::Display;
use time::OffsetDateTime;

use crate::market::MarketId;
use crate::orderbook::{mid_price, PriceLevel};

/// Lifecycle of the single physical connection behind a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    /// Dialing the server.
    Connecting,
    /// Connected; subscribed to the desired market.
    Open,
    /// Torn down. Terminal.
    Closed,
    /// Waiting for the reconnect delay to elapse.
    Reconnecting,
}

/// Latest snapshot received for the desired market.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookView {
    market: MarketId,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    loading: bool,
    updated_at: Option<OffsetDateTime>,
}

impl BookView {
    /// Empty view for `market`, waiting for its first snapshot.
    pub fn new(market: impl Into<MarketId>) -> Self {
        Self {
            market: market.into(),
            bids: Vec::new(),
            asks: Vec::new(),
            loading: true,
            updated_at: None,
        }
    }

    /// Market this view mirrors.
    pub fn market(&self) -> &str {
        &self.market
    }

    /// Bids, best first.
    pub fn bids(&self) -> &[PriceLevel] {
        &self.bids
    }

    /// Asks, best first.
    pub fn asks(&self) -> &[PriceLevel] {
        &self.asks
    }

    /// True until a snapshot arrives, and again while reconnecting.
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Time the last snapshot was applied.
    pub fn updated_at(&self) -> Option<OffsetDateTime> {
        self.updated_at
    }

    /// Get the best bid price.
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Get the best ask price.
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Midpoint between best bid and best ask. None if a side is empty.
    pub fn mid_price(&self) -> Option<Decimal> {
        mid_price(self.best_bid()?, self.best_ask()?)
    }

    /// Get the spread between best bid and ask.
    pub fn spread(&self) -> Option<Decimal> {
        self.best_ask()?.checked_sub(self.best_bid()?)
    }

    /// Replace both sides wholesale with a new snapshot.
    pub fn replace(&mut self, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>, now: OffsetDateTime) {
        self.bids = bids;
        self.asks = asks;
        self.loading = false;
        self.updated_at = Some(now);
    }

    /// Keep the last data but flag it as stale.
    pub fn mark_stale(&mut self) {
        self.loading = true;
    }

    /// Switch to another market, dropping all data.
    pub fn reset(&mut self, market: impl Into<MarketId>) {
        *self = Self::new(market);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn new_view_is_loading_and_empty() {
        let view = BookView::new("M1");

        assert!(view.is_loading());
        assert_eq!(view.best_bid(), None);
        assert_eq!(view.best_ask(), None);
        assert_eq!(view.mid_price(), None);
        assert_eq!(view.updated_at(), None);
    }

    #[test]
    fn replace_updates_derived_values() {
        let mut view = BookView::new("M1");

        view.replace(
            vec![PriceLevel::new(dec!(20.44), dec!(100.5))],
            vec![PriceLevel::new(dec!(20.46), dec!(80.3))],
            OffsetDateTime::now_utc(),
        );

        assert!(!view.is_loading());
        assert_eq!(view.mid_price(), Some(dec!(20.45)));
        assert_eq!(view.spread(), Some(dec!(0.02)));
        assert!(view.updated_at().is_some());
    }

    #[test]
    fn one_sided_book_has_no_mid() {
        let mut view = BookView::new("M1");
        view.replace(
            vec![],
            vec![PriceLevel::new(dec!(20.46), dec!(80.3))],
            OffsetDateTime::now_utc(),
        );

        assert_eq!(view.best_ask(), Some(dec!(20.46)));
        assert_eq!(view.mid_price(), None);
    }

    #[test]
    fn mark_stale_keeps_data() {
        let mut view = BookView::new("M1");
        view.replace(
            vec![PriceLevel::new(dec!(20.44), dec!(1))],
            vec![],
            OffsetDateTime::now_utc(),
        );

        view.mark_stale();

        assert!(view.is_loading());
        assert_eq!(view.best_bid(), Some(dec!(20.44)));
    }

    #[test]
    fn reset_switches_market() {
        let mut view = BookView::new("M1");
        view.replace(
            vec![PriceLevel::new(dec!(20.44), dec!(1))],
            vec![],
            OffsetDateTime::now_utc(),
        );

        view.reset("M2");

        assert_eq!(view.market(), "M2");
        assert!(view.bids().is_empty());
        assert!(view.is_loading());
    }

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }
}
