//! Order-book state shared by the venue reconstructors.
//!
//! Maintains the two price-keyed maps for one instrument at one venue and
//! owns the consistency predicate that gates every publication: a book is
//! published only when both sides are non-empty, every price and volume is
//! strictly positive, and the best bid does not exceed the best ask. An
//! inconsistent book must never reach a subscriber — the caller requests a
//! connection restart instead.

use ordered_float::OrderedFloat;

use crate::types::{BookHandler, SideMap};

/// Order book for one instrument at one venue.
///
/// Only the venue's single reader task mutates a book, so there is no
/// internal locking; venue adapters wrap it as their message-handling state.
#[derive(Debug, Default)]
pub struct OrderBook {
    asks: SideMap,
    bids: SideMap,
}

impl OrderBook {
    /// Create an empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all levels from both sides.
    ///
    /// Called on transport restart, on snapshot replacement, and when a parse
    /// failure leaves the maps in an ambiguous state.
    pub fn clear(&mut self) {
        self.asks.clear();
        self.bids.clear();
    }

    /// Replace both sides wholesale (polled snapshots).
    pub fn replace(&mut self, bids: SideMap, asks: SideMap) {
        self.bids = bids;
        self.asks = asks;
    }

    /// Insert or update a bid level.
    pub fn set_bid(&mut self, price: f64, volume: f64) {
        self.bids.insert(OrderedFloat(price), volume);
    }

    /// Insert or update an ask level.
    pub fn set_ask(&mut self, price: f64, volume: f64) {
        self.asks.insert(OrderedFloat(price), volume);
    }

    /// Delete the bid level at `price`, if present.
    pub fn remove_bid(&mut self, price: f64) {
        self.bids.remove(&OrderedFloat(price));
    }

    /// Delete the ask level at `price`, if present.
    pub fn remove_ask(&mut self, price: f64) {
        self.asks.remove(&OrderedFloat(price));
    }

    /// Highest bid price, if any.
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.last_key_value().map(|(p, _)| p.into_inner())
    }

    /// Lowest ask price, if any.
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first_key_value().map(|(p, _)| p.into_inner())
    }

    pub fn asks(&self) -> &SideMap {
        &self.asks
    }

    pub fn bids(&self) -> &SideMap {
        &self.bids
    }

    /// The publication gate: both sides non-empty, all prices and volumes
    /// strictly positive, best bid ≤ best ask (touching is tolerated).
    pub fn is_consistent(&self) -> bool {
        let (best_bid, best_ask) = match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => (b, a),
            _ => return false,
        };

        if best_bid <= 0.0 || best_ask <= 0.0 || best_bid > best_ask {
            return false;
        }

        let positive = |(price, volume): (&OrderedFloat<f64>, &f64)| {
            price.into_inner() > 0.0 && *volume > 0.0
        };
        self.bids.iter().all(positive) && self.asks.iter().all(positive)
    }

    /// Invoke `handler` with the current book if it is consistent.
    ///
    /// Returns `false` when the book failed the consistency check and nothing
    /// was published; the caller is expected to request a restart.
    pub fn publish_if_consistent(&self, symbol: &str, handler: &BookHandler) -> bool {
        if !self.is_consistent() {
            return false;
        }
        handler(symbol, &self.asks, &self.bids);
        true
    }
}
