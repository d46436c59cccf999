//! Market data structures and subscriber callback signatures.
//!
//! # Timestamp convention
//!
//! All timestamps are **microseconds since Unix epoch**. Venues reporting
//! milliseconds or fractional seconds are converted at the parse boundary.

use std::collections::BTreeMap;
use std::sync::Arc;

use ordered_float::OrderedFloat;

use super::enums::TakerSide;
use crate::error::TapeError;

/// One side of an order book: price → volume.
///
/// `BTreeMap` iteration yields ascending prices; callers read the bid side in
/// descending order via `.iter().rev()`. `OrderedFloat` keys give the total
/// order `f64` lacks (prices are finite and positive by construction).
pub type SideMap = BTreeMap<OrderedFloat<f64>, f64>;

/// A single normalized trade execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp_us: u64,
    pub side: TakerSide,
}

// ---------------------------------------------------------------------------
// Subscriber callbacks
// ---------------------------------------------------------------------------

/// Callback invoked with each consistent order-book publication.
///
/// Parameters: `(symbol, asks, bids)`. The maps are borrowed views valid only
/// for the duration of the call.
pub type BookHandler = Arc<dyn Fn(&str, &SideMap, &SideMap) + Send + Sync>;

/// Callback invoked for each normalized trade.
///
/// Parameters: `(symbol, price, volume, timestamp_us, taker_side)`.
pub type TradeHandler = Arc<dyn Fn(&str, f64, f64, u64, TakerSide) + Send + Sync>;

/// Callback invoked for every reported error.
pub type ErrorHandler = Arc<dyn Fn(&TapeError) + Send + Sync>;
