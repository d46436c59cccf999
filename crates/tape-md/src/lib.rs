//! # tape-md
//!
//! Venue market-data adapters and the subscriber/archival fan-out.
//!
//! ## Architecture
//!
//! Each streaming venue module exposes a subscriber (`BitfinexSubscriber`,
//! `CoinbaseSubscriber`, `BitmexSubscriber`) built from a protocol adapter
//! driven by the shared `StreamSupervisor`; Kraken polls its REST API
//! instead. The [`provider::MarketDataProvider`] instantiates one subscriber
//! per configured venue for a single instrument and fans publications into
//! the user subscriber and the two bounded archive queues drained by
//! [`archive`]'s writer loops.

pub mod archive;
pub mod bitfinex;
pub mod bitmex;
pub mod coinbase;
pub mod kraken;
pub mod provider;

#[cfg(test)]
pub mod testutil;

pub use provider::{MarketDataProvider, MarketSubscriber};
