//! Enumerations used throughout the collector.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TapeError;

// ---------------------------------------------------------------------------
// Venue identifiers
// ---------------------------------------------------------------------------

/// Supported market-data venues.
///
/// `Ord` is derived so venues can key `BTreeMap`s and produce a stable
/// ordering in configs and logs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Bitfinex,
    Coinbase,
    Kraken,
    Bitmex,
}

impl Venue {
    /// All supported venues, in stable order.
    pub fn all() -> [Venue; 4] {
        [Venue::Bitfinex, Venue::Coinbase, Venue::Kraken, Venue::Bitmex]
    }

    /// Lowercase venue name as used in configs, CSV lines, and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Bitfinex => "bitfinex",
            Venue::Coinbase => "coinbase",
            Venue::Kraken => "kraken",
            Venue::Bitmex => "bitmex",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Venue {
    type Err = TapeError;

    /// Case-insensitive venue lookup.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bitfinex" => Ok(Venue::Bitfinex),
            "coinbase" => Ok(Venue::Coinbase),
            "kraken" => Ok(Venue::Kraken),
            "bitmex" => Ok(Venue::Bitmex),
            other => Err(TapeError::Config(format!("unsupported venue: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Trade direction
// ---------------------------------------------------------------------------

/// The taker's direction in a trade — the side that crossed the spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TakerSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TakerSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TakerSide::Buy => f.write_str("buy"),
            TakerSide::Sell => f.write_str("sell"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_from_str_is_case_insensitive() {
        assert_eq!("BitMEX".parse::<Venue>().unwrap(), Venue::Bitmex);
        assert_eq!("KRAKEN".parse::<Venue>().unwrap(), Venue::Kraken);
        assert_eq!("coinbase".parse::<Venue>().unwrap(), Venue::Coinbase);
        assert!("gdax".parse::<Venue>().is_err());
    }

    #[test]
    fn venue_round_trips_through_as_str() {
        for venue in Venue::all() {
            assert_eq!(venue.as_str().parse::<Venue>().unwrap(), venue);
        }
    }
}
