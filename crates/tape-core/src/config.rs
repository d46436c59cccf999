//! Symbol-mapping configuration.
//!
//! One instrument is collected per process. The config file maps the
//! universal symbol name to each venue's own symbol:
//!
//! ```json
//! {
//!   "symbol": "BTCUSD",
//!   "mapping": {
//!     "bitfinex": "tBTCUSD",
//!     "coinbase": "BTC-USD",
//!     "kraken": "XXBTZUSD",
//!     "bitmex": "XBTUSD"
//!   }
//! }
//! ```
//!
//! Unknown venue names are configuration errors; so is a mapping that leaves
//! no enabled venue.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::TapeError;
use crate::types::Venue;

/// On-disk shape of the symbol config file.
#[derive(Debug, Clone, Deserialize)]
struct SymbolConfigFile {
    symbol: String,
    mapping: BTreeMap<String, String>,
}

/// Per-venue symbol alias plus requested book depth.
#[derive(Debug, Clone)]
pub struct VenueSymbol {
    pub symbol: String,
    pub depth: u32,
}

/// Fully resolved description of the instrument to collect.
#[derive(Debug, Clone)]
pub struct InstrumentSpec {
    /// Universal symbol name (e.g. `BTCUSD`), used for archive file names.
    pub symbol: String,
    /// Enabled venues with their venue-specific symbols.
    pub venues: BTreeMap<Venue, VenueSymbol>,
    /// Number of price levels written per archive line.
    pub price_levels: u32,
}

/// Load the symbol config and keep only `enabled` venues.
pub fn load_instrument_spec(
    path: &Path,
    enabled: &BTreeSet<Venue>,
    depth: u32,
) -> Result<InstrumentSpec, TapeError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        TapeError::Config(format!("could not read symbol config {}: {e}", path.display()))
    })?;
    parse_instrument_spec(&content, enabled, depth)
}

/// Parse the symbol config from a JSON string (separated out for tests).
pub fn parse_instrument_spec(
    content: &str,
    enabled: &BTreeSet<Venue>,
    depth: u32,
) -> Result<InstrumentSpec, TapeError> {
    let file: SymbolConfigFile = serde_json::from_str(content)
        .map_err(|e| TapeError::Config(format!("bad symbol config: {e}")))?;

    if file.symbol.is_empty() {
        return Err(TapeError::Config("symbol name is empty".into()));
    }

    let mut venues = BTreeMap::new();
    for (venue_name, venue_symbol) in &file.mapping {
        let venue: Venue = venue_name.parse()?;
        if venue_symbol.is_empty() {
            return Err(TapeError::Config(format!("empty symbol for venue {venue}")));
        }
        if enabled.contains(&venue) {
            venues.insert(venue, VenueSymbol { symbol: venue_symbol.clone(), depth });
        }
    }

    if venues.is_empty() {
        return Err(TapeError::Config(
            "symbol mapping matches none of the enabled venues".into(),
        ));
    }

    Ok(InstrumentSpec { symbol: file.symbol, venues, price_levels: depth })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "symbol": "BTCUSD",
        "mapping": {
            "bitfinex": "tBTCUSD",
            "coinbase": "BTC-USD",
            "kraken": "XXBTZUSD",
            "bitmex": "XBTUSD"
        }
    }"#;

    fn all_venues() -> BTreeSet<Venue> {
        Venue::all().into_iter().collect()
    }

    #[test]
    fn parses_full_mapping() {
        let spec = parse_instrument_spec(CONFIG, &all_venues(), 10).unwrap();
        assert_eq!(spec.symbol, "BTCUSD");
        assert_eq!(spec.price_levels, 10);
        assert_eq!(spec.venues.len(), 4);
        assert_eq!(spec.venues[&Venue::Bitfinex].symbol, "tBTCUSD");
        assert_eq!(spec.venues[&Venue::Kraken].depth, 10);
    }

    #[test]
    fn filters_to_enabled_venues() {
        let enabled = BTreeSet::from([Venue::Kraken]);
        let spec = parse_instrument_spec(CONFIG, &enabled, 5).unwrap();
        assert_eq!(spec.venues.len(), 1);
        assert!(spec.venues.contains_key(&Venue::Kraken));
    }

    #[test]
    fn unknown_venue_is_an_error() {
        let config = r#"{"symbol": "BTCUSD", "mapping": {"gdax": "BTC-USD"}}"#;
        let err = parse_instrument_spec(config, &all_venues(), 10).unwrap_err();
        assert!(matches!(err, TapeError::Config(_)));
    }

    #[test]
    fn empty_filtered_mapping_is_an_error() {
        let config = r#"{"symbol": "BTCUSD", "mapping": {"bitfinex": "tBTCUSD"}}"#;
        let enabled = BTreeSet::from([Venue::Kraken]);
        assert!(parse_instrument_spec(config, &enabled, 10).is_err());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_instrument_spec("{", &all_venues(), 10).is_err());
    }
}
