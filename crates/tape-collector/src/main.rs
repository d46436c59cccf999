//! # tape-collector
//!
//! Collects live order books and trades for one instrument from several
//! exchanges in parallel and archives them into rotating CSV blocks.
//!
//! # Usage
//!
//! ```bash
//! tape-collector --dump-path /data/btcusd \
//!     --symbol-config symbols/btcusd.json \
//!     --duration 480 --blocks 3 --depth 10
//! ```
//!
//! The process runs for `duration × blocks` minutes (or until Ctrl+C), then
//! shuts every feed down and exits 0. Any startup error is written to stderr
//! and exits 1.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;

use tape_core::config::load_instrument_spec;
use tape_core::types::Venue;
use tape_md::{MarketDataProvider, MarketSubscriber};

/// Multi-venue market data collector.
#[derive(Parser)]
#[command(name = "tape-collector", about = "Multi-venue market data collector")]
struct Cli {
    /// Collect from selected exchanges only (comma-separated subset of
    /// bitfinex, bitmex, kraken, coinbase). Default: all.
    #[arg(long)]
    exchanges: Option<String>,

    /// Dump path for market data.
    #[arg(long)]
    dump_path: PathBuf,

    /// Config file for symbol name mapping (JSON).
    #[arg(long)]
    symbol_config: PathBuf,

    /// Duration of one archive block in minutes.
    #[arg(long, default_value_t = 480)]
    duration: u32,

    /// Number of archive blocks; total run time is duration × blocks.
    #[arg(long, default_value_t = 1)]
    blocks: u32,

    /// Depth of the order book and number of archived price levels.
    #[arg(long, default_value_t = 10)]
    depth: u32,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Optional log directory for daily-rotating file output.
    #[arg(long)]
    log_dir: Option<String>,
}

/// Parse the `--exchanges` list; case-insensitive, unknown names error.
fn parse_exchanges(arg: Option<&str>) -> Result<BTreeSet<Venue>> {
    let Some(arg) = arg else {
        return Ok(Venue::all().into_iter().collect());
    };

    let mut venues = BTreeSet::new();
    for name in arg.split(',') {
        venues.insert(name.trim().parse::<Venue>()?);
    }
    if venues.is_empty() {
        bail!("an empty list of exchanges was passed");
    }
    Ok(venues)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard =
        tape_core::logging::init_logging(&cli.log_level, cli.log_dir.as_deref(), "tape-collector");

    if cli.duration == 0 {
        bail!("invalid duration");
    }
    if cli.blocks == 0 {
        bail!("invalid number of blocks");
    }
    if cli.depth == 0 {
        bail!("invalid order book depth");
    }

    let exchanges = parse_exchanges(cli.exchanges.as_deref())?;
    let spec = load_instrument_spec(&cli.symbol_config, &exchanges, cli.depth)
        .context("symbol mapping configuration")?;

    info!("collecting market data for symbol '{}'", spec.symbol);
    info!("dump path: {}", cli.dump_path.display());
    info!("block duration: {} minute(s), blocks: {}", cli.duration, cli.blocks);
    for (venue, source) in &spec.venues {
        info!("{venue}: {}", source.symbol);
    }

    let mut provider = MarketDataProvider::start(spec, MarketSubscriber::default())?;
    provider.set_dump_quotes(true, &cli.dump_path, cli.duration)?;

    let run_for = Duration::from_secs(u64::from(cli.duration) * u64::from(cli.blocks) * 60);
    info!("running for {} minute(s) — press Ctrl+C to stop", run_for.as_secs() / 60);

    tokio::select! {
        _ = tokio::time::sleep(run_for) => {
            info!("collection window elapsed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    provider.shutdown().await;
    info!("all feeds stopped — goodbye");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_exchange_set_is_all() {
        let venues = parse_exchanges(None).unwrap();
        assert_eq!(venues.len(), 4);
    }

    #[test]
    fn exchange_list_is_case_insensitive() {
        let venues = parse_exchanges(Some("BitMEX, kraken")).unwrap();
        assert_eq!(venues, BTreeSet::from([Venue::Bitmex, Venue::Kraken]));
    }

    #[test]
    fn unknown_exchange_errors() {
        assert!(parse_exchanges(Some("bitfinex,gdax")).is_err());
    }
}
