//! Rotating CSV archive for trades and price levels.
//!
//! Two symmetric writer loops (one per record kind) drain bounded queues into
//! `<dump-path>/<kind>/<symbol>_<block>.csv`. Files are opened append-only
//! and written unbuffered, so concurrent runs into the same block interleave
//! whole lines and a crash loses at most the line in flight. A write failure
//! drops that record and keeps the writer alive.
//!
//! Line formats:
//!
//! - trades: `venue,price(%.2f),signed_volume(%.8f),timestamp_µs` — the
//!   volume sign encodes the taker side (positive = buy);
//! - prices: `venue,timestamp_µs` followed by `,price(%.2f),volume(%.8f)`
//!   per level, bid/ask interleaved from best outward.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::Receiver;
use tracing::{error, info};

use tape_core::types::{TakerSide, Venue};

/// Capacity of each archival queue. Producers drop records (with a warning)
/// when the writer falls this far behind.
pub const ARCHIVE_QUEUE_CAPACITY: usize = 8192;

/// A record one of the archive writers knows how to persist.
pub trait DumpRecord: Send + 'static {
    /// Subdirectory under the dump path (`trades` or `prices`).
    const KIND: &'static str;

    fn timestamp_us(&self) -> u64;

    /// One CSV line, terminated with `\n`.
    fn format_csv(&self) -> String;
}

// ---------------------------------------------------------------------------
// Trade records
// ---------------------------------------------------------------------------

/// One archived trade.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeDumpRecord {
    pub venue: Venue,
    pub price: f64,
    pub volume: f64,
    pub timestamp_us: u64,
    pub side: TakerSide,
}

impl TradeDumpRecord {
    /// Parse one line produced by [`DumpRecord::format_csv`]. Re-encoding the
    /// result reproduces the input byte for byte.
    pub fn parse_csv(line: &str) -> Option<Self> {
        let mut fields = line.trim_end_matches('\n').split(',');
        let venue: Venue = fields.next()?.parse().ok()?;
        let price: f64 = fields.next()?.parse().ok()?;
        let signed_volume: f64 = fields.next()?.parse().ok()?;
        let timestamp_us: u64 = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }

        let side = if signed_volume < 0.0 { TakerSide::Sell } else { TakerSide::Buy };
        Some(Self { venue, price, volume: signed_volume.abs(), timestamp_us, side })
    }
}

impl DumpRecord for TradeDumpRecord {
    const KIND: &'static str = "trades";

    fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    fn format_csv(&self) -> String {
        let signed_volume = match self.side {
            TakerSide::Buy => self.volume,
            TakerSide::Sell => -self.volume,
        };
        format!("{},{:.2},{:.8},{}\n", self.venue, self.price, signed_volume, self.timestamp_us)
    }
}

// ---------------------------------------------------------------------------
// Price-level records
// ---------------------------------------------------------------------------

/// One archived top-of-book sample: `(price, volume)` pairs interleaved
/// `b0, a0, b1, a1, …` from best outward.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceDumpRecord {
    pub venue: Venue,
    pub timestamp_us: u64,
    pub levels: Vec<(f64, f64)>,
}

impl DumpRecord for PriceDumpRecord {
    const KIND: &'static str = "prices";

    fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    fn format_csv(&self) -> String {
        use std::fmt::Write as _;

        let mut line = format!("{},{}", self.venue, self.timestamp_us);
        for (price, volume) in &self.levels {
            let _ = write!(line, ",{price:.2},{volume:.8}");
        }
        line.push('\n');
        line
    }
}

// ---------------------------------------------------------------------------
// Block arithmetic
// ---------------------------------------------------------------------------

/// Index of the archive block containing `timestamp_us`.
///
/// Records stamped before the dump started (or with no block duration set)
/// land in block 0.
pub fn block_index(timestamp_us: u64, dump_start_us: u64, block_us: u64) -> u64 {
    if timestamp_us > dump_start_us && block_us != 0 {
        (timestamp_us - dump_start_us) / block_us
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// Writer loop
// ---------------------------------------------------------------------------

/// Drain `rx` into rotating CSV files under `dir` until `stop` is raised or
/// every sender is gone. Runs on a blocking thread; file I/O is synchronous
/// and unbuffered by design.
pub fn run_dump_loop<R: DumpRecord>(
    symbol: &str,
    dir: &Path,
    dump_start_us: Arc<AtomicU64>,
    block_us: u64,
    rx: Receiver<R>,
    stop: Arc<AtomicBool>,
) {
    let kind = R::KIND;
    info!("[archive] {kind} writer started in {}", dir.display());

    let mut file: Option<File> = None;
    let mut current_block: u64 = 0;

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let record = match rx.recv() {
            Ok(record) => record,
            Err(_) => break, // all producers gone
        };

        let start_us = dump_start_us.load(Ordering::SeqCst);
        let record_block = block_index(record.timestamp_us(), start_us, block_us);

        if file.is_none() || record_block != current_block {
            file = None;
            let path: PathBuf = dir.join(format!("{symbol}_{record_block}.csv"));
            match File::options().append(true).create(true).open(&path) {
                Ok(f) => {
                    file = Some(f);
                    current_block = record_block;
                }
                Err(e) => {
                    error!("[archive] could not open {}: {e}", path.display());
                }
            }
        }

        if let Some(f) = file.as_mut() {
            if let Err(e) = f.write_all(record.format_csv().as_bytes()) {
                error!("[archive] {kind} write failed: {e}");
            }
        }
    }

    info!("[archive] {kind} writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    const MINUTE_US: u64 = 60 * 1_000_000;

    fn buy(timestamp_us: u64) -> TradeDumpRecord {
        TradeDumpRecord {
            venue: Venue::Bitfinex,
            price: 50000.0,
            volume: 0.5,
            timestamp_us,
            side: TakerSide::Buy,
        }
    }

    #[test]
    fn block_index_boundaries() {
        let start = 1_000_000_000;
        assert_eq!(block_index(start + 30 * 1_000_000, start, MINUTE_US), 0);
        assert_eq!(block_index(start + 90 * 1_000_000, start, MINUTE_US), 1);
        assert_eq!(block_index(start + 150 * 1_000_000, start, MINUTE_US), 2);
        // Records stamped before the dump started land in block 0.
        assert_eq!(block_index(start - 1, start, MINUTE_US), 0);
        // No block duration: everything in block 0.
        assert_eq!(block_index(start + 90 * 1_000_000, start, 0), 0);
    }

    #[test]
    fn trade_line_sign_encodes_taker_side() {
        let mut record = buy(1_641_092_645_678_000);
        assert_eq!(
            record.format_csv(),
            "bitfinex,50000.00,0.50000000,1641092645678000\n"
        );

        record.side = TakerSide::Sell;
        assert_eq!(
            record.format_csv(),
            "bitfinex,50000.00,-0.50000000,1641092645678000\n"
        );
    }

    #[test]
    fn trade_line_round_trips_byte_for_byte() {
        for line in [
            "bitmex,50000.00,0.10000000,1641092645678000\n",
            "kraken,49999.90,-1.25000000,1641092645678000\n",
            "coinbase,0.05,0.00000001,7\n",
        ] {
            let record = TradeDumpRecord::parse_csv(line).unwrap();
            assert_eq!(record.format_csv(), line);
        }
    }

    #[test]
    fn trade_parse_rejects_malformed_lines() {
        assert!(TradeDumpRecord::parse_csv("").is_none());
        assert!(TradeDumpRecord::parse_csv("bitfinex,1.00").is_none());
        assert!(TradeDumpRecord::parse_csv("gdax,1.00,1.00000000,5\n").is_none());
        assert!(TradeDumpRecord::parse_csv("bitfinex,1.00,1.00000000,5,extra\n").is_none());
    }

    #[test]
    fn price_line_interleaves_levels() {
        let record = PriceDumpRecord {
            venue: Venue::Coinbase,
            timestamp_us: 1_641_092_645_678_000,
            levels: vec![(10.0, 1.0), (11.0, 2.0), (9.5, 3.0), (11.5, 0.25)],
        };
        assert_eq!(
            record.format_csv(),
            "coinbase,1641092645678000,10.00,1.00000000,11.00,2.00000000,9.50,3.00000000,11.50,0.25000000\n"
        );
    }

    #[test]
    fn writer_rotates_files_on_block_boundaries() {
        let tmp = tempfile::tempdir().unwrap();
        let start: u64 = 1_700_000_000_000_000;
        let dump_start = Arc::new(AtomicU64::new(start));
        let stop = Arc::new(AtomicBool::new(false));

        let (tx, rx) = bounded::<TradeDumpRecord>(ARCHIVE_QUEUE_CAPACITY);
        tx.send(buy(start + 30 * 1_000_000)).unwrap();
        tx.send(buy(start + 90 * 1_000_000)).unwrap();
        tx.send(buy(start + 150 * 1_000_000)).unwrap();
        drop(tx);

        run_dump_loop("BTCUSD", tmp.path(), dump_start, MINUTE_US, rx, stop);

        for block in 0..3u64 {
            let content =
                std::fs::read_to_string(tmp.path().join(format!("BTCUSD_{block}.csv"))).unwrap();
            assert_eq!(content.lines().count(), 1, "block {block}");
        }
    }

    #[test]
    fn writer_appends_without_truncation() {
        let tmp = tempfile::tempdir().unwrap();
        let start: u64 = 1_700_000_000_000_000;

        for _run in 0..2 {
            let (tx, rx) = bounded::<TradeDumpRecord>(8);
            tx.send(buy(start + 1_000_000)).unwrap();
            drop(tx);
            run_dump_loop(
                "BTCUSD",
                tmp.path(),
                Arc::new(AtomicU64::new(start)),
                MINUTE_US,
                rx,
                Arc::new(AtomicBool::new(false)),
            );
        }

        let content = std::fs::read_to_string(tmp.path().join("BTCUSD_0.csv")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn stop_flag_abandons_queued_records() {
        let tmp = tempfile::tempdir().unwrap();
        let start: u64 = 1_700_000_000_000_000;
        let stop = Arc::new(AtomicBool::new(true));

        let (tx, rx) = bounded::<TradeDumpRecord>(8);
        tx.send(buy(start + 1_000_000)).unwrap();
        drop(tx);

        run_dump_loop(
            "BTCUSD",
            tmp.path(),
            Arc::new(AtomicU64::new(start)),
            MINUTE_US,
            rx,
            stop,
        );
        assert!(!tmp.path().join("BTCUSD_0.csv").exists());
    }
}
