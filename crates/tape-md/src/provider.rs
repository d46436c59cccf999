//! Market-data provider: one subscriber per configured venue, fanned out to
//! the user subscriber and the archival queues.
//!
//! For every inbound book publication a single timestamp is sampled, so the
//! user callback and the corresponding price-dump record carry the same
//! `timestamp_µs`. Archival queues are bounded: when a writer falls behind,
//! the producing reader drops the record and logs a warning instead of
//! blocking.
//!
//! Venue failures are isolated: errors are logged here and never re-raised
//! into the user's callback path.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Sender, TrySendError, bounded};
use tracing::{error, info, warn};

use tape_core::config::InstrumentSpec;
use tape_core::error::TapeError;
use tape_core::time_util;
use tape_core::types::{BookHandler, ErrorHandler, SideMap, TakerSide, TradeHandler, Venue};

use crate::archive::{
    ARCHIVE_QUEUE_CAPACITY, DumpRecord, PriceDumpRecord, TradeDumpRecord, run_dump_loop,
};
use crate::bitfinex::BitfinexSubscriber;
use crate::bitmex::{BitmexSubscriber, ws::BitmexCredentials};
use crate::coinbase::CoinbaseSubscriber;
use crate::kraken::{DEFAULT_POLL_PERIOD, KrakenSubscriber};

/// Book callback at the provider boundary:
/// `(venue, symbol, asks, bids, timestamp_µs)`.
pub type ProviderBookHandler =
    Arc<dyn Fn(Venue, &str, &SideMap, &SideMap, u64) + Send + Sync>;

/// Trade callback at the provider boundary:
/// `(venue, symbol, price, volume, timestamp_µs, taker_side)`.
pub type ProviderTradeHandler =
    Arc<dyn Fn(Venue, &str, f64, f64, u64, TakerSide) + Send + Sync>;

/// The user's subscription; both callbacks are optional.
#[derive(Clone, Default)]
pub struct MarketSubscriber {
    pub on_book: Option<ProviderBookHandler>,
    pub on_trade: Option<ProviderTradeHandler>,
}

enum VenueFeed {
    Bitfinex(BitfinexSubscriber),
    Coinbase(CoinbaseSubscriber),
    Bitmex(BitmexSubscriber),
    Kraken(KrakenSubscriber),
}

/// Archival fan-out state shared with the per-venue callbacks.
///
/// The senders live behind mutexes so dumping can be enabled after the
/// subscribers (and their captured callbacks) already exist.
struct DumpState {
    enabled: AtomicBool,
    /// Shared with the writer tasks, which read it per record.
    start_us: Arc<AtomicU64>,
    trades_tx: Mutex<Option<Sender<TradeDumpRecord>>>,
    prices_tx: Mutex<Option<Sender<PriceDumpRecord>>>,
}

impl DumpState {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            start_us: Arc::new(AtomicU64::new(0)),
            trades_tx: Mutex::new(None),
            prices_tx: Mutex::new(None),
        }
    }

    fn enqueue_trade(&self, record: TradeDumpRecord) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.trades_tx.lock().expect("trades queue lock").as_ref() {
            if let Err(TrySendError::Full(_)) = tx.try_send(record) {
                warn!("trades dump queue full, dropping record");
            }
        }
    }

    fn enqueue_prices(&self, record: PriceDumpRecord) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.prices_tx.lock().expect("prices queue lock").as_ref() {
            if let Err(TrySendError::Full(_)) = tx.try_send(record) {
                warn!("prices dump queue full, dropping record");
            }
        }
    }
}

/// Top `levels` of each side interleaved `b0, a0, b1, a1, …` from best
/// outward; stops at the shorter side.
fn interleave_levels(bids: &SideMap, asks: &SideMap, levels: usize) -> Vec<(f64, f64)> {
    let mut out = Vec::with_capacity(levels * 2);
    for ((bid_price, bid_vol), (ask_price, ask_vol)) in
        bids.iter().rev().zip(asks.iter()).take(levels)
    {
        out.push((bid_price.into_inner(), *bid_vol));
        out.push((ask_price.into_inner(), *ask_vol));
    }
    out
}

fn make_book_fanout(
    venue: Venue,
    levels: usize,
    user: Option<ProviderBookHandler>,
    dump: Arc<DumpState>,
) -> BookHandler {
    Arc::new(move |symbol, asks, bids| {
        // One timestamp per publication: the user and the archive see the
        // same value.
        let timestamp_us = time_util::now_us();

        if let Some(cb) = &user {
            cb(venue, symbol, asks, bids, timestamp_us);
        }

        dump.enqueue_prices(PriceDumpRecord {
            venue,
            timestamp_us,
            levels: interleave_levels(bids, asks, levels),
        });
    })
}

fn make_trade_fanout(
    venue: Venue,
    user: Option<ProviderTradeHandler>,
    dump: Arc<DumpState>,
) -> TradeHandler {
    Arc::new(move |symbol, price, volume, timestamp_us, side| {
        if let Some(cb) = &user {
            cb(venue, symbol, price, volume, timestamp_us, side);
        }

        dump.enqueue_trade(TradeDumpRecord { venue, price, volume, timestamp_us, side });
    })
}

fn make_error_sink(venue: Venue) -> ErrorHandler {
    Arc::new(move |err| {
        error!("{venue}: {err}");
    })
}

/// Live market data for one instrument across all configured venues.
pub struct MarketDataProvider {
    spec: InstrumentSpec,
    feeds: Vec<VenueFeed>,
    dump: Arc<DumpState>,
    dump_path: PathBuf,
    block_us: u64,
    stop_dumping: Arc<AtomicBool>,
    writer_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl MarketDataProvider {
    /// Start one venue subscriber per entry in `spec` and wire the fan-out.
    pub fn start(
        spec: InstrumentSpec,
        subscriber: MarketSubscriber,
    ) -> Result<Self, TapeError> {
        info!("adding market data feeds for symbol: {}", spec.symbol);

        let dump = Arc::new(DumpState::new());
        let levels = spec.price_levels as usize;
        let mut feeds = Vec::new();

        for (venue, source) in &spec.venues {
            let on_book =
                make_book_fanout(*venue, levels, subscriber.on_book.clone(), dump.clone());
            let on_trade = make_trade_fanout(*venue, subscriber.on_trade.clone(), dump.clone());
            let on_error = make_error_sink(*venue);

            let feed = match venue {
                Venue::Bitfinex => VenueFeed::Bitfinex(BitfinexSubscriber::start(
                    &source.symbol,
                    source.depth,
                    on_book,
                    on_trade,
                    on_error,
                )),
                Venue::Coinbase => VenueFeed::Coinbase(CoinbaseSubscriber::start(
                    &source.symbol,
                    on_book,
                    on_trade,
                    on_error,
                )),
                Venue::Bitmex => VenueFeed::Bitmex(BitmexSubscriber::start(
                    &source.symbol,
                    BitmexCredentials::default(),
                    on_book,
                    on_trade,
                    on_error,
                )),
                Venue::Kraken => VenueFeed::Kraken(KrakenSubscriber::start(
                    &source.symbol,
                    source.depth,
                    DEFAULT_POLL_PERIOD,
                    on_book,
                    on_trade,
                    on_error,
                )?),
            };
            feeds.push(feed);

            info!(
                "{venue} added as a market data feed: source symbol={}, depth={}",
                source.symbol, source.depth
            );
        }

        Ok(Self {
            spec,
            feeds,
            dump,
            dump_path: PathBuf::new(),
            block_us: 0,
            stop_dumping: Arc::new(AtomicBool::new(false)),
            writer_tasks: Vec::new(),
        })
    }

    /// A provider with no feeds, for exercising the dump pipeline in tests.
    #[cfg(test)]
    fn idle(spec: InstrumentSpec) -> Self {
        Self {
            spec,
            feeds: Vec::new(),
            dump: Arc::new(DumpState::new()),
            dump_path: PathBuf::new(),
            block_us: 0,
            stop_dumping: Arc::new(AtomicBool::new(false)),
            writer_tasks: Vec::new(),
        }
    }

    /// Enable or disable the archival fan-out.
    ///
    /// On enable: records the dump start time, creates the `trades` and
    /// `prices` directories, and lazily starts the two writer tasks.
    pub fn set_dump_quotes(
        &mut self,
        enabled: bool,
        path: &Path,
        block_minutes: u32,
    ) -> Result<(), TapeError> {
        if enabled && path.as_os_str().is_empty() {
            return Err(TapeError::Config("dump path is not defined".into()));
        }
        if block_minutes == 0 {
            return Err(TapeError::Config("block duration must be positive".into()));
        }

        info!(
            "market data dumping: enabled={enabled}, path={}, block duration(minutes)={block_minutes}",
            path.display()
        );

        self.dump_path = path.to_path_buf();
        self.block_us = block_minutes as u64 * 60 * 1_000_000;

        if !enabled {
            self.dump.enabled.store(false, Ordering::SeqCst);
            self.dump.start_us.store(0, Ordering::SeqCst);
            return Ok(());
        }

        self.dump.start_us.store(time_util::now_us(), Ordering::SeqCst);

        for kind in ["trades", "prices"] {
            std::fs::create_dir_all(path.join(kind)).map_err(|e| {
                TapeError::Archive(format!("could not create {}/{kind}: {e}", path.display()))
            })?;
        }

        if self.writer_tasks.is_empty() {
            self.spawn_writers();
        }
        self.dump.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_writers(&mut self) {
        let (trades_tx, trades_rx) = bounded::<TradeDumpRecord>(ARCHIVE_QUEUE_CAPACITY);
        let (prices_tx, prices_rx) = bounded::<PriceDumpRecord>(ARCHIVE_QUEUE_CAPACITY);
        *self.dump.trades_tx.lock().expect("trades queue lock") = Some(trades_tx);
        *self.dump.prices_tx.lock().expect("prices queue lock") = Some(prices_tx);

        let symbol = self.spec.symbol.clone();
        let trades_dir = self.dump_path.join(TradeDumpRecord::KIND);
        let start_us = self.dump.start_us.clone();
        let block_us = self.block_us;
        let stop = self.stop_dumping.clone();
        self.writer_tasks.push(tokio::task::spawn_blocking(move || {
            run_dump_loop(&symbol, &trades_dir, start_us, block_us, trades_rx, stop);
        }));

        let symbol = self.spec.symbol.clone();
        let prices_dir = self.dump_path.join(PriceDumpRecord::KIND);
        let start_us = self.dump.start_us.clone();
        let block_us = self.block_us;
        let stop = self.stop_dumping.clone();
        self.writer_tasks.push(tokio::task::spawn_blocking(move || {
            run_dump_loop(&symbol, &prices_dir, start_us, block_us, prices_rx, stop);
        }));
    }

    /// Stop every venue subscriber, then the archive writers. All joins are
    /// unconditional.
    pub async fn shutdown(&mut self) {
        for feed in &mut self.feeds {
            match feed {
                VenueFeed::Bitfinex(s) => s.stop().await,
                VenueFeed::Coinbase(s) => s.stop().await,
                VenueFeed::Bitmex(s) => s.stop().await,
                VenueFeed::Kraken(s) => s.stop().await,
            }
        }

        self.dump.enabled.store(false, Ordering::SeqCst);
        self.stop_dumping.store(true, Ordering::SeqCst);
        // Dropping the senders wakes both writers.
        self.dump.trades_tx.lock().expect("trades queue lock").take();
        self.dump.prices_tx.lock().expect("prices queue lock").take();

        for task in self.writer_tasks.drain(..) {
            let _ = task.await;
        }
    }
}
