//! Kraken market data — polled over the public REST API.
//!
//! Kraken is the one venue without a streaming connection here: two
//! independent workers poll the Depth and Trades endpoints on a fixed period
//! and respect a cooperative shutdown signal. A failed request is reported
//! and the worker lives on to the next tick.
//!
//! The first Trades poll only initializes the `since` cursor — its records
//! are historical and discarded so a fresh start does not flood subscribers.

pub mod api;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use tape_core::book::OrderBook;
use tape_core::types::{BookHandler, ErrorHandler, SideMap, TradeHandler};

use self::api::{KrakenOrderType, KrakenRestClient, KrakenTrade, TradesPage};

/// Default pause between polls.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(1);

/// Polled subscriber for one Kraken pair.
pub struct KrakenSubscriber {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl KrakenSubscriber {
    /// Start the two polling workers for `pair` (e.g. `XXBTZUSD`).
    pub fn start(
        pair: &str,
        depth: u32,
        poll_period: Duration,
        book_handler: BookHandler,
        trade_handler: TradeHandler,
        error_handler: ErrorHandler,
    ) -> Result<Self, tape_core::error::TapeError> {
        let client = Arc::new(KrakenRestClient::new()?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let book_task = {
            let client = client.clone();
            let pair = pair.to_string();
            let errors = error_handler.clone();
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                book_poll_loop(client, pair, depth, poll_period, book_handler, errors, shutdown)
                    .await;
            })
        };

        let trades_task = {
            let pair = pair.to_string();
            tokio::spawn(async move {
                trades_poll_loop(
                    client,
                    pair,
                    poll_period,
                    trade_handler,
                    error_handler,
                    shutdown_rx,
                )
                .await;
            })
        };

        Ok(Self { shutdown_tx, tasks: vec![book_task, trades_task] })
    }

    /// Signal both workers and join them.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Sleep one poll period, waking early on shutdown. Returns `false` when the
/// worker should exit.
async fn poll_pause(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = shutdown.changed() => false,
    }
}

async fn book_poll_loop(
    client: Arc<KrakenRestClient>,
    pair: String,
    depth: u32,
    period: Duration,
    book_handler: BookHandler,
    error_handler: ErrorHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut book = OrderBook::new();

    while !*shutdown.borrow() {
        match client.get_order_book(&pair, depth).await {
            Ok(snapshot) => {
                if !snapshot.asks.is_empty() && !snapshot.bids.is_empty() {
                    let bids: SideMap = snapshot
                        .bids
                        .iter()
                        .map(|r| (ordered_float::OrderedFloat(r.price), r.volume))
                        .collect();
                    let asks: SideMap = snapshot
                        .asks
                        .iter()
                        .map(|r| (ordered_float::OrderedFloat(r.price), r.volume))
                        .collect();

                    // Polled books are replaced wholesale; an inconsistent
                    // snapshot is simply not published.
                    book.replace(bids, asks);
                    book.publish_if_consistent(&pair, &book_handler);
                }
            }
            Err(e) => error_handler(&e),
        }

        if !poll_pause(period, &mut shutdown).await {
            break;
        }
    }
    info!("[kraken] book poll worker stopped");
}

/// Pagination state for the Trades endpoint.
///
/// Factored out of the poll loop so the discard-then-follow behaviour is
/// testable without HTTP.
struct TradeCursor {
    since: u64,
}

impl TradeCursor {
    fn new() -> Self {
        Self { since: 0 }
    }

    /// Consume one page: advance `since` and return the trades to publish.
    /// The very first page initializes the cursor and publishes nothing.
    fn advance(&mut self, page: TradesPage) -> Vec<KrakenTrade> {
        if self.since == 0 {
            self.since = page.last_id;
            return Vec::new();
        }

        self.since = page.last_id;
        page.records
            .into_iter()
            .filter(|r| r.order == KrakenOrderType::Market && r.deal.is_some())
            .collect()
    }
}

async fn trades_poll_loop(
    client: Arc<KrakenRestClient>,
    pair: String,
    period: Duration,
    trade_handler: TradeHandler,
    error_handler: ErrorHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cursor = TradeCursor::new();

    while !*shutdown.borrow() {
        match client.get_trades(&pair, cursor.since).await {
            Ok(page) => {
                for trade in cursor.advance(page) {
                    if let Some(side) = trade.deal {
                        trade_handler(&pair, trade.price, trade.volume, trade.timestamp_us, side);
                    }
                }
            }
            Err(e) => error_handler(&e),
        }

        if !poll_pause(period, &mut shutdown).await {
            break;
        }
    }
    info!("[kraken] trades poll worker stopped");
}
