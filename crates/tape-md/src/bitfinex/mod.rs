//! Bitfinex market data — order book and trades over the v2 WebSocket API.
//!
//! Book channel payload entries are `[price, count, amount]` triples:
//!
//! - `count > 0, amount > 0` — set the bid level at `price` to `amount`
//! - `count > 0, amount < 0` — set the ask level at `price` to `−amount`
//! - `count = 0, amount = 1` — delete the bid level at `price`
//! - `count = 0, amount = −1` — delete the ask level at `price`
//!
//! A payload that is a list of triples is a snapshot: both sides are cleared
//! first. Trade channel messages tagged `"te"` carry
//! `[id, ts_ms, amount, price]`; the sign of `amount` is the taker side.

pub mod ws;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use tape_core::book::OrderBook;
use tape_core::types::{BookHandler, ErrorHandler, TakerSide, TradeHandler};
use tape_core::ws::{StreamHandle, StreamSupervisor};

use self::ws::{BITFINEX_WS_URL, BitfinexWsClient};

/// The venue caps order-book subscriptions at 25 or 100 levels.
fn book_len_for_depth(depth: u32) -> u32 {
    if depth <= 25 { 25 } else { 100 }
}

/// Streaming subscriber for one Bitfinex instrument.
pub struct BitfinexSubscriber {
    supervisor: StreamSupervisor,
}

impl BitfinexSubscriber {
    /// Subscribe to the order book and trade stream for `symbol`
    /// (e.g. `tBTCUSD`) and start the connection.
    pub fn start(
        symbol: &str,
        depth: u32,
        book_handler: BookHandler,
        trade_handler: TradeHandler,
        error_handler: ErrorHandler,
    ) -> Self {
        let client = Arc::new(BitfinexWsClient::new());
        wire_channels(&client, symbol, depth, book_handler, trade_handler);

        let supervisor =
            StreamSupervisor::start("bitfinex", BITFINEX_WS_URL, client, error_handler);
        Self { supervisor }
    }

    /// Whether the connection is up and the venue welcome has been seen.
    pub fn is_working(&self) -> bool {
        self.supervisor.is_working()
    }

    /// Stop the supervisor and transport; joins all tasks.
    pub async fn stop(&mut self) {
        self.supervisor.stop().await;
    }
}

/// Register the book and trades channels on `client`. Separated from
/// [`BitfinexSubscriber::start`] so tests can drive the protocol without a
/// live connection.
fn wire_channels(
    client: &Arc<BitfinexWsClient>,
    symbol: &str,
    depth: u32,
    book_handler: BookHandler,
    trade_handler: TradeHandler,
) {
    let book = Arc::new(Mutex::new(OrderBook::new()));

    // The book is per-session state: drop it with the channel registry on
    // every restart so a stale side never survives a reconnect.
    {
        let book = book.clone();
        client.set_session_reset(Arc::new(move || {
            book.lock().expect("bitfinex book lock").clear();
        }));
    }

    {
        let params = BTreeMap::from([
            ("symbol".to_string(), symbol.to_string()),
            ("prec".to_string(), "P0".to_string()),
            ("freq".to_string(), "F0".to_string()),
            ("len".to_string(), book_len_for_depth(depth).to_string()),
        ]);
        let book = book.clone();
        let symbol = symbol.to_string();
        client.subscribe(
            "book",
            params,
            Arc::new(move |stream, payload| {
                order_book_event(stream, payload, &book, &symbol, &book_handler);
            }),
        );
    }

    {
        let params = BTreeMap::from([("symbol".to_string(), symbol.to_string())]);
        let symbol = symbol.to_string();
        client.subscribe(
            "trades",
            params,
            Arc::new(move |_stream, payload| {
                trades_event(payload, &symbol, &trade_handler);
            }),
        );
    }
}

/// Apply one `[price, count, amount]` triple to the book. Returns `false`
/// when the entry is not a triple of numbers.
fn apply_book_entry(book: &mut OrderBook, entry: &Value) -> bool {
    let Some(triple) = entry.as_array() else {
        return false;
    };
    if triple.len() != 3 {
        return false;
    }
    let (Some(price), Some(count), Some(amount)) =
        (triple[0].as_f64(), triple[1].as_f64(), triple[2].as_f64())
    else {
        return false;
    };

    if count > 0.0 {
        if amount > 0.0 {
            book.set_bid(price, amount);
        } else if amount < 0.0 {
            book.set_ask(price, -amount);
        }
    } else if count == 0.0 {
        if amount == 1.0 {
            book.remove_bid(price);
        } else if amount == -1.0 {
            book.remove_ask(price);
        }
    }
    true
}

fn order_book_event(
    stream: &StreamHandle,
    payload: &[Value],
    book: &Mutex<OrderBook>,
    symbol: &str,
    book_handler: &BookHandler,
) {
    // payload[0] is the channel payload; heartbeats put a string here.
    let Some(value) = payload.first() else {
        return;
    };
    let Some(items) = value.as_array() else {
        return;
    };
    if items.is_empty() {
        return;
    }

    let mut book = book.lock().expect("bitfinex book lock");

    // A single delta is a triple of numbers; anything else is a snapshot —
    // a list of triples replacing the whole book.
    if !apply_book_entry(&mut book, value) {
        book.clear();
        for item in items {
            apply_book_entry(&mut book, item);
        }
    }

    if !book.publish_if_consistent(symbol, book_handler) {
        stream.request_restart();
    }
}

fn trades_event(payload: &[Value], symbol: &str, trade_handler: &TradeHandler) {
    // Only trade-executed messages carry a deal; "tu" updates and snapshots
    // are skipped.
    if payload.first().and_then(Value::as_str) != Some("te") {
        return;
    }
    let Some(content) = payload.get(1).and_then(Value::as_array) else {
        return;
    };
    if content.len() < 4 {
        return;
    }

    let (Some(ts_ms), Some(amount), Some(price)) =
        (content[1].as_u64(), content[2].as_f64(), content[3].as_f64())
    else {
        return;
    };

    let timestamp_us = ts_ms * 1000;
    let side = if amount < 0.0 { TakerSide::Sell } else { TakerSide::Buy };
    trade_handler(symbol, price, amount.abs(), timestamp_us, side);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BookProbe, TradeProbe, test_supervisor};
    use tape_core::error::TapeError;
    use tape_core::ws::StreamProtocol;

    const WELCOME: &str = r#"{"event":"info","version":2}"#;
    const BOOK_ACK: &str = r#"{"event":"subscribed","channel":"book","chanId":17,"symbol":"tBTCUSD","prec":"P0","freq":"F0","len":25}"#;
    const TRADES_ACK: &str = r#"{"event":"subscribed","channel":"trades","chanId":18,"symbol":"tBTCUSD"}"#;

    fn wired_client(
        depth: u32,
    ) -> (Arc<BitfinexWsClient>, BookProbe, TradeProbe) {
        let client = Arc::new(BitfinexWsClient::new());
        let book_probe = BookProbe::new();
        let trade_probe = TradeProbe::new();
        wire_channels(
            &client,
            "tBTCUSD",
            depth,
            book_probe.handler(),
            trade_probe.handler(),
        );
        (client, book_probe, trade_probe)
    }

    #[test]
    fn len_selection_boundaries() {
        assert_eq!(book_len_for_depth(1), 25);
        assert_eq!(book_len_for_depth(25), 25);
        assert_eq!(book_len_for_depth(26), 100);
        assert_eq!(book_len_for_depth(500), 100);
    }

    #[test]
    fn welcome_version_two_marks_init() {
        let (client, _book, _trades) = wired_client(10);
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        client.read_handler(&handle, WELCOME).unwrap();
        assert!(handle.is_init_received());
    }

    #[test]
    fn unexpected_welcome_version_is_fatal() {
        let (client, _book, _trades) = wired_client(10);
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        let err = client
            .read_handler(&handle, r#"{"event":"info","version":3}"#)
            .unwrap_err();
        assert!(matches!(err, TapeError::Protocol(_)));
        assert!(!handle.is_init_received());
    }

    #[test]
    fn snapshot_then_delete_flags_restart() {
        let (client, book_probe, _trades) = wired_client(10);
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        client.read_handler(&handle, WELCOME).unwrap();
        client.read_handler(&handle, BOOK_ACK).unwrap();

        // Snapshot: one bid at 100, one ask at 101.
        client
            .read_handler(&handle, r#"[17,[[100.0,1,2.0],[101.0,1,-1.5]]]"#)
            .unwrap();
        let (bids, asks) = book_probe.last().expect("snapshot published");
        assert_eq!(bids, vec![(100.0, 2.0)]);
        assert_eq!(asks, vec![(101.0, 1.5)]);
        assert_eq!(book_probe.count(), 1);

        // Delta deletes the only bid — inconsistent, no publication, restart.
        client.read_handler(&handle, r#"[17,[100.0,0,1]]"#).unwrap();
        assert_eq!(book_probe.count(), 1);
        assert!(handle.restart_pending());
    }

    #[test]
    fn delta_updates_publish() {
        let (client, book_probe, _trades) = wired_client(10);
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        client.read_handler(&handle, WELCOME).unwrap();
        client.read_handler(&handle, BOOK_ACK).unwrap();
        client
            .read_handler(&handle, r#"[17,[[100.0,1,2.0],[101.0,1,-1.5]]]"#)
            .unwrap();

        // New bid level below the best.
        client.read_handler(&handle, r#"[17,[99.5,2,3.0]]"#).unwrap();
        let (bids, asks) = book_probe.last().unwrap();
        assert_eq!(bids, vec![(100.0, 2.0), (99.5, 3.0)]);
        assert_eq!(asks, vec![(101.0, 1.5)]);

        // Delete the ask level via count=0, amount=-1.
        client.read_handler(&handle, r#"[17,[101.0,0,-1]]"#).unwrap();
        // Ask side now empty — inconsistent.
        assert!(handle.restart_pending());
        assert_eq!(book_probe.count(), 2);
    }

    #[test]
    fn heartbeat_frames_are_ignored() {
        let (client, book_probe, _trades) = wired_client(10);
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        client.read_handler(&handle, WELCOME).unwrap();
        client.read_handler(&handle, BOOK_ACK).unwrap();
        client.read_handler(&handle, r#"[17,"hb"]"#).unwrap();
        assert_eq!(book_probe.count(), 0);
        assert!(!handle.restart_pending());
    }

    #[test]
    fn te_trade_is_normalized() {
        let (client, _book, trade_probe) = wired_client(10);
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        client.read_handler(&handle, WELCOME).unwrap();
        client.read_handler(&handle, TRADES_ACK).unwrap();

        client
            .read_handler(&handle, r#"[18,"te",[401597395,1641092645678,-0.5,50000.0]]"#)
            .unwrap();
        let trades = trade_probe.all();
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.symbol, "tBTCUSD");
        assert_eq!(t.price, 50000.0);
        assert_eq!(t.volume, 0.5);
        assert_eq!(t.timestamp_us, 1_641_092_645_678_000);
        assert_eq!(t.side, TakerSide::Sell);
    }

    #[test]
    fn tu_trades_and_snapshots_are_skipped() {
        let (client, _book, trade_probe) = wired_client(10);
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        client.read_handler(&handle, WELCOME).unwrap();
        client.read_handler(&handle, TRADES_ACK).unwrap();

        client
            .read_handler(&handle, r#"[18,"tu",[401597395,1641092645678,0.5,50000.0]]"#)
            .unwrap();
        client
            .read_handler(&handle, r#"[18,[[401597395,1641092645678,0.5,50000.0]]]"#)
            .unwrap();
        assert!(trade_probe.all().is_empty());
    }

    #[test]
    fn data_before_ack_is_dropped() {
        let (client, book_probe, _trades) = wired_client(10);
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        client.read_handler(&handle, WELCOME).unwrap();
        // No ack yet: channel id 17 is unknown.
        client
            .read_handler(&handle, r#"[17,[[100.0,1,2.0],[101.0,1,-1.5]]]"#)
            .unwrap();
        assert_eq!(book_probe.count(), 0);
    }

    #[test]
    fn session_reset_clears_book_and_registry() {
        let (client, book_probe, _trades) = wired_client(10);
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        client.read_handler(&handle, WELCOME).unwrap();
        client.read_handler(&handle, BOOK_ACK).unwrap();
        client
            .read_handler(&handle, r#"[17,[[100.0,1,2.0],[101.0,1,-1.5]]]"#)
            .unwrap();
        assert_eq!(book_probe.count(), 1);

        client.reset_active_channels();

        // Same channel id no longer routes; the book was cleared with it.
        client.read_handler(&handle, r#"[17,[99.5,2,3.0]]"#).unwrap();
        assert_eq!(book_probe.count(), 1);
        assert!(!handle.restart_pending());
    }
}
