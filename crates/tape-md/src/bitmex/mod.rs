//! BitMEX market data — `orderBook10` top-of-book and `trade` stream.
//!
//! `orderBook10` always ships the full top-10 view, so only `update` actions
//! are processed: both sides are cleared and reloaded. Level sizes arrive as
//! contract notionals; the stored volume is `notional / price`. Trades are
//! `insert` actions with the taker side given directly and volume in
//! `homeNotional` (base currency).

pub mod auth;
pub mod ws;

use std::sync::{Arc, Mutex};

use serde_json::Value;

use tape_core::book::OrderBook;
use tape_core::time_util;
use tape_core::types::{BookHandler, ErrorHandler, TakerSide, TradeHandler};
use tape_core::ws::{StreamHandle, StreamSupervisor};

use self::ws::{BITMEX_WS_URL, BitmexCredentials, BitmexWsClient};

/// Streaming subscriber for one BitMEX instrument.
pub struct BitmexSubscriber {
    supervisor: StreamSupervisor,
}

impl BitmexSubscriber {
    /// Subscribe to the top-10 book and trade stream for `symbol`
    /// (e.g. `XBTUSD`) and start the connection. Credentials are optional;
    /// without them no authentication frame is sent.
    pub fn start(
        symbol: &str,
        credentials: BitmexCredentials,
        book_handler: BookHandler,
        trade_handler: TradeHandler,
        error_handler: ErrorHandler,
    ) -> Self {
        let client = Arc::new(BitmexWsClient::new(credentials));
        wire_channels(&client, symbol, book_handler, trade_handler);

        let supervisor = StreamSupervisor::start("bitmex", BITMEX_WS_URL, client, error_handler);
        Self { supervisor }
    }

    pub fn is_working(&self) -> bool {
        self.supervisor.is_working()
    }

    pub async fn stop(&mut self) {
        self.supervisor.stop().await;
    }
}

fn wire_channels(
    client: &Arc<BitmexWsClient>,
    symbol: &str,
    book_handler: BookHandler,
    trade_handler: TradeHandler,
) {
    let book = Arc::new(Mutex::new(OrderBook::new()));

    {
        let book = book.clone();
        client.set_session_reset(Arc::new(move || {
            book.lock().expect("bitmex book lock").clear();
        }));
    }

    {
        let book = book.clone();
        let expected = symbol.to_string();
        client.subscribe(
            "orderBook10",
            symbol,
            Arc::new(move |stream, object| {
                order_book_event(stream, object, &book, &expected, &book_handler);
            }),
        );
    }

    {
        let expected = symbol.to_string();
        client.subscribe(
            "trade",
            symbol,
            Arc::new(move |_stream, object| {
                trades_event(object, &expected, &trade_handler);
            }),
        );
    }
}

/// Load `[price, notional]` levels into one side, converting notional to
/// base-currency volume.
fn load_book_side(book: &mut OrderBook, records: Option<&Value>, is_bid: bool) {
    let Some(records) = records.and_then(Value::as_array) else {
        return;
    };
    for record in records {
        let Some(pair) = record.as_array() else {
            continue;
        };
        if pair.len() != 2 {
            continue;
        }
        let (Some(price), Some(notional)) = (pair[0].as_f64(), pair[1].as_f64()) else {
            continue;
        };
        if price == 0.0 {
            continue;
        }
        if is_bid {
            book.set_bid(price, notional / price);
        } else {
            book.set_ask(price, notional / price);
        }
    }
}

fn order_book_event(
    stream: &StreamHandle,
    object: &Value,
    book: &Mutex<OrderBook>,
    symbol: &str,
    book_handler: &BookHandler,
) {
    // "partial" images and deltas are not used: every "update" carries the
    // whole top-10 view.
    if object.get("action").and_then(Value::as_str) != Some("update") {
        return;
    }

    let mut book = book.lock().expect("bitmex book lock");
    book.clear();

    if let Some(data) = object.get("data").and_then(Value::as_array) {
        for record in data {
            if record.get("symbol").and_then(Value::as_str) != Some(symbol) {
                continue;
            }
            load_book_side(&mut book, record.get("asks"), false);
            load_book_side(&mut book, record.get("bids"), true);
        }
    }

    if !book.publish_if_consistent(symbol, book_handler) {
        stream.request_restart();
    }
}

fn trades_event(object: &Value, symbol: &str, trade_handler: &TradeHandler) {
    if object.get("action").and_then(Value::as_str) != Some("insert") {
        return;
    }
    let Some(data) = object.get("data").and_then(Value::as_array) else {
        return;
    };

    for record in data {
        if record.get("symbol").and_then(Value::as_str) != Some(symbol) {
            continue;
        }

        let side = match record.get("side").and_then(Value::as_str) {
            Some(s) if s.starts_with(['B', 'b']) => TakerSide::Buy,
            Some(s) if s.starts_with(['S', 's']) => TakerSide::Sell,
            _ => continue,
        };

        let (Some(price), Some(volume)) = (
            record.get("price").and_then(Value::as_f64),
            record.get("homeNotional").and_then(Value::as_f64),
        ) else {
            continue;
        };
        if price <= 0.0 || volume <= 0.0 {
            continue;
        }

        let Some(iso_time) = record.get("timestamp").and_then(Value::as_str) else {
            continue;
        };
        let Ok(timestamp_us) = time_util::parse_iso_timestamp_us(iso_time) else {
            continue;
        };

        trade_handler(symbol, price, volume, timestamp_us, side);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BookProbe, TradeProbe, test_supervisor};
    use tape_core::ws::StreamProtocol;

    const WELCOME: &str =
        r#"{"info":"Welcome to the BitMEX Realtime API.","version":"2.0.0"}"#;
    const BOOK_ACK: &str = r#"{"subscribe":"orderBook10:XBTUSD","success":true}"#;
    const TRADE_ACK: &str = r#"{"subscribe":"trade:XBTUSD","success":true}"#;

    fn wired_client() -> (Arc<BitmexWsClient>, BookProbe, TradeProbe) {
        let client = Arc::new(BitmexWsClient::new(BitmexCredentials::default()));
        let book_probe = BookProbe::new();
        let trade_probe = TradeProbe::new();
        wire_channels(&client, "XBTUSD", book_probe.handler(), trade_probe.handler());
        (client, book_probe, trade_probe)
    }

    #[test]
    fn info_welcome_marks_init() {
        let (client, _book, _trades) = wired_client();
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        assert!(!handle.is_init_received());
        client.read_handler(&handle, WELCOME).unwrap();
        assert!(handle.is_init_received());
    }

    #[test]
    fn update_converts_notional_to_volume() {
        let (client, book_probe, _trades) = wired_client();
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        client.read_handler(&handle, WELCOME).unwrap();
        client.read_handler(&handle, BOOK_ACK).unwrap();

        client
            .read_handler(
                &handle,
                r#"{"table":"orderBook10","action":"update","data":[{"symbol":"XBTUSD","bids":[[50000.0,100000.0]],"asks":[[50010.0,200020.0]],"timestamp":"2022-01-02T03:04:05.678Z"}]}"#,
            )
            .unwrap();
        let (bids, asks) = book_probe.last().unwrap();
        assert_eq!(bids, vec![(50000.0, 100000.0 / 50000.0)]);
        assert_eq!(asks, vec![(50010.0, 200020.0 / 50010.0)]);
    }

    #[test]
    fn partial_actions_are_skipped() {
        let (client, book_probe, _trades) = wired_client();
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        client.read_handler(&handle, WELCOME).unwrap();
        client.read_handler(&handle, BOOK_ACK).unwrap();
        client
            .read_handler(
                &handle,
                r#"{"table":"orderBook10","action":"partial","data":[{"symbol":"XBTUSD","bids":[[50000.0,1.0]],"asks":[[50010.0,1.0]]}]}"#,
            )
            .unwrap();
        assert_eq!(book_probe.count(), 0);
        assert!(!handle.restart_pending());
    }

    #[test]
    fn data_before_ack_is_dropped() {
        let (client, book_probe, _trades) = wired_client();
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        client.read_handler(&handle, WELCOME).unwrap();
        client
            .read_handler(
                &handle,
                r#"{"table":"orderBook10","action":"update","data":[{"symbol":"XBTUSD","bids":[[50000.0,1.0]],"asks":[[50010.0,1.0]]}]}"#,
            )
            .unwrap();
        assert_eq!(book_probe.count(), 0);
    }

    #[test]
    fn trade_insert_is_normalized() {
        let (client, _book, trade_probe) = wired_client();
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        client.read_handler(&handle, WELCOME).unwrap();
        client.read_handler(&handle, TRADE_ACK).unwrap();

        client
            .read_handler(
                &handle,
                r#"{"table":"trade","action":"insert","data":[{"symbol":"XBTUSD","side":"Buy","price":50000,"homeNotional":0.1,"timestamp":"2022-01-02T03:04:05.678Z"}]}"#,
            )
            .unwrap();
        let trades = trade_probe.all();
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.symbol, "XBTUSD");
        assert_eq!(t.price, 50000.0);
        assert_eq!(t.volume, 0.1);
        assert_eq!(t.timestamp_us, 1_641_092_645_678_000);
        assert_eq!(t.side, TakerSide::Buy);
    }

    #[test]
    fn foreign_symbols_and_bad_records_are_skipped() {
        let (client, _book, trade_probe) = wired_client();
        let (sup, _errs) = test_supervisor(client.clone());
        let handle = sup.handle();

        client.read_handler(&handle, WELCOME).unwrap();
        client.read_handler(&handle, TRADE_ACK).unwrap();

        client
            .read_handler(
                &handle,
                r#"{"table":"trade","action":"insert","data":[
                    {"symbol":"ETHUSD","side":"Sell","price":4000,"homeNotional":1.0,"timestamp":"2022-01-02T03:04:05.678Z"},
                    {"symbol":"XBTUSD","side":"Sell","price":50000,"homeNotional":0,"timestamp":"2022-01-02T03:04:05.678Z"},
                    {"symbol":"XBTUSD","side":"Sell","price":50000,"homeNotional":0.2,"timestamp":"2022-01-02T03:04:05.678Z"}
                ]}"#,
            )
            .unwrap();
        let trades = trade_probe.all();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, TakerSide::Sell);
        assert_eq!(trades[0].volume, 0.2);
    }

    #[test]
    fn authenticate_without_credentials_writes_nothing() {
        let (client, _book, _trades) = wired_client();
        let (sup, _errs) = test_supervisor(client.clone());
        client.authenticate(&sup.handle()).unwrap();
    }
}
