//! Coinbase market data — `level2_batch` order book and `matches` trades.
//!
//! `snapshot` frames replace both sides with `[price, size]` string arrays;
//! `l2update` frames carry `[side, price, size]` changes where a zero size
//! deletes the level. The `matches` channel reports the *resting* side, so
//! the taker side is the opposite. A frame whose `product_id` is not the
//! subscribed symbol requests a restart (defensive; the subscription covers
//! only the expected product).

pub mod ws;

use std::sync::{Arc, Mutex};

use serde_json::Value;

use tape_core::book::OrderBook;
use tape_core::time_util;
use tape_core::types::{BookHandler, ErrorHandler, TakerSide, TradeHandler};
use tape_core::ws::{StreamHandle, StreamSupervisor};

use self::ws::{COINBASE_WS_URL, CoinbaseWsClient};

/// Streaming subscriber for one Coinbase product.
pub struct CoinbaseSubscriber {
    supervisor: StreamSupervisor,
}

impl CoinbaseSubscriber {
    /// Subscribe to the level-2 book and match stream for `symbol`
    /// (e.g. `BTC-USD`) and start the connection.
    pub fn start(
        symbol: &str,
        book_handler: BookHandler,
        trade_handler: TradeHandler,
        error_handler: ErrorHandler,
    ) -> Self {
        let client = Arc::new(CoinbaseWsClient::new());
        wire_channels(&client, symbol, book_handler, trade_handler);

        let supervisor =
            StreamSupervisor::start("coinbase", COINBASE_WS_URL, client, error_handler);
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
    client: &Arc<CoinbaseWsClient>,
    symbol: &str,
    book_handler: BookHandler,
    trade_handler: TradeHandler,
) {
    let book = Arc::new(Mutex::new(OrderBook::new()));

    {
        let book = book.clone();
        client.set_session_reset(Arc::new(move || {
            book.lock().expect("coinbase book lock").clear();
        }));
    }

    {
        let book = book.clone();
        let expected = symbol.to_string();
        client.subscribe(
            "level2_batch",
            symbol,
            &["snapshot", "l2update"],
            Arc::new(move |stream, object| {
                level2_event(stream, object, &book, &expected, &book_handler);
            }),
        );
    }

    {
        let expected = symbol.to_string();
        client.subscribe(
            "matches",
            symbol,
            &["match"],
            Arc::new(move |stream, object| {
                matches_event(stream, object, &expected, &trade_handler);
            }),
        );
    }
}

/// Price/size pairs arrive as decimal strings.
fn level_from_strings(entry: &Value) -> Option<(f64, f64)> {
    let pair = entry.as_array()?;
    if pair.len() < 2 {
        return None;
    }
    let price = pair[0].as_str()?.parse::<f64>().ok()?;
    let size = pair[1].as_str()?.parse::<f64>().ok()?;
    Some((price, size))
}

fn level2_event(
    stream: &StreamHandle,
    object: &Value,
    book: &Mutex<OrderBook>,
    symbol: &str,
    book_handler: &BookHandler,
) {
    if object.get("product_id").and_then(Value::as_str) != Some(symbol) {
        stream.request_restart();
        return;
    }

    let mut book = book.lock().expect("coinbase book lock");

    match object.get("type").and_then(Value::as_str) {
        Some("snapshot") => {
            book.clear();
            for (side_field, is_bid) in [("bids", true), ("asks", false)] {
                let Some(orders) = object.get(side_field).and_then(Value::as_array) else {
                    continue;
                };
                for order in orders {
                    let Some((price, size)) = level_from_strings(order) else {
                        continue;
                    };
                    if price <= 0.0 || size <= 0.0 {
                        continue;
                    }
                    if is_bid {
                        book.set_bid(price, size);
                    } else {
                        book.set_ask(price, size);
                    }
                }
            }
        }
        Some("l2update") => {
            let Some(changes) = object.get("changes").and_then(Value::as_array) else {
                return;
            };
            for change in changes {
                let Some(triple) = change.as_array() else {
                    continue;
                };
                if triple.len() < 3 {
                    continue;
                }
                let Some(side) = triple[0].as_str() else {
                    continue;
                };
                let (Some(price), Some(size)) = (
                    triple[1].as_str().and_then(|s| s.parse::<f64>().ok()),
                    triple[2].as_str().and_then(|s| s.parse::<f64>().ok()),
                ) else {
                    continue;
                };
                if price < 0.0 {
                    continue;
                }

                match side {
                    "buy" => {
                        if size <= 0.0 {
                            book.remove_bid(price);
                        } else {
                            book.set_bid(price, size);
                        }
                    }
                    "sell" => {
                        if size <= 0.0 {
                            book.remove_ask(price);
                        } else {
                            book.set_ask(price, size);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => return,
    }

    if !book.publish_if_consistent(symbol, book_handler) {
        stream.request_restart();
    }
}

fn matches_event(
    stream: &StreamHandle,
    object: &Value,
    symbol: &str,
    trade_handler: &TradeHandler,
) {
    if object.get("product_id").and_then(Value::as_str) != Some(symbol) {
        stream.request_restart();
        return;
    }

    // The venue reports the maker (resting) side; the taker took the
    // opposite.
    let side = match object.get("side").and_then(Value::as_str) {
        Some("buy") => TakerSide::Sell,
        Some("sell") => TakerSide::Buy,
        _ => return,
    };

    let (Some(price), Some(volume)) = (
        object.get("price").and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok()),
        object.get("size").and_then(Value::as_str).and_then(|s| s.parse::<f64>().ok()),
    ) else {
        return;
    };

    let Some(iso_time) = object.get("time").and_then(Value::as_str) else {
        return;
    };
    let Ok(timestamp_us) = time_util::parse_iso_timestamp_us(iso_time) else {
        return;
    };

    trade_handler(symbol, price, volume, timestamp_us, side);
}
