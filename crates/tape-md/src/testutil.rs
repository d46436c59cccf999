//! Shared probes for driving venue protocols with canned frames in tests.

use std::sync::{Arc, Mutex};

use tape_core::types::{BookHandler, TakerSide, TradeEvent, TradeHandler};
use tape_core::ws::{StreamProtocol, StreamSupervisor};

/// Captures every book publication as `(bids descending, asks ascending)`
/// price/volume vectors.
#[derive(Clone, Default)]
pub struct BookProbe {
    published: Arc<Mutex<Vec<(Vec<(f64, f64)>, Vec<(f64, f64)>)>>>,
}

impl BookProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> BookHandler {
        let published = self.published.clone();
        Arc::new(move |_symbol, asks, bids| {
            let bids_desc: Vec<(f64, f64)> =
                bids.iter().rev().map(|(p, v)| (p.into_inner(), *v)).collect();
            let asks_asc: Vec<(f64, f64)> =
                asks.iter().map(|(p, v)| (p.into_inner(), *v)).collect();
            published.lock().unwrap().push((bids_desc, asks_asc));
        })
    }

    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<(Vec<(f64, f64)>, Vec<(f64, f64)>)> {
        self.published.lock().unwrap().last().cloned()
    }
}

/// Collects every normalized trade.
#[derive(Clone, Default)]
pub struct TradeProbe {
    trades: Arc<Mutex<Vec<TradeEvent>>>,
}

impl TradeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> TradeHandler {
        let trades = self.trades.clone();
        Arc::new(move |symbol, price, volume, timestamp_us, side: TakerSide| {
            trades.lock().unwrap().push(TradeEvent {
                symbol: symbol.to_string(),
                price,
                volume,
                timestamp_us,
                side,
            });
        })
    }

    pub fn all(&self) -> Vec<TradeEvent> {
        self.trades.lock().unwrap().clone()
    }
}

/// An unstarted supervisor around `protocol` plus the collected error
/// messages. Nothing connects; tests feed frames through `read_handler`.
pub fn test_supervisor(
    protocol: Arc<dyn StreamProtocol>,
) -> (StreamSupervisor, Arc<Mutex<Vec<String>>>) {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let sup = StreamSupervisor::new(
        "test",
        "wss://example.invalid/ws",
        protocol,
        Arc::new(move |e| sink.lock().unwrap().push(e.to_string())),
    );
    (sup, errors)
}
