//! Coinbase WebSocket framing and channel registry.
//!
//! Coinbase sends no welcome message: the connection is usable the moment
//! the socket is up, so `INIT_RECEIVED` is immediate. Subscriptions for all
//! channels are grouped into a single `subscribe` frame with a
//! `(channel, product_ids)` list; the `subscriptions` ack enumerates what is
//! active. Data frames carry a `type` (e.g. `snapshot`, `l2update`, `match`)
//! and a `product_id`; an internal event→channel map, populated at subscribe
//! time, resolves the handler.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tracing::debug;

use tape_core::error::TapeError;
use tape_core::ws::{StreamHandle, StreamProtocol};

/// Public market-data endpoint.
pub const COINBASE_WS_URL: &str = "wss://ws-feed.exchange.coinbase.com/";

/// Handler for one channel's data frames; receives the whole frame object.
pub type EventHandler = Arc<dyn Fn(&StreamHandle, &Value) + Send + Sync>;

/// A subscription is keyed by channel name and product id.
type ChannelProductKey = (String, String);

#[derive(Default)]
struct Registry {
    requested: BTreeMap<ChannelProductKey, EventHandler>,
    /// Maps an inbound frame `type` to the channel that produces it.
    event_to_channel: HashMap<String, String>,
    active: BTreeSet<ChannelProductKey>,
}

/// Coinbase protocol adapter driven by a `StreamSupervisor`.
pub struct CoinbaseWsClient {
    registry: Mutex<Registry>,
    on_session_reset: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl CoinbaseWsClient {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            on_session_reset: Mutex::new(None),
        }
    }

    /// Register a callback fired on every connection restart.
    pub fn set_session_reset(&self, f: Arc<dyn Fn() + Send + Sync>) {
        *self.on_session_reset.lock().expect("coinbase reset lock") = Some(f);
    }

    /// Request a channel subscription for one product. `events` lists the
    /// frame `type`s this channel produces (e.g. `snapshot` and `l2update`
    /// for `level2_batch`).
    pub fn subscribe(
        &self,
        channel: &str,
        product_id: &str,
        events: &[&str],
        handler: EventHandler,
    ) {
        let mut reg = self.registry.lock().expect("coinbase registry lock");
        reg.requested.insert((channel.to_string(), product_id.to_string()), handler);
        for event in events {
            reg.event_to_channel.insert(event.to_string(), channel.to_string());
        }
    }

    fn handler_for(&self, event_type: &str, product_id: &str) -> Option<EventHandler> {
        let reg = self.registry.lock().expect("coinbase registry lock");
        let channel = reg.event_to_channel.get(event_type)?;
        reg.requested.get(&(channel.clone(), product_id.to_string())).cloned()
    }

    fn register_subscriptions(&self, object: &Value) {
        let Some(channels) = object.get("channels").and_then(Value::as_array) else {
            return;
        };

        let mut reg = self.registry.lock().expect("coinbase registry lock");
        for channel in channels {
            let name = channel.get("name").and_then(Value::as_str).unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            let Some(products) = channel.get("product_ids").and_then(Value::as_array) else {
                continue;
            };
            for product in products.iter().filter_map(Value::as_str) {
                if !product.is_empty() {
                    debug!("coinbase channel '{name}' active for {product}");
                    reg.active.insert((name.to_string(), product.to_string()));
                }
            }
        }
    }
}

impl Default for CoinbaseWsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamProtocol for CoinbaseWsClient {
    fn init_is_immediate(&self) -> bool {
        true
    }

    fn subscribe_events(&self, stream: &StreamHandle) -> Result<(), TapeError> {
        // Consolidate the unacknowledged requests into one frame with a
        // minimal set of (channel, product_ids) groups.
        let mut groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        {
            let reg = self.registry.lock().expect("coinbase registry lock");
            for key in reg.requested.keys() {
                if reg.active.contains(key) {
                    continue;
                }
                groups.entry(key.0.clone()).or_default().insert(key.1.clone());
            }
        }

        if groups.is_empty() {
            return Ok(());
        }

        let channels: Vec<Value> = groups
            .into_iter()
            .map(|(name, products)| {
                json!({
                    "name": name,
                    "product_ids": products.into_iter().collect::<Vec<_>>(),
                })
            })
            .collect();

        stream.write(json!({"type": "subscribe", "channels": channels}).to_string());
        Ok(())
    }

    fn reset_active_channels(&self) {
        self.registry.lock().expect("coinbase registry lock").active.clear();
        if let Some(f) = self.on_session_reset.lock().expect("coinbase reset lock").clone() {
            f();
        }
    }

    fn read_handler(&self, stream: &StreamHandle, raw: &str) -> Result<(), TapeError> {
        let object: Value = serde_json::from_str(raw)
            .map_err(|e| TapeError::Parse(format!("coinbase: bad frame: {e}")))?;

        let event_type = object.get("type").and_then(Value::as_str).unwrap_or_default();
        let product_id = object.get("product_id").and_then(Value::as_str).unwrap_or_default();

        if !event_type.is_empty() && !product_id.is_empty() {
            if let Some(handler) = self.handler_for(event_type, product_id) {
                handler(stream, &object);
            }
        } else if event_type == "subscriptions" {
            self.register_subscriptions(&object);
        }

        Ok(())
    }
}
