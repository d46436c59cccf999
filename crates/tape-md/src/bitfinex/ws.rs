//! Bitfinex v2 WebSocket framing and channel registry.
//!
//! The venue speaks three frame shapes:
//!
//! - events: JSON objects with an `"event"` field (`info`, `subscribed`,
//!   `unsubscribed`);
//! - data: JSON arrays `[chanId, payload…]` routed by the integer channel id
//!   assigned in the `subscribed` ack;
//! - heartbeats: `[chanId, "hb"]`, which fall through the data path and are
//!   ignored by the channel handlers.
//!
//! Only protocol version 2 is accepted; any other welcome version is a fatal
//! protocol error for this connection's supervisor.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tracing::debug;

use tape_core::error::TapeError;
use tape_core::ws::{StreamHandle, StreamProtocol};

/// Public market-data endpoint, protocol version 2.
pub const BITFINEX_WS_URL: &str = "wss://api-pub.bitfinex.com/ws/2";

const REQUIRED_API_VERSION: u64 = 2;

/// Handler for one channel's data frames. Receives the frame payload with
/// the leading channel id stripped.
pub type EventHandler = Arc<dyn Fn(&StreamHandle, &[Value]) + Send + Sync>;

struct SubscribeInfo {
    params: BTreeMap<String, String>,
    handler: EventHandler,
}

/// Channel bookkeeping for one connection. `requested` survives restarts;
/// the id maps and `active` only live for one venue session.
#[derive(Default)]
struct Registry {
    requested: BTreeMap<String, SubscribeInfo>,
    id_to_name: HashMap<u64, String>,
    active: HashMap<String, u64>,
    to_unsubscribe: BTreeSet<String>,
}

/// Bitfinex protocol adapter driven by a `StreamSupervisor`.
pub struct BitfinexWsClient {
    registry: Mutex<Registry>,
    /// Invoked from `reset_active_channels` so the owning market-data layer
    /// can drop per-session state (the order book) together with the
    /// channel registry.
    on_session_reset: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl BitfinexWsClient {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            on_session_reset: Mutex::new(None),
        }
    }

    /// Register a callback fired on every connection restart, before the
    /// transport reconnects.
    pub fn set_session_reset(&self, f: Arc<dyn Fn() + Send + Sync>) {
        *self.on_session_reset.lock().expect("bitfinex reset lock") = Some(f);
    }

    /// Request a channel subscription. The frame goes out on the next watch
    /// tick (and again after every restart) until the venue acknowledges it.
    pub fn subscribe(
        &self,
        channel: &str,
        params: BTreeMap<String, String>,
        handler: EventHandler,
    ) {
        let mut reg = self.registry.lock().expect("bitfinex registry lock");
        reg.requested.insert(channel.to_string(), SubscribeInfo { params, handler });
    }

    /// Withdraw a subscription. A not-yet-acknowledged request is simply
    /// dropped; an active channel is queued for an unsubscribe frame.
    pub fn unsubscribe(&self, channel: &str) {
        let mut reg = self.registry.lock().expect("bitfinex registry lock");
        if reg.requested.remove(channel).is_some() && !reg.active.contains_key(channel) {
            return;
        }
        reg.to_unsubscribe.insert(channel.to_string());
    }

    fn register_subscription(&self, object: &Value) {
        let channel = object.get("channel").and_then(Value::as_str).unwrap_or_default();
        let chan_id = object.get("chanId").and_then(Value::as_u64).unwrap_or(0);

        if !channel.is_empty() && chan_id != 0 {
            debug!("bitfinex channel '{channel}' active with id {chan_id}");
            let mut reg = self.registry.lock().expect("bitfinex registry lock");
            reg.id_to_name.insert(chan_id, channel.to_string());
            reg.active.insert(channel.to_string(), chan_id);
        }
    }

    fn unregister_subscription(&self, object: &Value) {
        let status = object.get("status").and_then(Value::as_str).unwrap_or_default();
        let chan_id = object.get("chanId").and_then(Value::as_u64).unwrap_or(0);

        if status == "OK" && chan_id != 0 {
            let mut reg = self.registry.lock().expect("bitfinex registry lock");
            if let Some(name) = reg.id_to_name.remove(&chan_id) {
                reg.active.remove(&name);
            }
        }
    }

    /// Resolve the handler for a data frame's channel id.
    fn handler_for(&self, chan_id: u64) -> Option<EventHandler> {
        let reg = self.registry.lock().expect("bitfinex registry lock");
        let name = reg.id_to_name.get(&chan_id)?;
        reg.requested.get(name).map(|info| info.handler.clone())
    }

    fn flush_unsubscribes(&self, stream: &StreamHandle) {
        let ids: Vec<u64> = {
            let mut reg = self.registry.lock().expect("bitfinex registry lock");
            let names = std::mem::take(&mut reg.to_unsubscribe);
            names.iter().filter_map(|name| reg.active.get(name).copied()).collect()
        };

        for id in ids {
            stream.write(json!({"event": "unsubscribe", "chanId": id}).to_string());
        }
    }
}

impl Default for BitfinexWsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamProtocol for BitfinexWsClient {
    fn subscribe_events(&self, stream: &StreamHandle) -> Result<(), TapeError> {
        self.flush_unsubscribes(stream);

        let to_subscribe: Vec<(String, Value)> = {
            let reg = self.registry.lock().expect("bitfinex registry lock");
            reg.requested
                .iter()
                .filter(|(name, _)| !reg.active.contains_key(*name))
                .map(|(name, info)| {
                    let mut object = json!({"event": "subscribe", "channel": name});
                    for (key, value) in &info.params {
                        object[key.as_str()] = Value::String(value.clone());
                    }
                    (name.clone(), object)
                })
                .collect()
        };

        for (name, frame) in to_subscribe {
            debug!("bitfinex subscribing to '{name}'");
            stream.write(frame.to_string());
        }
        Ok(())
    }

    fn reset_active_channels(&self) {
        {
            let mut reg = self.registry.lock().expect("bitfinex registry lock");
            reg.id_to_name.clear();
            reg.active.clear();
        }
        if let Some(f) = self.on_session_reset.lock().expect("bitfinex reset lock").clone() {
            f();
        }
    }

    fn read_handler(&self, stream: &StreamHandle, raw: &str) -> Result<(), TapeError> {
        let object: Value = serde_json::from_str(raw)
            .map_err(|e| TapeError::Parse(format!("bitfinex: bad frame: {e}")))?;

        let event = object.get("event").and_then(Value::as_str);

        if stream.is_init_received() {
            if let Some(array) = object.as_array() {
                if array.len() >= 2 {
                    let Some(chan_id) = array[0].as_u64() else {
                        return Ok(());
                    };
                    if let Some(handler) = self.handler_for(chan_id) {
                        handler(stream, &array[1..]);
                    }
                }
            } else if event == Some("subscribed") {
                self.register_subscription(&object);
            } else if event == Some("unsubscribed") {
                self.unregister_subscription(&object);
            }
        } else if event == Some("info") {
            let version = object.get("version").and_then(Value::as_u64).unwrap_or(0);
            if version == REQUIRED_API_VERSION {
                stream.mark_init_received();
            } else {
                return Err(TapeError::Protocol(format!(
                    "unexpected version of bitfinex websocket api: {version}"
                )));
            }
        }

        Ok(())
    }
}
