//! BitMEX WebSocket framing and channel registry.
//!
//! A JSON object containing `"info"` is the welcome. Subscriptions go out as
//! `{"op":"subscribe","args":["channel:symbol"]}`; the ack
//! `{"subscribe":"channel:symbol","success":true}` registers the channel
//! (the part before the colon). Data frames carry the channel name in
//! `"table"` and are dispatched only while the channel is active. With an
//! API key configured, an `authKeyExpires` frame is sent before subscribing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tracing::debug;

use tape_core::error::TapeError;
use tape_core::ws::{StreamHandle, StreamProtocol};

use super::auth;

/// Public market-data endpoint.
pub const BITMEX_WS_URL: &str = "wss://ws.bitmex.com/realtime";

/// Handshake target signed during authentication.
const TARGET: &str = "/realtime";

/// Handler for one channel's data frames; receives the whole frame object.
pub type EventHandler = Arc<dyn Fn(&StreamHandle, &Value) + Send + Sync>;

/// Optional API credentials.
#[derive(Debug, Clone, Default)]
pub struct BitmexCredentials {
    pub key: String,
    pub secret: String,
}

impl BitmexCredentials {
    fn is_configured(&self) -> bool {
        !self.key.is_empty() && !self.secret.is_empty()
    }
}

struct SubscribeInfo {
    symbol: String,
    handler: EventHandler,
}

#[derive(Default)]
struct Registry {
    requested: BTreeMap<String, SubscribeInfo>,
    active: BTreeSet<String>,
    to_unsubscribe: BTreeSet<String>,
}

/// BitMEX protocol adapter driven by a `StreamSupervisor`.
pub struct BitmexWsClient {
    credentials: BitmexCredentials,
    registry: Mutex<Registry>,
    on_session_reset: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl BitmexWsClient {
    pub fn new(credentials: BitmexCredentials) -> Self {
        Self {
            credentials,
            registry: Mutex::new(Registry::default()),
            on_session_reset: Mutex::new(None),
        }
    }

    /// Register a callback fired on every connection restart.
    pub fn set_session_reset(&self, f: Arc<dyn Fn() + Send + Sync>) {
        *self.on_session_reset.lock().expect("bitmex reset lock") = Some(f);
    }

    /// Request a channel subscription for one symbol.
    pub fn subscribe(&self, channel: &str, symbol: &str, handler: EventHandler) {
        let mut reg = self.registry.lock().expect("bitmex registry lock");
        reg.requested.insert(
            channel.to_string(),
            SubscribeInfo { symbol: symbol.to_string(), handler },
        );
    }

    /// Withdraw a subscription and queue the venue unsubscribe frame.
    pub fn unsubscribe(&self, channel: &str) {
        let mut reg = self.registry.lock().expect("bitmex registry lock");
        if reg.requested.remove(channel).is_some() {
            reg.to_unsubscribe.insert(channel.to_string());
        }
    }

    fn handler_for(&self, channel: &str) -> Option<EventHandler> {
        let reg = self.registry.lock().expect("bitmex registry lock");
        if !reg.active.contains(channel) {
            return None;
        }
        reg.requested.get(channel).map(|info| info.handler.clone())
    }

    fn register_subscription(&self, subscription: &str) {
        // "orderBook10:XBTUSD" → channel "orderBook10".
        let channel = subscription.split(':').next().unwrap_or(subscription);
        debug!("bitmex channel '{channel}' active");
        let mut reg = self.registry.lock().expect("bitmex registry lock");
        reg.active.insert(channel.to_string());
    }

    fn flush_unsubscribes(&self, stream: &StreamHandle) {
        let subscriptions: Vec<String> = {
            let mut reg = self.registry.lock().expect("bitmex registry lock");
            let names = std::mem::take(&mut reg.to_unsubscribe);
            names
                .iter()
                .filter(|name| reg.active.contains(*name))
                .cloned()
                .collect()
        };

        for channel in subscriptions {
            stream.write(json!({"op": "unsubscribe", "args": [channel]}).to_string());
        }
    }
}

impl StreamProtocol for BitmexWsClient {
    fn authenticate(&self, stream: &StreamHandle) -> Result<(), TapeError> {
        if !self.credentials.is_configured() {
            return Ok(());
        }

        let expires = auth::expiration_time();
        let message = format!("GET{TARGET}{expires}");
        let signature = auth::signature(&self.credentials.secret, &message);

        stream.write(
            json!({
                "op": "authKeyExpires",
                "args": [self.credentials.key, expires, signature],
            })
            .to_string(),
        );
        Ok(())
    }

    fn subscribe_events(&self, stream: &StreamHandle) -> Result<(), TapeError> {
        self.flush_unsubscribes(stream);

        let to_subscribe: Vec<(String, String)> = {
            let reg = self.registry.lock().expect("bitmex registry lock");
            reg.requested
                .iter()
                .filter(|(name, _)| !reg.active.contains(*name))
                .map(|(name, info)| (name.clone(), info.symbol.clone()))
                .collect()
        };

        for (channel, symbol) in to_subscribe {
            debug!("bitmex subscribing to '{channel}:{symbol}'");
            stream.write(
                json!({"op": "subscribe", "args": [format!("{channel}:{symbol}")]}).to_string(),
            );
        }
        Ok(())
    }

    fn reset_active_channels(&self) {
        self.registry.lock().expect("bitmex registry lock").active.clear();
        if let Some(f) = self.on_session_reset.lock().expect("bitmex reset lock").clone() {
            f();
        }
    }

    fn read_handler(&self, stream: &StreamHandle, raw: &str) -> Result<(), TapeError> {
        let object: Value = serde_json::from_str(raw)
            .map_err(|e| TapeError::Parse(format!("bitmex: bad frame: {e}")))?;

        if stream.is_init_received() {
            if let Some(table) = object.get("table").and_then(Value::as_str) {
                if let Some(handler) = self.handler_for(table) {
                    handler(stream, &object);
                }
            } else if let (Some(subscription), Some(success)) = (
                object.get("subscribe").and_then(Value::as_str),
                object.get("success").and_then(Value::as_bool),
            ) {
                if success {
                    self.register_subscription(subscription);
                }
            }
        } else if object.get("info").is_some() {
            stream.mark_init_received();
        }

        Ok(())
    }
}
