//! Kraken public REST API client.
//!
//! Covers the two public market-data endpoints the collector polls:
//! `GET /0/public/Depth` and `GET /0/public/Trades`. Responses share the
//! envelope `{"error":[…],"result":…}`; any entry in `error` whose first
//! character is `E` (case-insensitive) fails the request. Entries with other
//! prefixes (warnings, `W*`) are ignored.

use serde_json::Value;

use tape_core::error::TapeError;
use tape_core::types::TakerSide;

/// Public REST endpoint.
pub const KRAKEN_API_URL: &str = "https://api.kraken.com";

/// Cap on one poll request.
const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// One price level from the Depth endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookRecord {
    pub price: f64,
    pub volume: f64,
    pub timestamp_us: u64,
}

/// Full snapshot from the Depth endpoint, filtered to positive levels.
#[derive(Debug, Clone, Default)]
pub struct DepthSnapshot {
    pub asks: Vec<OrderBookRecord>,
    pub bids: Vec<OrderBookRecord>,
}

/// Order type of a historical trade (`m` market, `l` limit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KrakenOrderType {
    Market,
    Limit,
    Unknown,
}

/// One trade from the Trades endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct KrakenTrade {
    pub price: f64,
    pub volume: f64,
    pub timestamp_us: u64,
    pub deal: Option<TakerSide>,
    pub order: KrakenOrderType,
}

/// One page from the Trades endpoint plus the pagination cursor.
#[derive(Debug, Clone, Default)]
pub struct TradesPage {
    pub records: Vec<KrakenTrade>,
    pub last_id: u64,
}

/// Thin reqwest wrapper over the public endpoints.
pub struct KrakenRestClient {
    client: reqwest::Client,
    base_url: String,
}

impl KrakenRestClient {
    pub fn new() -> Result<Self, TapeError> {
        Self::with_base_url(KRAKEN_API_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, TapeError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| TapeError::Api(format!("kraken http client: {e}")))?;
        Ok(Self { client, base_url: base_url.into() })
    }

    /// `GET /0/public/Depth?pair=…&count=…`
    pub async fn get_order_book(
        &self,
        pair: &str,
        count: u32,
    ) -> Result<DepthSnapshot, TapeError> {
        let url = format!("{}/0/public/Depth", self.base_url);
        let mut query: Vec<(&str, String)> = vec![("pair", pair.to_string())];
        if count != 0 {
            query.push(("count", count.to_string()));
        }

        let body = self.fetch(&url, &query).await?;
        let result = parse_response(&body)?;
        Ok(parse_depth(&result, pair))
    }

    /// `GET /0/public/Trades?pair=…&since=…`
    pub async fn get_trades(&self, pair: &str, since: u64) -> Result<TradesPage, TapeError> {
        let url = format!("{}/0/public/Trades", self.base_url);
        let mut query: Vec<(&str, String)> = vec![("pair", pair.to_string())];
        if since != 0 {
            query.push(("since", since.to_string()));
        }

        let body = self.fetch(&url, &query).await?;
        let result = parse_response(&body)?;
        Ok(parse_trades(&result, pair))
    }

    async fn fetch(&self, url: &str, query: &[(&str, String)]) -> Result<String, TapeError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| TapeError::Api(format!("kraken request {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TapeError::Api(format!("kraken request {url} failed: {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| TapeError::Api(format!("kraken response read failed: {e}")))
    }
}

/// Unwrap the `{"error":[…],"result":…}` envelope.
///
/// Only `E*` entries are request-fatal; warnings pass through silently.
pub fn parse_response(body: &str) -> Result<Value, TapeError> {
    let object: Value = serde_json::from_str(body)
        .map_err(|e| TapeError::Parse(format!("kraken: bad response body: {e}")))?;

    if let Some(errors) = object.get("error").and_then(Value::as_array) {
        let fatal: Vec<&str> = errors
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| s.starts_with(['E', 'e']))
            .collect();
        if !fatal.is_empty() {
            return Err(TapeError::Api(fatal.join(", ")));
        }
    }

    object
        .get("result")
        .cloned()
        .ok_or_else(|| TapeError::Parse("kraken: response has no result".into()))
}

/// Kraken encodes numbers as decimal strings and timestamps as fractional
/// seconds; accept plain numbers too.
fn value_as_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn seconds_to_us(seconds: f64) -> u64 {
    (seconds * 1_000_000.0).round() as u64
}

fn parse_order_book_records(items: Option<&Value>) -> Vec<OrderBookRecord> {
    let Some(items) = items.and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let entry = item.as_array()?;
            let record = OrderBookRecord {
                price: value_as_f64(entry.first())?,
                volume: value_as_f64(entry.get(1))?,
                timestamp_us: seconds_to_us(value_as_f64(entry.get(2)).unwrap_or(0.0)),
            };
            (record.price > 0.0 && record.volume > 0.0).then_some(record)
        })
        .collect()
}

/// Extract `result.<pair>.{asks,bids}` from a Depth result.
pub fn parse_depth(result: &Value, pair: &str) -> DepthSnapshot {
    let Some(pair_item) = result.get(pair) else {
        return DepthSnapshot::default();
    };
    DepthSnapshot {
        asks: parse_order_book_records(pair_item.get("asks")),
        bids: parse_order_book_records(pair_item.get("bids")),
    }
}

/// Extract `result.<pair>` trades and the `last` cursor from a Trades result.
pub fn parse_trades(result: &Value, pair: &str) -> TradesPage {
    let mut page = TradesPage::default();

    if let Some(items) = result.get(pair).and_then(Value::as_array) {
        page.records = items
            .iter()
            .filter_map(|item| {
                let entry = item.as_array()?;
                let price = value_as_f64(entry.first())?;
                let volume = value_as_f64(entry.get(1))?;
                let timestamp_us = seconds_to_us(value_as_f64(entry.get(2))?);

                let deal = match entry.get(3).and_then(Value::as_str) {
                    Some("b") => Some(TakerSide::Buy),
                    Some("s") => Some(TakerSide::Sell),
                    _ => None,
                };
                let order = match entry.get(4).and_then(Value::as_str) {
                    Some("m") => KrakenOrderType::Market,
                    Some("l") => KrakenOrderType::Limit,
                    _ => KrakenOrderType::Unknown,
                };

                let record = KrakenTrade { price, volume, timestamp_us, deal, order };
                (record.price > 0.0 && record.volume > 0.0 && record.timestamp_us != 0)
                    .then_some(record)
            })
            .collect();
    }

    page.last_id = match result.get("last") {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(v) => v.as_u64().unwrap_or(0),
        None => 0,
    };
    page
}
