// =============================================================================
// Brokerage capability — narrow interface over the trading venue
// =============================================================================
//
// The core never talks to the venue directly; it consumes this trait. Two
// implementations ship:
//
//   - `HttpBroker`: HMAC-SHA256 signed REST client. Secrets are never logged
//     or serialised. Every request carries a 10-second timeout.
//   - `PaperBroker`: in-memory venue with instant fills, used in tests and
//     whenever no API credentials are configured.
//
// Failures are classified transient (timeouts, 5xx, connection resets —
// caller skips the tick) or permanent (4xx, auth — surfaced and audited).
// =============================================================================

use std::collections::BTreeMap;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::errors::BrokerError;
use crate::records::CollateralPosition;
use crate::types::{OrderMode, Side};

type HmacSha256 = Hmac<Sha256>;

type Result<T> = std::result::Result<T, BrokerError>;

// =============================================================================
// Wire types
// =============================================================================

/// One asset balance: freely tradeable quantity plus locked collateral.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub qty: f64,
    #[serde(default)]
    pub locked: f64,
}

/// An order the pipeline wants placed.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub side: Side,
    pub symbol: String,
    pub amount: f64,
    pub mode: OrderMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

/// Venue acknowledgement of a placed order.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub filled_qty: Option<f64>,
    #[serde(default)]
    pub avg_fill_price: Option<f64>,
}

// =============================================================================
// Capability trait
// =============================================================================

/// The venue surface the supervisor consumes. Implementations must be safe
/// for concurrent calls.
#[async_trait]
pub trait Brokerage: Send + Sync {
    async fn fetch_balances(&self) -> Result<BTreeMap<String, BalanceEntry>>;
    async fn fetch_prices(&self, symbols: &[String]) -> Result<BTreeMap<String, f64>>;
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck>;
    async fn fetch_collateral(&self) -> Result<Vec<CollateralPosition>>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

/// Signed REST client. All authenticated requests append a millisecond
/// timestamp and an HMAC-SHA256 hex signature over the query string.
pub struct HttpBroker {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpBroker {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-API-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = chrono::Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn get_json(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self.client.get(&url).send().await.map_err(classify)?;
        decode(resp, path).await
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let qs = self.signed_query("");
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(classify)?;
        decode(resp, path).await
    }
}

#[async_trait]
impl Brokerage for HttpBroker {
    async fn fetch_balances(&self) -> Result<BTreeMap<String, BalanceEntry>> {
        let body = self.get_json("/api/v1/balances", "").await?;
        let arr = body["balances"]
            .as_array()
            .ok_or_else(|| BrokerError::Permanent("balances response missing array".into()))?;

        let mut out = BTreeMap::new();
        for entry in arr {
            let symbol = entry["symbol"].as_str().unwrap_or("").to_string();
            if symbol.is_empty() {
                continue;
            }
            out.insert(
                symbol,
                BalanceEntry {
                    qty: num_field(entry, "qty"),
                    locked: num_field(entry, "locked"),
                },
            );
        }
        debug!(count = out.len(), "balances fetched");
        Ok(out)
    }

    async fn fetch_prices(&self, symbols: &[String]) -> Result<BTreeMap<String, f64>> {
        if symbols.is_empty() {
            return Ok(BTreeMap::new());
        }
        let params = format!("symbols={}", symbols.join(","));
        let body = self.get_json("/api/v1/prices", &params).await?;
        let obj = body["prices"]
            .as_object()
            .ok_or_else(|| BrokerError::Permanent("prices response missing object".into()))?;

        let mut out = BTreeMap::new();
        for (sym, val) in obj {
            if let Some(price) = parse_num(val) {
                out.insert(sym.clone(), price);
            }
        }
        debug!(count = out.len(), "prices fetched");
        Ok(out)
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        let body = serde_json::to_value(req)
            .map_err(|e| BrokerError::Permanent(format!("unencodable order request: {e}")))?;
        debug!(symbol = %req.symbol, side = %req.side, mode = %req.mode, amount = req.amount, "placing order");

        let resp = self.post_json("/api/v1/orders", &body).await?;
        let ack: OrderAck = serde_json::from_value(resp)
            .map_err(|e| BrokerError::Permanent(format!("unparseable order ack: {e}")))?;
        debug!(order_id = %ack.order_id, status = %ack.status, "order acknowledged");
        Ok(ack)
    }

    async fn fetch_collateral(&self) -> Result<Vec<CollateralPosition>> {
        let body = self.get_json("/api/v1/collateral", "").await?;
        let arr = body["positions"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(arr.len());
        for entry in arr {
            let symbol = entry["symbol"].as_str().unwrap_or("").to_string();
            if symbol.is_empty() {
                continue;
            }
            out.push(CollateralPosition {
                symbol,
                locked_qty: num_field(&entry, "locked_qty"),
                health: entry["health"].as_f64().unwrap_or(f64::INFINITY),
            });
        }
        Ok(out)
    }
}

impl std::fmt::Debug for HttpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBroker")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Error classification & decoding helpers
// =============================================================================

fn classify(e: reqwest::Error) -> BrokerError {
    if e.is_timeout() || e.is_connect() {
        BrokerError::Transient(e.to_string())
    } else {
        BrokerError::Permanent(e.to_string())
    }
}

async fn decode(resp: reqwest::Response, path: &str) -> Result<serde_json::Value> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.map_err(classify)?;

    if status.is_success() {
        return Ok(body);
    }
    let msg = format!("{path} returned {status}: {body}");
    if status.is_server_error() || status.as_u16() == 429 {
        warn!(%status, path, "transient venue error");
        Err(BrokerError::Transient(msg))
    } else {
        warn!(%status, path, "permanent venue error");
        Err(BrokerError::Permanent(msg))
    }
}

fn num_field(entry: &serde_json::Value, key: &str) -> f64 {
    parse_num(&entry[key]).unwrap_or(0.0)
}

/// Venues send numbers both as JSON numbers and as decimal strings.
fn parse_num(val: &serde_json::Value) -> Option<f64> {
    if let Some(n) = val.as_f64() {
        return Some(n);
    }
    val.as_str().and_then(|s| s.parse().ok())
}

// =============================================================================
// Paper implementation
// =============================================================================

/// In-memory venue: instant synthetic fills, scriptable failures. Used by
/// tests and as the live implementation when no credentials are configured.
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

struct PaperState {
    balances: BTreeMap<String, BalanceEntry>,
    prices: BTreeMap<String, f64>,
    collateral: Vec<CollateralPosition>,
    /// When set, the next call fails with this error.
    fail_next: Option<BrokerError>,
    orders_placed: u64,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState {
                balances: BTreeMap::new(),
                prices: BTreeMap::new(),
                collateral: Vec::new(),
                fail_next: None,
                orders_placed: 0,
            }),
        }
    }

    /// Paper venue seeded with a small demo portfolio.
    pub fn with_demo_portfolio() -> Self {
        let broker = Self::new();
        broker.set_balance("BTC", 0.5, 0.0);
        broker.set_balance("XRP", 100.0, 0.0);
        broker.set_balance("USDC", 1_000.0, 0.0);
        broker.set_price("BTC", 70_000.0);
        broker.set_price("XRP", 0.5);
        broker.set_price("USDC", 1.0);
        broker
    }

    pub fn set_balance(&self, symbol: &str, qty: f64, locked: f64) {
        self.state
            .lock()
            .balances
            .insert(symbol.to_string(), BalanceEntry { qty, locked });
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.state.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_collateral(&self, positions: Vec<CollateralPosition>) {
        self.state.lock().collateral = positions;
    }

    pub fn fail_next(&self, err: BrokerError) {
        self.state.lock().fail_next = Some(err);
    }

    pub fn orders_placed(&self) -> u64 {
        self.state.lock().orders_placed
    }

    fn take_failure(&self) -> Option<BrokerError> {
        self.state.lock().fail_next.take()
    }
}

#[async_trait]
impl Brokerage for PaperBroker {
    async fn fetch_balances(&self) -> Result<BTreeMap<String, BalanceEntry>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.state.lock().balances.clone())
    }

    async fn fetch_prices(&self, symbols: &[String]) -> Result<BTreeMap<String, f64>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let state = self.state.lock();
        Ok(symbols
            .iter()
            .filter_map(|s| state.prices.get(s).map(|p| (s.clone(), *p)))
            .collect())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut state = self.state.lock();
        state.orders_placed += 1;

        let price = req
            .limit_price
            .or_else(|| state.prices.get(&req.symbol).copied())
            .unwrap_or(0.0);

        // Instant synthetic fill; balances adjust immediately.
        let entry = state.balances.entry(req.symbol.clone()).or_default();
        match req.side {
            Side::Buy => entry.qty += req.amount,
            Side::Sell => entry.qty = (entry.qty - req.amount).max(0.0),
        }

        Ok(OrderAck {
            order_id: format!("paper-{}", uuid::Uuid::new_v4()),
            status: "filled".to_string(),
            filled_qty: Some(req.amount),
            avg_fill_price: Some(price),
        })
    }

    async fn fetch_collateral(&self) -> Result<Vec<CollateralPosition>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok(self.state.lock().collateral.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let broker = HttpBroker::new("https://venue.test", "key", "secret");
        let a = broker.sign("symbols=BTC&timestamp=1");
        let b = broker.sign("symbols=BTC&timestamp=1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn numbers_parse_from_strings_and_floats() {
        assert_eq!(parse_num(&serde_json::json!(1.5)), Some(1.5));
        assert_eq!(parse_num(&serde_json::json!("2.25")), Some(2.25));
        assert_eq!(parse_num(&serde_json::json!(null)), None);
        assert_eq!(parse_num(&serde_json::json!("abc")), None);
    }

    #[tokio::test]
    async fn paper_broker_fills_and_adjusts_balances() {
        let broker = PaperBroker::with_demo_portfolio();
        let ack = broker
            .place_order(&OrderRequest {
                side: Side::Sell,
                symbol: "XRP".to_string(),
                amount: 10.0,
                mode: OrderMode::Market,
                limit_price: None,
                client_order_id: None,
            })
            .await
            .unwrap();
        assert_eq!(ack.status, "filled");
        assert_eq!(ack.filled_qty, Some(10.0));

        let balances = broker.fetch_balances().await.unwrap();
        assert!((balances["XRP"].qty - 90.0).abs() < 1e-9);
        assert_eq!(broker.orders_placed(), 1);
    }

    #[tokio::test]
    async fn paper_broker_scripted_failure_fires_once() {
        let broker = PaperBroker::with_demo_portfolio();
        broker.fail_next(BrokerError::Transient("blip".into()));
        assert!(broker.fetch_balances().await.is_err());
        assert!(broker.fetch_balances().await.is_ok());
    }

    #[tokio::test]
    async fn paper_broker_prices_are_filtered_to_request() {
        let broker = PaperBroker::with_demo_portfolio();
        let prices = broker
            .fetch_prices(&["BTC".to_string(), "DOGE".to_string()])
            .await
            .unwrap();
        assert!(prices.contains_key("BTC"));
        assert!(!prices.contains_key("DOGE"));
    }
}
