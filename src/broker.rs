// =============================================================================
// Broker Adapter — dry-run / paper-sim / Alpaca paper / Alpaca live
// =============================================================================
//
// One enum, four ways out of the engine. The rest of the core is agnostic:
// it calls the same operations regardless of mode, and idempotency keys
// (client order ids derived from intent ids) make replays converge.
//
//   DryRun    — no network at all; submissions land in the dry-run
//               idempotency ledger and return order_id="dry-run".
//   PaperSim  — deterministic in-memory fills at the requested limit price,
//               protective legs tracked as open orders for reconciliation.
//   Alpaca    — real REST API; paper and live differ only in base URL and in
//               what the gate stack allowed beforehand.
//
// SECURITY: the API secret rides in a sensitive default header and is never
// logged or serialized.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::ledger::{atomic_write_json, read_json};

/// Synthetic order id returned by the dry-run variant.
pub const DRY_RUN_ORDER_ID: &str = "dry-run";

const PAPER_BASE_URL: &str = "https://paper-api.alpaca.markets";
const LIVE_BASE_URL: &str = "https://api.alpaca.markets";

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid order request: {0}")]
    InvalidRequest(String),
    #[error("insufficient funds")]
    InsufficientFunds,
    /// The idempotency key was already used. Callers treat this as success.
    #[error("order already exists: {0}")]
    AlreadyExists(String),
    #[error("rate limited")]
    RateLimited,
    #[error("transient broker failure: {0}")]
    Transient(String),
    /// Fatal for the LIVE gate: downgrades to DRY_RUN.
    #[error("broker auth failure: {0}")]
    Auth(String),
    /// Cancel/status race: the order is gone. Convergent, not an error.
    #[error("order not found: {0}")]
    NotFound(String),
    #[error("unclassified broker failure: {0}")]
    Unknown(String),
}

impl BrokerError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient(_) | Self::Unknown(_))
    }

    /// Races that mean the desired end state already holds.
    pub fn is_convergent(&self) -> bool {
        matches!(self, Self::AlreadyExists(_) | Self::NotFound(_))
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Entry with protective stop and take-profit, submitted as one unit.
#[derive(Debug, Clone)]
pub struct BracketSpec {
    pub symbol: String,
    pub qty: i64,
    /// None = market entry.
    pub limit_price: Option<f64>,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub client_order_id: String,
}

/// A resting order as the broker reports it.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: i64,
    pub order_type: String,
    pub stop_price: Option<f64>,
    pub limit_price: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: i64,
    pub avg_entry: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub qty: i64,
    pub avg_price: f64,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum Broker {
    DryRun(DryRunBroker),
    PaperSim(PaperSimBroker),
    Alpaca(AlpacaBroker),
}

impl Broker {
    pub async fn submit_bracket(&self, spec: &BracketSpec) -> Result<String, BrokerError> {
        match self {
            Self::DryRun(b) => b.record_submission("bracket", &spec.client_order_id, |rec| {
                rec.insert("symbol".into(), json!(spec.symbol));
                rec.insert("qty".into(), json!(spec.qty));
                rec.insert("limit_price".into(), json!(spec.limit_price));
                rec.insert("stop_loss".into(), json!(spec.stop_loss));
                rec.insert("take_profit".into(), json!(spec.take_profit));
            }),
            Self::PaperSim(b) => b.submit_bracket(spec),
            Self::Alpaca(b) => b.submit_bracket(spec).await,
        }
    }

    pub async fn submit_stop(
        &self,
        symbol: &str,
        qty: i64,
        stop_price: f64,
        client_order_id: &str,
    ) -> Result<String, BrokerError> {
        match self {
            Self::DryRun(b) => b.record_submission("stop", client_order_id, |rec| {
                rec.insert("symbol".into(), json!(symbol));
                rec.insert("qty".into(), json!(qty));
                rec.insert("stop_price".into(), json!(stop_price));
            }),
            Self::PaperSim(b) => b.submit_stop(symbol, qty, stop_price, client_order_id),
            Self::Alpaca(b) => b.submit_stop(symbol, qty, stop_price, client_order_id).await,
        }
    }

    /// Market sell used for trims and final exits.
    pub async fn submit_sell(
        &self,
        symbol: &str,
        qty: i64,
        client_order_id: &str,
    ) -> Result<String, BrokerError> {
        match self {
            Self::DryRun(b) => b.record_submission("sell", client_order_id, |rec| {
                rec.insert("symbol".into(), json!(symbol));
                rec.insert("qty".into(), json!(qty));
            }),
            Self::PaperSim(b) => b.submit_sell(symbol, qty, client_order_id),
            Self::Alpaca(b) => b.submit_sell(symbol, qty, client_order_id).await,
        }
    }

    pub async fn cancel(&self, order_id: &str) -> Result<(), BrokerError> {
        match self {
            Self::DryRun(_) => Ok(()),
            Self::PaperSim(b) => b.cancel(order_id),
            Self::Alpaca(b) => b.cancel(order_id).await,
        }
    }

    pub async fn list_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<OpenOrder>, BrokerError> {
        match self {
            Self::DryRun(_) => Ok(Vec::new()),
            Self::PaperSim(b) => Ok(b.list_open_orders(symbol)),
            Self::Alpaca(b) => b.list_open_orders(symbol).await,
        }
    }

    pub async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        match self {
            Self::DryRun(_) => Ok(Vec::new()),
            Self::PaperSim(b) => Ok(b.list_positions()),
            Self::Alpaca(b) => b.list_positions().await,
        }
    }

    pub async fn account_equity(&self) -> Result<f64, BrokerError> {
        match self {
            Self::DryRun(b) => Ok(b.equity),
            Self::PaperSim(b) => Ok(b.equity),
            Self::Alpaca(b) => b.account_equity().await,
        }
    }

    /// Whether the exchange clock says the market is open.
    pub async fn market_clock_open(&self) -> Result<bool, BrokerError> {
        match self {
            Self::DryRun(_) | Self::PaperSim(_) => Ok(true),
            Self::Alpaca(b) => b.market_clock_open().await,
        }
    }

    /// Fill state for an order we submitted, by client order id.
    pub async fn fill_for(&self, client_order_id: &str) -> Result<Option<Fill>, BrokerError> {
        match self {
            Self::DryRun(_) => Ok(None),
            Self::PaperSim(b) => Ok(b.fill_for(client_order_id)),
            Self::Alpaca(b) => b.fill_for(client_order_id).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Dry-run
// ---------------------------------------------------------------------------

/// Writes every submission attempt into the atomic dry-run idempotency
/// ledger. A repeated client order id returns `AlreadyExists`, exactly like
/// a real broker rejecting a duplicate idempotency key.
#[derive(Debug)]
pub struct DryRunBroker {
    ledger_path: PathBuf,
    pub equity: f64,
}

impl DryRunBroker {
    pub fn new(ledger_path: PathBuf, equity: f64) -> Self {
        Self { ledger_path, equity }
    }

    fn record_submission(
        &self,
        kind: &str,
        client_order_id: &str,
        fill_fields: impl FnOnce(&mut serde_json::Map<String, Value>),
    ) -> Result<String, BrokerError> {
        let mut ledger = match read_json(&self.ledger_path) {
            Ok(Some(Value::Object(map))) => map,
            Ok(_) => serde_json::Map::new(),
            Err(e) => return Err(BrokerError::Transient(format!("dry-run ledger read: {e}"))),
        };

        if ledger.contains_key(client_order_id) {
            return Err(BrokerError::AlreadyExists(client_order_id.to_string()));
        }

        let mut rec = serde_json::Map::new();
        rec.insert("kind".into(), json!(kind));
        rec.insert("order_id".into(), json!(DRY_RUN_ORDER_ID));
        rec.insert("ts_utc".into(), json!(Utc::now().to_rfc3339()));
        fill_fields(&mut rec);
        ledger.insert(client_order_id.to_string(), Value::Object(rec));

        atomic_write_json(&self.ledger_path, &Value::Object(ledger))
            .map_err(|e| BrokerError::Transient(format!("dry-run ledger write: {e}")))?;

        info!(client_order_id, kind, "dry-run submission recorded");
        Ok(DRY_RUN_ORDER_ID.to_string())
    }
}

// ---------------------------------------------------------------------------
// Paper-sim
// ---------------------------------------------------------------------------

/// Deterministic local fills: entries fill instantly at the requested limit
/// price (the candidate's pivot, or the last cached close for market
/// orders), protective legs rest as open orders until cancelled.
pub struct PaperSimBroker {
    pub equity: f64,
    state: RwLock<PaperSimState>,
}

#[derive(Default)]
struct PaperSimState {
    open_orders: Vec<OpenOrder>,
    positions: HashMap<String, BrokerPosition>,
    fills: HashMap<String, Fill>,
}

impl std::fmt::Debug for PaperSimBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperSimBroker")
            .field("equity", &self.equity)
            .finish_non_exhaustive()
    }
}

impl PaperSimBroker {
    pub fn new(equity: f64) -> Self {
        Self {
            equity,
            state: RwLock::new(PaperSimState::default()),
        }
    }

    fn submit_bracket(&self, spec: &BracketSpec) -> Result<String, BrokerError> {
        if spec.qty <= 0 {
            return Err(BrokerError::InvalidRequest(format!(
                "qty {} must be positive",
                spec.qty
            )));
        }
        let mut s = self.state.write();
        if s.fills.contains_key(&spec.client_order_id) {
            return Err(BrokerError::AlreadyExists(spec.client_order_id.clone()));
        }

        // Deterministic pricing: the caller supplies the candidate's entry
        // level (or last cached close) as the limit.
        let fill_price = match spec.limit_price {
            Some(p) => p,
            None => {
                return Err(BrokerError::InvalidRequest(
                    "paper-sim bracket requires a limit price".into(),
                ))
            }
        };
        s.fills.insert(
            spec.client_order_id.clone(),
            Fill {
                qty: spec.qty,
                avg_price: fill_price,
            },
        );

        let pos = s
            .positions
            .entry(spec.symbol.clone())
            .or_insert_with(|| BrokerPosition {
                symbol: spec.symbol.clone(),
                qty: 0,
                avg_entry: fill_price,
            });
        pos.qty += spec.qty;
        pos.avg_entry = fill_price;

        // Protective stop leg rests until reconciled away.
        let stop_id = format!("{}:stop", spec.client_order_id);
        s.open_orders.push(OpenOrder {
            id: stop_id,
            client_order_id: format!("{}:stop", spec.client_order_id),
            symbol: spec.symbol.clone(),
            side: "sell".into(),
            qty: spec.qty,
            order_type: "stop".into(),
            stop_price: Some(spec.stop_loss),
            limit_price: None,
        });

        debug!(
            symbol = %spec.symbol,
            qty = spec.qty,
            fill_price,
            "paper-sim bracket filled"
        );
        Ok(spec.client_order_id.clone())
    }

    fn submit_stop(
        &self,
        symbol: &str,
        qty: i64,
        stop_price: f64,
        client_order_id: &str,
    ) -> Result<String, BrokerError> {
        let mut s = self.state.write();
        if s.open_orders.iter().any(|o| o.client_order_id == client_order_id) {
            return Err(BrokerError::AlreadyExists(client_order_id.to_string()));
        }
        s.open_orders.push(OpenOrder {
            id: client_order_id.to_string(),
            client_order_id: client_order_id.to_string(),
            symbol: symbol.to_string(),
            side: "sell".into(),
            qty,
            order_type: "stop".into(),
            stop_price: Some(stop_price),
            limit_price: None,
        });
        Ok(client_order_id.to_string())
    }

    fn submit_sell(
        &self,
        symbol: &str,
        qty: i64,
        client_order_id: &str,
    ) -> Result<String, BrokerError> {
        let mut s = self.state.write();
        if s.fills.contains_key(client_order_id) {
            return Err(BrokerError::AlreadyExists(client_order_id.to_string()));
        }
        let price = match s.positions.get(symbol) {
            Some(p) => p.avg_entry,
            None => return Err(BrokerError::InvalidRequest(format!("no position in {symbol}"))),
        };
        s.fills.insert(
            client_order_id.to_string(),
            Fill {
                qty,
                avg_price: price,
            },
        );
        if let Some(p) = s.positions.get_mut(symbol) {
            p.qty = (p.qty - qty).max(0);
        }
        Ok(client_order_id.to_string())
    }

    fn cancel(&self, order_id: &str) -> Result<(), BrokerError> {
        let mut s = self.state.write();
        let before = s.open_orders.len();
        s.open_orders.retain(|o| o.id != order_id);
        if s.open_orders.len() == before {
            return Err(BrokerError::NotFound(order_id.to_string()));
        }
        Ok(())
    }

    fn list_open_orders(&self, symbol: Option<&str>) -> Vec<OpenOrder> {
        self.state
            .read()
            .open_orders
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect()
    }

    fn list_positions(&self) -> Vec<BrokerPosition> {
        self.state
            .read()
            .positions
            .values()
            .filter(|p| p.qty > 0)
            .cloned()
            .collect()
    }

    fn fill_for(&self, client_order_id: &str) -> Option<Fill> {
        self.state.read().fills.get(client_order_id).copied()
    }
}

// ---------------------------------------------------------------------------
// Alpaca
// ---------------------------------------------------------------------------

pub struct AlpacaBroker {
    client: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for AlpacaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaBroker")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    id: String,
    #[serde(default)]
    client_order_id: String,
    symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    qty: Option<String>,
    #[serde(default, rename = "type")]
    order_type: String,
    #[serde(default)]
    stop_price: Option<String>,
    #[serde(default)]
    limit_price: Option<String>,
    #[serde(default)]
    filled_qty: Option<String>,
    #[serde(default)]
    filled_avg_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    symbol: String,
    qty: String,
    avg_entry_price: String,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    equity: String,
}

#[derive(Debug, Deserialize)]
struct RawClock {
    is_open: bool,
}

impl AlpacaBroker {
    /// `live` selects the live base URL; `base_url_override` (the
    /// `APCA_API_BASE_URL` env) wins over both defaults.
    pub fn new(key_id: &str, secret: &str, live: bool, base_url_override: Option<&str>) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(v) = reqwest::header::HeaderValue::from_str(key_id) {
            headers.insert("APCA-API-KEY-ID", v);
        }
        if let Ok(mut v) = reqwest::header::HeaderValue::from_str(secret) {
            v.set_sensitive(true);
            headers.insert("APCA-API-SECRET-KEY", v);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        let base_url = base_url_override
            .map(str::to_string)
            .unwrap_or_else(|| {
                if live {
                    LIVE_BASE_URL.to_string()
                } else {
                    PAPER_BASE_URL.to_string()
                }
            });

        debug!(base_url = %base_url, "AlpacaBroker initialised");
        Self { client, base_url }
    }

    #[instrument(skip(self, spec), fields(symbol = %spec.symbol, qty = spec.qty), name = "broker::submit_bracket")]
    async fn submit_bracket(&self, spec: &BracketSpec) -> Result<String, BrokerError> {
        let mut body = json!({
            "symbol": spec.symbol,
            "qty": spec.qty.to_string(),
            "side": "buy",
            "time_in_force": "day",
            "order_class": "bracket",
            "client_order_id": spec.client_order_id,
            "stop_loss": {"stop_price": format!("{:.2}", spec.stop_loss)},
            "take_profit": {"limit_price": format!("{:.2}", spec.take_profit)},
        });
        match spec.limit_price {
            Some(limit) => {
                body["type"] = json!("limit");
                body["limit_price"] = json!(format!("{limit:.2}"));
            }
            None => {
                body["type"] = json!("market");
            }
        }
        let order: RawOrder = self.post_json("/v2/orders", &body).await?;
        info!(order_id = %order.id, symbol = %spec.symbol, "bracket order submitted");
        Ok(order.id)
    }

    #[instrument(skip(self), name = "broker::submit_stop")]
    async fn submit_stop(
        &self,
        symbol: &str,
        qty: i64,
        stop_price: f64,
        client_order_id: &str,
    ) -> Result<String, BrokerError> {
        let body = json!({
            "symbol": symbol,
            "qty": qty.to_string(),
            "side": "sell",
            "type": "stop",
            "time_in_force": "day",
            "stop_price": format!("{stop_price:.2}"),
            "client_order_id": client_order_id,
        });
        let order: RawOrder = self.post_json("/v2/orders", &body).await?;
        Ok(order.id)
    }

    #[instrument(skip(self), name = "broker::submit_sell")]
    async fn submit_sell(
        &self,
        symbol: &str,
        qty: i64,
        client_order_id: &str,
    ) -> Result<String, BrokerError> {
        let body = json!({
            "symbol": symbol,
            "qty": qty.to_string(),
            "side": "sell",
            "type": "market",
            "time_in_force": "day",
            "client_order_id": client_order_id,
        });
        let order: RawOrder = self.post_json("/v2/orders", &body).await?;
        Ok(order.id)
    }

    async fn cancel(&self, order_id: &str) -> Result<(), BrokerError> {
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;
        if resp.status().is_success() || resp.status().as_u16() == 204 {
            return Ok(());
        }
        Err(classify_response(resp).await)
    }

    async fn list_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>, BrokerError> {
        let mut url = format!("{}/v2/orders?status=open&limit=200", self.base_url);
        if let Some(s) = symbol {
            url.push_str(&format!("&symbols={s}"));
        }
        let orders: Vec<RawOrder> = self.get_json(&url).await?;
        Ok(orders.into_iter().map(raw_to_open_order).collect())
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let url = format!("{}/v2/positions", self.base_url);
        let positions: Vec<RawPosition> = self.get_json(&url).await?;
        Ok(positions
            .into_iter()
            .map(|p| BrokerPosition {
                symbol: p.symbol,
                qty: p.qty.parse().unwrap_or(0),
                avg_entry: p.avg_entry_price.parse().unwrap_or(0.0),
            })
            .collect())
    }

    async fn account_equity(&self) -> Result<f64, BrokerError> {
        let url = format!("{}/v2/account", self.base_url);
        let account: RawAccount = self.get_json(&url).await?;
        account
            .equity
            .parse()
            .map_err(|_| BrokerError::Unknown(format!("unparseable equity {}", account.equity)))
    }

    async fn market_clock_open(&self) -> Result<bool, BrokerError> {
        let url = format!("{}/v2/clock", self.base_url);
        let clock: RawClock = self.get_json(&url).await?;
        Ok(clock.is_open)
    }

    async fn fill_for(&self, client_order_id: &str) -> Result<Option<Fill>, BrokerError> {
        let url = format!(
            "{}/v2/orders:by_client_order_id?client_order_id={}",
            self.base_url, client_order_id
        );
        let order: RawOrder = match self.get_json(&url).await {
            Ok(o) => o,
            Err(BrokerError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let filled_qty: i64 = order
            .filled_qty
            .as_deref()
            .and_then(|q| q.parse().ok())
            .unwrap_or(0);
        if filled_qty <= 0 {
            return Ok(None);
        }
        let avg_price: f64 = order
            .filled_avg_price
            .as_deref()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0.0);
        Ok(Some(Fill {
            qty: filled_qty,
            avg_price,
        }))
    }

    // -------------------------------------------------------------------------
    // HTTP plumbing
    // -------------------------------------------------------------------------

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, BrokerError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(classify_response(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| BrokerError::Transient(format!("response decode: {e}")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, BrokerError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(classify_response(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| BrokerError::Transient(format!("response decode: {e}")))
    }
}

fn raw_to_open_order(o: RawOrder) -> OpenOrder {
    OpenOrder {
        id: o.id,
        client_order_id: o.client_order_id,
        symbol: o.symbol,
        side: o.side,
        qty: o.qty.as_deref().and_then(|q| q.parse().ok()).unwrap_or(0),
        order_type: o.order_type,
        stop_price: o.stop_price.as_deref().and_then(|p| p.parse().ok()),
        limit_price: o.limit_price.as_deref().and_then(|p| p.parse().ok()),
    }
}

/// Map an Alpaca error response onto the taxonomy the engine matches on.
async fn classify_response(resp: reqwest::Response) -> BrokerError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let lower = body.to_lowercase();

    match status {
        401 => BrokerError::Auth(body),
        403 if lower.contains("buying power") || lower.contains("insufficient") => {
            BrokerError::InsufficientFunds
        }
        403 => BrokerError::Auth(body),
        404 => BrokerError::NotFound(body),
        409 => BrokerError::AlreadyExists(body),
        422 if lower.contains("client_order_id") && lower.contains("unique") => {
            BrokerError::AlreadyExists(body)
        }
        422 => BrokerError::InvalidRequest(body),
        429 => BrokerError::RateLimited,
        500..=599 => BrokerError::Transient(format!("{status}: {body}")),
        _ => {
            warn!(status, body = %body, "unclassified broker response");
            BrokerError::Unknown(format!("{status}: {body}"))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bracket(client_order_id: &str) -> BracketSpec {
        BracketSpec {
            symbol: "AAPL".into(),
            qty: 100,
            limit_price: Some(185.0),
            stop_loss: 180.0,
            take_profit: 192.0,
            client_order_id: client_order_id.into(),
        }
    }

    #[tokio::test]
    async fn dry_run_submission_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dry_run_ledger.json");
        let broker = Broker::DryRun(DryRunBroker::new(path.clone(), 100_000.0));

        let id = broker.submit_bracket(&bracket("intent-1:Entry")).await.unwrap();
        assert_eq!(id, DRY_RUN_ORDER_ID);

        // Replay: the ledger already holds the key.
        let err = broker.submit_bracket(&bracket("intent-1:Entry")).await;
        assert!(matches!(err, Err(BrokerError::AlreadyExists(_))));

        let ledger = read_json(&path).unwrap().unwrap();
        assert!(ledger.get("intent-1:Entry").is_some());
        assert_eq!(ledger["intent-1:Entry"]["order_id"], DRY_RUN_ORDER_ID);
    }

    #[tokio::test]
    async fn dry_run_never_reports_fills_or_positions() {
        let dir = tempfile::tempdir().unwrap();
        let broker = Broker::DryRun(DryRunBroker::new(
            dir.path().join("dry_run_ledger.json"),
            50_000.0,
        ));
        broker.submit_bracket(&bracket("intent-1:Entry")).await.unwrap();

        assert!(broker.fill_for("intent-1:Entry").await.unwrap().is_none());
        assert!(broker.list_positions().await.unwrap().is_empty());
        assert!(broker.list_open_orders(None).await.unwrap().is_empty());
        assert_eq!(broker.account_equity().await.unwrap(), 50_000.0);
    }

    #[tokio::test]
    async fn paper_sim_fills_at_limit_price() {
        let broker = Broker::PaperSim(PaperSimBroker::new(100_000.0));
        broker.submit_bracket(&bracket("intent-1:Entry")).await.unwrap();

        let fill = broker.fill_for("intent-1:Entry").await.unwrap().unwrap();
        assert_eq!(fill.qty, 100);
        assert_eq!(fill.avg_price, 185.0);

        let positions = broker.list_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].qty, 100);

        // The protective stop leg rests as an open order.
        let orders = broker.list_open_orders(Some("AAPL")).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].stop_price, Some(180.0));
    }

    #[tokio::test]
    async fn paper_sim_duplicate_bracket_is_already_exists() {
        let broker = Broker::PaperSim(PaperSimBroker::new(100_000.0));
        broker.submit_bracket(&bracket("intent-1:Entry")).await.unwrap();
        let err = broker.submit_bracket(&bracket("intent-1:Entry")).await;
        assert!(matches!(err, Err(BrokerError::AlreadyExists(_))));

        // Position was not doubled by the replay.
        let positions = broker.list_positions().await.unwrap();
        assert_eq!(positions[0].qty, 100);
    }

    #[tokio::test]
    async fn paper_sim_cancel_and_replace_stop() {
        let broker = Broker::PaperSim(PaperSimBroker::new(100_000.0));
        broker.submit_bracket(&bracket("intent-1:Entry")).await.unwrap();

        let orders = broker.list_open_orders(Some("AAPL")).await.unwrap();
        broker.cancel(&orders[0].id).await.unwrap();
        // Double-cancel is a convergent race.
        let err = broker.cancel(&orders[0].id).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
        assert!(err.is_convergent());

        broker
            .submit_stop("AAPL", 100, 182.0, "intent-1:StopUpdate:182.00")
            .await
            .unwrap();
        let orders = broker.list_open_orders(Some("AAPL")).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].stop_price, Some(182.0));
    }

    #[tokio::test]
    async fn paper_sim_sell_reduces_position() {
        let broker = Broker::PaperSim(PaperSimBroker::new(100_000.0));
        broker.submit_bracket(&bracket("intent-1:Entry")).await.unwrap();

        broker.submit_sell("AAPL", 50, "intent-1:TrimR1").await.unwrap();
        let positions = broker.list_positions().await.unwrap();
        assert_eq!(positions[0].qty, 50);

        // Idempotent replay.
        let err = broker.submit_sell("AAPL", 50, "intent-1:TrimR1").await;
        assert!(matches!(err, Err(BrokerError::AlreadyExists(_))));
        assert_eq!(broker.list_positions().await.unwrap()[0].qty, 50);

        broker.submit_sell("AAPL", 50, "intent-1:Exit").await.unwrap();
        assert!(broker.list_positions().await.unwrap().is_empty());
    }

    #[test]
    fn error_classification_helpers() {
        assert!(BrokerError::RateLimited.is_retriable());
        assert!(BrokerError::Transient("x".into()).is_retriable());
        assert!(BrokerError::Unknown("x".into()).is_retriable());
        assert!(!BrokerError::Auth("x".into()).is_retriable());
        assert!(BrokerError::AlreadyExists("x".into()).is_convergent());
        assert!(BrokerError::NotFound("x".into()).is_convergent());
        assert!(!BrokerError::InvalidRequest("x".into()).is_convergent());
    }
}
