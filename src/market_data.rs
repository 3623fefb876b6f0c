// =============================================================================
// Market Data Adapter — Alpaca Data API v2 + deterministic fixture
// =============================================================================
//
// The core consumes exactly three capabilities: closed 10-minute bars (BOH
// confirmation and intraday structure), daily bars (swing-low stops), and the
// latest trade (sizing fallback, trim triggers). Every call returns either a
// value or a classified failure; transient failures are retried with bounded
// backoff inside the cycle, everything else propagates as a block upstream.
// =============================================================================

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Default Alpaca data API root.
const DATA_BASE_URL: &str = "https://data.alpaca.markets";

/// Bounded in-cycle retry schedule for transient failures.
const RETRY_DELAYS_MS: [u64; 3] = [250, 500, 1000];

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MarketDataError {
    /// Network / 5xx / rate limit — retried, then surfaced as a block.
    #[error("transient market data failure: {0}")]
    Transient(String),
    #[error("symbol not found: {0}")]
    NotFound(String),
    #[error("market closed")]
    ClosedMarket,
    #[error("market data auth failure: {0}")]
    Auth(String),
}

// ---------------------------------------------------------------------------
// Bars
// ---------------------------------------------------------------------------

/// One OHLCV bar. `ts_utc` is the bar's open time.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub ts_utc: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    /// A 10-minute bar is closed once its window has fully elapsed.
    pub fn closed_10m_by(&self, now: DateTime<Utc>) -> bool {
        self.ts_utc + ChronoDuration::minutes(10) <= now
    }
}

// ---------------------------------------------------------------------------
// Adapter (enum over concrete sources)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum MarketData {
    Alpaca(AlpacaMarketData),
    Fixture(FixtureMarketData),
}

impl MarketData {
    /// The last `count` fully-closed 10-minute bars, oldest first.
    pub async fn closed_10m_bars(
        &self,
        symbol: &str,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketDataError> {
        match self {
            Self::Alpaca(a) => {
                let bars = retry_transient(|| a.fetch_bars(symbol, "10Min", count + 2)).await?;
                Ok(keep_closed(bars, count, now))
            }
            Self::Fixture(f) => Ok(keep_closed(f.intraday(symbol)?, count, now)),
        }
    }

    /// The last `count` completed daily bars, oldest first. The current
    /// (incomplete) session bar is never included.
    pub async fn daily_bars(
        &self,
        symbol: &str,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Bar>, MarketDataError> {
        match self {
            Self::Alpaca(a) => {
                let bars = retry_transient(|| a.fetch_bars(symbol, "1Day", count + 1)).await?;
                Ok(keep_completed_daily(bars, count, now))
            }
            Self::Fixture(f) => Ok(keep_completed_daily(f.daily(symbol)?, count, now)),
        }
    }

    /// Price of the most recent trade.
    pub async fn last_trade_price(&self, symbol: &str) -> Result<f64, MarketDataError> {
        match self {
            Self::Alpaca(a) => retry_transient(|| a.fetch_last_trade(symbol)).await,
            Self::Fixture(f) => f.last_trade(symbol),
        }
    }
}

fn keep_closed(mut bars: Vec<Bar>, count: usize, now: DateTime<Utc>) -> Vec<Bar> {
    bars.retain(|b| b.closed_10m_by(now));
    bars.sort_by_key(|b| b.ts_utc);
    if bars.len() > count {
        bars.drain(..bars.len() - count);
    }
    bars
}

fn keep_completed_daily(mut bars: Vec<Bar>, count: usize, now: DateTime<Utc>) -> Vec<Bar> {
    let today = crate::clock::ny_date(now);
    bars.retain(|b| crate::clock::ny_date(b.ts_utc) < today);
    bars.sort_by_key(|b| b.ts_utc);
    if bars.len() > count {
        bars.drain(..bars.len() - count);
    }
    bars
}

/// Run `op` up to four times, sleeping the bounded schedule between transient
/// failures. Anything non-transient returns immediately.
async fn retry_transient<T, F, Fut>(mut op: F) -> Result<T, MarketDataError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, MarketDataError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(MarketDataError::Transient(msg)) if attempt < RETRY_DELAYS_MS.len() => {
                warn!(attempt = attempt + 1, error = %msg, "transient market data error — backing off");
                tokio::time::sleep(std::time::Duration::from_millis(RETRY_DELAYS_MS[attempt]))
                    .await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Alpaca source
// ---------------------------------------------------------------------------

pub struct AlpacaMarketData {
    client: reqwest::Client,
    base_url: String,
}

impl std::fmt::Debug for AlpacaMarketData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaMarketData")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct RawBar {
    t: DateTime<Utc>,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: u64,
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Vec<RawBar>,
}

#[derive(Debug, Deserialize)]
struct LatestTradeResponse {
    trade: RawTrade,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    p: f64,
}

impl AlpacaMarketData {
    /// Credentials go into default headers; the secret never appears in logs.
    pub fn new(key_id: &str, secret: &str) -> Self {
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
        Self {
            client,
            base_url: DATA_BASE_URL.to_string(),
        }
    }

    #[instrument(skip(self), name = "market_data::bars")]
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Bar>, MarketDataError> {
        let url = format!(
            "{}/v2/stocks/{}/bars?timeframe={}&limit={}&sort=desc&adjustment=raw",
            self.base_url, symbol, timeframe, limit
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MarketDataError::Transient(e.to_string()))?;
        let resp = classify_status(resp, symbol).await?;
        let body: BarsResponse = resp
            .json()
            .await
            .map_err(|e| MarketDataError::Transient(format!("bars decode: {e}")))?;
        debug!(symbol, timeframe, count = body.bars.len(), "bars fetched");
        Ok(body
            .bars
            .into_iter()
            .map(|b| Bar {
                ts_utc: b.t,
                open: b.o,
                high: b.h,
                low: b.l,
                close: b.c,
                volume: b.v,
            })
            .collect())
    }

    #[instrument(skip(self), name = "market_data::last_trade")]
    async fn fetch_last_trade(&self, symbol: &str) -> Result<f64, MarketDataError> {
        let url = format!("{}/v2/stocks/{}/trades/latest", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MarketDataError::Transient(e.to_string()))?;
        let resp = classify_status(resp, symbol).await?;
        let body: LatestTradeResponse = resp
            .json()
            .await
            .map_err(|e| MarketDataError::Transient(format!("trade decode: {e}")))?;
        Ok(body.trade.p)
    }
}

async fn classify_status(
    resp: reqwest::Response,
    symbol: &str,
) -> Result<reqwest::Response, MarketDataError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if body.to_lowercase().contains("market is closed") {
        return Err(MarketDataError::ClosedMarket);
    }
    match status.as_u16() {
        401 | 403 => Err(MarketDataError::Auth(format!("{status}: {body}"))),
        404 => Err(MarketDataError::NotFound(symbol.to_string())),
        422 => Err(MarketDataError::NotFound(format!("{symbol}: {body}"))),
        429 => Err(MarketDataError::Transient(format!("rate limited: {body}"))),
        _ => Err(MarketDataError::Transient(format!("{status}: {body}"))),
    }
}

// ---------------------------------------------------------------------------
// Fixture source (tests, offline checks)
// ---------------------------------------------------------------------------

/// Deterministic in-memory market data: the engine's loops are exercised
/// against this in tests, with bars and trades staged per symbol.
#[derive(Debug, Default)]
pub struct FixtureMarketData {
    intraday: HashMap<String, Vec<Bar>>,
    daily: HashMap<String, Vec<Bar>>,
    trades: HashMap<String, f64>,
}

impl FixtureMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_intraday(&mut self, symbol: &str, bars: Vec<Bar>) {
        self.intraday.insert(symbol.to_uppercase(), bars);
    }

    pub fn set_daily(&mut self, symbol: &str, bars: Vec<Bar>) {
        self.daily.insert(symbol.to_uppercase(), bars);
    }

    pub fn set_last_trade(&mut self, symbol: &str, price: f64) {
        self.trades.insert(symbol.to_uppercase(), price);
    }

    fn intraday(&self, symbol: &str) -> Result<Vec<Bar>, MarketDataError> {
        self.intraday
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| MarketDataError::NotFound(symbol.to_string()))
    }

    fn daily(&self, symbol: &str) -> Result<Vec<Bar>, MarketDataError> {
        self.daily
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| MarketDataError::NotFound(symbol.to_string()))
    }

    fn last_trade(&self, symbol: &str) -> Result<f64, MarketDataError> {
        self.trades
            .get(&symbol.to_uppercase())
            .copied()
            .ok_or_else(|| MarketDataError::NotFound(symbol.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
