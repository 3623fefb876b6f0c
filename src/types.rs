// =============================================================================
// Shared types used across the execution engine
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How orders leave the engine. Anything other than `AlpacaLive` never risks
/// real funds; the gate stack can only ever downgrade toward `DryRun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    DryRun,
    PaperSim,
    AlpacaPaper,
    AlpacaLive,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::DryRun
    }
}

impl ExecutionMode {
    /// Parse the `EXECUTION_MODE` env value. Unknown values map to `None` so
    /// the caller can fail closed.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "DRY_RUN" => Some(Self::DryRun),
            "PAPER_SIM" => Some(Self::PaperSim),
            "ALPACA_PAPER" => Some(Self::AlpacaPaper),
            "ALPACA_LIVE" => Some(Self::AlpacaLive),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::AlpacaLive)
    }

    /// Ledger book this mode's order events are routed to.
    pub fn book_id(&self) -> &'static str {
        match self {
            Self::DryRun => "DRY_RUN",
            Self::PaperSim => "PAPER_SIM",
            Self::AlpacaPaper => "ALPACA_PAPER",
            Self::AlpacaLive => "ALPACA_LIVE",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DryRun => write!(f, "DRY_RUN"),
            Self::PaperSim => write!(f, "PAPER_SIM"),
            Self::AlpacaPaper => write!(f, "ALPACA_PAPER"),
            Self::AlpacaLive => write!(f, "ALPACA_LIVE"),
        }
    }
}

/// Session phase in New York time. Gates which stop sources the exit loop may
/// use and whether entries are considered at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketPhase {
    /// Before 09:30 ET on a trading day.
    Pre,
    /// 09:30–09:45 ET. Initial bracket stop only.
    OpenNoise,
    /// 09:45–10:30 ET. Daily swing-low preferred.
    EarlyTrend,
    /// 10:30–15:30 ET. Intraday higher-low primary.
    Normal,
    /// 15:30–16:00 ET. Stops frozen.
    CloseProtect,
    /// After 16:00 ET on a trading day.
    Post,
    /// Weekend or NYSE full-closure holiday.
    Holiday,
}

impl MarketPhase {
    pub fn market_open(&self) -> bool {
        matches!(
            self,
            Self::OpenNoise | Self::EarlyTrend | Self::Normal | Self::CloseProtect
        )
    }
}

impl std::fmt::Display for MarketPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pre => write!(f, "Pre"),
            Self::OpenNoise => write!(f, "OpenNoise"),
            Self::EarlyTrend => write!(f, "EarlyTrend"),
            Self::Normal => write!(f, "Normal"),
            Self::CloseProtect => write!(f, "CloseProtect"),
            Self::Post => write!(f, "Post"),
            Self::Holiday => write!(f, "Holiday"),
        }
    }
}

/// A validated row from the daily candidate file. Long-only by construction:
/// rows with any other direction are rejected at the CSV boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub symbol: String,
    pub strategy_id: String,
    /// Breakout pivot the BOH confirmation is measured against.
    pub entry_level: f64,
    pub stop_loss: f64,
    pub target_r1: f64,
    pub target_r2: f64,
    /// Distance from entry to stop as a fraction of entry (sizing divisor).
    pub entry_dist_pct: f64,
}

/// Lifecycle of an entry intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentStatus {
    Scheduled,
    Submitted,
    Filled,
    Cancelled,
    Expired,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "Scheduled",
            Self::Submitted => "Submitted",
            Self::Filled => "Filled",
            Self::Cancelled => "Cancelled",
            Self::Expired => "Expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Scheduled" => Some(Self::Scheduled),
            "Submitted" => Some(Self::Submitted),
            "Filled" => Some(Self::Filled),
            "Cancelled" => Some(Self::Cancelled),
            "Expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A BOH-confirmed, sized entry waiting for (or past) its planned submit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryIntent {
    pub intent_id: String,
    pub ny_date: NaiveDate,
    pub symbol: String,
    pub strategy_id: String,
    pub pivot: f64,
    pub stop: f64,
    pub r1: f64,
    pub r2: f64,
    pub quantity: i64,
    pub planned_entry_time_utc: DateTime<Utc>,
    pub status: IntentStatus,
}

impl EntryIntent {
    /// Deterministic intent id: SHA-256 over the stable natural key, with the
    /// pivot fixed to 4 decimal places so the id is byte-stable across runs.
    pub fn deterministic_id(
        ny_date: NaiveDate,
        strategy_id: &str,
        symbol: &str,
        pivot: f64,
    ) -> String {
        let key = format!("{ny_date}|{strategy_id}|{symbol}|entry|{pivot:.4}");
        let digest = Sha256::digest(key.as_bytes());
        hex::encode(&digest[..16])
    }
}

/// Per-symbol lifecycle phase for the current NY day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolPhase {
    Flat,
    Entering,
    Open,
    Exiting,
}

impl SymbolPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flat => "Flat",
            Self::Entering => "Entering",
            Self::Open => "Open",
            Self::Exiting => "Exiting",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Flat" => Some(Self::Flat),
            "Entering" => Some(Self::Entering),
            "Open" => Some(Self::Open),
            "Exiting" => Some(Self::Exiting),
            _ => None,
        }
    }
}

impl std::fmt::Display for SymbolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Exit-side lifecycle of an owned position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Flat,
    Entering,
    Open,
    Exiting,
    Closed,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flat => "Flat",
            Self::Entering => "Entering",
            Self::Open => "Open",
            Self::Exiting => "Exiting",
            Self::Closed => "Closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Flat" => Some(Self::Flat),
            "Entering" => Some(Self::Entering),
            "Open" => Some(Self::Open),
            "Exiting" => Some(Self::Exiting),
            "Closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A position owned by the engine after an entry fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub strategy_id: String,
    /// Intent that opened this position; every exit-side order purpose is
    /// keyed by it.
    pub intent_id: String,
    pub qty_open: i64,
    pub avg_entry: f64,
    pub initial_stop: f64,
    /// Monotone non-decreasing once set (trailing ratchet).
    pub current_stop: f64,
    pub r1_done: bool,
    pub r2_done: bool,
    pub state: PositionState,
    pub opened_ts_utc: DateTime<Utc>,
    pub last_structure_ts_utc: Option<DateTime<Utc>>,
}

/// What a submitted order is for. Together with the intent id this forms the
/// idempotency key: at most one successful submission per (intent, purpose).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderPurpose {
    Entry,
    StopInit,
    TrimR1,
    TrimR2,
    StopUpdate,
    Exit,
}

impl OrderPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "Entry",
            Self::StopInit => "StopInit",
            Self::TrimR1 => "TrimR1",
            Self::TrimR2 => "TrimR2",
            Self::StopUpdate => "StopUpdate",
            Self::Exit => "Exit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Entry" => Some(Self::Entry),
            "StopInit" => Some(Self::StopInit),
            "TrimR1" => Some(Self::TrimR1),
            "TrimR2" => Some(Self::TrimR2),
            "StopUpdate" => Some(Self::StopUpdate),
            "Exit" => Some(Self::Exit),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
