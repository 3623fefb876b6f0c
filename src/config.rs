// =============================================================================
// Execution Configuration — one immutable value per process start
// =============================================================================
//
// Central configuration hub for the execution engine. Everything tunable is
// read from the environment exactly once and frozen into an `ExecutionConfig`;
// per-cycle code only ever reads this value, so a cycle can never observe a
// half-applied reconfiguration.
//
// Invalid numeric or time values fall back to their defaults with a single
// startup warning. Structural problems (unknown EXECUTION_MODE, impossible
// jitter window) are collected by `validate()` and fail `config-check`.
// =============================================================================

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::warn;

use crate::clock::PollPolicy;
use crate::types::ExecutionMode;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const DEFAULT_STATE_DIR: &str = "/root/avwap_r3k_scanner/state";
const DEFAULT_DB_PATH: &str = "data/execution_v2.sqlite";
const DEFAULT_CANDIDATES_CSV: &str = "data/candidates.csv";

const DEFAULT_ENTRY_DELAY_AFTER_OPEN_MIN: i64 = 20;
const DEFAULT_MIN_EXIT_ARMING_SECS: i64 = 120;
const DEFAULT_MARKET_SETTLE_MIN: i64 = 0;
const DEFAULT_EDGE_WINDOW_RECHECKS: u32 = 3;
const DEFAULT_EDGE_WINDOW_RECHECK_DELAY_SECS: u64 = 5;
const DEFAULT_EDGE_WINDOW_PROXIMITY_PCT: f64 = 0.002;
const DEFAULT_ONE_SHOT_COOLDOWN_MIN: i64 = 120;
const DEFAULT_BASE_RISK_PCT: f64 = 0.01;
const DEFAULT_PAPER_SIM_EQUITY: f64 = 100_000.0;
const DEFAULT_ENTRY_JITTER_MIN_SECS: i64 = 30;
const DEFAULT_ENTRY_JITTER_MAX_SECS: i64 = 90;
const DEFAULT_TRIM_FRACTION: f64 = 0.5;
const DEFAULT_MIN_STOP_DISTANCE_PCT: f64 = 1.5;
const DEFAULT_MIN_BARS_SINCE_ENTRY: u32 = 4;
const DEFAULT_MIN_MINUTES_SINCE_ENTRY: i64 = 20;

// ---------------------------------------------------------------------------
// One-shot reset policy
// ---------------------------------------------------------------------------

/// How the one-entry-per-symbol-per-day marker resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OneShotResetMode {
    /// Marker expires after a cooldown; a later re-confirmation may re-enter.
    Cooldown,
    /// Marker holds for the whole NY day.
    Daily,
}

impl OneShotResetMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "cooldown" => Some(Self::Cooldown),
            "daily" => Some(Self::Daily),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionConfig
// ---------------------------------------------------------------------------

/// Frozen snapshot of every tunable the engine reads. Built once at startup
/// from the environment plus CLI overrides.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    // --- Mode & the live two-key gate ------------------------------------
    /// Mode requested by `EXECUTION_MODE` (before the gate stack runs).
    pub requested_mode: ExecutionMode,
    /// `EXECUTION_MODE` raw value when it failed to parse (config-check error).
    pub mode_parse_error: Option<String>,
    /// `DRY_RUN=1` forces dry-run regardless of everything else.
    pub force_dry_run: bool,
    /// `LIVE_TRADING=1` — first key of the live gate.
    pub live_trading_flag: bool,
    /// `LIVE_CONFIRM_TOKEN` — must byte-equal the token file's trimmed contents.
    pub live_confirm_token: Option<String>,

    // --- Safety ------------------------------------------------------------
    pub kill_switch_env: bool,
    /// Empty = all symbols allowed.
    pub allowlist: Vec<String>,
    pub max_orders_per_day: u32,
    pub max_positions: u32,
    pub max_gross_notional: f64,
    pub max_notional_per_symbol: f64,

    // --- Broker credentials -------------------------------------------------
    pub api_key_id: Option<String>,
    pub api_secret_key: Option<String>,
    pub api_base_url: Option<String>,

    // --- Paths --------------------------------------------------------------
    pub state_dir: PathBuf,
    pub db_path: PathBuf,
    pub candidates_csv: PathBuf,

    // --- Polling & throttles -----------------------------------------------
    pub poll: PollPolicy,
    pub entry_delay_after_open_min: i64,
    pub min_exit_arming_secs: i64,
    pub market_settle_min: i64,

    // --- Portfolio decision enforcement --------------------------------------
    pub portfolio_decision_enforce: bool,

    // --- Feature-flagged subsystems ------------------------------------------
    pub edge_window_enabled: bool,
    pub edge_window_rechecks: u32,
    pub edge_window_recheck_delay_secs: u64,
    pub edge_window_proximity_pct: f64,
    pub one_shot_enabled: bool,
    pub one_shot_reset_mode: OneShotResetMode,
    pub one_shot_cooldown_min: i64,
    pub correlation_sizing_enabled: bool,
    /// Sizing haircut in [0, 1) applied only while correlation sizing is on.
    pub correlation_penalty: f64,

    // --- Sizing & exits ------------------------------------------------------
    pub base_risk_pct: f64,
    pub risk_scale: f64,
    pub paper_sim_equity: f64,
    pub entry_jitter_min_secs: i64,
    pub entry_jitter_max_secs: i64,
    pub trim_fraction_r1: f64,
    pub trim_fraction_r2: f64,
    pub min_stop_distance_pct: f64,
    pub min_bars_since_entry: u32,
    pub min_minutes_since_entry: i64,

    // --- CLI-only switches ---------------------------------------------------
    pub ignore_market_hours: bool,
}

impl ExecutionConfig {
    /// Read the environment into a config. CLI overrides are applied by the
    /// caller afterwards (`db_path`, `candidates_csv`, `ignore_market_hours`,
    /// poll seconds).
    pub fn from_env() -> Self {
        let raw_mode = std::env::var("EXECUTION_MODE").ok();
        let (requested_mode, mode_parse_error) = match raw_mode.as_deref() {
            None => (ExecutionMode::DryRun, None),
            Some(raw) => match ExecutionMode::parse(raw) {
                Some(m) => (m, None),
                None => {
                    warn!(value = raw, "unknown EXECUTION_MODE — treating as DRY_RUN");
                    (ExecutionMode::DryRun, Some(raw.to_string()))
                }
            },
        };

        let poll = PollPolicy::from_raw(
            std::env::var("EXECUTION_POLL_SECONDS").ok().as_deref(),
            std::env::var("EXECUTION_POLL_MARKET_SECONDS").ok().as_deref(),
            std::env::var("EXECUTION_POLL_TIGHT_SECONDS").ok().as_deref(),
            std::env::var("EXECUTION_POLL_TIGHT_START_ET").ok().as_deref(),
            std::env::var("EXECUTION_POLL_TIGHT_END_ET").ok().as_deref(),
        );

        Self {
            requested_mode,
            mode_parse_error,
            force_dry_run: env_flag("DRY_RUN"),
            live_trading_flag: env_flag("LIVE_TRADING"),
            live_confirm_token: env_nonempty("LIVE_CONFIRM_TOKEN"),
            kill_switch_env: env_flag("KILL_SWITCH"),
            allowlist: env_csv("ALLOWLIST_SYMBOLS"),
            max_orders_per_day: env_num("MAX_LIVE_ORDERS_PER_DAY", 10),
            max_positions: env_num("MAX_LIVE_POSITIONS", 5),
            max_gross_notional: env_num("MAX_LIVE_GROSS_NOTIONAL", 50_000.0),
            max_notional_per_symbol: env_num("MAX_LIVE_NOTIONAL_PER_SYMBOL", 10_000.0),
            api_key_id: env_nonempty("APCA_API_KEY_ID"),
            api_secret_key: env_nonempty("APCA_API_SECRET_KEY"),
            api_base_url: env_nonempty("APCA_API_BASE_URL"),
            state_dir: PathBuf::from(
                std::env::var("AVWAP_STATE_DIR").unwrap_or_else(|_| DEFAULT_STATE_DIR.into()),
            ),
            db_path: PathBuf::from(
                std::env::var("EXECUTION_V2_DB").unwrap_or_else(|_| DEFAULT_DB_PATH.into()),
            ),
            candidates_csv: PathBuf::from(
                std::env::var("AVWAP_CANDIDATES_CSV")
                    .unwrap_or_else(|_| DEFAULT_CANDIDATES_CSV.into()),
            ),
            poll,
            entry_delay_after_open_min: env_num(
                "ENTRY_DELAY_AFTER_OPEN_MINUTES",
                DEFAULT_ENTRY_DELAY_AFTER_OPEN_MIN,
            ),
            min_exit_arming_secs: env_num("MIN_EXIT_ARMING_SECONDS", DEFAULT_MIN_EXIT_ARMING_SECS),
            market_settle_min: env_num("MARKET_SETTLE_MINUTES", DEFAULT_MARKET_SETTLE_MIN),
            portfolio_decision_enforce: env_flag("PORTFOLIO_DECISION_ENFORCE"),
            edge_window_enabled: env_flag("EDGE_WINDOW_ENABLED"),
            edge_window_rechecks: env_num("EDGE_WINDOW_RECHECKS", DEFAULT_EDGE_WINDOW_RECHECKS),
            edge_window_recheck_delay_secs: env_num(
                "EDGE_WINDOW_RECHECK_DELAY_SEC",
                DEFAULT_EDGE_WINDOW_RECHECK_DELAY_SECS,
            ),
            edge_window_proximity_pct: env_num(
                "EDGE_WINDOW_PROXIMITY_PCT",
                DEFAULT_EDGE_WINDOW_PROXIMITY_PCT,
            ),
            one_shot_enabled: env_flag_default("ONE_SHOT_PER_SYMBOL_ENABLED", true),
            one_shot_reset_mode: std::env::var("ONE_SHOT_RESET_MODE")
                .ok()
                .and_then(|s| {
                    let parsed = OneShotResetMode::parse(&s);
                    if parsed.is_none() {
                        warn!(value = %s, "unknown ONE_SHOT_RESET_MODE — using cooldown");
                    }
                    parsed
                })
                .unwrap_or(OneShotResetMode::Cooldown),
            one_shot_cooldown_min: env_num(
                "ONE_SHOT_COOLDOWN_MINUTES",
                DEFAULT_ONE_SHOT_COOLDOWN_MIN,
            ),
            correlation_sizing_enabled: env_flag("CORRELATION_SIZING_ENABLED"),
            correlation_penalty: env_num("CORRELATION_PENALTY", 0.0),
            base_risk_pct: env_num("BASE_RISK_PCT", DEFAULT_BASE_RISK_PCT),
            risk_scale: env_num("RISK_SCALE", 1.0),
            paper_sim_equity: env_num("PAPER_SIM_EQUITY", DEFAULT_PAPER_SIM_EQUITY),
            entry_jitter_min_secs: env_num("ENTRY_JITTER_MIN_SECONDS", DEFAULT_ENTRY_JITTER_MIN_SECS),
            entry_jitter_max_secs: env_num("ENTRY_JITTER_MAX_SECONDS", DEFAULT_ENTRY_JITTER_MAX_SECS),
            trim_fraction_r1: env_num("TRIM_FRACTION_R1", DEFAULT_TRIM_FRACTION),
            trim_fraction_r2: env_num("TRIM_FRACTION_R2", DEFAULT_TRIM_FRACTION),
            min_stop_distance_pct: env_num("MIN_STOP_DISTANCE_PCT", DEFAULT_MIN_STOP_DISTANCE_PCT),
            min_bars_since_entry: env_num("MIN_BARS_SINCE_ENTRY", DEFAULT_MIN_BARS_SINCE_ENTRY),
            min_minutes_since_entry: env_num(
                "MIN_MINUTES_SINCE_ENTRY",
                DEFAULT_MIN_MINUTES_SINCE_ENTRY,
            ),
            ignore_market_hours: false,
        }
    }

    // -------------------------------------------------------------------------
    // Derived paths
    // -------------------------------------------------------------------------

    /// Root of the persisted layout: the parent of the state dir, so that
    /// `state/`, `ledger/`, and `analytics/` are siblings.
    pub fn layout_root(&self) -> PathBuf {
        self.state_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.state_dir.clone())
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.layout_root().join("ledger")
    }

    pub fn kill_switch_path(&self) -> PathBuf {
        self.state_dir.join("KILL_SWITCH")
    }

    pub fn live_token_path(&self) -> PathBuf {
        self.state_dir.join("live_confirm_token.txt")
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        self.state_dir.join("execution_heartbeat.json")
    }

    pub fn dry_run_ledger_path(&self) -> PathBuf {
        self.state_dir.join("dry_run_ledger.json")
    }

    pub fn writer_lock_path(&self) -> PathBuf {
        self.state_dir.join("execution_v2.lock")
    }

    pub fn decisions_artifact_path(&self, date: NaiveDate) -> PathBuf {
        self.layout_root()
            .join("analytics/artifacts/portfolio_decisions")
            .join(format!("{date}.json"))
    }

    pub fn live_ledger_path(&self, date: NaiveDate) -> PathBuf {
        self.ledger_dir()
            .join(ExecutionMode::AlpacaLive.book_id())
            .join(format!("{date}.jsonl"))
    }

    // -------------------------------------------------------------------------
    // Validation (config-check)
    // -------------------------------------------------------------------------

    /// Structural problems that make the configuration invalid. Empty means
    /// `config-check` passes.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if let Some(raw) = &self.mode_parse_error {
            problems.push(format!(
                "EXECUTION_MODE '{raw}' is not one of DRY_RUN, PAPER_SIM, ALPACA_PAPER, ALPACA_LIVE"
            ));
        }

        if self.entry_jitter_min_secs < 0
            || self.entry_jitter_max_secs < self.entry_jitter_min_secs
        {
            problems.push(format!(
                "entry jitter window [{}, {}] is not a valid range",
                self.entry_jitter_min_secs, self.entry_jitter_max_secs
            ));
        }

        for (name, v) in [
            ("BASE_RISK_PCT", self.base_risk_pct),
            ("TRIM_FRACTION_R1", self.trim_fraction_r1),
            ("TRIM_FRACTION_R2", self.trim_fraction_r2),
            ("CORRELATION_PENALTY", self.correlation_penalty),
        ] {
            if !(0.0..=1.0).contains(&v) {
                problems.push(format!("{name} {v} must be within [0, 1]"));
            }
        }

        if self.edge_window_proximity_pct < 0.0 {
            problems.push(format!(
                "EDGE_WINDOW_PROXIMITY_PCT {} must be non-negative",
                self.edge_window_proximity_pct
            ));
        }

        if self.requires_credentials() && !self.has_credentials() {
            problems.push(format!(
                "mode {} requires APCA_API_KEY_ID and APCA_API_SECRET_KEY",
                self.requested_mode
            ));
        }

        problems
    }

    /// Broker-backed modes cannot run without credentials.
    pub fn requires_credentials(&self) -> bool {
        matches!(
            self.requested_mode,
            ExecutionMode::AlpacaPaper | ExecutionMode::AlpacaLive
        ) && !self.force_dry_run
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key_id.is_some() && self.api_secret_key.is_some()
    }
}

#[cfg(test)]
impl ExecutionConfig {
    /// A DRY_RUN config rooted in `root`, with market hours ignored so tests
    /// are independent of wall-clock time.
    pub fn for_tests(root: &Path) -> Self {
        Self {
            requested_mode: ExecutionMode::DryRun,
            mode_parse_error: None,
            force_dry_run: false,
            live_trading_flag: false,
            live_confirm_token: None,
            kill_switch_env: false,
            allowlist: Vec::new(),
            max_orders_per_day: 10,
            max_positions: 5,
            max_gross_notional: 50_000.0,
            max_notional_per_symbol: 10_000.0,
            api_key_id: None,
            api_secret_key: None,
            api_base_url: None,
            state_dir: root.join("state"),
            db_path: root.join("data/execution_v2.sqlite"),
            candidates_csv: root.join("data/candidates.csv"),
            poll: PollPolicy::default(),
            entry_delay_after_open_min: 20,
            min_exit_arming_secs: 120,
            market_settle_min: 0,
            portfolio_decision_enforce: false,
            edge_window_enabled: false,
            edge_window_rechecks: 3,
            edge_window_recheck_delay_secs: 5,
            edge_window_proximity_pct: 0.002,
            one_shot_enabled: true,
            one_shot_reset_mode: OneShotResetMode::Cooldown,
            one_shot_cooldown_min: 120,
            correlation_sizing_enabled: false,
            correlation_penalty: 0.0,
            base_risk_pct: 0.01,
            risk_scale: 1.0,
            paper_sim_equity: 100_000.0,
            entry_jitter_min_secs: 30,
            entry_jitter_max_secs: 90,
            trim_fraction_r1: 0.5,
            trim_fraction_r2: 0.5,
            min_stop_distance_pct: 1.5,
            min_bars_since_entry: 4,
            min_minutes_since_entry: 20,
            ignore_market_hours: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Env parsing helpers
// ---------------------------------------------------------------------------

fn env_flag(name: &str) -> bool {
    env_flag_default(name, false)
}

fn env_flag_default(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Err(_) => default,
        Ok(v) => matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "YES"),
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let v = v.trim().to_string();
        if v.is_empty() {
            None
        } else {
            Some(v)
        }
    })
}

fn env_csv(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse a numeric env var, falling back to `default` with one warning.
fn env_num<T: std::str::FromStr + std::fmt::Display + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(var = name, value = %raw, %default, "invalid numeric env — using default");
                default
            }
        },
    }
}

// =============================================================================
// Tests
// =============================================================================
