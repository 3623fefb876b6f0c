// =============================================================================
// Safety Gate Stack — ordered, fail-closed, downgrade-only
// =============================================================================
//
// Gates run in a fixed order at the top of every cycle. A gate can (a) skip
// the cycle outright (market closed), (b) downgrade the effective mode toward
// DRY_RUN (kill switch, broken live keys), or (c) block new entries while
// exits keep running (stale watchlist, caps). Gates never upgrade and never
// block exits.
//
// Operator alerts are throttled to one per reason per NY day via the durable
// `alerts_sent` table, so a restart cannot re-page anyone.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::clock;
use crate::config::ExecutionConfig;
use crate::store::StateStore;
use crate::types::{ExecutionMode, MarketPhase};

// ---------------------------------------------------------------------------
// GateDecision
// ---------------------------------------------------------------------------

/// Caps snapshot carried into the cycle's decision record.
#[derive(Debug, Clone)]
pub struct CapsSnapshot {
    pub orders_today: u32,
    pub max_orders_per_day: u32,
    pub positions_open: u32,
    pub max_positions: u32,
    pub gross_notional: f64,
    pub max_gross_notional: f64,
    pub max_notional_per_symbol: f64,
}

impl CapsSnapshot {
    pub fn to_json(&self) -> Value {
        json!({
            "orders_today": self.orders_today,
            "max_orders_per_day": self.max_orders_per_day,
            "positions_open": self.positions_open,
            "max_positions": self.max_positions,
            "gross_notional": self.gross_notional,
            "max_gross_notional": self.max_gross_notional,
            "max_notional_per_symbol": self.max_notional_per_symbol,
        })
    }
}

/// The cycle's verdict from the gate stack.
#[derive(Debug, Clone)]
pub struct GateDecision {
    /// Effective mode after downgrades.
    pub mode: ExecutionMode,
    /// Session phase at evaluation time.
    pub phase: MarketPhase,
    /// Market closed and not overridden: do nothing but write the heartbeat.
    pub skip_cycle: bool,
    /// New entries may be considered this cycle.
    pub entries_allowed: bool,
    /// Reason codes, in gate order, for everything that fired.
    pub reasons: Vec<String>,
    /// Allowlist in force (empty = all symbols).
    pub allowlist: Vec<String>,
    pub caps: CapsSnapshot,
    /// Per-symbol blocks discovered during the cycle (filled by the buy loop).
    pub blocks: HashMap<String, String>,
}

impl GateDecision {
    /// True when anything beyond a plain open-market pass happened.
    pub fn is_nondefault(&self) -> bool {
        !self.reasons.is_empty() || !self.blocks.is_empty()
    }

    pub fn to_json(&self) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("mode".into(), json!(self.mode.to_string()));
        m.insert("phase".into(), json!(self.phase.to_string()));
        m.insert("entries_allowed".into(), json!(self.entries_allowed));
        m.insert("reasons".into(), json!(self.reasons));
        m.insert("allowlist".into(), json!(self.allowlist));
        m.insert("caps".into(), self.caps.to_json());
        m.insert("blocks".into(), json!(self.blocks));
        m
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Run the fixed gate order for this cycle. Store errors are fatal and
/// propagate; everything else fails closed into the decision.
pub fn evaluate(
    cfg: &ExecutionConfig,
    store: &StateStore,
    now: DateTime<Utc>,
) -> Result<GateDecision> {
    let today = clock::ny_date(now);
    let phase = clock::market_phase(now);

    let caps = CapsSnapshot {
        orders_today: store.count_orders(today)?,
        max_orders_per_day: cfg.max_orders_per_day,
        positions_open: store.open_position_count()?,
        max_positions: cfg.max_positions,
        gross_notional: store.gross_notional()?,
        max_gross_notional: cfg.max_gross_notional,
        max_notional_per_symbol: cfg.max_notional_per_symbol,
    };

    let mut decision = GateDecision {
        mode: cfg.requested_mode,
        phase,
        skip_cycle: false,
        entries_allowed: true,
        reasons: Vec::new(),
        allowlist: cfg.allowlist.clone(),
        caps,
        blocks: HashMap::new(),
    };

    // ── 1. Kill switch ───────────────────────────────────────────────
    if cfg.kill_switch_env || cfg.kill_switch_path().exists() {
        decision.mode = ExecutionMode::DryRun;
        decision.entries_allowed = false;
        fire(store, &mut decision, today, now, "kill_switch_active")?;
    }

    // ── 2. Market hours ──────────────────────────────────────────────
    if !cfg.ignore_market_hours && !phase.market_open() {
        decision.skip_cycle = true;
        decision.entries_allowed = false;
        decision.reasons.push("market_closed".into());
        // Closed market is routine, not an alert.
        return Ok(decision);
    }

    // ── 3. Watchlist freshness ───────────────────────────────────────
    if !watchlist_fresh(&cfg.candidates_csv, now) {
        decision.entries_allowed = false;
        fire(store, &mut decision, today, now, "watchlist_stale")?;
    }

    // ── 4. Execution mode resolution (two-key live gate) ─────────────
    if cfg.force_dry_run && decision.mode != ExecutionMode::DryRun {
        decision.mode = ExecutionMode::DryRun;
        decision.reasons.push("dry_run_forced".into());
    }
    if decision.mode.is_live() {
        if !cfg.live_trading_flag {
            decision.mode = ExecutionMode::DryRun;
            fire(store, &mut decision, today, now, "live_flag_missing")?;
        } else if !live_token_matches(cfg) {
            decision.mode = ExecutionMode::DryRun;
            fire(store, &mut decision, today, now, "live_token_mismatch")?;
        }
    }

    // ── 5. Live ledger present ───────────────────────────────────────
    if decision.mode.is_live() && !readable(&cfg.live_ledger_path(today)) {
        decision.mode = ExecutionMode::DryRun;
        fire(store, &mut decision, today, now, "live_ledger_missing")?;
    }

    // ── 6. Caps (global; per-symbol notional is checked per candidate) ─
    if decision.caps.orders_today >= cfg.max_orders_per_day {
        decision.entries_allowed = false;
        fire(store, &mut decision, today, now, "cap_orders_per_day")?;
    }
    if decision.caps.positions_open >= cfg.max_positions {
        decision.entries_allowed = false;
        fire(store, &mut decision, today, now, "cap_positions")?;
    }
    if decision.caps.gross_notional >= cfg.max_gross_notional {
        decision.entries_allowed = false;
        fire(store, &mut decision, today, now, "cap_gross_notional")?;
    }

    // Gates 7 (allowlist) and 8 (portfolio decisions) are carried in the
    // decision and enforced per candidate by the buy loop.

    info!(
        mode = %decision.mode,
        phase = %decision.phase,
        entries_allowed = decision.entries_allowed,
        reasons = ?decision.reasons,
        "gate stack evaluated"
    );
    Ok(decision)
}

/// Record a reason and emit the once-per-day operator alert for it.
fn fire(
    store: &StateStore,
    decision: &mut GateDecision,
    today: chrono::NaiveDate,
    now: DateTime<Utc>,
    reason: &str,
) -> Result<()> {
    decision.reasons.push(reason.to_string());
    if store.alert_once(today, reason, now)? {
        warn!(target: "operator_alert", reason, "safety gate fired");
    }
    Ok(())
}

/// The candidate file exists and was written today (NY time). The external
/// supervisor enforces this too; the engine re-checks defensively.
fn watchlist_fresh(path: &Path, now: DateTime<Utc>) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    let mtime: DateTime<Utc> = modified.into();
    clock::ny_date(mtime) == clock::ny_date(now)
}

/// Second key of the live gate: the env token must byte-equal the trimmed
/// contents of the token file.
fn live_token_matches(cfg: &ExecutionConfig) -> bool {
    let Some(expected) = cfg.live_confirm_token.as_deref() else {
        return false;
    };
    match std::fs::read_to_string(cfg.live_token_path()) {
        Ok(contents) => contents.trim() == expected,
        Err(_) => false,
    }
}

fn readable(path: &Path) -> bool {
    std::fs::File::open(path).is_ok()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &Path) -> ExecutionConfig {
        ExecutionConfig::for_tests(root)
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn fresh_watchlist(cfg: &ExecutionConfig) {
        std::fs::create_dir_all(cfg.candidates_csv.parent().unwrap()).unwrap();
        std::fs::write(&cfg.candidates_csv, "Symbol\n").unwrap();
    }

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    #[test]
    fn clean_config_passes_all_gates() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        fresh_watchlist(&cfg);

        let d = evaluate(&cfg, &store(), now()).unwrap();
        assert!(d.entries_allowed);
        assert!(!d.skip_cycle);
        assert_eq!(d.mode, ExecutionMode::DryRun);
        assert!(d.reasons.is_empty());
        assert!(!d.is_nondefault());
    }

    #[test]
    fn kill_switch_file_forces_dry_run_and_blocks_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.requested_mode = ExecutionMode::AlpacaPaper;
        fresh_watchlist(&cfg);

        std::fs::create_dir_all(&cfg.state_dir).unwrap();
        std::fs::write(cfg.kill_switch_path(), "").unwrap();

        let d = evaluate(&cfg, &store(), now()).unwrap();
        assert_eq!(d.mode, ExecutionMode::DryRun);
        assert!(!d.entries_allowed);
        assert!(!d.skip_cycle, "exits must still run under the kill switch");
        assert!(d.reasons.contains(&"kill_switch_active".to_string()));
    }

    #[test]
    fn kill_switch_env_flag_works_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.kill_switch_env = true;
        fresh_watchlist(&cfg);

        let d = evaluate(&cfg, &store(), now()).unwrap();
        assert!(!d.entries_allowed);
        assert!(d.reasons.contains(&"kill_switch_active".to_string()));
    }

    #[test]
    fn missing_watchlist_blocks_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        // No candidate file written at all.

        let d = evaluate(&cfg, &store(), now()).unwrap();
        assert!(!d.entries_allowed);
        assert!(!d.skip_cycle);
        assert!(d.reasons.contains(&"watchlist_stale".to_string()));
    }

    #[test]
    fn live_without_two_keys_downgrades() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.requested_mode = ExecutionMode::AlpacaLive;
        fresh_watchlist(&cfg);

        // Key 1 missing entirely.
        let d = evaluate(&cfg, &store(), now()).unwrap();
        assert_eq!(d.mode, ExecutionMode::DryRun);
        assert!(d.reasons.contains(&"live_flag_missing".to_string()));

        // Key 1 present, token file absent.
        cfg.live_trading_flag = true;
        cfg.live_confirm_token = Some("GO-LIVE-42".into());
        let d = evaluate(&cfg, &store(), now()).unwrap();
        assert_eq!(d.mode, ExecutionMode::DryRun);
        assert!(d.reasons.contains(&"live_token_mismatch".to_string()));

        // Token file disagrees.
        std::fs::create_dir_all(&cfg.state_dir).unwrap();
        std::fs::write(cfg.live_token_path(), "SOMETHING-ELSE\n").unwrap();
        let d = evaluate(&cfg, &store(), now()).unwrap();
        assert_eq!(d.mode, ExecutionMode::DryRun);
    }

    #[test]
    fn live_with_both_keys_and_ledger_stays_live() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.requested_mode = ExecutionMode::AlpacaLive;
        cfg.live_trading_flag = true;
        cfg.live_confirm_token = Some("GO-LIVE-42".into());
        fresh_watchlist(&cfg);

        std::fs::create_dir_all(&cfg.state_dir).unwrap();
        std::fs::write(cfg.live_token_path(), "GO-LIVE-42\n").unwrap();

        let today = clock::ny_date(now());
        let ledger = cfg.live_ledger_path(today);
        std::fs::create_dir_all(ledger.parent().unwrap()).unwrap();
        std::fs::write(&ledger, "").unwrap();

        let d = evaluate(&cfg, &store(), now()).unwrap();
        assert_eq!(d.mode, ExecutionMode::AlpacaLive);
        assert!(d.entries_allowed);
    }

    #[test]
    fn live_without_ledger_downgrades() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.requested_mode = ExecutionMode::AlpacaLive;
        cfg.live_trading_flag = true;
        cfg.live_confirm_token = Some("GO-LIVE-42".into());
        fresh_watchlist(&cfg);
        std::fs::create_dir_all(&cfg.state_dir).unwrap();
        std::fs::write(cfg.live_token_path(), "GO-LIVE-42").unwrap();

        let d = evaluate(&cfg, &store(), now()).unwrap();
        assert_eq!(d.mode, ExecutionMode::DryRun);
        assert!(d.reasons.contains(&"live_ledger_missing".to_string()));
    }

    #[test]
    fn order_cap_blocks_at_exactly_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.max_orders_per_day = 2;
        fresh_watchlist(&cfg);
        let st = store();
        let today = clock::ny_date(now());

        // One below the cap: allowed.
        st.record_order_once("i1", crate::types::OrderPurpose::Entry, "o1", "ok", today, now())
            .unwrap();
        let d = evaluate(&cfg, &st, now()).unwrap();
        assert!(d.entries_allowed);

        // At the cap: the next order would be one beyond — blocked.
        st.record_order_once("i2", crate::types::OrderPurpose::Entry, "o2", "ok", today, now())
            .unwrap();
        let d = evaluate(&cfg, &st, now()).unwrap();
        assert!(!d.entries_allowed);
        assert!(d.reasons.contains(&"cap_orders_per_day".to_string()));
    }

    #[test]
    fn dry_run_env_downgrades_requested_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.requested_mode = ExecutionMode::AlpacaPaper;
        cfg.force_dry_run = true;
        fresh_watchlist(&cfg);

        let d = evaluate(&cfg, &store(), now()).unwrap();
        assert_eq!(d.mode, ExecutionMode::DryRun);
        assert!(d.reasons.contains(&"dry_run_forced".to_string()));
        // Forced dry-run still allows (dry-run) entries.
        assert!(d.entries_allowed);
    }

    #[test]
    fn decision_serializes_for_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        fresh_watchlist(&cfg);

        let mut d = evaluate(&cfg, &store(), now()).unwrap();
        d.blocks.insert("AAPL".into(), "concentration_cap".into());
        let j = Value::Object(d.to_json());
        assert_eq!(j["mode"], "DRY_RUN");
        assert_eq!(j["blocks"]["AAPL"], "concentration_cap");
        assert_eq!(j["caps"]["max_orders_per_day"], 10);
    }

    #[test]
    fn alerts_throttle_once_per_reason_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.kill_switch_env = true;
        fresh_watchlist(&cfg);
        let st = store();

        // Two cycles: the reason fires both times, the durable throttle rows
        // show the alert went out only once.
        let t = now();
        let today = clock::ny_date(t);
        evaluate(&cfg, &st, t).unwrap();
        evaluate(&cfg, &st, t).unwrap();
        assert!(!st.alert_once(today, "kill_switch_active", t).unwrap());
    }

    #[test]
    fn market_closed_skips_cycle_when_not_ignoring_hours() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.ignore_market_hours = false;
        fresh_watchlist(&cfg);

        // Saturday noon UTC: Holiday phase.
        let weekend = DateTime::parse_from_rfc3339("2025-06-01T16:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let d = evaluate(&cfg, &store(), weekend).unwrap();
        assert!(d.skip_cycle);
        assert!(!d.entries_allowed);
        assert!(d.reasons.contains(&"market_closed".to_string()));
    }
}
