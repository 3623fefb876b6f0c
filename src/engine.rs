// =============================================================================
// Execution Orchestrator — the cycle driver
// =============================================================================
//
// One cycle: read the clock → evaluate gates → refresh candidates → load
// portfolio decisions → run exits → run entries → write the heartbeat → if
// the cycle was material, append the portfolio-decision cycle record → sleep.
//
// Restart-safe by construction: every mutation along the way is idempotent
// and keyed, so replaying a completed cycle produces no new orders and no new
// ledger records beyond a fresh cycle record.
//
// The broker variant is selected once at startup from the requested mode; a
// mid-day downgrade (kill switch, broken live keys) routes the ENTRY side
// through the dry-run broker instead, so a downgraded cycle can never place
// new risk with the real API. Exits keep the primary broker: risk-reducing
// orders continue for as long as the broker is reachable.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::broker::{AlpacaBroker, Broker, DryRunBroker, PaperSimBroker};
use crate::buy::{BuyCycle, BuyOutcome};
use crate::candidates::{self, CandidateFileError};
use crate::clock;
use crate::config::ExecutionConfig;
use crate::decisions::DecisionState;
use crate::gates::{self, GateDecision};
use crate::ledger::{atomic_write_json, LedgerRouter, BOOK_PORTFOLIO_DECISIONS};
use crate::market_data::{FixtureMarketData, MarketData};
use crate::sell::{SellCycle, SellOutcome};
use crate::store::{StateStore, WriterLock};
use crate::types::ExecutionMode;

/// Startup failures that map to dedicated process exit codes.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration invalid: {0:?}")]
    ConfigInvalid(Vec<String>),
    #[error("writer lock held by another instance")]
    WriterLockHeld,
    #[error("credentials missing for mode {0}")]
    CredentialsMissing(ExecutionMode),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Summary of one completed cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub mode: ExecutionMode,
    pub market_open: bool,
    pub skipped: bool,
    pub buy: BuyOutcome,
    pub sell: SellOutcome,
    pub material: bool,
}

pub struct Engine {
    cfg: ExecutionConfig,
    store: StateStore,
    ledger: LedgerRouter,
    market_data: MarketData,
    /// Broker for the requested mode.
    primary_broker: Broker,
    /// Fallback every downgraded cycle routes through.
    dry_run_broker: Broker,
    /// Held for the engine's lifetime; releases on drop.
    _writer_lock: Option<WriterLock>,
    errors_count: u64,
}

impl Engine {
    /// Validate config, take the writer lock, open the store, and build the
    /// mode-selected adapters.
    pub fn start(cfg: ExecutionConfig) -> Result<Self, StartupError> {
        // Credentials first: the dedicated exit code (65) must win over the
        // generic config-invalid report for the same root cause.
        if cfg.requires_credentials() && !cfg.has_credentials() {
            return Err(StartupError::CredentialsMissing(cfg.requested_mode));
        }
        let problems = cfg.validate();
        if !problems.is_empty() {
            return Err(StartupError::ConfigInvalid(problems));
        }

        let writer_lock = WriterLock::acquire(&cfg.writer_lock_path())
            .map_err(|_| StartupError::WriterLockHeld)?;
        let store = StateStore::open(&cfg.db_path).context("state store open failed")?;
        let ledger = LedgerRouter::new(cfg.ledger_dir());

        let market_data = match (&cfg.api_key_id, &cfg.api_secret_key) {
            (Some(key), Some(secret)) => {
                MarketData::Alpaca(crate::market_data::AlpacaMarketData::new(key, secret))
            }
            _ => {
                warn!("no market data credentials — confirmations will block until provided");
                MarketData::Fixture(FixtureMarketData::new())
            }
        };

        let dry_run_broker = Broker::DryRun(DryRunBroker::new(
            cfg.dry_run_ledger_path(),
            cfg.paper_sim_equity,
        ));
        // DRY_RUN=1 overrides the requested mode before any real adapter is
        // even constructed.
        let effective_mode = if cfg.force_dry_run {
            ExecutionMode::DryRun
        } else {
            cfg.requested_mode
        };
        let primary_broker = match effective_mode {
            ExecutionMode::DryRun => Broker::DryRun(DryRunBroker::new(
                cfg.dry_run_ledger_path(),
                cfg.paper_sim_equity,
            )),
            ExecutionMode::PaperSim => Broker::PaperSim(PaperSimBroker::new(cfg.paper_sim_equity)),
            ExecutionMode::AlpacaPaper | ExecutionMode::AlpacaLive => {
                let (Some(key), Some(secret)) = (&cfg.api_key_id, &cfg.api_secret_key) else {
                    return Err(StartupError::CredentialsMissing(cfg.requested_mode));
                };
                Broker::Alpaca(AlpacaBroker::new(
                    key,
                    secret,
                    cfg.requested_mode.is_live(),
                    cfg.api_base_url.as_deref(),
                ))
            }
        };

        info!(
            mode = %cfg.requested_mode,
            db = %cfg.db_path.display(),
            state_dir = %cfg.state_dir.display(),
            "execution engine started"
        );

        Ok(Self {
            cfg,
            store,
            ledger,
            market_data,
            primary_broker,
            dry_run_broker,
            _writer_lock: Some(writer_lock),
            errors_count: 0,
        })
    }

    /// Test constructor: injected parts, no lock file, no credentials.
    #[cfg(test)]
    pub fn with_parts(
        cfg: ExecutionConfig,
        store: StateStore,
        market_data: MarketData,
        primary_broker: Broker,
    ) -> Self {
        let ledger = LedgerRouter::new(cfg.ledger_dir());
        let dry_run_broker = Broker::DryRun(DryRunBroker::new(
            cfg.dry_run_ledger_path(),
            cfg.paper_sim_equity,
        ));
        Self {
            cfg,
            store,
            ledger,
            market_data,
            primary_broker,
            dry_run_broker,
            _writer_lock: None,
            errors_count: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Cycle
    // -------------------------------------------------------------------------

    /// One full cycle at `now`. Store errors propagate (fatal); everything
    /// else lands in the gate decision, the error count, and the ledgers.
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let today = clock::ny_date(now);

        // Day-boundary hygiene before anything reads state.
        self.store.purge_stale_candidates(today)?;
        self.store.expire_old_intents(today, now)?;

        let mut gate = gates::evaluate(&self.cfg, &self.store, now)?;

        if gate.skip_cycle {
            let report = CycleReport {
                mode: gate.mode,
                market_open: false,
                skipped: true,
                buy: BuyOutcome::default(),
                sell: SellOutcome::default(),
                material: false,
            };
            self.write_heartbeat(&gate, now)?;
            return Ok(report);
        }

        // Secondary market-hours check against the broker clock: the local
        // calendar does not know early closes or unscheduled halts.
        if !self.cfg.ignore_market_hours && gate.phase.market_open() {
            if let Ok(false) = self.primary_broker.market_clock_open().await {
                warn!("broker clock reports closed market — blocking new entries");
                gate.entries_allowed = false;
                if !gate.reasons.iter().any(|r| r == "broker_clock_closed") {
                    gate.reasons.push("broker_clock_closed".into());
                }
            }
        }

        // Candidate refresh. File-level defects block entries, never exits.
        self.refresh_candidates(&mut gate, today, now)?;

        // Portfolio decisions (gate 8). An invalid artifact writes one ledger
        // record per reason per day and blocks all entries.
        let decisions = DecisionState::load(
            &self.cfg.decisions_artifact_path(today),
            today,
            self.cfg.portfolio_decision_enforce,
        );
        if let Some(reason) = decisions.block_all_reason() {
            gate.reasons.push(reason.to_string());
            if self.store.alert_once(today, reason, now)? {
                warn!(target: "operator_alert", reason, "portfolio decision artifact rejected");
                let mut fields = serde_json::Map::new();
                fields.insert("reason".into(), json!(reason));
                if let Err(e) = self.ledger.append(
                    BOOK_PORTFOLIO_DECISIONS,
                    today,
                    "decision_artifact_rejected",
                    now,
                    fields,
                ) {
                    warn!(error = %e, "decision rejection record failed");
                }
            }
        }

        // A downgraded cycle must not reach the real API with NEW risk, so
        // entries route through the dry-run broker. Exits keep the primary
        // broker regardless: risk-reducing orders continue as long as the
        // broker is reachable, kill switch included.
        let entry_broker = if gate.mode == self.cfg.requested_mode {
            &self.primary_broker
        } else {
            &self.dry_run_broker
        };

        // Exits before entries: never add risk while a kill condition or cap
        // breach is pending.
        let sell_outcome = SellCycle {
            cfg: &self.cfg,
            store: &self.store,
            ledger: &self.ledger,
            market_data: &self.market_data,
            broker: &self.primary_broker,
        }
        .run(&mut gate, now)
        .await?;

        let buy_outcome = BuyCycle {
            cfg: &self.cfg,
            store: &self.store,
            ledger: &self.ledger,
            market_data: &self.market_data,
            broker: entry_broker,
            fill_broker: &self.primary_broker,
            decisions: &decisions,
        }
        .run(&mut gate, now)
        .await?;

        self.errors_count += u64::from(buy_outcome.errors + sell_outcome.errors);

        self.write_heartbeat(&gate, now)?;

        let market_open = gate.phase.market_open();
        let material = market_open
            || buy_outcome.is_material()
            || sell_outcome.is_material()
            || gate.is_nondefault();
        if material {
            self.append_cycle_record(&gate, &buy_outcome, &sell_outcome, today, now);
        }

        Ok(CycleReport {
            mode: gate.mode,
            market_open,
            skipped: false,
            buy: buy_outcome,
            sell: sell_outcome,
            material,
        })
    }

    pub async fn run_once(&mut self) -> Result<CycleReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// The default command: cycle forever on the poll cadence, exiting
    /// cleanly on Ctrl-C. Store errors abort the loop for the supervisor to
    /// restart.
    pub async fn run_loop(&mut self) -> Result<()> {
        info!("run-loop started");
        loop {
            let started = Utc::now();
            match self.run_cycle_at(started).await {
                Ok(report) => {
                    info!(
                        mode = %report.mode,
                        market_open = report.market_open,
                        skipped = report.skipped,
                        material = report.material,
                        "cycle complete"
                    );
                }
                Err(e) => {
                    // Store-level failure: fail fast, supervisor restarts.
                    error!(error = %e, "fatal cycle error");
                    return Err(e);
                }
            }

            let sleep_for = self.cfg.poll.poll_interval(Utc::now());
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("shutdown signal received — stopping after current cycle");
                    return Ok(());
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Candidate refresh
    // -------------------------------------------------------------------------

    fn refresh_candidates(
        &mut self,
        gate: &mut GateDecision,
        today: chrono::NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match candidates::load_candidates(&self.cfg.candidates_csv, today) {
            Ok(rows) => {
                for c in &rows {
                    self.store.upsert_candidate(today, c, now)?;
                }
            }
            Err(e) => {
                let reason = match e {
                    CandidateFileError::Missing(_) => "watchlist_missing",
                    CandidateFileError::StaleScanDate { .. } => "watchlist_stale",
                    CandidateFileError::MissingColumns(_) => "candidate_schema_invalid",
                    CandidateFileError::Unreadable(_)
                    | CandidateFileError::Csv(_)
                    | CandidateFileError::Malformed(_) => "candidate_file_unreadable",
                };
                warn!(error = %e, reason, "candidate file rejected — entries blocked");
                gate.entries_allowed = false;
                if !gate.reasons.iter().any(|r| r == reason) {
                    gate.reasons.push(reason.to_string());
                }
                if self.store.alert_once(today, reason, now)? {
                    warn!(target: "operator_alert", reason, "candidate file rejected");
                }
                self.errors_count += 1;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Heartbeat & cycle record
    // -------------------------------------------------------------------------

    /// Atomically replace the heartbeat. Written at least once per non-fatal
    /// cycle, including skipped ones.
    fn write_heartbeat(&self, gate: &GateDecision, now: DateTime<Utc>) -> Result<()> {
        let today = clock::ny_date(now);
        let heartbeat = json!({
            "ts_utc": now.to_rfc3339(),
            "mode": gate.mode.to_string(),
            "market_open": gate.phase.market_open(),
            "intents_count": self.store.count_intents(today)?,
            "orders_count": self.store.count_orders(today)?,
            "errors_count": self.errors_count,
        });
        atomic_write_json(&self.cfg.heartbeat_path(), &heartbeat)
            .context("heartbeat write failed")?;
        Ok(())
    }

    /// One record per material cycle in the portfolio-decisions book.
    fn append_cycle_record(
        &self,
        gate: &GateDecision,
        buy: &BuyOutcome,
        sell: &SellOutcome,
        today: chrono::NaiveDate,
        now: DateTime<Utc>,
    ) {
        let mut fields = gate.to_json();
        fields.insert(
            "cycle_id".into(),
            json!(uuid::Uuid::new_v4().to_string()),
        );
        fields.insert("intents_created".into(), json!(buy.intents_created));
        fields.insert("orders_submitted".into(), json!(buy.orders_submitted));
        fields.insert("fills_confirmed".into(), json!(buy.fills_confirmed));
        fields.insert("trims_submitted".into(), json!(sell.trims_submitted));
        fields.insert("stops_updated".into(), json!(sell.stops_updated));
        fields.insert("exits_submitted".into(), json!(sell.exits_submitted));
        fields.insert(
            "errors".into(),
            json!(buy.errors + sell.errors),
        );
        if let Err(e) = self.ledger.append(
            BOOK_PORTFOLIO_DECISIONS,
            today,
            "cycle_decision",
            now,
            fields,
        ) {
            // The cycle record is observational; losing one is logged, not
            // fatal.
            warn!(error = %e, "cycle decision record failed");
        }
    }

}

// =============================================================================
// Tests — end-to-end cycles against fixture data
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::read_json;
    use crate::market_data::Bar;
    use crate::types::{IntentStatus, PositionState};
    use chrono::Duration as ChronoDuration;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    /// 11:00 ET on the real current NY date. The watchlist-freshness gate
    /// compares the candidate file's true mtime against "today", so cycle
    /// tests run on the actual date with market hours ignored.
    fn cycle_now() -> DateTime<Utc> {
        let today = clock::ny_date(Utc::now());
        clock::market_open_utc(today) + ChronoDuration::minutes(90)
    }

    fn bar_before(mins_before_cycle: i64, close: f64) -> Bar {
        Bar {
            ts_utc: cycle_now() - ChronoDuration::minutes(mins_before_cycle + 10),
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 1000,
        }
    }

    const CSV: &str = "Symbol,Direction,Entry_Level,Stop_Loss,Target_R1,Target_R2,Entry_DistPct\nAAPL,long,185.00,180.00,188.00,192.00,0.027\n";

    enum BrokerKind {
        DryRun,
        PaperSim,
    }

    fn engine_with(market_data: MarketData, kind: BrokerKind) -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ExecutionConfig::for_tests(dir.path());
        std::fs::create_dir_all(cfg.candidates_csv.parent().unwrap()).unwrap();
        std::fs::write(&cfg.candidates_csv, CSV).unwrap();
        let broker = match kind {
            BrokerKind::DryRun => Broker::DryRun(DryRunBroker::new(
                cfg.dry_run_ledger_path(),
                cfg.paper_sim_equity,
            )),
            BrokerKind::PaperSim => Broker::PaperSim(PaperSimBroker::new(cfg.paper_sim_equity)),
        };
        let store = StateStore::open_in_memory().unwrap();
        (Engine::with_parts(cfg, store, market_data, broker), dir)
    }

    fn confirmed_fixture() -> MarketData {
        let mut f = FixtureMarketData::new();
        f.set_intraday("AAPL", vec![bar_before(20, 185.25), bar_before(10, 185.50)]);
        f.set_last_trade("AAPL", 185.50);
        MarketData::Fixture(f)
    }

    #[tokio::test]
    async fn s1_confirm_and_submit_dry_run() {
        let (mut engine, _dir) = engine_with(confirmed_fixture(), BrokerKind::DryRun);

        let report = engine.run_cycle_at(cycle_now()).await.unwrap();
        assert_eq!(report.buy.intents_created, 1);
        assert!(report.material);

        // Second cycle after the jitter window: submission goes out, the
        // dry-run book records it, no broker call possible by construction.
        let later = cycle_now() + ChronoDuration::seconds(120);
        let report = engine.run_cycle_at(later).await.unwrap();
        assert_eq!(report.buy.orders_submitted, 1);

        let today = clock::ny_date(cycle_now());
        assert!(engine
            .ledger
            .has_matching("DRY_RUN", today, |v| {
                v["record_type"] == "order_submitted" && v["order_id"] == "dry-run"
            })
            .unwrap());

        // Replay of a completed cycle: no new orders, no new order records.
        let report = engine.run_cycle_at(later).await.unwrap();
        assert_eq!(report.buy.orders_submitted, 0);
        assert_eq!(report.buy.intents_created, 0);
    }

    #[tokio::test]
    async fn heartbeat_written_every_cycle_including_skipped() {
        let (mut engine, _dir) = engine_with(confirmed_fixture(), BrokerKind::DryRun);
        engine.cfg.ignore_market_hours = false;

        // Saturday: the cycle skips but the heartbeat lands.
        let weekend = ts("2025-06-01T16:00:00Z");
        let report = engine.run_cycle_at(weekend).await.unwrap();
        assert!(report.skipped);

        let hb = read_json(&engine.cfg.heartbeat_path()).unwrap().unwrap();
        assert_eq!(hb["market_open"], false);
        assert_eq!(hb["mode"], "DRY_RUN");
        assert!(hb.get("ts_utc").is_some());
        assert!(hb.get("intents_count").is_some());
    }

    #[tokio::test]
    async fn s4_portfolio_block_recorded_in_cycle_record() {
        let (mut engine, _dir) = engine_with(confirmed_fixture(), BrokerKind::DryRun);
        engine.cfg.portfolio_decision_enforce = true;

        let today = clock::ny_date(cycle_now());
        let artifact_path = engine.cfg.decisions_artifact_path(today);
        std::fs::create_dir_all(artifact_path.parent().unwrap()).unwrap();
        std::fs::write(
            &artifact_path,
            format!(
                r#"{{"schema_version": 1, "ny_date": "{today}", "decisions": {{"AAPL|S1_AVWAP_CORE": {{"action": "BLOCK", "reason": "concentration_cap"}}}}}}"#
            ),
        )
        .unwrap();

        let report = engine.run_cycle_at(cycle_now()).await.unwrap();
        assert_eq!(report.buy.intents_created, 0);
        assert!(report.material);

        assert!(engine
            .ledger
            .has_matching(BOOK_PORTFOLIO_DECISIONS, today, |v| {
                v["record_type"] == "cycle_decision"
                    && v["blocks"]["AAPL"] == "concentration_cap"
            })
            .unwrap());
    }

    #[tokio::test]
    async fn s5_missing_decision_artifact_blocks_all_when_enforced() {
        let (mut engine, _dir) = engine_with(confirmed_fixture(), BrokerKind::DryRun);
        engine.cfg.portfolio_decision_enforce = true;
        // No artifact written.

        let report = engine.run_cycle_at(cycle_now()).await.unwrap();
        assert_eq!(report.buy.intents_created, 0);

        let today = clock::ny_date(cycle_now());
        assert!(engine
            .ledger
            .has_matching(BOOK_PORTFOLIO_DECISIONS, today, |v| {
                v["record_type"] == "decision_artifact_rejected"
                    && v["reason"] == "decision_artifact_missing"
            })
            .unwrap());

        // The rejection record is throttled: one per reason per day.
        engine.run_cycle_at(cycle_now()).await.unwrap();
        let path = engine.ledger.book_path(BOOK_PORTFOLIO_DECISIONS, today);
        let content = std::fs::read_to_string(path).unwrap();
        let rejections = content
            .lines()
            .filter(|l| l.contains("decision_artifact_rejected"))
            .count();
        assert_eq!(rejections, 1);
    }

    #[tokio::test]
    async fn stale_watchlist_blocks_entries_but_cycles_continue() {
        let (mut engine, _dir) = engine_with(confirmed_fixture(), BrokerKind::DryRun);

        // The candidate file claims yesterday's ScanDate.
        std::fs::write(
            &engine.cfg.candidates_csv,
            "Symbol,Direction,Entry_Level,Stop_Loss,Target_R1,Target_R2,Entry_DistPct,ScanDate\nAAPL,long,185.00,180.00,188.00,192.00,0.027,2025-05-30\n",
        )
        .unwrap();

        let report = engine.run_cycle_at(cycle_now()).await.unwrap();
        assert_eq!(report.buy.intents_created, 0);
        assert!(!report.skipped);
    }

    #[tokio::test]
    async fn s3_kill_switch_mid_day_keeps_exits_alive() {
        let (mut engine, _dir) = engine_with(confirmed_fixture(), BrokerKind::PaperSim);

        // Cycle 1+2: entry goes through and fills.
        engine.run_cycle_at(cycle_now()).await.unwrap();
        let later = cycle_now() + ChronoDuration::seconds(120);
        let report = engine.run_cycle_at(later).await.unwrap();
        assert_eq!(report.buy.fills_confirmed, 1);

        // Operator drops the kill switch file.
        std::fs::create_dir_all(&engine.cfg.state_dir).unwrap();
        std::fs::write(engine.cfg.kill_switch_path(), "").unwrap();

        // Price collapses through the stop. The cycle runs downgraded to
        // DRY_RUN, entries stay shut, and the exit still fires.
        let crash = later + ChronoDuration::minutes(10);
        if let MarketData::Fixture(f) = &mut engine.market_data {
            f.set_last_trade("AAPL", 179.0);
        }
        let report = engine.run_cycle_at(crash).await.unwrap();
        assert_eq!(report.mode, ExecutionMode::DryRun);
        assert_eq!(report.buy.orders_submitted, 0);
        assert_eq!(report.sell.exits_submitted, 1);

        let p = engine
            .store
            .get_position("AAPL", "S1_AVWAP_CORE")
            .unwrap()
            .unwrap();
        assert_eq!(p.state, PositionState::Closed);
    }

    #[tokio::test]
    async fn expired_intents_cleaned_on_day_rollover() {
        let (mut engine, _dir) = engine_with(confirmed_fixture(), BrokerKind::DryRun);

        engine.run_cycle_at(cycle_now()).await.unwrap();
        let today = clock::ny_date(cycle_now());
        assert_eq!(engine.store.count_intents(today).unwrap(), 1);

        // Next day: yesterday's Scheduled intent expires.
        let tomorrow = cycle_now() + ChronoDuration::days(1);
        engine.run_cycle_at(tomorrow).await.unwrap();
        let stale = engine
            .store
            .list_intents_by_status(today, IntentStatus::Scheduled)
            .unwrap();
        assert!(stale.is_empty());
    }
}
