// =============================================================================
// Buy Loop — candidate → BOH confirmation → sized intent → bracket order
// =============================================================================
//
// Per cycle, three passes over the entry side:
//
//   1. Confirm & schedule — every Flat candidate is checked for a two-bar
//      breakout hold; confirmations become deterministic, jitter-delayed
//      entry intents. Single-bar closes never count. No intrabar evaluation.
//   2. Submit due intents — Scheduled intents past their planned time go out
//      as bracket orders (entry + protective stop + R2 take-profit). Replays
//      converge: the order ledger and the broker's duplicate-id rejection
//      both key on the intent id.
//   3. Confirm fills — Submitted intents are checked against the broker;
//      fills open positions, consume the one-shot, and write the slippage
//      record.
//
// Every skip lands in the gate decision's per-symbol block map with a reason
// code, so the cycle record explains itself.
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BracketSpec, BrokerError};
use crate::clock;
use crate::config::{ExecutionConfig, OneShotResetMode};
use crate::decisions::{DecisionState, Permit};
use crate::gates::GateDecision;
use crate::ledger::{LedgerRouter, BOOK_EXECUTION_SLIPPAGE};
use crate::market_data::{Bar, MarketData, MarketDataError};
use crate::store::StateStore;
use crate::types::{
    Candidate, EntryIntent, IntentStatus, OrderPurpose, Position, PositionState, SymbolPhase,
};

/// What the buy side did this cycle, for the heartbeat and cycle record.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuyOutcome {
    pub intents_created: u32,
    pub orders_submitted: u32,
    pub fills_confirmed: u32,
    pub errors: u32,
}

impl BuyOutcome {
    pub fn is_material(&self) -> bool {
        self.intents_created > 0
            || self.orders_submitted > 0
            || self.fills_confirmed > 0
            || self.errors > 0
    }
}

/// Everything the buy loop needs for one cycle.
pub struct BuyCycle<'a> {
    pub cfg: &'a ExecutionConfig,
    pub store: &'a StateStore,
    pub ledger: &'a LedgerRouter,
    pub market_data: &'a MarketData,
    /// Submission side: downgrade-aware, so a killed cycle cannot place new
    /// risk with the real API.
    pub broker: &'a Broker,
    /// Read-only queries (fills, equity): always the mode-selected broker, so
    /// a downgrade never blinds fill confirmation.
    pub fill_broker: &'a Broker,
    pub decisions: &'a DecisionState,
}

impl<'a> BuyCycle<'a> {
    /// Run all three passes. Only state-store failures propagate; broker and
    /// market-data failures degrade to per-symbol blocks.
    pub async fn run(&self, gate: &mut GateDecision, now: DateTime<Utc>) -> Result<BuyOutcome> {
        let mut outcome = BuyOutcome::default();
        let today = clock::ny_date(now);

        if gate.entries_allowed {
            self.confirm_and_schedule(gate, now, &mut outcome).await?;
            self.submit_due(gate, now, &mut outcome).await?;
        } else {
            debug!(reasons = ?gate.reasons, "entry side disabled by gates this cycle");
        }

        // Fill confirmation always runs: a submitted order may fill while the
        // gates are down, and the position must be owned either way.
        self.confirm_fills(today, now, &mut outcome).await?;

        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Pass 1: confirm and schedule
    // -------------------------------------------------------------------------

    async fn confirm_and_schedule(
        &self,
        gate: &mut GateDecision,
        now: DateTime<Utc>,
        outcome: &mut BuyOutcome,
    ) -> Result<()> {
        let today = clock::ny_date(now);

        for candidate in self.store.list_active_candidates(today)? {
            let symbol = candidate.symbol.clone();

            // Allowlist (gate 7).
            if !gate.allowlist.is_empty() && !gate.allowlist.contains(&symbol) {
                gate.blocks.insert(symbol, "not_allowlisted".into());
                continue;
            }

            // Lifecycle: only Flat symbols are entry candidates.
            let (phase, _) = self
                .store
                .symbol_phase(today, &candidate.strategy_id, &symbol)?;
            if phase != SymbolPhase::Flat {
                continue;
            }
            if self
                .store
                .open_intent_for(today, &symbol, &candidate.strategy_id)?
                .is_some()
            {
                continue;
            }

            // Portfolio decision (gate 8).
            if let Permit::Block(reason) =
                self.decisions.permit(&symbol, &candidate.strategy_id)
            {
                debug!(symbol = %symbol, reason = %reason, "entry blocked by portfolio decision");
                gate.blocks.insert(symbol, reason);
                continue;
            }

            // One-shot guard.
            if self.one_shot_blocks(today, &candidate, now)? {
                info!(symbol = %symbol, "entry skipped: one-shot already consumed");
                gate.blocks.insert(symbol, "one_shot_cooldown_active".into());
                continue;
            }

            // Min delay after the open.
            let earliest = clock::market_open_utc(today)
                + ChronoDuration::minutes(
                    self.cfg.entry_delay_after_open_min + self.cfg.market_settle_min,
                );
            if now < earliest {
                debug!(symbol = %symbol, %earliest, "too early after the open");
                continue;
            }

            // Two-bar BOH confirmation (+ optional edge-window rechecks).
            match self.confirm_boh(&candidate, now).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(MarketDataError::Transient(msg)) => {
                    warn!(symbol = %symbol, error = %msg, "market data unavailable for confirmation");
                    gate.blocks.insert(symbol, "market_data_unavailable".into());
                    outcome.errors += 1;
                    continue;
                }
                Err(e) => {
                    debug!(symbol = %symbol, error = %e, "confirmation data unavailable");
                    gate.blocks.insert(symbol, "market_data_unavailable".into());
                    continue;
                }
            }

            // Sizing.
            let equity = match self.fill_broker.account_equity().await {
                Ok(e) => e,
                Err(e) => {
                    debug!(error = %e, "broker equity unavailable — using paper-sim constant");
                    self.cfg.paper_sim_equity
                }
            };
            let gross_remaining =
                (self.cfg.max_gross_notional - self.store.gross_notional()?).max(0.0);
            let symbol_remaining = (self.cfg.max_notional_per_symbol
                - self.store.symbol_notional(&symbol)?)
            .max(0.0);
            let qty = size_entry(
                self.cfg,
                equity,
                &candidate,
                gross_remaining,
                symbol_remaining,
            );
            if qty <= 0 {
                debug!(symbol = %symbol, "sized to zero — skipping");
                gate.blocks.insert(symbol, "sizing_zero".into());
                continue;
            }

            // Deterministic intent with randomized submit delay.
            let delay = jitter_secs(self.cfg);
            let intent = EntryIntent {
                intent_id: EntryIntent::deterministic_id(
                    today,
                    &candidate.strategy_id,
                    &symbol,
                    candidate.entry_level,
                ),
                ny_date: today,
                symbol: symbol.clone(),
                strategy_id: candidate.strategy_id.clone(),
                pivot: candidate.entry_level,
                stop: candidate.stop_loss,
                r1: candidate.target_r1,
                r2: candidate.target_r2,
                quantity: qty,
                planned_entry_time_utc: now + ChronoDuration::seconds(delay),
                status: IntentStatus::Scheduled,
            };
            let stored = self.store.put_entry_intent(&intent, now)?;
            if stored.intent_id == intent.intent_id && stored.status == IntentStatus::Scheduled {
                info!(
                    symbol = %symbol,
                    intent_id = %stored.intent_id,
                    qty,
                    pivot = candidate.entry_level,
                    planned = %stored.planned_entry_time_utc,
                    "entry intent scheduled"
                );
                outcome.intents_created += 1;
            }
        }
        Ok(())
    }

    /// Two closed 10-minute bars above the pivot, with bounded sub-minute
    /// rechecks when the edge window is enabled and price is knocking.
    async fn confirm_boh(
        &self,
        candidate: &Candidate,
        now: DateTime<Utc>,
    ) -> Result<bool, MarketDataError> {
        let bars = self
            .market_data
            .closed_10m_bars(&candidate.symbol, 2, now)
            .await?;
        if boh_confirmed(&bars, candidate.entry_level) {
            if let Some(last_bar) = bars.last() {
                debug!(
                    symbol = %candidate.symbol,
                    pivot = candidate.entry_level,
                    open = last_bar.open,
                    high = last_bar.high,
                    close = last_bar.close,
                    volume = last_bar.volume,
                    "two-bar breakout hold confirmed"
                );
            }
            return Ok(true);
        }

        if !self.cfg.edge_window_enabled {
            return Ok(false);
        }

        // Edge window: only worth rechecking when price is already within
        // the proximity band of the pivot.
        let last = self.market_data.last_trade_price(&candidate.symbol).await?;
        let proximity = (candidate.entry_level - last).abs() / candidate.entry_level;
        if proximity > self.cfg.edge_window_proximity_pct {
            return Ok(false);
        }

        for recheck in 1..=self.cfg.edge_window_rechecks {
            tokio::time::sleep(std::time::Duration::from_secs(
                self.cfg.edge_window_recheck_delay_secs,
            ))
            .await;
            let now = Utc::now();
            let bars = self
                .market_data
                .closed_10m_bars(&candidate.symbol, 2, now)
                .await?;
            if boh_confirmed(&bars, candidate.entry_level) {
                debug!(symbol = %candidate.symbol, recheck, "edge window confirmed breakout");
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn one_shot_blocks(
        &self,
        today: chrono::NaiveDate,
        candidate: &Candidate,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !self.cfg.one_shot_enabled {
            return Ok(false);
        }
        let Some(consumed_at) =
            self.store
                .entry_consumed_at(today, &candidate.strategy_id, &candidate.symbol)?
        else {
            return Ok(false);
        };
        match self.cfg.one_shot_reset_mode {
            OneShotResetMode::Daily => Ok(true),
            OneShotResetMode::Cooldown => {
                let expires =
                    consumed_at + ChronoDuration::minutes(self.cfg.one_shot_cooldown_min);
                Ok(now < expires)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Pass 2: submit due intents
    // -------------------------------------------------------------------------

    async fn submit_due(
        &self,
        gate: &mut GateDecision,
        now: DateTime<Utc>,
        outcome: &mut BuyOutcome,
    ) -> Result<()> {
        let today = clock::ny_date(now);

        for intent in self.store.pop_due_entry_intents(now)? {
            debug_assert!(!intent.status.is_terminal());

            // Restart safety: if the order ledger already holds an Entry for
            // this intent, the submission happened in a previous life.
            if let Some((order_id, _)) = self.store.get_order(&intent.intent_id, OrderPurpose::Entry)? {
                debug!(intent_id = %intent.intent_id, order_id = %order_id, "entry already submitted — converging");
                self.store
                    .set_intent_status(&intent.intent_id, IntentStatus::Submitted, now)?;
                continue;
            }

            let spec = BracketSpec {
                symbol: intent.symbol.clone(),
                qty: intent.quantity,
                limit_price: Some(intent.pivot),
                stop_loss: intent.stop,
                take_profit: intent.r2,
                client_order_id: entry_client_order_id(&intent.intent_id),
            };

            match self.broker.submit_bracket(&spec).await {
                Ok(order_id) => {
                    self.record_entry_submission(gate, &intent, &order_id, today, now)?;
                    outcome.orders_submitted += 1;
                }
                Err(BrokerError::AlreadyExists(_)) => {
                    // The broker has it from a replay; converge.
                    self.record_entry_submission(gate, &intent, &spec.client_order_id, today, now)?;
                }
                Err(e) if e.is_retriable() => {
                    warn!(
                        intent_id = %intent.intent_id,
                        symbol = %intent.symbol,
                        error = %e,
                        "entry submission failed transiently — retrying next cycle"
                    );
                    gate.blocks
                        .insert(intent.symbol.clone(), "broker_transient".into());
                    outcome.errors += 1;
                }
                Err(BrokerError::Auth(msg)) => {
                    warn!(error = %msg, "broker auth failure on entry — blocking symbol");
                    gate.blocks.insert(intent.symbol.clone(), "broker_auth".into());
                    outcome.errors += 1;
                }
                Err(e) => {
                    warn!(
                        intent_id = %intent.intent_id,
                        symbol = %intent.symbol,
                        error = %e,
                        "entry rejected — cancelling intent"
                    );
                    self.store
                        .set_intent_status(&intent.intent_id, IntentStatus::Cancelled, now)?;
                    gate.blocks
                        .insert(intent.symbol.clone(), "entry_rejected".into());
                    outcome.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Shared success path for a real submission and an `AlreadyExists`
    /// convergence: record once, mark Submitted, move the lifecycle.
    fn record_entry_submission(
        &self,
        gate: &GateDecision,
        intent: &EntryIntent,
        order_id: &str,
        today: chrono::NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let inserted = self.store.record_order_once(
            &intent.intent_id,
            OrderPurpose::Entry,
            order_id,
            "submitted",
            today,
            now,
        )?;
        self.store
            .set_intent_status(&intent.intent_id, IntentStatus::Submitted, now)?;
        self.store.set_symbol_phase(
            today,
            &intent.strategy_id,
            &intent.symbol,
            SymbolPhase::Entering,
            None,
        )?;

        // Dry-run orders never fill; the one-shot is consumed at submission
        // so a later re-confirmation cannot fire a second time today.
        if matches!(self.broker, Broker::DryRun(_)) {
            self.store
                .mark_entry_consumed(today, &intent.strategy_id, &intent.symbol, now)?;
        }

        if inserted {
            // Ledger-side idempotency: scan today's book for the natural key
            // before appending, in case the store was rebuilt mid-day.
            let book = gate.mode.book_id();
            let already = self
                .ledger
                .has_event(book, today, "order_submitted", &intent.intent_id)
                .unwrap_or(false);
            if !already {
                let mut fields = serde_json::Map::new();
                fields.insert("intent_id".into(), json!(intent.intent_id));
                fields.insert("symbol".into(), json!(intent.symbol));
                fields.insert("strategy_id".into(), json!(intent.strategy_id));
                fields.insert("purpose".into(), json!(OrderPurpose::Entry.as_str()));
                fields.insert("order_id".into(), json!(order_id));
                fields.insert("qty".into(), json!(intent.quantity));
                fields.insert("limit_price".into(), json!(intent.pivot));
                fields.insert("stop_loss".into(), json!(intent.stop));
                fields.insert("take_profit".into(), json!(intent.r2));
                if let Err(e) = self.ledger.append(book, today, "order_submitted", now, fields)
                {
                    // Ledger failure blocks nothing that already happened;
                    // the store row is the idempotency anchor.
                    warn!(error = %e, "order ledger append failed");
                }
            }
            info!(
                intent_id = %intent.intent_id,
                symbol = %intent.symbol,
                order_id,
                book = gate.mode.book_id(),
                "SUBMITTED entry order"
            );
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pass 3: confirm fills
    // -------------------------------------------------------------------------

    async fn confirm_fills(
        &self,
        today: chrono::NaiveDate,
        now: DateTime<Utc>,
        outcome: &mut BuyOutcome,
    ) -> Result<()> {
        for intent in self.store.list_intents_by_status(today, IntentStatus::Submitted)? {
            let client_order_id = entry_client_order_id(&intent.intent_id);
            let fill = match self.fill_broker.fill_for(&client_order_id).await {
                Ok(f) => f,
                Err(e) if e.is_retriable() => {
                    debug!(intent_id = %intent.intent_id, error = %e, "fill check unavailable");
                    continue;
                }
                Err(e) => {
                    warn!(intent_id = %intent.intent_id, error = %e, "fill check failed");
                    outcome.errors += 1;
                    continue;
                }
            };
            let Some(fill) = fill else { continue };

            let position = Position {
                symbol: intent.symbol.clone(),
                strategy_id: intent.strategy_id.clone(),
                intent_id: intent.intent_id.clone(),
                qty_open: fill.qty,
                avg_entry: fill.avg_price,
                initial_stop: intent.stop,
                current_stop: intent.stop,
                r1_done: false,
                r2_done: false,
                state: PositionState::Open,
                opened_ts_utc: now,
                last_structure_ts_utc: None,
            };
            self.store.upsert_position(&position)?;
            self.store
                .set_intent_status(&intent.intent_id, IntentStatus::Filled, now)?;
            self.store.set_symbol_phase(
                today,
                &intent.strategy_id,
                &intent.symbol,
                SymbolPhase::Open,
                None,
            )?;
            self.store
                .mark_entry_consumed(today, &intent.strategy_id, &intent.symbol, now)?;
            outcome.fills_confirmed += 1;

            info!(
                intent_id = %intent.intent_id,
                symbol = %intent.symbol,
                qty = fill.qty,
                avg_price = fill.avg_price,
                "entry filled — position open"
            );

            // Slippage is observational: a write failure warns once and the
            // cycle moves on.
            let expected = intent.pivot;
            let slippage_bps = if expected > 0.0 {
                (fill.avg_price - expected) / expected * 10_000.0
            } else {
                0.0
            };
            let mut fields = serde_json::Map::new();
            fields.insert("intent_id".into(), json!(intent.intent_id));
            fields.insert("symbol".into(), json!(intent.symbol));
            fields.insert("expected_price".into(), json!(expected));
            fields.insert("ideal_price".into(), json!(intent.pivot));
            fields.insert("actual_price".into(), json!(fill.avg_price));
            fields.insert("slippage_bps".into(), json!(slippage_bps));
            fields.insert("qty".into(), json!(fill.qty));
            if let Err(e) =
                self.ledger
                    .append(BOOK_EXECUTION_SLIPPAGE, today, "entry_slippage", now, fields)
            {
                warn!(error = %e, "slippage ledger append failed (ignored)");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Client order id for the entry leg: broker-side idempotency key.
pub fn entry_client_order_id(intent_id: &str) -> String {
    format!("{intent_id}:Entry")
}

/// Two-bar breakout-on-hold: the bar that closed above the pivot AND the next
/// bar holding above it. Exactly two closed bars required.
pub fn boh_confirmed(bars: &[Bar], pivot: f64) -> bool {
    if bars.len() < 2 {
        return false;
    }
    let second_last = &bars[bars.len() - 2];
    let last = &bars[bars.len() - 1];
    second_last.close > pivot && last.close > pivot
}

/// Risk-based sizing clipped by the remaining notional caps.
///
/// `Entry_DistPct` converts the per-trade dollar risk into a target notional;
/// the caps then clip it, and the entry price converts it to whole shares.
pub fn size_entry(
    cfg: &ExecutionConfig,
    equity: f64,
    candidate: &Candidate,
    gross_notional_remaining: f64,
    symbol_notional_remaining: f64,
) -> i64 {
    if candidate.entry_dist_pct <= 0.0 || candidate.entry_level <= 0.0 {
        return 0;
    }
    let penalty = if cfg.correlation_sizing_enabled {
        cfg.correlation_penalty
    } else {
        0.0
    };
    let risk_dollars = equity * cfg.base_risk_pct * cfg.risk_scale * (1.0 - penalty);
    let target_notional = risk_dollars / candidate.entry_dist_pct;
    let clipped = target_notional
        .min(gross_notional_remaining)
        .min(symbol_notional_remaining);
    (clipped / candidate.entry_level).floor() as i64
}

/// Uniform jitter in `[min, max]` seconds for the planned entry time.
fn jitter_secs(cfg: &ExecutionConfig) -> i64 {
    let (min, max) = (cfg.entry_jitter_min_secs, cfg.entry_jitter_max_secs);
    if max <= min {
        return min.max(0);
    }
    rand::thread_rng().gen_range(min..=max)
}

// =============================================================================
// Tests
// =============================================================================
