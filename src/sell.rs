// =============================================================================
// Sell/Exit Loop — phase-gated stops, R1/R2 trims, broker reconciliation
// =============================================================================
//
// Runs every cycle for every open position, regardless of the entry-side
// gates. Under the kill switch it keeps running: every action here reduces
// risk, never adds it.
//
// Stop source by session phase:
//
//   OpenNoise    — initial bracket stop only
//   EarlyTrend   — daily swing-low preferred; intraday higher-low only after
//                  the guardrails clear
//   Normal       — intraday higher-low primary, daily swing-low fallback
//   CloseProtect — frozen; no structure-based updates at all
//
// The trailing ratchet is absolute: a stop only ever tightens. Any computed
// level that would loosen risk is discarded (twice — here and in the store).
//
// Reconciliation compares the desired stop against the broker's resting
// orders and replaces only when strictly tighter, cancelling the superseded
// order first. `AlreadyExists` / `NotFound` races are convergent.
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::clock;
use crate::config::ExecutionConfig;
use crate::gates::GateDecision;
use crate::ledger::LedgerRouter;
use crate::market_data::{Bar, MarketData};
use crate::store::StateStore;
use crate::types::{MarketPhase, OrderPurpose, Position, SymbolPhase};

/// Price comparison slack for reconciling stop levels.
const STOP_EPSILON: f64 = 0.005;

/// What the exit side did this cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct SellOutcome {
    pub trims_submitted: u32,
    pub stops_updated: u32,
    pub exits_submitted: u32,
    pub errors: u32,
}

impl SellOutcome {
    pub fn is_material(&self) -> bool {
        self.trims_submitted > 0
            || self.stops_updated > 0
            || self.exits_submitted > 0
            || self.errors > 0
    }
}

/// Everything the exit loop needs for one cycle.
pub struct SellCycle<'a> {
    pub cfg: &'a ExecutionConfig,
    pub store: &'a StateStore,
    pub ledger: &'a LedgerRouter,
    pub market_data: &'a MarketData,
    pub broker: &'a Broker,
}

impl<'a> SellCycle<'a> {
    pub async fn run(&self, gate: &mut GateDecision, now: DateTime<Utc>) -> Result<SellOutcome> {
        let mut outcome = SellOutcome::default();

        for position in self.store.list_open_positions()? {
            if let Err(e) = self.manage_position(gate, &position, now, &mut outcome).await {
                // Exits are never blocked by recoverable errors; log, count,
                // move to the next symbol.
                warn!(symbol = %position.symbol, error = %e, "exit management failed for symbol");
                outcome.errors += 1;
            }
        }
        Ok(outcome)
    }

    async fn manage_position(
        &self,
        gate: &mut GateDecision,
        position: &Position,
        now: DateTime<Utc>,
        outcome: &mut SellOutcome,
    ) -> Result<()> {
        let today = clock::ny_date(now);

        // 1. Reconcile quantity with the broker first: a stop leg may have
        // filled since the last cycle.
        let position = match self.sync_qty_from_broker(position, today).await? {
            Some(p) => p,
            None => return Ok(()),
        };

        let last = match self.market_data.last_trade_price(&position.symbol).await {
            Ok(p) => p,
            Err(e) => {
                debug!(symbol = %position.symbol, error = %e, "no last trade — holding exit state");
                return Ok(());
            }
        };

        // 2. Engine-side stop trigger. The broker-resident stop is the first
        // line of defense; this covers modes without live stop legs.
        if last <= position.current_stop {
            self.trigger_stop_exit(gate, &position, today, now, outcome).await?;
            return Ok(());
        }

        // 3. Behavioral exits arm only after the post-fill delay.
        let armed = now - position.opened_ts_utc
            >= ChronoDuration::seconds(self.cfg.min_exit_arming_secs);
        if !armed {
            debug!(symbol = %position.symbol, "exit management not yet armed");
            return Ok(());
        }

        // 4. Trims at R1 / R2.
        self.maybe_trim(gate, &position, last, today, now, outcome).await?;

        // Refresh after a possible trim so stop updates see current qty.
        let Some(position) = self
            .store
            .get_position(&position.symbol, &position.strategy_id)?
        else {
            return Ok(());
        };
        if position.qty_open <= 0 {
            return Ok(());
        }

        // 5. Stop updates: structural by phase, trailing after R2.
        let phase = gate.phase;
        let desired = self.desired_stop(&position, phase, last, now).await?;
        if let Some(new_stop) = desired {
            if new_stop > position.current_stop
                && self.store.tighten_position_stop(
                    &position.symbol,
                    &position.strategy_id,
                    new_stop,
                    now,
                )?
            {
                info!(
                    symbol = %position.symbol,
                    old_stop = position.current_stop,
                    new_stop,
                    phase = %phase,
                    "stop tightened"
                );
                outcome.stops_updated += 1;
            }
        }

        // 6. Reconcile the (possibly unchanged) desired stop with the broker.
        let Some(position) = self
            .store
            .get_position(&position.symbol, &position.strategy_id)?
        else {
            return Ok(());
        };
        self.reconcile_stop_order(gate, &position, today, now).await?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Quantity sync
    // -------------------------------------------------------------------------

    /// Pull the broker's view of the position. A broker qty below ours means
    /// legs filled behind our back; zero means the position is gone.
    /// Returns `None` when the position closed.
    async fn sync_qty_from_broker(
        &self,
        position: &Position,
        today: chrono::NaiveDate,
    ) -> Result<Option<Position>> {
        // Dry-run has no broker positions to compare against.
        if matches!(self.broker, Broker::DryRun(_)) {
            return Ok(Some(position.clone()));
        }

        let broker_positions = match self.broker.list_positions().await {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "broker positions unavailable — keeping local view");
                return Ok(Some(position.clone()));
            }
        };

        let broker_qty = broker_positions
            .iter()
            .find(|p| p.symbol == position.symbol)
            .map(|p| p.qty)
            .unwrap_or(0);

        if broker_qty >= position.qty_open {
            return Ok(Some(position.clone()));
        }

        let sold = position.qty_open - broker_qty;
        warn!(
            symbol = %position.symbol,
            local_qty = position.qty_open,
            broker_qty,
            "broker reports fewer shares — syncing (leg filled externally)"
        );
        let remaining =
            self.store
                .reduce_position_qty(&position.symbol, &position.strategy_id, sold)?;
        if remaining == 0 {
            self.store.set_symbol_phase(
                today,
                &position.strategy_id,
                &position.symbol,
                SymbolPhase::Flat,
                None,
            )?;
            return Ok(None);
        }
        Ok(self.store.get_position(&position.symbol, &position.strategy_id)?)
    }

    // -------------------------------------------------------------------------
    // Stop trigger
    // -------------------------------------------------------------------------

    /// Price is at or through the stop: flatten what remains. Resting stop
    /// orders are cancelled first so the market sell cannot double-fill.
    async fn trigger_stop_exit(
        &self,
        gate: &GateDecision,
        position: &Position,
        today: chrono::NaiveDate,
        now: DateTime<Utc>,
        outcome: &mut SellOutcome,
    ) -> Result<()> {
        // Mark the lifecycle first so the entry side cannot touch the symbol
        // while the exit is in flight.
        self.store.set_symbol_phase(
            today,
            &position.strategy_id,
            &position.symbol,
            SymbolPhase::Exiting,
            None,
        )?;

        for order in self
            .broker
            .list_open_orders(Some(&position.symbol))
            .await
            .unwrap_or_default()
        {
            if order.order_type == "stop" {
                match self.broker.cancel(&order.id).await {
                    Ok(()) => {}
                    Err(e) if e.is_convergent() => {}
                    Err(e) => {
                        warn!(symbol = %position.symbol, error = %e, "stop cancel failed before exit");
                    }
                }
            }
        }

        let client_order_id = format!("{}:Exit", position.intent_id);
        match self
            .broker
            .submit_sell(&position.symbol, position.qty_open, &client_order_id)
            .await
        {
            Ok(order_id) => {
                let inserted = self.store.record_order_once(
                    &position.intent_id,
                    OrderPurpose::Exit,
                    &order_id,
                    "submitted",
                    today,
                    now,
                )?;
                if inserted {
                    self.append_order_record(gate, position, OrderPurpose::Exit, &order_id, position.qty_open, today, now);
                }
                self.store.reduce_position_qty(
                    &position.symbol,
                    &position.strategy_id,
                    position.qty_open,
                )?;
                self.store.set_symbol_phase(
                    today,
                    &position.strategy_id,
                    &position.symbol,
                    SymbolPhase::Flat,
                    None,
                )?;
                info!(
                    symbol = %position.symbol,
                    qty = position.qty_open,
                    stop = position.current_stop,
                    "STOP EXIT — position flattened"
                );
                outcome.exits_submitted += 1;
            }
            Err(BrokerError::AlreadyExists(_)) => {
                // Replay: the exit already went out; converge quietly.
                self.store.reduce_position_qty(
                    &position.symbol,
                    &position.strategy_id,
                    position.qty_open,
                )?;
            }
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "stop exit submission failed — retrying next cycle");
                outcome.errors += 1;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Trims
    // -------------------------------------------------------------------------

    async fn maybe_trim(
        &self,
        gate: &GateDecision,
        position: &Position,
        last: f64,
        today: chrono::NaiveDate,
        now: DateTime<Utc>,
        outcome: &mut SellOutcome,
    ) -> Result<()> {
        let intent = self.store.get_intent(&position.intent_id)?;
        let Some(intent) = intent else {
            debug!(symbol = %position.symbol, "no intent row for position — skipping trims");
            return Ok(());
        };

        if !position.r1_done && last >= intent.r1 {
            let done = self
                .submit_trim(
                    gate,
                    position,
                    OrderPurpose::TrimR1,
                    self.cfg.trim_fraction_r1,
                    today,
                    now,
                    outcome,
                )
                .await?;
            if done {
                self.store.mark_r1_done(&position.symbol, &position.strategy_id)?;
            }
        }

        // Re-read so the R2 fraction applies to post-R1 remaining quantity.
        let Some(position) = self
            .store
            .get_position(&position.symbol, &position.strategy_id)?
        else {
            return Ok(());
        };
        if position.qty_open > 0 && position.r1_done && !position.r2_done && last >= intent.r2 {
            let done = self
                .submit_trim(
                    gate,
                    &position,
                    OrderPurpose::TrimR2,
                    self.cfg.trim_fraction_r2,
                    today,
                    now,
                    outcome,
                )
                .await?;
            if done {
                self.store.mark_r2_done(&position.symbol, &position.strategy_id)?;
            }
        }
        Ok(())
    }

    /// One trim, idempotent on `(intent_id, purpose)`. A partial-fill replay
    /// never re-trims: once the purpose is in the order ledger it stays
    /// consumed. Returns whether the trim is durably done (submitted now or
    /// previously); a transient failure returns `false` so it retries.
    async fn submit_trim(
        &self,
        gate: &GateDecision,
        position: &Position,
        purpose: OrderPurpose,
        fraction: f64,
        today: chrono::NaiveDate,
        now: DateTime<Utc>,
        outcome: &mut SellOutcome,
    ) -> Result<bool> {
        if self.store.get_order(&position.intent_id, purpose)?.is_some() {
            debug!(symbol = %position.symbol, purpose = %purpose, "trim already recorded — skipping");
            return Ok(true);
        }

        let qty = ((position.qty_open as f64) * fraction).floor() as i64;
        let qty = qty.clamp(1, position.qty_open);
        let client_order_id = format!("{}:{}", position.intent_id, purpose.as_str());

        match self
            .broker
            .submit_sell(&position.symbol, qty, &client_order_id)
            .await
        {
            Ok(order_id) => {
                let inserted = self.store.record_order_once(
                    &position.intent_id,
                    purpose,
                    &order_id,
                    "submitted",
                    today,
                    now,
                )?;
                if inserted {
                    self.append_order_record(gate, position, purpose, &order_id, qty, today, now);
                }
                self.store
                    .reduce_position_qty(&position.symbol, &position.strategy_id, qty)?;
                info!(
                    symbol = %position.symbol,
                    purpose = %purpose,
                    qty,
                    "trim submitted"
                );
                outcome.trims_submitted += 1;
            }
            Err(BrokerError::AlreadyExists(_)) => {
                // The broker saw this trim in a previous life.
                self.store.record_order_once(
                    &position.intent_id,
                    purpose,
                    &client_order_id,
                    "submitted",
                    today,
                    now,
                )?;
                self.store
                    .reduce_position_qty(&position.symbol, &position.strategy_id, qty)?;
            }
            Err(e) if e.is_retriable() => {
                warn!(symbol = %position.symbol, purpose = %purpose, error = %e, "trim failed transiently — retrying next cycle");
                outcome.errors += 1;
                return Ok(false);
            }
            Err(e) => {
                warn!(symbol = %position.symbol, purpose = %purpose, error = %e, "trim rejected");
                outcome.errors += 1;
                return Ok(false);
            }
        }
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Stop computation
    // -------------------------------------------------------------------------

    /// The stop the position should have right now, by session phase.
    /// `None` = keep the current stop.
    async fn desired_stop(
        &self,
        position: &Position,
        phase: MarketPhase,
        last: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        // OpenNoise rides the initial bracket stop; CloseProtect freezes
        // whatever is in force. No updates of any kind in either phase.
        if matches!(phase, MarketPhase::OpenNoise | MarketPhase::CloseProtect) {
            return Ok(None);
        }

        // After R2, the trail takes over in any phase that allows updates.
        let trailing = if position.r2_done {
            self.store
                .get_intent(&position.intent_id)?
                .map(|i| trailing_stop_after_r2(last, i.r1, i.r2))
        } else {
            None
        };

        let structural = match phase {
            MarketPhase::EarlyTrend => {
                let daily = self.daily_structural_stop(position, now).await;
                match daily {
                    Some(s) => Some(s),
                    None => self.intraday_structural_stop(position, now).await,
                }
            }
            MarketPhase::Normal => {
                let intraday = self.intraday_structural_stop(position, now).await;
                match intraday {
                    Some(s) => Some(s),
                    None => self.daily_structural_stop(position, now).await,
                }
            }
            // The exit loop only sees open-market phases; anything else
            // freezes the stop.
            _ => None,
        };

        Ok(match (trailing, structural) {
            (Some(t), Some(s)) => Some(t.max(s)),
            (Some(t), None) => Some(t),
            (None, s) => s,
        })
    }

    /// Swing low from completed daily bars, if it clears the distance
    /// guardrail.
    async fn daily_structural_stop(&self, position: &Position, now: DateTime<Utc>) -> Option<f64> {
        let bars = self
            .market_data
            .daily_bars(&position.symbol, 10, now)
            .await
            .ok()?;
        let swing = daily_swing_low(&bars)?;
        structural_guardrail_ok(self.cfg, position.avg_entry, swing).then_some(swing)
    }

    /// Intraday higher-low from 10-minute bars, gated by the bars-since-entry
    /// and minutes-since-entry guardrails.
    async fn intraday_structural_stop(
        &self,
        position: &Position,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let elapsed = now - position.opened_ts_utc;
        if elapsed < ChronoDuration::minutes(self.cfg.min_minutes_since_entry) {
            return None;
        }
        let bars = self
            .market_data
            .closed_10m_bars(&position.symbol, 30, now)
            .await
            .ok()?;
        let since_entry: Vec<Bar> = bars
            .into_iter()
            .filter(|b| b.ts_utc >= position.opened_ts_utc)
            .collect();
        if (since_entry.len() as u32) < self.cfg.min_bars_since_entry {
            return None;
        }
        let hl = intraday_higher_low(&since_entry)?;
        structural_guardrail_ok(self.cfg, position.avg_entry, hl).then_some(hl)
    }

    // -------------------------------------------------------------------------
    // Broker-side stop reconciliation
    // -------------------------------------------------------------------------

    /// Make the broker's resting stop match `position.current_stop` for the
    /// remaining quantity. Replacement happens only when strictly tighter;
    /// cancel precedes submit; convergent races are tolerated; on a failed
    /// replacement the old level is restored so there is never "no stop".
    async fn reconcile_stop_order(
        &self,
        gate: &GateDecision,
        position: &Position,
        today: chrono::NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // Dry-run: nothing rests at a broker.
        if matches!(self.broker, Broker::DryRun(_)) {
            return Ok(());
        }

        let orders = match self.broker.list_open_orders(Some(&position.symbol)).await {
            Ok(o) => o,
            Err(e) => {
                debug!(symbol = %position.symbol, error = %e, "open orders unavailable — skipping reconcile");
                return Ok(());
            }
        };
        let resting: Vec<_> = orders
            .into_iter()
            .filter(|o| o.order_type == "stop" && o.side == "sell")
            .collect();

        let current = resting
            .iter()
            .filter_map(|o| o.stop_price)
            .fold(f64::NEG_INFINITY, f64::max);

        // Converged: a resting stop at (or within epsilon of) the desired
        // level, covering the remaining quantity.
        let qty_covered: i64 = resting.iter().map(|o| o.qty).sum();
        if current >= position.current_stop - STOP_EPSILON && qty_covered >= position.qty_open {
            return Ok(());
        }

        // Cancel superseded stops first.
        for order in &resting {
            match self.broker.cancel(&order.id).await {
                Ok(()) => debug!(
                    symbol = %position.symbol,
                    order_id = %order.id,
                    stop = ?order.stop_price,
                    limit = ?order.limit_price,
                    "superseded stop cancelled"
                ),
                Err(e) if e.is_convergent() => {}
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "stop cancel failed — keeping existing stop");
                    return Ok(());
                }
            }
        }

        let client_order_id = format!(
            "{}:StopUpdate:{:.2}",
            position.intent_id, position.current_stop
        );
        match self
            .broker
            .submit_stop(
                &position.symbol,
                position.qty_open,
                position.current_stop,
                &client_order_id,
            )
            .await
        {
            Ok(order_id) => {
                let inserted = self.store.record_order_once(
                    &position.intent_id,
                    OrderPurpose::StopUpdate,
                    &order_id,
                    "submitted",
                    today,
                    now,
                )?;
                if !inserted {
                    // Later updates replace the external id under the same
                    // idempotency key.
                    self.store.update_external_order_id(
                        &position.intent_id,
                        OrderPurpose::StopUpdate,
                        &order_id,
                        "submitted",
                        now,
                    )?;
                } else {
                    self.append_order_record(
                        gate,
                        position,
                        OrderPurpose::StopUpdate,
                        &order_id,
                        position.qty_open,
                        today,
                        now,
                    );
                }
                debug!(symbol = %position.symbol, stop = position.current_stop, "stop order reconciled");
            }
            Err(BrokerError::AlreadyExists(_)) => {}
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "stop replacement failed — restoring previous level");
                // Never leave the position uncovered: put back a stop at the
                // last known good level.
                if current.is_finite() {
                    let restore_id = format!("{}:StopRestore:{current:.2}", position.intent_id);
                    if let Err(e) = self
                        .broker
                        .submit_stop(&position.symbol, position.qty_open, current, &restore_id)
                        .await
                    {
                        if !e.is_convergent() {
                            warn!(symbol = %position.symbol, error = %e, "stop restore also failed");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Ledger plumbing
    // -------------------------------------------------------------------------

    fn append_order_record(
        &self,
        gate: &GateDecision,
        position: &Position,
        purpose: OrderPurpose,
        order_id: &str,
        qty: i64,
        today: chrono::NaiveDate,
        now: DateTime<Utc>,
    ) {
        // Scan before append: the (intent_id, purpose) natural key must
        // appear at most once per book per day.
        let book = gate.mode.book_id();
        let already = self
            .ledger
            .has_matching(book, today, |v| {
                v.get("record_type").and_then(serde_json::Value::as_str) == Some("order_submitted")
                    && v.get("intent_id").and_then(serde_json::Value::as_str)
                        == Some(position.intent_id.as_str())
                    && v.get("purpose").and_then(serde_json::Value::as_str)
                        == Some(purpose.as_str())
            })
            .unwrap_or(false);
        if already {
            return;
        }

        let mut fields = serde_json::Map::new();
        fields.insert("intent_id".into(), json!(position.intent_id));
        fields.insert("symbol".into(), json!(position.symbol));
        fields.insert("strategy_id".into(), json!(position.strategy_id));
        fields.insert("purpose".into(), json!(purpose.as_str()));
        fields.insert("order_id".into(), json!(order_id));
        fields.insert("qty".into(), json!(qty));
        fields.insert("stop".into(), json!(position.current_stop));
        if let Err(e) = self.ledger.append(book, today, "order_submitted", now, fields) {
            warn!(error = %e, "exit order ledger append failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Pure structure helpers
// ---------------------------------------------------------------------------

/// Latest local minimum in completed daily bars: a bar whose low undercuts
/// both neighbors.
pub fn daily_swing_low(bars: &[Bar]) -> Option<f64> {
    if bars.len() < 3 {
        return None;
    }
    for i in (1..bars.len() - 1).rev() {
        if bars[i].low < bars[i - 1].low && bars[i].low < bars[i + 1].low {
            return Some(bars[i].low);
        }
    }
    None
}

/// Latest higher-low in intraday bars: the most recent local minimum that
/// sits above an earlier local minimum. A flat or lower low is not structure
/// worth tightening to.
pub fn intraday_higher_low(bars: &[Bar]) -> Option<f64> {
    if bars.len() < 3 {
        return None;
    }
    let mut lows = Vec::new();
    for i in 1..bars.len() - 1 {
        if bars[i].low < bars[i - 1].low && bars[i].low < bars[i + 1].low {
            lows.push(bars[i].low);
        }
    }
    match lows.as_slice() {
        [.., prev, last] if last > prev => Some(*last),
        _ => None,
    }
}

/// Structural stops may not crowd the entry: the level must keep at least
/// `min_stop_distance_pct` of room below the average entry price.
pub fn structural_guardrail_ok(cfg: &ExecutionConfig, avg_entry: f64, stop: f64) -> bool {
    stop <= avg_entry * (1.0 - cfg.min_stop_distance_pct / 100.0)
}

/// Post-R2 trail: give back at most the R1→R2 leg from the latest price.
pub fn trailing_stop_after_r2(last: f64, r1: f64, r2: f64) -> f64 {
    last - (r2 - r1)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperSimBroker;
    use crate::gates;
    use crate::market_data::FixtureMarketData;
    use crate::types::{EntryIntent, IntentStatus, PositionState};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn bar_hl(t: &str, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            ts_utc: ts(t),
            open: close,
            high,
            low,
            close,
            volume: 1000,
        }
    }

    #[test]
    fn daily_swing_low_finds_local_minimum() {
        let bars = vec![
            bar_hl("2025-05-27T04:00:00Z", 186.0, 183.0, 185.0),
            bar_hl("2025-05-28T04:00:00Z", 185.0, 181.0, 184.0), // local min
            bar_hl("2025-05-29T04:00:00Z", 187.0, 182.5, 186.5),
        ];
        assert_eq!(daily_swing_low(&bars), Some(181.0));
        assert_eq!(daily_swing_low(&bars[..2]), None);
    }

    #[test]
    fn intraday_higher_low_requires_rising_structure() {
        // Two local minima, second higher: structure.
        let rising = vec![
            bar_hl("2025-06-02T14:00:00Z", 186.0, 184.0, 185.5),
            bar_hl("2025-06-02T14:10:00Z", 185.5, 183.0, 185.0), // min 183
            bar_hl("2025-06-02T14:20:00Z", 186.5, 184.5, 186.0),
            bar_hl("2025-06-02T14:30:00Z", 186.0, 183.8, 185.8), // min 183.8 (higher)
            bar_hl("2025-06-02T14:40:00Z", 187.0, 185.0, 186.8),
        ];
        assert_eq!(intraday_higher_low(&rising), Some(183.8));

        // Second minimum lower: no higher-low.
        let falling = vec![
            bar_hl("2025-06-02T14:00:00Z", 186.0, 184.0, 185.5),
            bar_hl("2025-06-02T14:10:00Z", 185.5, 183.0, 185.0),
            bar_hl("2025-06-02T14:20:00Z", 186.5, 184.5, 186.0),
            bar_hl("2025-06-02T14:30:00Z", 186.0, 182.0, 185.8),
            bar_hl("2025-06-02T14:40:00Z", 187.0, 185.0, 186.8),
        ];
        assert_eq!(intraday_higher_low(&falling), None);

        // One minimum only: not enough structure.
        assert_eq!(intraday_higher_low(&rising[..3]), None);
    }

    #[test]
    fn guardrail_keeps_room_below_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ExecutionConfig::for_tests(dir.path());
        // 1.5% of 185 = 2.775; the stop must sit at or below 182.225.
        assert!(structural_guardrail_ok(&cfg, 185.0, 182.0));
        assert!(!structural_guardrail_ok(&cfg, 185.0, 184.0));
    }

    #[test]
    fn trailing_stop_gives_back_the_r2_leg() {
        // R1=188, R2=192: leg of 4. At 195 the trail sits at 191.
        assert_eq!(trailing_stop_after_r2(195.0, 188.0, 192.0), 191.0);
    }

    // -------------------------------------------------------------------------
    // Cycle-level tests
    // -------------------------------------------------------------------------

    struct Rig {
        _dir: tempfile::TempDir,
        cfg: ExecutionConfig,
        store: StateStore,
        ledger: LedgerRouter,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ExecutionConfig::for_tests(dir.path());
        std::fs::create_dir_all(cfg.candidates_csv.parent().unwrap()).unwrap();
        std::fs::write(&cfg.candidates_csv, "Symbol\n").unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let ledger = LedgerRouter::new(cfg.ledger_dir());
        Rig {
            _dir: dir,
            cfg,
            store,
            ledger,
        }
    }

    fn now() -> DateTime<Utc> {
        ts("2025-06-02T15:00:00Z") // 11:00 ET, Normal phase
    }

    fn today() -> chrono::NaiveDate {
        clock::ny_date(now())
    }

    /// Open a 100-share AAPL position via the paper-sim broker so broker and
    /// store agree, with the intent row present for trim targets.
    async fn seed_position(rig: &Rig, broker: &Broker) -> Position {
        let intent_id = EntryIntent::deterministic_id(today(), "S1_AVWAP_CORE", "AAPL", 185.0);
        let intent = EntryIntent {
            intent_id: intent_id.clone(),
            ny_date: today(),
            symbol: "AAPL".into(),
            strategy_id: "S1_AVWAP_CORE".into(),
            pivot: 185.0,
            stop: 180.0,
            r1: 188.0,
            r2: 192.0,
            quantity: 100,
            planned_entry_time_utc: now() - ChronoDuration::hours(1),
            status: IntentStatus::Filled,
        };
        rig.store.put_entry_intent(&intent, now()).unwrap();
        rig.store
            .set_intent_status(&intent_id, IntentStatus::Filled, now())
            .unwrap();

        broker
            .submit_bracket(&crate::broker::BracketSpec {
                symbol: "AAPL".into(),
                qty: 100,
                limit_price: Some(185.0),
                stop_loss: 180.0,
                take_profit: 192.0,
                client_order_id: format!("{intent_id}:Entry"),
            })
            .await
            .unwrap();

        let position = Position {
            symbol: "AAPL".into(),
            strategy_id: "S1_AVWAP_CORE".into(),
            intent_id,
            qty_open: 100,
            avg_entry: 185.0,
            initial_stop: 180.0,
            current_stop: 180.0,
            r1_done: false,
            r2_done: false,
            state: PositionState::Open,
            // Opened over an hour ago: exits are armed, guardrail minutes met.
            opened_ts_utc: now() - ChronoDuration::hours(1),
            last_structure_ts_utc: None,
        };
        rig.store.upsert_position(&position).unwrap();
        position
    }

    fn fixture(last: f64) -> MarketData {
        let mut f = FixtureMarketData::new();
        f.set_last_trade("AAPL", last);
        f.set_intraday("AAPL", Vec::new());
        f.set_daily("AAPL", Vec::new());
        MarketData::Fixture(f)
    }

    async fn run_sell(
        rig: &Rig,
        md: &MarketData,
        broker: &Broker,
        at: DateTime<Utc>,
    ) -> (GateDecision, SellOutcome) {
        let mut gate = gates::evaluate(&rig.cfg, &rig.store, at).unwrap();
        // Pin the phase: gate evaluation under ignore_market_hours reflects
        // the actual clock, tests want the phase at `at`.
        gate.phase = clock::market_phase(at);
        let cycle = SellCycle {
            cfg: &rig.cfg,
            store: &rig.store,
            ledger: &rig.ledger,
            market_data: md,
            broker,
        };
        let outcome = cycle.run(&mut gate, at).await.unwrap();
        (gate, outcome)
    }

    #[tokio::test]
    async fn r1_trim_sells_half_once() {
        let rig = rig();
        let broker = Broker::PaperSim(PaperSimBroker::new(100_000.0));
        let pos = seed_position(&rig, &broker).await;
        let md = fixture(188.2); // above R1, below R2

        let (_, outcome) = run_sell(&rig, &md, &broker, now()).await;
        assert_eq!(outcome.trims_submitted, 1);

        let p = rig.store.get_position("AAPL", "S1_AVWAP_CORE").unwrap().unwrap();
        assert!(p.r1_done);
        assert!(!p.r2_done);
        assert_eq!(p.qty_open, 50);

        // Replay the same cycle: the trim purpose is consumed.
        let (_, outcome) = run_sell(&rig, &md, &broker, now()).await;
        assert_eq!(outcome.trims_submitted, 0);
        let p = rig.store.get_position("AAPL", "S1_AVWAP_CORE").unwrap().unwrap();
        assert_eq!(p.qty_open, 50);

        assert!(rig
            .store
            .get_order(&pos.intent_id, OrderPurpose::TrimR1)
            .unwrap()
            .is_some());
        assert!(rig
            .store
            .get_order(&pos.intent_id, OrderPurpose::TrimR2)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn r2_trim_then_trailing_then_exit() {
        let rig = rig();
        let broker = Broker::PaperSim(PaperSimBroker::new(100_000.0));
        let pos = seed_position(&rig, &broker).await;

        // R1 leg.
        let (_, o) = run_sell(&rig, &fixture(188.2), &broker, now()).await;
        assert_eq!(o.trims_submitted, 1);

        // R2 leg: trims half of the remaining 50, then the trail arms.
        let t2 = now() + ChronoDuration::minutes(10);
        let (_, o) = run_sell(&rig, &fixture(192.5), &broker, t2).await;
        assert_eq!(o.trims_submitted, 1);
        let p = rig.store.get_position("AAPL", "S1_AVWAP_CORE").unwrap().unwrap();
        assert!(p.r2_done);
        assert_eq!(p.qty_open, 25);

        // Price runs: the trail ratchets (195.0 - (192-188) = 191.0).
        let t3 = now() + ChronoDuration::minutes(20);
        let (_, o) = run_sell(&rig, &fixture(195.0), &broker, t3).await;
        assert!(o.stops_updated >= 1);
        let p = rig.store.get_position("AAPL", "S1_AVWAP_CORE").unwrap().unwrap();
        assert_eq!(p.current_stop, 191.0);

        // Pullback through the trail: the remainder exits.
        let t4 = now() + ChronoDuration::minutes(30);
        let (_, o) = run_sell(&rig, &fixture(190.5), &broker, t4).await;
        assert_eq!(o.exits_submitted, 1);
        let p = rig.store.get_position("AAPL", "S1_AVWAP_CORE").unwrap().unwrap();
        assert_eq!(p.qty_open, 0);
        assert_eq!(p.state, PositionState::Closed);

        // Exactly one record per purpose, idempotent under replay.
        for purpose in [OrderPurpose::TrimR1, OrderPurpose::TrimR2, OrderPurpose::Exit] {
            assert!(
                rig.store.get_order(&pos.intent_id, purpose).unwrap().is_some(),
                "missing {purpose} record"
            );
        }
        let (_, o) = run_sell(&rig, &fixture(190.5), &broker, t4).await;
        assert_eq!(o.exits_submitted, 0);
        assert_eq!(o.trims_submitted, 0);
    }

    #[tokio::test]
    async fn stop_never_loosens() {
        let rig = rig();
        let broker = Broker::PaperSim(PaperSimBroker::new(100_000.0));
        seed_position(&rig, &broker).await;

        // Tighten to 182 by hand, then present structure that computes lower.
        rig.store
            .tighten_position_stop("AAPL", "S1_AVWAP_CORE", 182.0, now())
            .unwrap();

        let mut f = FixtureMarketData::new();
        f.set_last_trade("AAPL", 186.0);
        f.set_intraday("AAPL", Vec::new());
        // Swing low at 181 — below the current stop; must be discarded.
        f.set_daily(
            "AAPL",
            vec![
                bar_hl("2025-05-27T04:00:00Z", 186.0, 183.0, 185.0),
                bar_hl("2025-05-28T04:00:00Z", 185.0, 181.0, 184.0),
                bar_hl("2025-05-29T04:00:00Z", 187.0, 182.5, 186.5),
            ],
        );
        let md = MarketData::Fixture(f);

        run_sell(&rig, &md, &broker, now()).await;
        let p = rig.store.get_position("AAPL", "S1_AVWAP_CORE").unwrap().unwrap();
        assert_eq!(p.current_stop, 182.0, "stop must not loosen from 182 to 181");
    }

    #[tokio::test]
    async fn exits_run_under_kill_switch() {
        let rig = rig();
        std::fs::create_dir_all(&rig.cfg.state_dir).unwrap();
        std::fs::write(rig.cfg.kill_switch_path(), "").unwrap();

        let broker = Broker::PaperSim(PaperSimBroker::new(100_000.0));
        seed_position(&rig, &broker).await;

        // Stop triggered while the kill switch is on: the exit still fires.
        let (gate, outcome) = run_sell(&rig, &fixture(179.5), &broker, now()).await;
        assert!(!gate.entries_allowed);
        assert_eq!(outcome.exits_submitted, 1);
        let p = rig.store.get_position("AAPL", "S1_AVWAP_CORE").unwrap().unwrap();
        assert_eq!(p.qty_open, 0);
    }

    #[tokio::test]
    async fn close_protect_freezes_structural_stops() {
        let rig = rig();
        let broker = Broker::PaperSim(PaperSimBroker::new(100_000.0));
        seed_position(&rig, &broker).await;

        // 15:45 ET — CloseProtect. Structure says 182, but the phase freezes
        // stops.
        let late = ts("2025-06-02T19:45:00Z");
        let mut f = FixtureMarketData::new();
        f.set_last_trade("AAPL", 186.0);
        f.set_intraday("AAPL", Vec::new());
        f.set_daily(
            "AAPL",
            vec![
                bar_hl("2025-05-27T04:00:00Z", 186.0, 183.5, 185.0),
                bar_hl("2025-05-28T04:00:00Z", 185.0, 182.0, 184.0),
                bar_hl("2025-05-29T04:00:00Z", 187.0, 183.0, 186.5),
            ],
        );
        let md = MarketData::Fixture(f);

        let (gate, outcome) = run_sell(&rig, &md, &broker, late).await;
        assert_eq!(gate.phase, MarketPhase::CloseProtect);
        assert_eq!(outcome.stops_updated, 0);
        let p = rig.store.get_position("AAPL", "S1_AVWAP_CORE").unwrap().unwrap();
        assert_eq!(p.current_stop, 180.0);
    }

    #[tokio::test]
    async fn normal_phase_tightens_to_daily_swing_low() {
        let rig = rig();
        let broker = Broker::PaperSim(PaperSimBroker::new(100_000.0));
        seed_position(&rig, &broker).await;

        let mut f = FixtureMarketData::new();
        f.set_last_trade("AAPL", 186.0);
        f.set_intraday("AAPL", Vec::new()); // no intraday structure yet
        f.set_daily(
            "AAPL",
            vec![
                bar_hl("2025-05-27T04:00:00Z", 186.0, 183.5, 185.0),
                bar_hl("2025-05-28T04:00:00Z", 185.0, 182.0, 184.0), // swing low 182
                bar_hl("2025-05-29T04:00:00Z", 187.0, 183.0, 186.5),
            ],
        );
        let md = MarketData::Fixture(f);

        let (_, outcome) = run_sell(&rig, &md, &broker, now()).await;
        assert_eq!(outcome.stops_updated, 1);
        let p = rig.store.get_position("AAPL", "S1_AVWAP_CORE").unwrap().unwrap();
        assert_eq!(p.current_stop, 182.0);

        // The broker-side stop leg was replaced with the tighter level.
        let orders = broker.list_open_orders(Some("AAPL")).await.unwrap();
        let stops: Vec<_> = orders.iter().filter(|o| o.order_type == "stop").collect();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].stop_price, Some(182.0));
    }
}
