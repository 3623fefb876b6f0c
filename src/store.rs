// =============================================================================
// State Store — single-writer embedded SQLite + on-disk writer lock
// =============================================================================
//
// Owns every table behind the execution engine: candidates, entry intents,
// positions, the order ledger, per-symbol lifecycle, consumed entries, and
// the alert throttle. All mutation happens on one connection held by one
// process; the exclusive lock file makes a second instance refuse to start.
//
// Store errors are fatal to the process (the supervisor restarts it); this
// module therefore returns `anyhow::Result` and never tries to limp along.
//
// Schema evolution is forward-only: an integer version in `meta`, and a list
// of idempotent migration batches applied at open.
// =============================================================================

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::types::{
    Candidate, EntryIntent, IntentStatus, OrderPurpose, Position, PositionState, SymbolPhase,
};

// ---------------------------------------------------------------------------
// Writer lock
// ---------------------------------------------------------------------------

/// Exclusive on-disk lock. Holding it is the precondition for opening the
/// store read-write; it is removed on drop (normal shutdown) and goes stale
/// only on a hard kill, where the operator removes it by hand.
#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating lock dir {} failed", parent.display()))?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                bail!("writer lock already held: {}", path.display());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("creating lock {} failed", path.display()))
            }
        };
        let _ = writeln!(file, "{}", std::process::id());
        info!(path = %path.display(), "writer lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove writer lock");
        }
    }
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Forward-only migration batches. Index + 1 is the schema version the batch
/// brings the database to.
const MIGRATIONS: &[&str] = &[
    // v1: full initial schema.
    "
    CREATE TABLE IF NOT EXISTS candidates (
        ny_date        TEXT NOT NULL,
        symbol         TEXT NOT NULL,
        strategy_id    TEXT NOT NULL,
        entry_level    REAL NOT NULL,
        stop_loss      REAL NOT NULL,
        target_r1      REAL NOT NULL,
        target_r2      REAL NOT NULL,
        entry_dist_pct REAL NOT NULL,
        loaded_ts_utc  TEXT NOT NULL,
        PRIMARY KEY (ny_date, symbol, strategy_id)
    );
    CREATE TABLE IF NOT EXISTS entry_intents (
        intent_id              TEXT PRIMARY KEY,
        ny_date                TEXT NOT NULL,
        symbol                 TEXT NOT NULL,
        strategy_id            TEXT NOT NULL,
        pivot                  REAL NOT NULL,
        stop                   REAL NOT NULL,
        r1                     REAL NOT NULL,
        r2                     REAL NOT NULL,
        quantity               INTEGER NOT NULL,
        planned_entry_time_utc TEXT NOT NULL,
        status                 TEXT NOT NULL,
        revision               INTEGER NOT NULL DEFAULT 1,
        created_ts_utc         TEXT NOT NULL,
        updated_ts_utc         TEXT NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS uq_intents_open
        ON entry_intents (ny_date, symbol, strategy_id)
        WHERE status IN ('Scheduled', 'Submitted');
    CREATE TABLE IF NOT EXISTS positions (
        symbol                TEXT NOT NULL,
        strategy_id           TEXT NOT NULL,
        intent_id             TEXT NOT NULL,
        qty_open              INTEGER NOT NULL,
        avg_entry             REAL NOT NULL,
        initial_stop          REAL NOT NULL,
        current_stop          REAL NOT NULL,
        r1_done               INTEGER NOT NULL DEFAULT 0,
        r2_done               INTEGER NOT NULL DEFAULT 0,
        state                 TEXT NOT NULL,
        opened_ts_utc         TEXT NOT NULL,
        last_structure_ts_utc TEXT,
        revision              INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (symbol, strategy_id)
    );
    CREATE TABLE IF NOT EXISTS order_ledger (
        intent_id       TEXT NOT NULL,
        purpose         TEXT NOT NULL,
        broker_order_id TEXT NOT NULL,
        status          TEXT NOT NULL,
        ny_date         TEXT NOT NULL,
        ts_utc          TEXT NOT NULL,
        PRIMARY KEY (intent_id, purpose)
    );
    CREATE TABLE IF NOT EXISTS symbol_lifecycle (
        ny_date                 TEXT NOT NULL,
        strategy_id             TEXT NOT NULL,
        symbol                  TEXT NOT NULL,
        phase                   TEXT NOT NULL,
        cooldown_expires_ts_utc TEXT,
        PRIMARY KEY (ny_date, strategy_id, symbol)
    );
    CREATE TABLE IF NOT EXISTS consumed_entries (
        ny_date     TEXT NOT NULL,
        strategy_id TEXT NOT NULL,
        symbol      TEXT NOT NULL,
        ts_utc      TEXT NOT NULL,
        PRIMARY KEY (ny_date, strategy_id, symbol)
    );
    CREATE TABLE IF NOT EXISTS alerts_sent (
        ny_date TEXT NOT NULL,
        reason  TEXT NOT NULL,
        ts_utc  TEXT NOT NULL,
        PRIMARY KEY (ny_date, reason)
    );
    ",
];

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct StateStore {
    conn: Connection,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open (creating if needed) and migrate the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating db dir {} failed", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening state store {} failed", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key   TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', 0);",
        )?;

        let current: i64 = self.conn.query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |r| r.get(0),
        )?;

        for (idx, batch) in MIGRATIONS.iter().enumerate() {
            let target = (idx + 1) as i64;
            if target <= current {
                continue;
            }
            self.conn
                .execute_batch(&format!("BEGIN; {batch} COMMIT;"))
                .with_context(|| format!("migration to schema v{target} failed"))?;
            self.conn.execute(
                "UPDATE meta SET value = ?1 WHERE key = 'schema_version'",
                params![target],
            )?;
            info!(version = target, "state store migrated");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Candidates
    // -------------------------------------------------------------------------

    pub fn upsert_candidate(
        &self,
        date: NaiveDate,
        c: &Candidate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO candidates
                 (ny_date, symbol, strategy_id, entry_level, stop_loss,
                  target_r1, target_r2, entry_dist_pct, loaded_ts_utc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (ny_date, symbol, strategy_id) DO UPDATE SET
                 entry_level = excluded.entry_level,
                 stop_loss = excluded.stop_loss,
                 target_r1 = excluded.target_r1,
                 target_r2 = excluded.target_r2,
                 entry_dist_pct = excluded.entry_dist_pct,
                 loaded_ts_utc = excluded.loaded_ts_utc",
            params![
                date.to_string(),
                c.symbol,
                c.strategy_id,
                c.entry_level,
                c.stop_loss,
                c.target_r1,
                c.target_r2,
                c.entry_dist_pct,
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_active_candidates(&self, date: NaiveDate) -> Result<Vec<Candidate>> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol, strategy_id, entry_level, stop_loss, target_r1, target_r2,
                    entry_dist_pct
             FROM candidates WHERE ny_date = ?1 ORDER BY symbol",
        )?;
        let rows = stmt.query_map(params![date.to_string()], |r| {
            Ok(Candidate {
                symbol: r.get(0)?,
                strategy_id: r.get(1)?,
                entry_level: r.get(2)?,
                stop_loss: r.get(3)?,
                target_r1: r.get(4)?,
                target_r2: r.get(5)?,
                entry_dist_pct: r.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Day-scoped expiration: candidates from any other NY date are dropped.
    pub fn purge_stale_candidates(&self, today: NaiveDate) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM candidates WHERE ny_date != ?1",
            params![today.to_string()],
        )?;
        if n > 0 {
            debug!(purged = n, "stale candidates removed");
        }
        Ok(n)
    }

    // -------------------------------------------------------------------------
    // Entry intents
    // -------------------------------------------------------------------------

    /// Insert an intent; if the deterministic id already exists, return the
    /// stored row unchanged. This is what makes intent creation idempotent
    /// across restarts.
    pub fn put_entry_intent(&self, intent: &EntryIntent, now: DateTime<Utc>) -> Result<EntryIntent> {
        self.conn.execute(
            "INSERT OR IGNORE INTO entry_intents
                 (intent_id, ny_date, symbol, strategy_id, pivot, stop, r1, r2,
                  quantity, planned_entry_time_utc, status, created_ts_utc, updated_ts_utc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                intent.intent_id,
                intent.ny_date.to_string(),
                intent.symbol,
                intent.strategy_id,
                intent.pivot,
                intent.stop,
                intent.r1,
                intent.r2,
                intent.quantity,
                intent.planned_entry_time_utc.to_rfc3339(),
                intent.status.as_str(),
                now.to_rfc3339(),
            ],
        )?;
        if let Some(stored) = self.get_intent(&intent.intent_id)? {
            return Ok(stored);
        }
        // The partial unique index rejected a second non-terminal intent for
        // the same (ny_date, symbol, strategy_id); hand back the open one.
        self.open_intent_for(intent.ny_date, &intent.symbol, &intent.strategy_id)?
            .context("intent insert ignored but no open intent found")
    }

    pub fn get_intent(&self, intent_id: &str) -> Result<Option<EntryIntent>> {
        self.conn
            .query_row(
                "SELECT intent_id, ny_date, symbol, strategy_id, pivot, stop, r1, r2,
                        quantity, planned_entry_time_utc, status
                 FROM entry_intents WHERE intent_id = ?1",
                params![intent_id],
                row_to_intent,
            )
            .optional()
            .context("intent lookup failed")
    }

    /// The non-terminal intent for a symbol today, if any.
    pub fn open_intent_for(
        &self,
        date: NaiveDate,
        symbol: &str,
        strategy_id: &str,
    ) -> Result<Option<EntryIntent>> {
        self.conn
            .query_row(
                "SELECT intent_id, ny_date, symbol, strategy_id, pivot, stop, r1, r2,
                        quantity, planned_entry_time_utc, status
                 FROM entry_intents
                 WHERE ny_date = ?1 AND symbol = ?2 AND strategy_id = ?3
                   AND status IN ('Scheduled', 'Submitted')",
                params![date.to_string(), symbol, strategy_id],
                row_to_intent,
            )
            .optional()
            .context("open intent lookup failed")
    }

    /// Scheduled intents whose planned entry time has arrived.
    pub fn pop_due_entry_intents(&self, now: DateTime<Utc>) -> Result<Vec<EntryIntent>> {
        let mut stmt = self.conn.prepare(
            "SELECT intent_id, ny_date, symbol, strategy_id, pivot, stop, r1, r2,
                    quantity, planned_entry_time_utc, status
             FROM entry_intents
             WHERE status = 'Scheduled' AND planned_entry_time_utc <= ?1
             ORDER BY planned_entry_time_utc",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], row_to_intent)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn list_intents_by_status(
        &self,
        date: NaiveDate,
        status: IntentStatus,
    ) -> Result<Vec<EntryIntent>> {
        let mut stmt = self.conn.prepare(
            "SELECT intent_id, ny_date, symbol, strategy_id, pivot, stop, r1, r2,
                    quantity, planned_entry_time_utc, status
             FROM entry_intents WHERE ny_date = ?1 AND status = ?2 ORDER BY symbol",
        )?;
        let rows = stmt.query_map(params![date.to_string(), status.as_str()], row_to_intent)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Expire non-terminal intents left over from previous NY days.
    pub fn expire_old_intents(&self, today: NaiveDate, now: DateTime<Utc>) -> Result<usize> {
        let n = self.conn.execute(
            "UPDATE entry_intents
             SET status = 'Expired', updated_ts_utc = ?2, revision = revision + 1
             WHERE ny_date < ?1 AND status IN ('Scheduled', 'Submitted')",
            params![today.to_string(), now.to_rfc3339()],
        )?;
        if n > 0 {
            info!(expired = n, "stale intents expired");
        }
        Ok(n)
    }

    pub fn set_intent_status(
        &self,
        intent_id: &str,
        status: IntentStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE entry_intents
             SET status = ?2, updated_ts_utc = ?3, revision = revision + 1
             WHERE intent_id = ?1",
            params![intent_id, status.as_str(), now.to_rfc3339()],
        )?;
        if n == 0 {
            bail!("intent {intent_id} not found for status update");
        }
        Ok(())
    }

    pub fn count_intents(&self, date: NaiveDate) -> Result<u32> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM entry_intents WHERE ny_date = ?1",
            params![date.to_string()],
            |r| r.get::<_, u32>(0),
        )?)
    }

    // -------------------------------------------------------------------------
    // Order ledger
    // -------------------------------------------------------------------------

    /// Record one successful submission for `(intent_id, purpose)`. Returns
    /// `true` when this call inserted the row, `false` when the key had
    /// already been recorded — callers treat `false` as "already done".
    pub fn record_order_once(
        &self,
        intent_id: &str,
        purpose: OrderPurpose,
        broker_order_id: &str,
        status: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO order_ledger
                 (intent_id, purpose, broker_order_id, status, ny_date, ts_utc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                intent_id,
                purpose.as_str(),
                broker_order_id,
                status,
                date.to_string(),
                now.to_rfc3339(),
            ],
        )?;
        Ok(n > 0)
    }

    pub fn get_order(
        &self,
        intent_id: &str,
        purpose: OrderPurpose,
    ) -> Result<Option<(String, String)>> {
        self.conn
            .query_row(
                "SELECT broker_order_id, status FROM order_ledger
                 WHERE intent_id = ?1 AND purpose = ?2",
                params![intent_id, purpose.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .context("order lookup failed")
    }

    /// Replace the broker order id after a cancel/replace race resolved.
    pub fn update_external_order_id(
        &self,
        intent_id: &str,
        purpose: OrderPurpose,
        broker_order_id: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE order_ledger
             SET broker_order_id = ?3, status = ?4, ts_utc = ?5
             WHERE intent_id = ?1 AND purpose = ?2",
            params![intent_id, purpose.as_str(), broker_order_id, status, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn count_orders(&self, date: NaiveDate) -> Result<u32> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM order_ledger WHERE ny_date = ?1",
            params![date.to_string()],
            |r| r.get::<_, u32>(0),
        )?)
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    pub fn upsert_position(&self, p: &Position) -> Result<()> {
        self.conn.execute(
            "INSERT INTO positions
                 (symbol, strategy_id, intent_id, qty_open, avg_entry, initial_stop,
                  current_stop, r1_done, r2_done, state, opened_ts_utc, last_structure_ts_utc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT (symbol, strategy_id) DO UPDATE SET
                 intent_id = excluded.intent_id,
                 qty_open = excluded.qty_open,
                 avg_entry = excluded.avg_entry,
                 initial_stop = excluded.initial_stop,
                 current_stop = excluded.current_stop,
                 r1_done = excluded.r1_done,
                 r2_done = excluded.r2_done,
                 state = excluded.state,
                 opened_ts_utc = excluded.opened_ts_utc,
                 last_structure_ts_utc = excluded.last_structure_ts_utc,
                 revision = revision + 1",
            params![
                p.symbol,
                p.strategy_id,
                p.intent_id,
                p.qty_open,
                p.avg_entry,
                p.initial_stop,
                p.current_stop,
                p.r1_done as i64,
                p.r2_done as i64,
                p.state.as_str(),
                p.opened_ts_utc.to_rfc3339(),
                p.last_structure_ts_utc.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_position(&self, symbol: &str, strategy_id: &str) -> Result<Option<Position>> {
        self.conn
            .query_row(
                "SELECT symbol, strategy_id, intent_id, qty_open, avg_entry, initial_stop,
                        current_stop, r1_done, r2_done, state, opened_ts_utc, last_structure_ts_utc
                 FROM positions WHERE symbol = ?1 AND strategy_id = ?2",
                params![symbol, strategy_id],
                row_to_position,
            )
            .optional()
            .context("position lookup failed")
    }

    pub fn list_open_positions(&self) -> Result<Vec<Position>> {
        let mut stmt = self.conn.prepare(
            "SELECT symbol, strategy_id, intent_id, qty_open, avg_entry, initial_stop,
                    current_stop, r1_done, r2_done, state, opened_ts_utc, last_structure_ts_utc
             FROM positions WHERE state IN ('Open', 'Exiting') ORDER BY symbol",
        )?;
        let rows = stmt.query_map([], row_to_position)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Tighten a stop. The ratchet is enforced here as well as in the exit
    /// loop: a loosening update silently becomes a no-op and returns `false`.
    pub fn tighten_position_stop(
        &self,
        symbol: &str,
        strategy_id: &str,
        new_stop: f64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let n = self.conn.execute(
            "UPDATE positions
             SET current_stop = ?3, last_structure_ts_utc = ?4, revision = revision + 1
             WHERE symbol = ?1 AND strategy_id = ?2 AND current_stop < ?3",
            params![symbol, strategy_id, new_stop, now.to_rfc3339()],
        )?;
        Ok(n > 0)
    }

    pub fn set_position_state(
        &self,
        symbol: &str,
        strategy_id: &str,
        state: PositionState,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE positions SET state = ?3, revision = revision + 1
             WHERE symbol = ?1 AND strategy_id = ?2",
            params![symbol, strategy_id, state.as_str()],
        )?;
        Ok(())
    }

    /// Reduce open quantity after a trim or exit fill; marks the position
    /// Closed when nothing remains.
    pub fn reduce_position_qty(
        &self,
        symbol: &str,
        strategy_id: &str,
        sold: i64,
    ) -> Result<i64> {
        self.conn.execute(
            "UPDATE positions
             SET qty_open = MAX(0, qty_open - ?3), revision = revision + 1
             WHERE symbol = ?1 AND strategy_id = ?2",
            params![symbol, strategy_id, sold],
        )?;
        let remaining: i64 = self.conn.query_row(
            "SELECT qty_open FROM positions WHERE symbol = ?1 AND strategy_id = ?2",
            params![symbol, strategy_id],
            |r| r.get(0),
        )?;
        if remaining == 0 {
            self.set_position_state(symbol, strategy_id, PositionState::Closed)?;
        }
        Ok(remaining)
    }

    pub fn mark_r1_done(&self, symbol: &str, strategy_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE positions SET r1_done = 1, revision = revision + 1
             WHERE symbol = ?1 AND strategy_id = ?2",
            params![symbol, strategy_id],
        )?;
        Ok(())
    }

    pub fn mark_r2_done(&self, symbol: &str, strategy_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE positions SET r2_done = 1, revision = revision + 1
             WHERE symbol = ?1 AND strategy_id = ?2",
            params![symbol, strategy_id],
        )?;
        Ok(())
    }

    pub fn open_position_count(&self) -> Result<u32> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE state IN ('Open', 'Exiting')",
            [],
            |r| r.get::<_, u32>(0),
        )?)
    }

    pub fn gross_notional(&self) -> Result<f64> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(SUM(qty_open * avg_entry), 0.0)
             FROM positions WHERE state IN ('Open', 'Exiting')",
            [],
            |r| r.get::<_, f64>(0),
        )?)
    }

    pub fn symbol_notional(&self, symbol: &str) -> Result<f64> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(SUM(qty_open * avg_entry), 0.0)
             FROM positions WHERE symbol = ?1 AND state IN ('Open', 'Exiting')",
            params![symbol],
            |r| r.get::<_, f64>(0),
        )?)
    }

    // -------------------------------------------------------------------------
    // Symbol lifecycle & one-shot
    // -------------------------------------------------------------------------

    pub fn set_symbol_phase(
        &self,
        date: NaiveDate,
        strategy_id: &str,
        symbol: &str,
        phase: SymbolPhase,
        cooldown_expires: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO symbol_lifecycle (ny_date, strategy_id, symbol, phase, cooldown_expires_ts_utc)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (ny_date, strategy_id, symbol) DO UPDATE SET
                 phase = excluded.phase,
                 cooldown_expires_ts_utc = COALESCE(excluded.cooldown_expires_ts_utc,
                                                    symbol_lifecycle.cooldown_expires_ts_utc)",
            params![
                date.to_string(),
                strategy_id,
                symbol,
                phase.as_str(),
                cooldown_expires.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Lifecycle phase for a symbol today; unseen symbols are Flat.
    pub fn symbol_phase(
        &self,
        date: NaiveDate,
        strategy_id: &str,
        symbol: &str,
    ) -> Result<(SymbolPhase, Option<DateTime<Utc>>)> {
        let row: Option<(String, Option<String>)> = self
            .conn
            .query_row(
                "SELECT phase, cooldown_expires_ts_utc FROM symbol_lifecycle
                 WHERE ny_date = ?1 AND strategy_id = ?2 AND symbol = ?3",
                params![date.to_string(), strategy_id, symbol],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            None => Ok((SymbolPhase::Flat, None)),
            Some((phase, cooldown)) => Ok((
                SymbolPhase::parse(&phase).unwrap_or(SymbolPhase::Flat),
                cooldown.as_deref().and_then(parse_ts),
            )),
        }
    }

    pub fn mark_entry_consumed(
        &self,
        date: NaiveDate,
        strategy_id: &str,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO consumed_entries (ny_date, strategy_id, symbol, ts_utc)
             VALUES (?1, ?2, ?3, ?4)",
            params![date.to_string(), strategy_id, symbol, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// When (if ever) this symbol consumed its one allowed entry today.
    pub fn entry_consumed_at(
        &self,
        date: NaiveDate,
        strategy_id: &str,
        symbol: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let ts: Option<String> = self
            .conn
            .query_row(
                "SELECT ts_utc FROM consumed_entries
                 WHERE ny_date = ?1 AND strategy_id = ?2 AND symbol = ?3",
                params![date.to_string(), strategy_id, symbol],
                |r| r.get(0),
            )
            .optional()?;
        Ok(ts.as_deref().and_then(parse_ts))
    }

    // -------------------------------------------------------------------------
    // Alert throttle
    // -------------------------------------------------------------------------

    /// True exactly once per (reason, NY day); later calls return false.
    pub fn alert_once(&self, date: NaiveDate, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO alerts_sent (ny_date, reason, ts_utc) VALUES (?1, ?2, ?3)",
            params![date.to_string(), reason, now.to_rfc3339()],
        )?;
        Ok(n > 0)
    }

    // -------------------------------------------------------------------------
    // Snapshot export
    // -------------------------------------------------------------------------

    /// Serialize every table into one JSON value for read-only analytics.
    /// The analytics process reads this instead of sharing the connection.
    pub fn export_snapshot(&self) -> Result<Value> {
        let mut snapshot = serde_json::Map::new();
        for table in [
            "candidates",
            "entry_intents",
            "positions",
            "order_ledger",
            "symbol_lifecycle",
            "consumed_entries",
        ] {
            let mut stmt = self.conn.prepare(&format!("SELECT * FROM {table}"))?;
            let col_names: Vec<String> =
                stmt.column_names().iter().map(|s| s.to_string()).collect();
            let rows = stmt.query_map([], |row| {
                let mut obj = serde_json::Map::new();
                for (i, name) in col_names.iter().enumerate() {
                    let v: rusqlite::types::Value = row.get(i)?;
                    obj.insert(name.clone(), sqlite_value_to_json(v));
                }
                Ok(Value::Object(obj))
            })?;
            let collected: Vec<Value> = rows.collect::<rusqlite::Result<_>>()?;
            snapshot.insert(table.to_string(), Value::Array(collected));
        }
        snapshot.insert("schema_version".into(), json!(MIGRATIONS.len()));
        Ok(Value::Object(snapshot))
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_intent(r: &rusqlite::Row<'_>) -> rusqlite::Result<EntryIntent> {
    let ny_date: String = r.get(1)?;
    let planned: String = r.get(9)?;
    let status: String = r.get(10)?;
    Ok(EntryIntent {
        intent_id: r.get(0)?,
        ny_date: NaiveDate::parse_from_str(&ny_date, "%Y-%m-%d").unwrap_or_default(),
        symbol: r.get(2)?,
        strategy_id: r.get(3)?,
        pivot: r.get(4)?,
        stop: r.get(5)?,
        r1: r.get(6)?,
        r2: r.get(7)?,
        quantity: r.get(8)?,
        planned_entry_time_utc: parse_ts(&planned).unwrap_or_default(),
        status: IntentStatus::parse(&status).unwrap_or(IntentStatus::Expired),
    })
}

fn row_to_position(r: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    let state: String = r.get(9)?;
    let opened: String = r.get(10)?;
    let last_structure: Option<String> = r.get(11)?;
    Ok(Position {
        symbol: r.get(0)?,
        strategy_id: r.get(1)?,
        intent_id: r.get(2)?,
        qty_open: r.get(3)?,
        avg_entry: r.get(4)?,
        initial_stop: r.get(5)?,
        current_stop: r.get(6)?,
        r1_done: r.get::<_, i64>(7)? != 0,
        r2_done: r.get::<_, i64>(8)? != 0,
        state: PositionState::parse(&state).unwrap_or(PositionState::Closed),
        opened_ts_utc: parse_ts(&opened).unwrap_or_default(),
        last_structure_ts_utc: last_structure.as_deref().and_then(parse_ts),
    })
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn sqlite_value_to_json(v: rusqlite::types::Value) -> Value {
    use rusqlite::types::Value as Sv;
    match v {
        Sv::Null => Value::Null,
        Sv::Integer(i) => json!(i),
        Sv::Real(f) => json!(f),
        Sv::Text(s) => json!(s),
        Sv::Blob(b) => json!(hex::encode(b)),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-02T14:40:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn candidate(symbol: &str) -> Candidate {
        Candidate {
            symbol: symbol.into(),
            strategy_id: "S1_AVWAP_CORE".into(),
            entry_level: 185.0,
            stop_loss: 180.0,
            target_r1: 188.0,
            target_r2: 192.0,
            entry_dist_pct: 0.027,
        }
    }

    fn intent(symbol: &str) -> EntryIntent {
        EntryIntent {
            intent_id: EntryIntent::deterministic_id(date(), "S1_AVWAP_CORE", symbol, 185.0),
            ny_date: date(),
            symbol: symbol.into(),
            strategy_id: "S1_AVWAP_CORE".into(),
            pivot: 185.0,
            stop: 180.0,
            r1: 188.0,
            r2: 192.0,
            quantity: 100,
            planned_entry_time_utc: now(),
            status: IntentStatus::Scheduled,
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        // A second migrate pass must be a no-op.
        store.migrate().unwrap();
        let v: i64 = store
            .conn
            .query_row("SELECT value FROM meta WHERE key='schema_version'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(v, MIGRATIONS.len() as i64);
    }

    #[test]
    fn candidate_upsert_and_day_scoped_purge() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_candidate(date(), &candidate("AAPL"), now()).unwrap();
        store.upsert_candidate(date(), &candidate("AAPL"), now()).unwrap();
        assert_eq!(store.list_active_candidates(date()).unwrap().len(), 1);

        let yesterday = date().pred_opt().unwrap();
        store
            .upsert_candidate(yesterday, &candidate("MSFT"), now())
            .unwrap();
        store.purge_stale_candidates(date()).unwrap();
        assert!(store.list_active_candidates(yesterday).unwrap().is_empty());
        assert_eq!(store.list_active_candidates(date()).unwrap().len(), 1);
    }

    #[test]
    fn put_intent_returns_existing_on_collision() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store.put_entry_intent(&intent("AAPL"), now()).unwrap();

        // Same deterministic id, different quantity: the stored row wins.
        let mut second = intent("AAPL");
        second.quantity = 999;
        let stored = store.put_entry_intent(&second, now()).unwrap();
        assert_eq!(stored.quantity, first.quantity);
    }

    #[test]
    fn at_most_one_open_intent_per_symbol_day() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store.put_entry_intent(&intent("AAPL"), now()).unwrap();

        // A different pivot yields a different id, but the partial unique
        // index still forbids a second non-terminal intent for the symbol.
        let mut other = intent("AAPL");
        other.pivot = 186.0;
        other.intent_id =
            EntryIntent::deterministic_id(date(), "S1_AVWAP_CORE", "AAPL", 186.0);
        let stored = store.put_entry_intent(&other, now()).unwrap();
        assert_eq!(stored.intent_id, first.intent_id);

        // Once the first is terminal, the new intent may be created.
        store
            .set_intent_status(&first.intent_id, IntentStatus::Cancelled, now())
            .unwrap();
        let stored = store.put_entry_intent(&other, now()).unwrap();
        assert_eq!(stored.intent_id, other.intent_id);
    }

    #[test]
    fn due_intents_respect_planned_time() {
        let store = StateStore::open_in_memory().unwrap();
        let mut early = intent("AAPL");
        early.planned_entry_time_utc = now() - chrono::Duration::seconds(10);
        let mut late = intent("MSFT");
        late.intent_id = EntryIntent::deterministic_id(date(), "S1_AVWAP_CORE", "MSFT", 400.0);
        late.planned_entry_time_utc = now() + chrono::Duration::seconds(600);

        store.put_entry_intent(&early, now()).unwrap();
        store.put_entry_intent(&late, now()).unwrap();

        let due = store.pop_due_entry_intents(now()).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].symbol, "AAPL");

        // After submission it is no longer due.
        store
            .set_intent_status(&due[0].intent_id, IntentStatus::Submitted, now())
            .unwrap();
        assert!(store.pop_due_entry_intents(now()).unwrap().is_empty());
    }

    #[test]
    fn record_order_once_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let inserted = store
            .record_order_once("abc", OrderPurpose::Entry, "ord-1", "submitted", date(), now())
            .unwrap();
        assert!(inserted);

        // Replay with a different broker id: the first record wins.
        let replay = store
            .record_order_once("abc", OrderPurpose::Entry, "ord-2", "submitted", date(), now())
            .unwrap();
        assert!(!replay);
        let (id, _) = store.get_order("abc", OrderPurpose::Entry).unwrap().unwrap();
        assert_eq!(id, "ord-1");

        // A different purpose under the same intent is a separate key.
        assert!(store
            .record_order_once("abc", OrderPurpose::TrimR1, "ord-3", "submitted", date(), now())
            .unwrap());
        assert_eq!(store.count_orders(date()).unwrap(), 2);
    }

    #[test]
    fn stop_ratchet_never_loosens_in_store() {
        let store = StateStore::open_in_memory().unwrap();
        let p = Position {
            symbol: "AAPL".into(),
            strategy_id: "S1_AVWAP_CORE".into(),
            intent_id: "deadbeef".into(),
            qty_open: 100,
            avg_entry: 185.0,
            initial_stop: 180.0,
            current_stop: 180.0,
            r1_done: false,
            r2_done: false,
            state: PositionState::Open,
            opened_ts_utc: now(),
            last_structure_ts_utc: None,
        };
        store.upsert_position(&p).unwrap();

        assert!(store
            .tighten_position_stop("AAPL", "S1_AVWAP_CORE", 182.0, now())
            .unwrap());
        // Looser stop: rejected.
        assert!(!store
            .tighten_position_stop("AAPL", "S1_AVWAP_CORE", 181.0, now())
            .unwrap());
        // Equal stop: no-op too.
        assert!(!store
            .tighten_position_stop("AAPL", "S1_AVWAP_CORE", 182.0, now())
            .unwrap());

        let p = store.get_position("AAPL", "S1_AVWAP_CORE").unwrap().unwrap();
        assert_eq!(p.current_stop, 182.0);
    }

    #[test]
    fn reduce_qty_closes_at_zero() {
        let store = StateStore::open_in_memory().unwrap();
        let p = Position {
            symbol: "AAPL".into(),
            strategy_id: "S1_AVWAP_CORE".into(),
            intent_id: "deadbeef".into(),
            qty_open: 100,
            avg_entry: 185.0,
            initial_stop: 180.0,
            current_stop: 180.0,
            r1_done: false,
            r2_done: false,
            state: PositionState::Open,
            opened_ts_utc: now(),
            last_structure_ts_utc: None,
        };
        store.upsert_position(&p).unwrap();

        assert_eq!(store.reduce_position_qty("AAPL", "S1_AVWAP_CORE", 50).unwrap(), 50);
        assert_eq!(store.open_position_count().unwrap(), 1);
        assert_eq!(store.reduce_position_qty("AAPL", "S1_AVWAP_CORE", 50).unwrap(), 0);
        assert_eq!(store.open_position_count().unwrap(), 0);
        let p = store.get_position("AAPL", "S1_AVWAP_CORE").unwrap().unwrap();
        assert_eq!(p.state, PositionState::Closed);
    }

    #[test]
    fn lifecycle_and_consumed_entries() {
        let store = StateStore::open_in_memory().unwrap();
        let (phase, _) = store.symbol_phase(date(), "S1_AVWAP_CORE", "AAPL").unwrap();
        assert_eq!(phase, SymbolPhase::Flat);

        let cooldown = now() + chrono::Duration::minutes(120);
        store
            .set_symbol_phase(date(), "S1_AVWAP_CORE", "AAPL", SymbolPhase::Open, Some(cooldown))
            .unwrap();
        let (phase, cd) = store.symbol_phase(date(), "S1_AVWAP_CORE", "AAPL").unwrap();
        assert_eq!(phase, SymbolPhase::Open);
        assert_eq!(cd, Some(cooldown));

        assert!(store.entry_consumed_at(date(), "S1_AVWAP_CORE", "AAPL").unwrap().is_none());
        store
            .mark_entry_consumed(date(), "S1_AVWAP_CORE", "AAPL", now())
            .unwrap();
        assert!(store.entry_consumed_at(date(), "S1_AVWAP_CORE", "AAPL").unwrap().is_some());
        // Marking again keeps the first timestamp.
        store
            .mark_entry_consumed(date(), "S1_AVWAP_CORE", "AAPL", now() + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(
            store.entry_consumed_at(date(), "S1_AVWAP_CORE", "AAPL").unwrap(),
            Some(now())
        );
    }

    #[test]
    fn alert_throttle_fires_once_per_day() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.alert_once(date(), "kill_switch_active", now()).unwrap());
        assert!(!store.alert_once(date(), "kill_switch_active", now()).unwrap());
        assert!(store.alert_once(date(), "watchlist_stale", now()).unwrap());
        // New day, same reason: fires again.
        let tomorrow = date().succ_opt().unwrap();
        assert!(store.alert_once(tomorrow, "kill_switch_active", now()).unwrap());
    }

    #[test]
    fn writer_lock_excludes_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execution_v2.lock");

        let lock = WriterLock::acquire(&path).unwrap();
        assert!(WriterLock::acquire(&path).is_err());
        drop(lock);
        // Lock released on drop: a new instance may start.
        let _relock = WriterLock::acquire(&path).unwrap();
    }

    #[test]
    fn snapshot_export_contains_all_tables() {
        let store = StateStore::open_in_memory().unwrap();
        store.upsert_candidate(date(), &candidate("AAPL"), now()).unwrap();
        store.put_entry_intent(&intent("AAPL"), now()).unwrap();

        let snap = store.export_snapshot().unwrap();
        assert_eq!(snap["candidates"].as_array().unwrap().len(), 1);
        assert_eq!(snap["entry_intents"].as_array().unwrap().len(), 1);
        assert!(snap["positions"].as_array().unwrap().is_empty());
        assert!(snap.get("order_ledger").is_some());
    }
}
