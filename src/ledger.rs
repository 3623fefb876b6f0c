// =============================================================================
// Append-only Ledgers — JSONL event books + atomic control files
// =============================================================================
//
// Every irreversible decision lands in a per-book, per-NY-date JSONL file.
// Records serialize with sorted keys (serde_json's map is BTree-backed) and
// compact separators, one object per line, fsynced before the caller
// proceeds. Control files (heartbeat, dry-run idempotency ledger) use
// write-temp-fsync-rename instead.
//
// A ledger write failure blocks the action that needed it; it never crashes
// the cycle. Callers get a plain `Result` and decide.
// =============================================================================

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Version stamped into every ledger record.
pub const SCHEMA_VERSION: u32 = 2;

/// Book name for per-cycle portfolio decision records.
pub const BOOK_PORTFOLIO_DECISIONS: &str = "PORTFOLIO_DECISIONS";
/// Book name for post-fill slippage events.
pub const BOOK_EXECUTION_SLIPPAGE: &str = "EXECUTION_SLIPPAGE";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Routes records to `<root>/<BOOK>/<YYYY-MM-DD>.jsonl`.
#[derive(Debug, Clone)]
pub struct LedgerRouter {
    root: PathBuf,
}

impl LedgerRouter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn book_path(&self, book: &str, date: NaiveDate) -> PathBuf {
        self.root.join(book).join(format!("{date}.jsonl"))
    }

    /// Append one record to a book. `fields` is completed with the envelope
    /// keys (`record_type`, `schema_version`, `ny_date`, `ts_utc`) before
    /// writing; the line is fsynced before returning.
    pub fn append(
        &self,
        book: &str,
        date: NaiveDate,
        record_type: &str,
        ts_utc: DateTime<Utc>,
        mut fields: Map<String, Value>,
    ) -> Result<()> {
        fields.insert("record_type".into(), json!(record_type));
        fields.insert("schema_version".into(), json!(SCHEMA_VERSION));
        fields.insert("ny_date".into(), json!(date.to_string()));
        fields.insert("ts_utc".into(), json!(ts_utc.to_rfc3339()));

        let path = self.book_path(book, date);
        append_line(&path, &Value::Object(fields))
            .with_context(|| format!("ledger append to {} failed", path.display()))?;

        debug!(book, %date, record_type, "ledger record appended");
        Ok(())
    }

    /// Scan today's book for any record matching `pred`. Used as the
    /// idempotency check before appending an event type that must be unique
    /// per natural key. Unparseable lines are ignored rather than trusted.
    pub fn has_matching(
        &self,
        book: &str,
        date: NaiveDate,
        pred: impl Fn(&Value) -> bool,
    ) -> Result<bool> {
        let path = self.book_path(book, date);
        if !path.exists() {
            return Ok(false);
        }
        let file = File::open(&path)
            .with_context(|| format!("ledger scan of {} failed", path.display()))?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(v) = serde_json::from_str::<Value>(&line) {
                if pred(&v) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Convenience: does today's book already hold `record_type` for this
    /// `intent_id`?
    pub fn has_event(
        &self,
        book: &str,
        date: NaiveDate,
        record_type: &str,
        intent_id: &str,
    ) -> Result<bool> {
        self.has_matching(book, date, |v| {
            v.get("record_type").and_then(Value::as_str) == Some(record_type)
                && v.get("intent_id").and_then(Value::as_str) == Some(intent_id)
        })
    }
}

fn append_line(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating ledger dir {} failed", parent.display()))?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Atomic control files
// ---------------------------------------------------------------------------

/// Replace `path` with `value` via write-temp-fsync-rename. Survives a crash
/// at any point with either the old or the new contents, never a torn file.
pub fn atomic_write_json(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating dir {} failed", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("creating {} failed", tmp.display()))?;
        file.write_all(serde_json::to_string(value)?.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming into {} failed", path.display()))?;

    // Directory fsync so the rename itself is durable where the platform
    // needs it.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Read a JSON control file, `None` if it does not exist.
pub fn read_json(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading {} failed", path.display()))?;
    Ok(Some(serde_json::from_str(&raw).with_context(|| {
        format!("parsing {} failed", path.display())
    })?))
}

// =============================================================================
// Tests
// =============================================================================
