// =============================================================================
// Candidate File Boundary — typed CSV ingestion with fail-closed validation
// =============================================================================
//
// The daily scan drops a loosely-typed CSV; everything past this module works
// with validated `Candidate` records. Unknown columns are ignored. A missing
// required column, an unreadable file, or a ScanDate that is not today blocks
// the whole file; a malformed individual row is skipped with a warning.
// =============================================================================

use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::Candidate;

/// Strategy assigned to rows that do not carry a `Strategy_ID` column.
pub const DEFAULT_STRATEGY_ID: &str = "S1_AVWAP_CORE";

/// Why the candidate file as a whole is unusable. Every variant is a
/// fail-closed block for new entries.
#[derive(Debug, Error)]
pub enum CandidateFileError {
    #[error("candidate file not found: {0}")]
    Missing(String),
    #[error("candidate file unreadable: {0}")]
    Unreadable(#[from] std::io::Error),
    #[error("candidate file csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("candidate file missing required columns: {0:?}")]
    MissingColumns(Vec<String>),
    #[error("candidate file ScanDate {found} does not match today {today}")]
    StaleScanDate { found: String, today: NaiveDate },
    #[error("candidate file malformed: {0}")]
    Malformed(String),
}

const REQUIRED_COLUMNS: [&str; 7] = [
    "Symbol",
    "Direction",
    "Entry_Level",
    "Stop_Loss",
    "Target_R1",
    "Target_R2",
    "Entry_DistPct",
];

/// One CSV row as the scan writes it. Extra columns are ignored by serde.
#[derive(Debug, Deserialize)]
struct RawRow {
    #[serde(rename = "Symbol")]
    symbol: String,
    #[serde(rename = "Direction")]
    direction: String,
    #[serde(rename = "Entry_Level")]
    entry_level: f64,
    #[serde(rename = "Stop_Loss")]
    stop_loss: f64,
    #[serde(rename = "Target_R1")]
    target_r1: f64,
    #[serde(rename = "Target_R2")]
    target_r2: f64,
    #[serde(rename = "Entry_DistPct")]
    entry_dist_pct: f64,
    #[serde(rename = "Strategy_ID", default)]
    strategy_id: Option<String>,
    #[serde(rename = "ScanDate", default)]
    scan_date: Option<String>,
}

/// Load and validate the day's candidate file.
///
/// `today` is the NY date of the decision moment; a `ScanDate` column that
/// disagrees with it rejects the file.
pub fn load_candidates(path: &Path, today: NaiveDate) -> Result<Vec<Candidate>, CandidateFileError> {
    if !path.exists() {
        return Err(CandidateFileError::Missing(path.display().to_string()));
    }

    let mut reader = csv::Reader::from_path(path)?;

    // Header check up front so a renamed column blocks the file instead of
    // silently producing zero rows.
    let headers = reader
        .headers()
        .map_err(|e| CandidateFileError::Malformed(e.to_string()))?
        .clone();
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|c| !headers.iter().any(|h| h == **c))
        .map(|c| c.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(CandidateFileError::MissingColumns(missing));
    }

    let mut out = Vec::new();
    for (idx, row) in reader.deserialize::<RawRow>().enumerate() {
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                warn!(line = idx + 2, error = %e, "skipping malformed candidate row");
                continue;
            }
        };

        if let Some(scan_date) = row.scan_date.as_deref().map(str::trim) {
            if !scan_date.is_empty() {
                match NaiveDate::parse_from_str(scan_date, "%Y-%m-%d") {
                    Ok(d) if d == today => {}
                    Ok(_) | Err(_) => {
                        return Err(CandidateFileError::StaleScanDate {
                            found: scan_date.to_string(),
                            today,
                        });
                    }
                }
            }
        }

        match validate_row(row, idx + 2) {
            Some(c) => out.push(c),
            None => continue,
        }
    }

    debug!(count = out.len(), path = %path.display(), "candidates loaded");
    Ok(out)
}

/// Per-row validation. Returns `None` (row skipped) for anything that cannot
/// become a safe long entry.
fn validate_row(row: RawRow, line: usize) -> Option<Candidate> {
    let symbol = row.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        warn!(line, "skipping candidate with empty symbol");
        return None;
    }

    if !row.direction.trim().eq_ignore_ascii_case("long") {
        warn!(line, symbol = %symbol, direction = %row.direction, "skipping non-long candidate");
        return None;
    }

    if !(row.entry_level.is_finite() && row.entry_level > 0.0)
        || !(row.stop_loss.is_finite() && row.stop_loss > 0.0)
        || !(row.target_r1.is_finite() && row.target_r1 > 0.0)
        || !(row.target_r2.is_finite() && row.target_r2 > 0.0)
    {
        warn!(line, symbol = %symbol, "skipping candidate with non-positive price fields");
        return None;
    }

    if row.stop_loss >= row.entry_level {
        warn!(
            line,
            symbol = %symbol,
            stop = row.stop_loss,
            pivot = row.entry_level,
            "skipping candidate whose stop is not below the pivot"
        );
        return None;
    }

    if !(row.entry_dist_pct.is_finite() && row.entry_dist_pct > 0.0) {
        warn!(line, symbol = %symbol, "skipping candidate with non-positive Entry_DistPct");
        return None;
    }

    let strategy_id = row
        .strategy_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_STRATEGY_ID)
        .to_string();

    Some(Candidate {
        symbol,
        strategy_id,
        entry_level: row.entry_level,
        stop_loss: row.stop_loss,
        target_r1: row.target_r1,
        target_r2: row.target_r2,
        entry_dist_pct: row.entry_dist_pct,
    })
}

// =============================================================================
// Tests
// =============================================================================
