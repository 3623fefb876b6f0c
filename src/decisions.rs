// =============================================================================
// Portfolio Decision Reader — per-intent ALLOW/BLOCK enforcement
// =============================================================================
//
// The analytics layer drops one JSON artifact per NY date. This module loads
// and validates it; any defect (missing, unreadable, wrong schema, wrong
// date) collapses to BLOCK-all for new entries while enforcement is on.
// Exits are never touched by this layer.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, warn};

/// Artifact schema version this engine understands.
const SUPPORTED_SCHEMA_VERSION: u32 = 1;

/// Verdict for one prospective entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permit {
    Allow,
    Block(String),
}

#[derive(Debug, Deserialize)]
struct RawArtifact {
    schema_version: u32,
    ny_date: String,
    decisions: HashMap<String, RawDecision>,
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Outcome of loading the day's artifact. Built once per cycle.
#[derive(Debug)]
pub enum DecisionState {
    /// Enforcement off: everything is allowed by this layer.
    Disabled,
    /// Artifact validated; per-intent decisions apply.
    Loaded { decisions: HashMap<String, Permit> },
    /// Artifact defective: every new entry is blocked with this reason code.
    BlockAll { reason: String },
}

impl DecisionState {
    /// Load and validate `analytics/artifacts/portfolio_decisions/<date>.json`.
    pub fn load(path: &Path, today: NaiveDate, enforce: bool) -> Self {
        if !enforce {
            return Self::Disabled;
        }

        let raw = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "portfolio decision artifact missing — blocking all entries");
                return Self::BlockAll {
                    reason: "decision_artifact_missing".into(),
                };
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "portfolio decision artifact unreadable — blocking all entries");
                return Self::BlockAll {
                    reason: "decision_artifact_unreadable".into(),
                };
            }
        };

        let artifact: RawArtifact = match serde_json::from_str(&raw) {
            Ok(a) => a,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "portfolio decision artifact malformed — blocking all entries");
                return Self::BlockAll {
                    reason: "decision_artifact_invalid".into(),
                };
            }
        };

        if artifact.schema_version != SUPPORTED_SCHEMA_VERSION {
            warn!(
                found = artifact.schema_version,
                supported = SUPPORTED_SCHEMA_VERSION,
                "portfolio decision artifact schema mismatch — blocking all entries"
            );
            return Self::BlockAll {
                reason: "decision_artifact_schema_mismatch".into(),
            };
        }

        if artifact.ny_date != today.to_string() {
            warn!(
                artifact_date = %artifact.ny_date,
                %today,
                "portfolio decision artifact is not for today — blocking all entries"
            );
            return Self::BlockAll {
                reason: "decision_artifact_date_mismatch".into(),
            };
        }

        let decisions = artifact
            .decisions
            .into_iter()
            .map(|(key, d)| {
                let permit = if d.action.eq_ignore_ascii_case("ALLOW") {
                    Permit::Allow
                } else {
                    Permit::Block(d.reason.unwrap_or_else(|| "decision_block".into()))
                };
                (key, permit)
            })
            .collect::<HashMap<_, _>>();

        debug!(count = decisions.len(), "portfolio decisions loaded");
        Self::Loaded { decisions }
    }

    /// Verdict for `(symbol, strategy_id)`. With a loaded artifact, a symbol
    /// absent from the map is blocked: silence from the decision layer is not
    /// permission.
    pub fn permit(&self, symbol: &str, strategy_id: &str) -> Permit {
        match self {
            Self::Disabled => Permit::Allow,
            Self::BlockAll { reason } => Permit::Block(reason.clone()),
            Self::Loaded { decisions } => decisions
                .get(&format!("{symbol}|{strategy_id}"))
                .cloned()
                .unwrap_or_else(|| Permit::Block("decision_absent".into())),
        }
    }

    /// The block-all reason code, if the artifact failed validation.
    pub fn block_all_reason(&self) -> Option<&str> {
        match self {
            Self::BlockAll { reason } => Some(reason),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
