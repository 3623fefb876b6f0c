// =============================================================================
// Execution V2 — Main Entry Point
// =============================================================================
//
// The engine starts in DRY_RUN unless the environment explicitly resolves to
// something riskier, and LIVE additionally requires the two-key gate
// (LIVE_TRADING=1 plus a matching confirm-token file). The gate stack can
// only ever downgrade from there.
//
// Exit codes: 0 success, 1 fatal error, 2 configuration invalid,
// 64 writer lock held, 65 credentials missing for the chosen mode.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod broker;
mod buy;
mod candidates;
mod clock;
mod config;
mod decisions;
mod engine;
mod gates;
mod ledger;
mod market_data;
mod sell;
mod store;
mod types;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ExecutionConfig;
use crate::engine::{Engine, StartupError};

const EXIT_FATAL: i32 = 1;
const EXIT_CONFIG_INVALID: i32 = 2;
const EXIT_LOCK_HELD: i32 = 64;
const EXIT_CREDENTIALS_MISSING: i32 = 65;

#[derive(Debug, Parser)]
#[command(name = "avwap-execution", about = "Breakout execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the SQLite state store (overrides EXECUTION_V2_DB).
    #[arg(long)]
    db_path: Option<std::path::PathBuf>,

    /// Path to the daily candidate CSV (overrides AVWAP_CANDIDATES_CSV).
    #[arg(long)]
    candidates_csv: Option<std::path::PathBuf>,

    /// Run cycles even while the market is closed.
    #[arg(long)]
    ignore_market_hours: bool,

    /// Force dry-run regardless of EXECUTION_MODE.
    #[arg(long)]
    dry_run: bool,

    /// Run a single cycle and exit (same as the run-once command).
    #[arg(long)]
    once: bool,

    /// Override the base and market poll intervals, in seconds.
    #[arg(long)]
    poll_seconds: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one cycle and exit (supervisor gating, tests).
    RunOnce,
    /// Run the cycle loop until interrupted (default).
    RunLoop,
    /// Validate environment and paths offline; exit 0 on pass.
    ConfigCheck,
    /// Print a read-only JSON snapshot of the state store for analytics.
    Snapshot,
}

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut cfg = ExecutionConfig::from_env();
    if let Some(db) = cli.db_path {
        cfg.db_path = db;
    }
    if let Some(csv) = cli.candidates_csv {
        cfg.candidates_csv = csv;
    }
    if cli.ignore_market_hours {
        cfg.ignore_market_hours = true;
    }
    if cli.dry_run {
        cfg.force_dry_run = true;
    }
    if let Some(secs) = cli.poll_seconds {
        let secs = secs.max(1);
        cfg.poll.base = std::time::Duration::from_secs(secs);
        cfg.poll.market = std::time::Duration::from_secs(secs);
    }

    let command = match cli.command {
        Some(c) => c,
        None if cli.once => Command::RunOnce,
        None => Command::RunLoop,
    };

    let code = match command {
        Command::ConfigCheck => config_check(&cfg),
        Command::Snapshot => snapshot(&cfg),
        Command::RunOnce => run(cfg, true).await,
        Command::RunLoop => run(cfg, false).await,
    };
    std::process::exit(code);
}

/// Read-only export; does not take the writer lock.
fn snapshot(cfg: &ExecutionConfig) -> i32 {
    match store::StateStore::open(&cfg.db_path).and_then(|s| s.export_snapshot()) {
        Ok(snap) => {
            println!("{snap}");
            0
        }
        Err(e) => {
            error!(error = %e, "snapshot export failed");
            EXIT_FATAL
        }
    }
}

fn config_check(cfg: &ExecutionConfig) -> i32 {
    let problems = cfg.validate();
    if problems.is_empty() {
        info!(
            mode = %cfg.requested_mode,
            state_dir = %cfg.state_dir.display(),
            db = %cfg.db_path.display(),
            "config-check passed"
        );
        0
    } else {
        for p in &problems {
            error!(problem = %p, "config-check failed");
        }
        EXIT_CONFIG_INVALID
    }
}

async fn run(cfg: ExecutionConfig, once: bool) -> i32 {
    let mut engine = match Engine::start(cfg) {
        Ok(engine) => engine,
        Err(StartupError::ConfigInvalid(problems)) => {
            for p in &problems {
                error!(problem = %p, "configuration invalid");
            }
            return EXIT_CONFIG_INVALID;
        }
        Err(StartupError::WriterLockHeld) => {
            error!("another execution instance holds the writer lock");
            return EXIT_LOCK_HELD;
        }
        Err(e @ StartupError::CredentialsMissing(_)) => {
            error!(error = %e, "credentials missing for the chosen mode");
            return EXIT_CREDENTIALS_MISSING;
        }
        Err(StartupError::Other(e)) => {
            error!(error = %e, "engine startup failed");
            return EXIT_FATAL;
        }
    };

    let result = if once {
        engine.run_once().await.map(|report| {
            info!(
                mode = %report.mode,
                market_open = report.market_open,
                material = report.material,
                intents = report.buy.intents_created,
                orders = report.buy.orders_submitted,
                fills = report.buy.fills_confirmed,
                trims = report.sell.trims_submitted,
                exits = report.sell.exits_submitted,
                "single cycle complete"
            );
        })
    } else {
        engine.run_loop().await
    };

    match result {
        Ok(()) => {
            warn!("execution engine stopped");
            0
        }
        Err(e) => {
            error!(error = %e, "fatal error — exiting for supervisor restart");
            EXIT_FATAL
        }
    }
}
