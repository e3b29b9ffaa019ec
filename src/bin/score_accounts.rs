//! Scheduled maintenance pass over the local account store.
//!
//! Runs every detector for every account, refreshes ICP fit, recomputes
//! heuristic scores, and sweeps expired analytics cache entries.
//!
//! Usage: `score_accounts [--db PATH] [--preset ID]`

use std::path::PathBuf;
use std::process::ExitCode;

use accountpulse::db::AccountDb;
use accountpulse::presets::{available_presets, load_default_preset, load_preset};
use accountpulse::scoring::{FitScorer, HeuristicsEngine};
use accountpulse::signals::SignalProcessor;
use accountpulse::sync::{QueryCache, ANALYTICS_INTEGRATION};

#[derive(Debug, Default)]
struct Args {
    db: Option<PathBuf>,
    preset: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--db" => {
                let path = iter.next().ok_or("--db needs a path")?;
                args.db = Some(PathBuf::from(path));
            }
            "--preset" => {
                args.preset = Some(iter.next().ok_or("--preset needs an id")?);
            }
            "-h" | "--help" => {
                return Err(format!(
                    "usage: score_accounts [--db PATH] [--preset ID]\npresets: {}",
                    available_presets()
                        .into_iter()
                        .map(|(id, _, _)| id)
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(args)
}

fn run(args: Args) -> Result<(), String> {
    let config = match args.preset.as_deref() {
        Some(id) => load_preset(id)?,
        None => load_default_preset()?,
    };
    log::info!("Using preset {} ({} signals)", config.id, config.signals.len());

    let db = match args.db {
        Some(path) => AccountDb::open_at(path),
        None => AccountDb::open(),
    }
    .map_err(|e| format!("Failed to open database: {}", e))?;

    let processor = SignalProcessor::new(&config);
    let detection = processor
        .process_all_accounts(&db)
        .map_err(|e| format!("Signal detection failed: {}", e))?;
    log::info!(
        "Detection: {} accounts, {} signals, {} account failures, {} detector failures",
        detection.accounts_processed,
        detection.signals_detected,
        detection.accounts_failed,
        detection.detector_failures
    );

    let fit = FitScorer::new(&config);
    let account_ids = db
        .list_account_ids()
        .map_err(|e| format!("Failed to list accounts: {}", e))?;
    let mut fit_failures = 0;
    for id in &account_ids {
        if let Err(e) = fit.update_account_fit(&db, id) {
            log::warn!("Fit update failed for {}: {}", id, e);
            fit_failures += 1;
        }
    }
    log::info!(
        "Fit: {} accounts updated, {} failed",
        account_ids.len() - fit_failures,
        fit_failures
    );

    let engine = HeuristicsEngine::new(config);
    let scoring = engine
        .run_all_accounts(&db)
        .map_err(|e| format!("Scoring failed: {}", e))?;
    log::info!(
        "Scoring: {} accounts, {} failed, {} opportunities",
        scoring.accounts_scored,
        scoring.accounts_failed,
        scoring.opportunities_created
    );

    let cache = QueryCache::new(db.into_shared(), ANALYTICS_INTEGRATION, 0);
    let removed = cache
        .cleanup_expired()
        .map_err(|e| format!("Cache cleanup failed: {}", e))?;
    log::info!("Cache: {} expired entries removed", removed);

    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{}", msg);
            return ExitCode::from(2);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            log::error!("{}", msg);
            ExitCode::FAILURE
        }
    }
}
