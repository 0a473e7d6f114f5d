//! Cleanup CLI: reclaims credit from abandoned checkouts and deletes
//! expired reservations. Intended to run on a schedule (cron/K8s CronJob).
//!
//! Usage: `cleanup [max_age_hours]` (default 24). Exits non-zero when any
//! session fails to clean up, so the scheduler can alert.

use credit_service::config::Config;
use credit_service::services::cleanup::CleanupService;
use credit_service::services::ledger::CreditLedger;
use credit_service::stores::postgres::{Database, PgLedgerStore, PgOrderStore};
use secrecy::ExposeSecret;
use service_core::observability::init_tracing;
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing("credit-cleanup", &config.log_level, None);

    let max_age_hours: i64 = match std::env::args().nth(1) {
        Some(arg) => match arg.parse() {
            Ok(hours) if hours > 0 => hours,
            _ => {
                eprintln!("Invalid max_age_hours: {}", arg);
                return ExitCode::FAILURE;
            }
        },
        None => 24,
    };

    match run(config, max_age_hours).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Cleanup failed");
            eprintln!("Cleanup failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, max_age_hours: i64) -> anyhow::Result<()> {
    let db = Database::new(
        config.database.url.expose_secret(),
        config.database.max_connections,
        config.database.min_connections,
    )
    .await?;
    db.run_migrations().await?;

    let ledger = CreditLedger::new(Arc::new(PgLedgerStore::new(db.pool().clone())));
    let orders = Arc::new(PgOrderStore::new(db.pool().clone()));
    let cleanup = CleanupService::new(orders, ledger);

    let report = cleanup.cleanup_abandoned_checkouts(max_age_hours).await?;
    let expired = cleanup.cleanup_expired_reservations().await?;

    println!(
        "Abandoned checkouts: {} sessions, {} orders, {} credits restored, {} failures",
        report.sessions_processed,
        report.orders_touched,
        report.credits_restored,
        report.failures
    );
    println!("Expired reservations removed: {}", expired);

    if report.had_failures() {
        anyhow::bail!("{} session(s) failed to clean up", report.failures);
    }
    Ok(())
}
