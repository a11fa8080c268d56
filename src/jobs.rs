//! Scheduled background jobs
//!
//! Three loops run for the life of the server: marking expired
//! knowledge stores, proactively recreating stores close to expiry,
//! and rolling over lapsed quota ledgers. Job errors are logged and
//! never crash the process; each run emits a one-line summary.

use crate::server::AppState;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Spawn all recurring jobs; the handles live as long as the server
pub fn spawn_background_jobs(state: &AppState) -> Vec<JoinHandle<()>> {
    let periods = state.config.jobs.clone();

    let cleanup = {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(periods.cleanup_hours * 3600));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                run_store_cleanup(&state);
            }
        })
    };

    let recreation = {
        let state = state.clone();
        let hours = state.config.jobs.recreation_hours;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(hours * 3600));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                run_store_recreation(&state).await;
            }
        })
    };

    let quota = {
        let state = state.clone();
        let hours = state.config.jobs.quota_sweep_hours;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(hours * 3600));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                run_quota_sweep(&state);
            }
        })
    };

    tracing::info!(
        cleanup_hours = state.config.jobs.cleanup_hours,
        recreation_hours = state.config.jobs.recreation_hours,
        quota_sweep_hours = state.config.jobs.quota_sweep_hours,
        "Background jobs scheduled"
    );

    vec![cleanup, recreation, quota]
}

/// Mark active stores past expiry; one run of the cleanup job
pub fn run_store_cleanup(state: &AppState) {
    let started = std::time::Instant::now();
    match state.knowledge.cleanup_expired() {
        Ok(marked) => {
            tracing::info!(
                marked,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Knowledge store cleanup finished"
            );
            metrics::increment_counter!("job_runs_total", "job" => "cleanup");
        }
        Err(e) => {
            tracing::error!(error = %e, "Knowledge store cleanup failed");
            metrics::increment_counter!("job_failures_total", "job" => "cleanup");
        }
    }
}

/// Recreate stores inside the lookahead window; one run of the job
pub async fn run_store_recreation(state: &AppState) {
    let started = std::time::Instant::now();
    match state.knowledge.recreate_expiring().await {
        Ok(summary) => {
            tracing::info!(
                recreated = summary.recreated,
                expiring = summary.total_expiring,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Proactive store recreation finished"
            );
            metrics::increment_counter!("job_runs_total", "job" => "recreation");
        }
        Err(e) => {
            tracing::error!(error = %e, "Proactive store recreation failed");
            metrics::increment_counter!("job_failures_total", "job" => "recreation");
        }
    }
}

/// Roll over lapsed ledgers; one run of the quota sweep
pub fn run_quota_sweep(state: &AppState) {
    match state.ledger.sweep_resets() {
        Ok(reset) => {
            tracing::info!(reset, "Quota sweep finished");
            metrics::increment_counter!("job_runs_total", "job" => "quota_sweep");
        }
        Err(e) => {
            tracing::error!(error = %e, "Quota sweep failed");
            metrics::increment_counter!("job_failures_total", "job" => "quota_sweep");
        }
    }
}
