//! HTTP health/status surface.
//!
//! Operators get `/health` (JSON, 503 when unhealthy) and `/ping`. The report
//! covers the ledger, the content resources, and per-job scheduler stats so a
//! stuck job is visible without log spelunking.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Instant};

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    ledger::InteractionLedger,
    scheduler::{JobRunner, JobStats},
    Result,
};

/// A job is reported degraded after this many consecutive failures.
const DEGRADED_AFTER_FAILURES: u32 = 3;

pub struct HealthState {
    pub ledger: Arc<InteractionLedger>,
    pub jobs: JobRunner,
    pub quotes_path: PathBuf,
    pub images_dir: PathBuf,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    uptime_secs: u64,
    checks: Checks,
    jobs: BTreeMap<String, JobReport>,
}

#[derive(Serialize)]
struct Checks {
    storage: bool,
    files: bool,
}

#[derive(Serialize)]
struct JobReport {
    last_run: Option<String>,
    last_success: Option<String>,
    consecutive_failures: u32,
}

impl From<JobStats> for JobReport {
    fn from(s: JobStats) -> Self {
        Self {
            last_run: s.last_run.map(|t| t.to_rfc3339()),
            last_success: s.last_success.map(|t| t.to_rfc3339()),
            consecutive_failures: s.consecutive_failures,
        }
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ping", get(ping))
        .with_state(state)
}

/// Bind and serve until the shutdown token fires.
pub async fn serve(state: Arc<HealthState>, port: u16, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("health server listening on port {port}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn ping() -> &'static str {
    "pong"
}

async fn health(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<HealthReport>) {
    let storage = state.ledger.health_check().is_ok();
    let files = state.quotes_path.exists() && state.images_dir.exists();

    let stats = state.jobs.stats().await;
    let failing_job = stats
        .values()
        .any(|s| s.consecutive_failures >= DEGRADED_AFTER_FAILURES);

    let status = if !storage {
        "unhealthy"
    } else if !files || failing_job {
        "degraded"
    } else {
        "healthy"
    };

    let report = HealthReport {
        status,
        uptime_secs: state.started_at.elapsed().as_secs(),
        checks: Checks { storage, files },
        jobs: stats
            .into_iter()
            .map(|(name, s)| (name, JobReport::from(s)))
            .collect(),
    };

    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}
