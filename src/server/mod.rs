// HTTP surface: liveness for the guardian, health for humans and
// orchestrators, status for a quick look at what the bot is doing.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::{MonitorSettings, ServerSettings};
use crate::models::Signal;
use crate::state::{SharedState, StateSnapshot};

#[derive(Clone)]
pub struct ServerContext {
    pub state: Arc<SharedState>,
    pub staleness_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub last_update: Option<DateTime<Utc>>,
    pub uptime_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    #[serde(flatten)]
    snapshot: StateSnapshot,
    recent_decisions: Vec<Signal>,
}

/// Health verdict from the heartbeat age. A process that has not
/// completed a cycle yet is treated as healthy; staleness only applies
/// once a first heartbeat exists.
pub fn build_report(
    now: DateTime<Utc>,
    started_at: DateTime<Utc>,
    last_update: Option<DateTime<Utc>>,
    staleness_secs: u64,
) -> (bool, HealthReport) {
    let uptime_seconds = (now - started_at).num_seconds();
    match last_update {
        Some(ts) => {
            let age = (now - ts).num_seconds();
            if age > staleness_secs as i64 {
                (
                    false,
                    HealthReport {
                        status: "unhealthy",
                        last_update,
                        uptime_seconds,
                        reason: Some(format!("no cycle update for {age}s")),
                    },
                )
            } else {
                (
                    true,
                    HealthReport {
                        status: "healthy",
                        last_update,
                        uptime_seconds,
                        reason: None,
                    },
                )
            }
        }
        None => (
            true,
            HealthReport {
                status: "healthy",
                last_update: None,
                uptime_seconds,
                reason: None,
            },
        ),
    }
}

async fn health(State(ctx): State<ServerContext>) -> (StatusCode, Json<HealthReport>) {
    let snapshot = ctx.state.snapshot().await;
    let (healthy, report) = build_report(
        Utc::now(),
        snapshot.started_at,
        snapshot.last_update,
        ctx.staleness_secs,
    );
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

/// Bare liveness: the process is up and serving.
async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn status(State(ctx): State<ServerContext>) -> Json<StatusReport> {
    let snapshot = ctx.state.snapshot().await;
    let recent_decisions = ctx.state.recent_decisions().await;
    Json(StatusReport {
        snapshot,
        recent_decisions,
    })
}

pub fn router(ctx: ServerContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(ctx)
}

pub async fn run(
    settings: ServerSettings,
    monitor: &MonitorSettings,
    state: Arc<SharedState>,
) -> std::io::Result<()> {
    let ctx = ServerContext {
        state,
        staleness_secs: monitor.staleness_secs,
    };
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("health server listening on {}", addr);
    axum::serve(listener, router(ctx)).await
}
