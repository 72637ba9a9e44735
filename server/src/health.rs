use crate::rest::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use datagrid_cluster::MemberState;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn to_http_status(self) -> StatusCode {
        match self {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub timestamp: u64,
}

impl ComponentHealth {
    fn healthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: Some(message.into()),
            timestamp: current_timestamp(),
        }
    }

    fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            timestamp: current_timestamp(),
        }
    }

    fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            timestamp: current_timestamp(),
        }
    }
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Readiness check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub timestamp: u64,
    pub checks: Vec<ComponentHealth>,
}

/// Liveness check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub timestamp: u64,
    pub uptime_seconds: u64,
}

/// Liveness probe: the process is up and serving HTTP
#[instrument(skip(state))]
pub async fn health_liveness(State(state): State<AppState>) -> Json<LivenessResponse> {
    let now = current_timestamp();
    Json(LivenessResponse {
        alive: true,
        timestamp: now,
        uptime_seconds: now.saturating_sub(state.started_at),
    })
}

/// Readiness probe: ready while the member is in a view. A locator without
/// a hosted member is ready as soon as it listens.
#[instrument(skip(state))]
pub async fn health_readiness(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let mut checks = Vec::new();

    if let Some(endpoint) = state.locator {
        checks.push(ComponentHealth::healthy(
            "locator",
            format!("listening on {}", endpoint),
        ));
    }

    match state.membership() {
        Some(handle) => {
            let check = match handle.state() {
                MemberState::Member | MemberState::Coordinator => {
                    let view_id = handle.current_view().map(|v| v.id()).unwrap_or(0);
                    ComponentHealth::healthy(
                        "membership",
                        format!("{} in view {}", handle.state(), view_id),
                    )
                }
                MemberState::Joining => ComponentHealth::degraded("membership", "joining"),
                MemberState::Left => ComponentHealth::unhealthy(
                    "membership",
                    handle
                        .forced_disconnect_reason()
                        .unwrap_or_else(|| "left the cluster".to_string()),
                ),
            };
            checks.push(check);
        }
        None if state.locator.is_none() => {
            checks.push(ComponentHealth::unhealthy("membership", "not started"));
        }
        None => {}
    }

    let ready = checks.iter().all(|c| c.status == HealthStatus::Healthy);
    let status = if ready {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };
    debug!("Readiness check: ready={}, checks={}", ready, checks.len());

    (
        status.to_http_status(),
        Json(ReadinessResponse {
            ready,
            timestamp: current_timestamp(),
            checks,
        }),
    )
}
