use crate::health;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use datagrid_cluster::{MemberState, MembershipHandle, PartitionState};
use datagrid_common::{Member, SuspectRecord, View};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// REST API response wrapper
#[derive(Serialize)]
#[serde(bound(serialize = "T: Serialize"))]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// What the HTTP surface reports on
#[derive(Clone)]
pub struct AppState {
    pub member: Option<MembershipHandle>,
    pub locator: Option<SocketAddr>,
    pub metrics: Option<PrometheusHandle>,
    pub started_at: u64,
}

impl AppState {
    pub fn new(
        member: Option<MembershipHandle>,
        locator: Option<SocketAddr>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            member,
            locator,
            metrics,
            started_at: health::current_timestamp(),
        }
    }

    pub fn membership(&self) -> Option<&MembershipHandle> {
        self.member.as_ref()
    }
}

/// Snapshot of the local member's view of the cluster
#[derive(Debug, Serialize)]
pub struct MembershipResponse {
    pub member: Member,
    pub state: MemberState,
    pub view: Option<View>,
    pub coordinator: Option<Member>,
    pub lead_member: Option<Member>,
    pub partition: PartitionState,
    pub suspects: Vec<SuspectRecord>,
    pub forced_disconnect: Option<String>,
}

impl MembershipResponse {
    fn from_handle(handle: &MembershipHandle) -> Self {
        Self {
            member: handle.local_member(),
            state: handle.state(),
            view: handle.current_view().map(|v| v.as_ref().clone()),
            coordinator: handle.coordinator(),
            lead_member: handle.lead_member(),
            partition: handle.partition_state(),
            suspects: handle.suspects(),
            forced_disconnect: handle.forced_disconnect_reason(),
        }
    }
}

/// Current view as seen by this process
#[instrument(skip(state))]
async fn membership_view(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<MembershipResponse>>) {
    match state.membership() {
        Some(handle) => (
            StatusCode::OK,
            Json(ApiResponse::success(MembershipResponse::from_handle(handle))),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error("this process hosts no member".to_string())),
        ),
    }
}

/// Prometheus text exposition
async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain")],
            "metrics exporter not installed\n".to_string(),
        ),
    }
}

/// Create the status router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health::health_liveness))
        .route("/health/ready", get(health::health_readiness))
        .route("/membership/view", get(membership_view))
        .route("/metrics", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the status surface until `shutdown` resolves
pub async fn start_rest_server<F>(
    addr: SocketAddr,
    state: AppState,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    info!("Starting status server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
