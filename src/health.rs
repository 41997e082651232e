//! Health server
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - liveness (is the process alive?)
//! - `/readyz` - readiness (is the replica status `active`?)
//! - `/statusz` - the coarse status as JSON, with its transition time
//! - `/metrics` - Prometheus metrics

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::controller::status::{CoarseStatus, StatusReport};

/// Reconciliation metrics.
pub struct Metrics {
    /// Events processed to completion.
    pub reconciliations_total: Counter,
    /// Events that ended in a non-retryable error.
    pub reconciliation_errors_total: Counter,
    /// Events re-queued because a precondition did not hold yet.
    pub deferrals_total: Counter,
    /// Restart requests issued to the supervision layer.
    pub restarts_total: Counter,

    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Counter::default();
        registry.register(
            "pgbouncer_operator_reconciliations",
            "Total number of reconciliation passes",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Counter::default();
        registry.register(
            "pgbouncer_operator_reconciliation_errors",
            "Total number of failed reconciliation passes",
            reconciliation_errors_total.clone(),
        );

        let deferrals_total = Counter::default();
        registry.register(
            "pgbouncer_operator_deferrals",
            "Total number of deferred (re-queued) events",
            deferrals_total.clone(),
        );

        let restarts_total = Counter::default();
        registry.register(
            "pgbouncer_operator_service_restarts",
            "Total number of supervised service restart requests",
            restarts_total.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            deferrals_total,
            restarts_total,
            registry,
        }
    }

    /// Encode metrics to Prometheus text format.
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server.
pub struct HealthState {
    report: RwLock<StatusReport>,
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            report: RwLock::new(StatusReport::default()),
            metrics: Metrics::new(),
        }
    }

    pub async fn set_status(&self, status: CoarseStatus) {
        self.report.write().await.update(status);
    }

    pub async fn status(&self) -> CoarseStatus {
        self.report.read().await.status.clone()
    }

    pub async fn report(&self) -> StatusReport {
        self.report.read().await.clone()
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.status().await.is_active() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn statusz(State(state): State<Arc<HealthState>>) -> Response {
    match serde_json::to_string(&state.report().await) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/statusz", get(statusz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server.
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "health server listening");

    axum::serve(listener, app).await
}
