//! Admin HTTP API.
//!
//! - `GET /healthz`: JSON status of every registered component
//! - `GET /livez`, `GET /readyz`: bare 200/503 for probes
//! - `GET /metrics`: Prometheus text format
//! - `GET /routes`: current routing table

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::proxy::RouteTable;
use crate::shutdown::signalled;
use crate::status::{ComponentStatus, Status};

/// Shared state for the admin handlers.
#[derive(Clone)]
pub struct ApiState {
    components: Arc<Vec<(&'static str, Arc<ComponentStatus>)>>,
    route_table: Arc<RouteTable>,
    metrics: PrometheusHandle,
}

impl ApiState {
    pub fn new(route_table: Arc<RouteTable>, metrics: PrometheusHandle) -> Self {
        Self {
            components: Arc::new(Vec::new()),
            route_table,
            metrics,
        }
    }

    /// Report `status` under `name` in health checks.
    pub fn with_component(mut self, name: &'static str, status: Arc<ComponentStatus>) -> Self {
        Arc::make_mut(&mut self.components).push((name, status));
        self
    }

    fn overall(&self) -> (Status, BTreeMap<&'static str, Status>) {
        let details: BTreeMap<_, _> = self
            .components
            .iter()
            .map(|(name, status)| (*name, status.status()))
            .collect();
        let status = if details.values().all(|s| *s == Status::Up) {
            Status::Up
        } else {
            Status::Down
        };
        (status, details)
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: Status,
    pub details: BTreeMap<&'static str, Status>,
}

/// One routing table entry.
#[derive(Debug, Serialize)]
pub struct RouteEntry {
    pub id: String,
    pub frontend: String,
    pub backend: String,
}

/// Create the admin router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(probe))
        .route("/readyz", get(probe))
        .route("/metrics", get(render_metrics))
        .route("/routes", get(routes))
        .with_state(state)
}

fn status_code(status: Status) -> StatusCode {
    match status {
        Status::Up => StatusCode::OK,
        Status::Down => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    let (status, details) = state.overall();
    (status_code(status), Json(HealthResponse { status, details }))
}

async fn probe(State(state): State<ApiState>) -> StatusCode {
    status_code(state.overall().0)
}

async fn render_metrics(State(state): State<ApiState>) -> String {
    state.metrics.render()
}

async fn routes(State(state): State<ApiState>) -> Json<Vec<RouteEntry>> {
    let entries = state
        .route_table
        .routes()
        .into_iter()
        .map(|(id, route)| RouteEntry {
            id: id.to_string(),
            frontend: route.frontend,
            backend: route.backend,
        })
        .collect();
    Json(entries)
}

/// Serve the admin API until shutdown is signalled.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind admin API on {addr}"))?;
    info!(addr = %addr, "Admin API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            signalled(&mut shutdown).await;
            info!("Admin API shutting down");
        })
        .await
        .context("Admin API server failed")
}
