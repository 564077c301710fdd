//! HTTP handlers.
//!
//! Every handler reads from the controller's published snapshot or the
//! load aggregator; none of them mutates controller state.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use tarn_core::{Replica, ReplicaPhase, ResourceCapability};
use tarn_health::BreakerSnapshot;
use tarn_metrics::{ControllerGauges, render_prometheus};
use tracing::warn;

use crate::ApiState;
use crate::auth::Identity;
use crate::catalog::CatalogError;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Discovery ──────────────────────────────────────────────────

/// GET /instances: one `host:port` line per serving replica.
pub async fn instances(State(state): State<ApiState>) -> impl IntoResponse {
    let body: String = state
        .controller
        .running_replicas()
        .iter()
        .filter(|r| !r.is_stopping())
        .map(|r| format!("{}:{}\n", r.host, state.replica_http_port))
        .collect();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        body,
    )
}

/// GET /health: 200 once any replica is ready.
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    if state.controller.status().ready_count() > 0 {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NO_INSTANCES_READY")
    }
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub target: u32,
    pub running: usize,
    pub ready: usize,
    pub launching: usize,
    pub pending_allocations: usize,
    pub aggregate_load: f64,
    pub progress: f64,
    pub queue_depth: u64,
    pub available: ResourceCapability,
    pub breakers: Vec<BreakerSnapshot>,
}

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.controller.status();
    ApiResponse::ok(StatusView {
        target: snapshot.target,
        running: snapshot.running.len(),
        ready: snapshot.ready_count(),
        launching: snapshot.launching,
        pending_allocations: snapshot.pending_allocations,
        aggregate_load: snapshot.aggregate_load,
        progress: snapshot.progress(),
        queue_depth: state.controller.aggregator().total_queue_depth().await,
        available: snapshot.available,
        breakers: snapshot.breakers.clone(),
    })
}

#[derive(Debug, Serialize)]
pub struct ReplicaView {
    pub id: String,
    pub node_id: String,
    pub host: String,
    pub phase: ReplicaPhase,
    pub resources: ResourceCapability,
    pub launched_at: u64,
    pub ready_at: Option<u64>,
    pub startup_latency_ms: Option<u64>,
    pub load: f64,
    pub queue_depth: u64,
}

impl ReplicaView {
    fn new(replica: Replica, load: f64, queue_depth: u64) -> Self {
        Self {
            startup_latency_ms: replica.startup_latency_ms(),
            id: replica.id,
            node_id: replica.node_id,
            host: replica.host,
            phase: replica.phase,
            resources: replica.resources,
            launched_at: replica.launched_at,
            ready_at: replica.ready_at,
            load,
            queue_depth,
        }
    }
}

/// GET /api/v1/replicas
pub async fn replicas(State(state): State<ApiState>) -> impl IntoResponse {
    let loads: HashMap<_, _> = state
        .controller
        .aggregator()
        .replica_loads()
        .await
        .into_iter()
        .map(|l| (l.replica_id.clone(), l))
        .collect();
    let views: Vec<_> = state
        .controller
        .running_replicas()
        .into_iter()
        .map(|r| {
            let (load, depth) = loads
                .get(&r.id)
                .map(|l| (l.load, l.queue_depth))
                .unwrap_or_default();
            ReplicaView::new(r, load, depth)
        })
        .collect();
    ApiResponse::ok(views)
}

/// GET /api/v1/alerts, oldest first.
pub async fn alerts(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.controller.recent_alerts())
}

// ── Models ─────────────────────────────────────────────────────

/// GET /api/v1/models: catalog entries the caller may read.
pub async fn list_models(State(state): State<ApiState>, identity: Identity) -> impl IntoResponse {
    let catalog = state.catalog.clone();
    let listed = match tokio::task::spawn_blocking(move || catalog.list_models()).await {
        Ok(listed) => listed,
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };
    let models = match listed {
        Ok(models) => models,
        Err(CatalogError::Unsupported(location)) => {
            warn!(%location, "model catalog cannot list repository");
            Vec::new()
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    };

    let visible: Vec<_> = models
        .into_iter()
        .filter(|m| {
            state
                .authorizer
                .is_allowed(&identity.user, &identity.groups, "read", m)
        })
        .collect();
    ApiResponse::ok(visible).into_response()
}

/// GET /api/v1/models/{model}/metrics
pub async fn model_metrics(
    State(state): State<ApiState>,
    Path(model): Path<String>,
    identity: Identity,
) -> impl IntoResponse {
    if !state
        .authorizer
        .is_allowed(&identity.user, &identity.groups, "read", &model)
    {
        return error_response("forbidden", StatusCode::FORBIDDEN).into_response();
    }
    match state.controller.aggregator().model_metrics(&model).await {
        Some(report) => ApiResponse::ok(report).into_response(),
        None => error_response("model not tracked", StatusCode::NOT_FOUND).into_response(),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.controller.status();
    let gauges = ControllerGauges {
        target: snapshot.target,
        running: snapshot.running.len(),
        pending: snapshot.pending_allocations,
        aggregate_load: snapshot.aggregate_load,
    };
    let aggregator = state.controller.aggregator();
    let body = render_prometheus(
        &gauges,
        &aggregator.replica_loads().await,
        &aggregator.model_reports().await,
    );
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
