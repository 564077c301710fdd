//! tarn-api — HTTP surface of the Tarn controller.
//!
//! Service discovery for clients, a health endpoint for load balancers,
//! and JSON status routes for dashboards. Everything is read-only over
//! the controller's published snapshot.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | `OK` once any replica is ready (no token) |
//! | GET | `/instances` | `host:port` per serving replica |
//! | GET | `/metrics` | Prometheus exposition |
//! | GET | `/api/v1/status` | Target, counts, load, resources, breakers |
//! | GET | `/api/v1/replicas` | Running replicas with load |
//! | GET | `/api/v1/alerts` | Recent alerts, oldest first |
//! | GET | `/api/v1/models` | Models in the repository the caller may read |
//! | GET | `/api/v1/models/{model}/metrics` | Latency percentiles and error rate |

pub mod auth;
pub mod catalog;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::get;
use tarn_scheduler::ControllerHandle;

pub use auth::{AllowAll, Authorizer, Identity, RuleAuthorizer, authorizer_from_config};
pub use catalog::{CatalogError, CatalogResult, DirectoryCatalog, ModelCatalog, catalog_for};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: ControllerHandle,
    pub authorizer: Arc<dyn Authorizer>,
    pub catalog: Arc<dyn ModelCatalog>,
    /// Required on every route but `/health` when set.
    pub token: Option<String>,
    /// Inference port advertised by `/instances`.
    pub replica_http_port: u16,
}

/// Build the complete router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/status", get(handlers::status))
        .route("/replicas", get(handlers::replicas))
        .route("/alerts", get(handlers::alerts))
        .route("/models", get(handlers::list_models))
        .route("/models/{model}/metrics", get(handlers::model_metrics));

    let protected = Router::new()
        .nest("/api/v1", api_routes)
        .route("/instances", get(handlers::instances))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(protected)
        .with_state(state)
}
