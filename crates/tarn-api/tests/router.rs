//! Router-level tests: token check, identity headers, and route wiring.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tarn_api::{AllowAll, ApiState, Authorizer, DirectoryCatalog, RuleAuthorizer, build_router};
use tarn_core::{AccessRule, Replica, ReplicaPhase, ResourceCapability};
use tarn_metrics::LoadAggregator;
use tarn_scheduler::{ControllerHandle, ControllerStatus};
use tokio::sync::watch;
use tower::ServiceExt;

struct Fixture {
    router: Router,
    aggregator: Arc<LoadAggregator>,
    _models: tempfile::TempDir,
}

fn replica(id: &str, host: &str, phase: ReplicaPhase) -> Replica {
    let mut r = Replica::allocated(id, "node", host, ResourceCapability::new(4096, 2, 1));
    r.phase = phase;
    r
}

fn fixture(token: Option<&str>, authorizer: Arc<dyn Authorizer>, running: Vec<Replica>) -> Fixture {
    let models = tempfile::tempdir().unwrap();
    for name in ["llama", "mistral"] {
        std::fs::create_dir(models.path().join(name)).unwrap();
    }
    let aggregator = Arc::new(LoadAggregator::new());
    let status = ControllerStatus {
        target: 2,
        running,
        pending_allocations: 1,
        aggregate_load: 0.42,
        ..ControllerStatus::default()
    };
    let (_, rx) = watch::channel(status);
    let state = ApiState {
        controller: ControllerHandle::new(rx, Arc::clone(&aggregator)),
        authorizer,
        catalog: Arc::new(DirectoryCatalog::new(models.path())),
        token: token.map(String::from),
        replica_http_port: 8000,
    };
    Fixture {
        router: build_router(state),
        aggregator,
        _models: models,
    }
}

async fn get(router: &Router, uri: &str, headers: &[(&str, &str)]) -> (StatusCode, String) {
    let mut req = Request::builder().uri(uri);
    for (k, v) in headers {
        req = req.header(*k, *v);
    }
    let resp = router
        .clone()
        .oneshot(req.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn json(body: &str) -> serde_json::Value {
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn health_reports_readiness_without_token() {
    let f = fixture(Some("s3cret"), Arc::new(AllowAll), vec![replica("c1", "h1", ReplicaPhase::Launching)]);
    let (status, body) = get(&f.router, "/health", &[]).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, "NO_INSTANCES_READY");

    let f = fixture(Some("s3cret"), Arc::new(AllowAll), vec![replica("c1", "h1", ReplicaPhase::Ready)]);
    let (status, body) = get(&f.router, "/health", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn token_is_required_when_configured() {
    let f = fixture(Some("s3cret"), Arc::new(AllowAll), Vec::new());

    let (status, _) = get(&f.router, "/api/v1/status", &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = get(&f.router, "/instances", &[("x-tarn-token", "wrong")]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = get(&f.router, "/api/v1/status", &[("x-tarn-token", "s3cret")]).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get(&f.router, "/metrics?token=s3cret", &[]).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn no_token_configured_means_open() {
    let f = fixture(None, Arc::new(AllowAll), Vec::new());
    let (status, _) = get(&f.router, "/api/v1/alerts", &[]).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn instances_lists_serving_replicas() {
    let f = fixture(
        None,
        Arc::new(AllowAll),
        vec![
            replica("c1", "10.0.0.1", ReplicaPhase::Ready),
            replica("c2", "10.0.0.2", ReplicaPhase::Launching),
            replica("c3", "10.0.0.3", ReplicaPhase::Stopping),
        ],
    );
    let (status, body) = get(&f.router, "/instances", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "10.0.0.1:8000\n10.0.0.2:8000\n");
}

#[tokio::test]
async fn status_reports_snapshot() {
    let f = fixture(None, Arc::new(AllowAll), vec![replica("c1", "h1", ReplicaPhase::Ready)]);
    let (status, body) = get(&f.router, "/api/v1/status", &[]).await;
    assert_eq!(status, StatusCode::OK);
    let v = json(&body);
    assert_eq!(v["success"], true);
    assert_eq!(v["data"]["target"], 2);
    assert_eq!(v["data"]["running"], 1);
    assert_eq!(v["data"]["ready"], 1);
    assert_eq!(v["data"]["pending_allocations"], 1);
    assert_eq!(v["data"]["progress"], 0.5);
}

#[tokio::test]
async fn replicas_include_scraped_load() {
    let f = fixture(None, Arc::new(AllowAll), vec![replica("c1", "h1", ReplicaPhase::Ready)]);
    f.aggregator
        .ingest("c1", "h1", "nv_gpu_utilization{gpu=\"0\"} 60\nnv_inference_pending_request_count{model=\"llama\"} 4\n")
        .await;

    let (_, body) = get(&f.router, "/api/v1/replicas", &[]).await;
    let v = json(&body);
    assert_eq!(v["data"][0]["id"], "c1");
    assert_eq!(v["data"][0]["load"], 0.6);
    assert_eq!(v["data"][0]["queue_depth"], 4);

    let (_, body) = get(&f.router, "/metrics", &[]).await;
    assert!(body.contains("tarn_replica_load{replica_id=\"c1\",host=\"h1\"} 0.6000"));
    assert!(body.contains("tarn_target_replicas 2"));
}

#[tokio::test]
async fn alerts_are_listed_oldest_first() {
    let f = fixture(None, Arc::new(AllowAll), Vec::new());
    f.aggregator.record_scaling_event("Scale up", 1, 2);
    f.aggregator.record_replica_failure("c7", "exit code 1");

    let (_, body) = get(&f.router, "/api/v1/alerts", &[]).await;
    let v = json(&body);
    assert_eq!(v["data"][0]["kind"], "scaling_event");
    assert_eq!(v["data"][1]["severity"], "critical");
    assert_eq!(v["data"][1]["message"], "Container c7 failed: exit code 1");
}

#[tokio::test]
async fn models_are_filtered_by_authorizer() {
    let rules = vec![AccessRule {
        users: vec!["alice".to_string()],
        resources: vec!["llama".to_string()],
        allow: true,
        ..AccessRule::default()
    }];
    let f = fixture(None, Arc::new(RuleAuthorizer::new(rules)), Vec::new());

    let (_, body) = get(&f.router, "/api/v1/models", &[("x-tarn-user", "alice")]).await;
    assert_eq!(json(&body)["data"], serde_json::json!(["llama"]));

    let (_, body) = get(&f.router, "/api/v1/models", &[("x-tarn-user", "bob")]).await;
    assert_eq!(json(&body)["data"], serde_json::json!([]));

    let (_, body) = get(&f.router, "/api/v1/models", &[]).await;
    assert_eq!(json(&body)["data"], serde_json::json!([]));
}

#[tokio::test]
async fn model_metrics_are_authorized_per_model() {
    let rules = vec![AccessRule {
        groups: vec!["ml".to_string()],
        actions: vec!["read".to_string()],
        allow: true,
        ..AccessRule::default()
    }];
    let f = fixture(None, Arc::new(RuleAuthorizer::new(rules)), Vec::new());
    f.aggregator.record_request("llama", true).await;
    f.aggregator.record_request("llama", false).await;
    f.aggregator.record_latency("llama", 12.0).await;

    let (status, _) = get(&f.router, "/api/v1/models/llama/metrics", &[("x-tarn-user", "eve")]).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let headers = [("x-tarn-user", "carol"), ("x-tarn-groups", "ops, ml")];
    let (status, body) = get(&f.router, "/api/v1/models/llama/metrics", &headers).await;
    assert_eq!(status, StatusCode::OK);
    let v = json(&body);
    assert_eq!(v["data"]["error_rate"], 0.5);
    assert_eq!(v["data"]["request_count"], 2);

    let (status, _) = get(&f.router, "/api/v1/models/unknown/metrics", &headers).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
