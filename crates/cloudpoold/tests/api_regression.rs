//! API regression tests.
//!
//! Drives the full router against a pool controller backed by the
//! in-memory driver: resizing, scale-in scheduling, per-machine actions
//! and error statuses.

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use chrono::Utc;
use serde_json::{Value, json};
use tower::ServiceExt;

use cloudpool_alert::MemoryAlertSink;
use cloudpool_api::build_router;
use cloudpool_core::{CloudPoolConfig, Machine, MachineState, VictimSelectionPolicy};
use cloudpool_driver::InMemoryDriver;
use cloudpool_engine::PoolController;

fn pool_config(margin: i64) -> CloudPoolConfig {
    CloudPoolConfig::from_toml_str(&format!(
        r#"
name = "web"

[driver]
kind = "memory"
pool_identifier = "sim"

[scale_out]
size = "m1.small"
image = "ubuntu-24.04"

[scale_in]
victim_selection_policy = "OLDEST_INSTANCE"
instance_hour_margin = {margin}
"#
    ))
    .unwrap()
}

struct TestPool {
    router: Router,
    driver: Arc<InMemoryDriver>,
    alerts: MemoryAlertSink,
}

async fn test_pool(running: u32, margin: i64) -> TestPool {
    let driver = Arc::new(InMemoryDriver::new("sim").unwrap().with_running_machines(running).await);
    let alerts = MemoryAlertSink::new();
    let controller = PoolController::new(
        &pool_config(margin),
        driver.clone(),
        Arc::new(alerts.clone()),
    )
    .unwrap();

    TestPool {
        router: build_router(Arc::new(controller)),
        driver,
        alerts,
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn with_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

async fn body_json(resp: Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn pool_snapshot_lists_machines() {
    let pool = test_pool(2, 0).await;

    let resp = pool.router.oneshot(get("/api/v1/pool")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["success"], true);
    let machines = body["data"]["machines"].as_array().unwrap();
    assert_eq!(machines.len(), 2);
    assert_eq!(machines[0]["state"], "RUNNING");
    assert!(machines[0]["launchTime"].is_string());
}

#[tokio::test]
async fn pool_size_before_any_pass() {
    let pool = test_pool(2, 0).await;

    let resp = pool.router.oneshot(get("/api/v1/pool/size")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["data"]["desiredSize"], 2);
    assert_eq!(body["data"]["allocated"], 2);
    assert_eq!(body["data"]["effectiveSize"], 2);
}

#[tokio::test]
async fn resize_scales_out() {
    let pool = test_pool(2, 0).await;

    let req = with_json("POST", "/api/v1/pool/size", json!({ "desiredSize": 5 }));
    let resp = pool.router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["data"]["desiredSize"], 5);
    assert_eq!(body["data"]["allocated"], 5);
    assert_eq!(pool.driver.calls().await.launches, vec![3]);
}

#[tokio::test]
async fn negative_size_is_rejected() {
    let pool = test_pool(2, 0).await;

    let req = with_json("POST", "/api/v1/pool/size", json!({ "desiredSize": -1 }));
    let resp = pool.router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body = body_json(resp).await;
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("non-negative"));
    assert!(pool.driver.calls().await.launches.is_empty());
}

#[tokio::test]
async fn scale_in_schedules_before_the_instance_hour() {
    let pool = test_pool(3, 300).await;

    let req = with_json("POST", "/api/v1/pool/size", json!({ "desiredSize": 1 }));
    let resp = pool.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["data"]["effectiveSize"], 1);

    let resp = pool
        .router
        .oneshot(get("/api/v1/pool/terminations"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    let pending = body["data"].as_array().unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending[0]["machine"]["id"].is_string());
    assert!(pending[0]["terminationTime"].is_string());

    assert!(pool.driver.calls().await.terminations.is_empty());
}

#[tokio::test]
async fn scale_in_without_margin_terminates_immediately() {
    let pool = test_pool(3, 0).await;

    let req = with_json("POST", "/api/v1/pool/size", json!({ "desiredSize": 1 }));
    let resp = pool.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(pool.driver.calls().await.terminations.len(), 2);

    let resp = pool
        .router
        .oneshot(get("/api/v1/pool/terminations"))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn terminate_machine_with_decrement() {
    let pool = test_pool(2, 0).await;

    let req = with_json(
        "POST",
        "/api/v1/pool/sim-0001/terminate",
        json!({ "decrementDesiredSize": true }),
    );
    let resp = pool.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["data"]["machineId"], "sim-0001");
    assert_eq!(body["data"]["action"], "terminated");

    let resp = pool.router.oneshot(get("/api/v1/pool/size")).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["data"]["desiredSize"], 1);
    assert!(pool.driver.calls().await.launches.is_empty());
}

#[tokio::test]
async fn terminate_unknown_machine_is_not_found() {
    let pool = test_pool(1, 0).await;

    let req = with_json("POST", "/api/v1/pool/nope/terminate", json!({}));
    let resp = pool.router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn attach_then_detach() {
    let pool = test_pool(2, 0).await;
    pool.driver
        .insert_unmanaged(Machine::new("ext-1", MachineState::Running).with_launch_time(Utc::now()))
        .await;

    let resp = pool
        .router
        .clone()
        .oneshot(with_json("POST", "/api/v1/pool/ext-1/attach", json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = pool.router.clone().oneshot(get("/api/v1/pool/size")).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["data"]["desiredSize"], 3);
    assert_eq!(body["data"]["allocated"], 3);

    let req = with_json(
        "POST",
        "/api/v1/pool/ext-1/detach",
        json!({ "decrementDesiredSize": true }),
    );
    let resp = pool.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = pool.router.oneshot(get("/api/v1/pool/size")).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["data"]["desiredSize"], 2);
    assert!(pool.driver.calls().await.launches.is_empty());
    assert!(pool.driver.calls().await.terminations.is_empty());
}

#[tokio::test]
async fn attach_unknown_machine_is_not_found() {
    let pool = test_pool(1, 0).await;

    let resp = pool
        .router
        .oneshot(with_json("POST", "/api/v1/pool/ghost/attach", json!({})))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn service_state_is_set_and_alerted() {
    let pool = test_pool(1, 0).await;

    let req = with_json(
        "POST",
        "/api/v1/pool/sim-0001/serviceState",
        json!({ "serviceState": "OUT_OF_SERVICE" }),
    );
    let resp = pool.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let alerts = pool.alerts.alerts().await;
    assert!(
        alerts
            .iter()
            .any(|a| a.message == "Service state set to OUT_OF_SERVICE for machine sim-0001")
    );

    let req = with_json(
        "POST",
        "/api/v1/pool/sim-0001/serviceState",
        json!({ "serviceState": "SLEEPING" }),
    );
    let resp = pool.router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn tags_round_trip() {
    let pool = test_pool(1, 0).await;

    let req = with_json(
        "POST",
        "/api/v1/pool/sim-0001/tags",
        json!({ "tags": { "role": "web", "team": "edge" } }),
    );
    let resp = pool.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let machine = pool.driver.machine("sim-0001").await.unwrap();
    assert_eq!(machine.metadata.get("role").map(String::as_str), Some("web"));

    let req = with_json(
        "DELETE",
        "/api/v1/pool/sim-0001/tags",
        json!({ "tagKeys": ["role"] }),
    );
    let resp = pool.router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let machine = pool.driver.machine("sim-0001").await.unwrap();
    assert!(!machine.metadata.contains_key("role"));
    assert!(machine.metadata.contains_key("team"));
}

#[tokio::test]
async fn metadata_is_exposed() {
    let pool = test_pool(0, 0).await;

    let resp = pool
        .router
        .oneshot(get("/api/v1/pool/metadata"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["data"]["poolIdentifier"], "sim");
    assert!(!body["data"]["supportedApiVersions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn driver_failure_is_bad_gateway() {
    let pool = test_pool(1, 0).await;
    pool.driver.fail_next_lists(1).await;

    let resp = pool.router.oneshot(get("/api/v1/pool")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[test]
fn sample_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("pool.toml");
    let config = CloudPoolConfig::from_file(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.name, "webservers");
    assert_eq!(
        config.scale_in.victim_selection_policy,
        VictimSelectionPolicy::ClosestToInstanceHour
    );
    assert_eq!(config.scale_in.instance_hour_margin, 300);
    assert_eq!(
        config.pool_update.update_interval().unwrap(),
        std::time::Duration::from_secs(30)
    );
}
