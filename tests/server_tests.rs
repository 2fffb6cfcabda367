//! HTTP control plane tests.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use gpu_partd::collab::sim::SimDevice;
use gpu_partd::config::Config;
use gpu_partd::control::{new_shared_control_plane, ControlPlane};
use gpu_partd::metrics::Metrics;
use gpu_partd::server::api::{build_router, AppState, SetPartitionsResponse};

struct TestApp {
    _dir: tempfile::TempDir,
    _sim: SimDevice,
    router: Router,
}

fn app(admin_token: Option<&str>) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.persistence.path = dir.path().join("topology.bin");
    config.server.admin_token = admin_token.map(str::to_string);

    let sim = SimDevice::new(config.device.memory_size);
    let metrics = Metrics::new().unwrap();
    let control = ControlPlane::from_config(&config, sim.collaborators(), metrics.clone()).unwrap();
    let state = Arc::new(AppState {
        control: new_shared_control_plane(control),
        config: Arc::new(config),
        metrics,
        start_time: Instant::now(),
    });
    TestApp {
        _dir: dir,
        _sim: sim,
        router: build_router(state),
    }
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, body)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_reports_mode() {
    let app = app(None);
    let (status, body) = call(&app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["platform"], "bare_metal");
    assert_eq!(body["partitioning_enabled"], false);
}

#[tokio::test]
async fn test_partition_lifecycle() {
    let app = app(None);

    let (status, body) = call(
        &app.router,
        post(
            "/v1/partitions",
            json!({ "entries": [{ "valid": true, "profile": "half" }, { "valid": true, "profile": "quarter" }] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["swizz_ids"], json!([1, 5]));

    let (status, body) = call(&app.router, get("/v1/partitions?all=true")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
    assert_eq!(body[0]["profile"], "half");

    let (status, body) = call(
        &app.router,
        post("/v1/partitions/1/compute", json!({ "shape": { "by": "size", "value": "quarter" } })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let cp = body["id"].as_u64().unwrap();

    let (status, export) = call(&app.router, get(&format!("/v1/partitions/1/compute/{cp}/export"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(export["size"], "quarter");

    let (status, _) = call(
        &app.router,
        Request::delete(format!("/v1/partitions/1/compute/{cp}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(&app.router, post("/v1/partitions/1/compute/import", export.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["uuid"], export["uuid"]);

    let (status, body) = call(&app.router, get("/v1/partitions/1/compute/profiles")).await;
    assert_eq!(status, StatusCode::OK);
    let quarter = body
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["size"] == "quarter")
        .unwrap();
    assert_eq!(quarter["available"], 1);
    assert_eq!(quarter["total"], 2);
}

#[tokio::test]
async fn test_errors_map_to_status_codes() {
    let app = app(None);

    let (status, body) = call(
        &app.router,
        post("/v1/partitions", json!({ "entries": [{ "valid": true, "profile": "bogus" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_argument");

    let (status, body) = call(&app.router, get("/v1/partitions/9/compute")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    call(
        &app.router,
        post("/v1/partitions", json!({ "entries": [{ "valid": true, "profile": "full" }] })),
    )
    .await;
    let (status, body) = call(
        &app.router,
        post("/v1/partitions", json!({ "entries": [{ "valid": true, "profile": "eighth" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
    assert_eq!(body["error"], "insufficient_resources");
}

#[tokio::test]
async fn test_admin_token_gates_mutations() {
    let app = app(Some("s3cret"));
    let batch = json!({ "entries": [{ "valid": true, "profile": "eighth" }] });

    let (status, body) = call(&app.router, post("/v1/partitions", batch.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "permission_denied");

    let request = Request::post("/v1/partitions")
        .header("content-type", "application/json")
        .header("authorization", "Bearer s3cret")
        .body(Body::from(batch.to_string()))
        .unwrap();
    let (status, body) = call(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    let swizz = body["swizz_ids"][0].as_u64().unwrap();

    // Unprivileged callers see only what they subscribe to.
    let as_alice = |req: axum::http::request::Builder| req.header("x-client-id", "alice");
    let (_, body) = call(&app.router, as_alice(Request::get("/v1/partitions")).body(Body::empty()).unwrap()).await;
    assert_eq!(body, json!([]));

    let (status, sub) = call(
        &app.router,
        as_alice(Request::post("/v1/subscriptions"))
            .header("content-type", "application/json")
            .body(Body::from(json!({ "swizz_id": swizz }).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sub["client_id"], "alice");

    let (_, body) = call(&app.router, as_alice(Request::get("/v1/partitions")).body(Body::empty()).unwrap()).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["subscribers"], 1);

    let id = sub["id"].as_str().unwrap();
    let (status, _) = call(
        &app.router,
        as_alice(Request::delete(format!("/v1/subscriptions/{id}")))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_capacity_and_profiles() {
    let app = app(None);
    let (status, body) = call(&app.router, get("/v1/partitions/capacity/quarter")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], 4);
    assert_eq!(body["spans"].as_array().unwrap().len(), 4);

    let (_, body) = call(&app.router, get("/v1/partitions/capacity/eighth+me")).await;
    assert_eq!(body["available"], 1);
    assert_eq!(body["total"], 1);
    call(
        &app.router,
        post("/v1/partitions", json!({ "entries": [{ "valid": true, "profile": "eighth+me" }] })),
    )
    .await;
    let (status, body) = call(&app.router, get("/v1/partitions/capacity/eighth+me")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available"], 0);
    assert_eq!(body["spans"], json!([]));

    let (status, body) = call(&app.router, get("/v1/partitions/profiles")).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["full", "half", "quarter", "eighth", "eighth+me"]);
}

#[tokio::test]
async fn test_mode_toggle_and_metrics() {
    let app = app(None);
    call(
        &app.router,
        post("/v1/partitions", json!({ "entries": [{ "valid": true, "profile": "half" }] })),
    )
    .await;

    let (status, body) = call(&app.router, post("/v1/mode", json!({ "enabled": false }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);

    let (status, body) = call(&app.router, post("/v1/mode", json!({ "enabled": true }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], true);
    assert_eq!(body["restored"]["source"], "record");
    assert_eq!(body["restored"]["gpu_partitions"], json!([1]));

    let response = app.router.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("gpu_partd_gpu_partitions 1"));
    assert!(text.contains(r#"gpu_partd_operations_total{op="set_partitions",outcome="ok"} 1"#));
}

#[tokio::test]
async fn test_live_server_round_trip() {
    let app = app(None);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/v1/partitions"))
        .json(&json!({ "entries": [{ "valid": true, "profile": "quarter", "placement": { "kind": "span", "value": 4 } }] }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: SetPartitionsResponse = response.json().await.unwrap();
    assert_eq!(body.swizz_ids, vec![5]);

    let health: Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["gpu_partitions"], 1);
    assert_eq!(health["partitioning_enabled"], true);
}
