//! End-to-end tests against the router with the stub backend

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use rill_registry::{LoaderFn, ModelBackend, ModelRegistry, StubBackend};
use rill_server::{build_router, AppState};
use rill_types::{ModelConfig, ServerConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn stub_loader(step_delay: Duration) -> LoaderFn {
    Arc::new(move |_config| {
        Box::pin(async move {
            Ok(Arc::new(StubBackend::new().with_step_delay(step_delay)) as Arc<dyn ModelBackend>)
        })
    })
}

fn failing_loader(message: &'static str) -> LoaderFn {
    Arc::new(move |_config| {
        Box::pin(async move {
            Ok(Arc::new(StubBackend::new().failing(message)) as Arc<dyn ModelBackend>)
        })
    })
}

async fn setup(config: ServerConfig) -> (Arc<AppState>, axum::Router) {
    let registry = Arc::new(ModelRegistry::new());
    registry
        .register_loader("stub", stub_loader(Duration::ZERO), false)
        .unwrap();
    let mut model_config = ModelConfig::new("stub", "1.0.0");
    model_config.warmup_tokens = 2;
    registry.load(model_config).await.unwrap();

    let state = AppState::new(config, registry);
    let router = build_router(Arc::clone(&state));
    (state, router)
}

fn fast_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.max_batch_wait_ms = 5;
    config
}

fn infer_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/infer")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn missing_required_field_is_400() {
    let (_state, router) = setup(fast_config()).await;

    let response = router
        .oneshot(infer_request(json!({ "prompt": "hi" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "validation_error");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("model"));
}

#[tokio::test]
async fn bad_priority_is_400() {
    let (_state, router) = setup(fast_config()).await;

    let response = router
        .oneshot(infer_request(json!({
            "model": "stub", "prompt": "hi", "priority": "URGENT"
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn out_of_range_max_tokens_is_400() {
    let (_state, router) = setup(fast_config()).await;

    let response = router
        .oneshot(infer_request(json!({
            "model": "stub", "prompt": "hi", "max_tokens": 0
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Beyond the model's sequence limit.
    let (_state, router) = setup(fast_config()).await;
    let response = router
        .oneshot(infer_request(json!({
            "model": "stub", "prompt": "hi", "max_tokens": 1_000_000
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_model_is_404() {
    let (_state, router) = setup(fast_config()).await;

    let response = router
        .oneshot(infer_request(json!({ "model": "gpt9", "prompt": "hi" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "unknown_model");
}

#[tokio::test]
async fn infer_collects_all_tokens() {
    let (_state, router) = setup(fast_config()).await;

    let response = router
        .oneshot(infer_request(json!({
            "model": "stub", "prompt": "hello world", "max_tokens": 5
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["completion_reason"], "done");
    assert_eq!(body["total_tokens"], 5);
    let tokens = body["tokens"].as_array().unwrap();
    assert_eq!(tokens.len(), 5);
    // Production order, by construction of the stub.
    for (i, token) in tokens.iter().enumerate() {
        assert_eq!(token["token"], format!("tok{i}"));
        assert_eq!(token["token_id"], i as u64);
        assert!(token["logprob"].is_f64());
    }
}

#[tokio::test]
async fn max_tokens_one_yields_exactly_one_token() {
    let (_state, router) = setup(fast_config()).await;

    let response = router
        .oneshot(infer_request(json!({
            "model": "stub", "prompt": "hi", "max_tokens": 1
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["total_tokens"], 1);
    assert_eq!(body["completion_reason"], "done");
}

#[tokio::test]
async fn infer_stream_is_newline_delimited_json() {
    let (_state, router) = setup(fast_config()).await;

    let request = Request::builder()
        .method("POST")
        .uri("/infer_stream")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "model": "stub", "prompt": "hi", "max_tokens": 3 }).to_string(),
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-ndjson"
    );

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let lines: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(lines.len(), 4, "3 tokens plus the terminal object");
    for (i, line) in lines[..3].iter().enumerate() {
        assert_eq!(line["token"], format!("tok{i}"));
        assert_eq!(line["token_id"], i as u64);
    }
    assert_eq!(lines[3]["end"], true);
    assert_eq!(lines[3]["completion_reason"], "done");
}

#[tokio::test]
async fn rate_limited_request_is_429() {
    let mut config = fast_config();
    config.rate_limit_per_minute = 2;
    let (_state, router) = setup(config).await;

    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(infer_request(json!({
                "model": "stub", "prompt": "hi", "max_tokens": 1, "client_id": "alice"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = router
        .oneshot(infer_request(json!({
            "model": "stub", "prompt": "hi", "max_tokens": 1, "client_id": "alice"
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "rate_limited");
}

#[tokio::test]
async fn inference_error_is_500_with_message() {
    let config = fast_config();
    let registry = Arc::new(ModelRegistry::new());
    registry
        .register_loader("broken", failing_loader("gpu on fire"), false)
        .unwrap();
    let mut model_config = ModelConfig::new("broken", "1.0.0");
    model_config.warmup_tokens = 0;
    registry.load(model_config).await.unwrap();

    let state = AppState::new(config, registry);
    let router = build_router(state);

    let response = router
        .oneshot(infer_request(json!({
            "model": "broken", "prompt": "hi", "max_tokens": 3
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "inference_error");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("gpu on fire"));
}

#[tokio::test]
async fn request_timeout_completes_with_timeout_reason() {
    let config = fast_config();
    let registry = Arc::new(ModelRegistry::new());
    registry
        .register_loader("slow", stub_loader(Duration::from_millis(50)), false)
        .unwrap();
    let mut model_config = ModelConfig::new("slow", "1.0.0");
    model_config.warmup_tokens = 0;
    registry.load(model_config).await.unwrap();

    let state = AppState::new(config, registry);
    let router = build_router(state);

    let response = router
        .oneshot(infer_request(json!({
            "model": "slow", "prompt": "hi", "max_tokens": 100, "timeout_s": 0.12
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["completion_reason"], "timeout");
    // Some tokens made it out before the budget ran out.
    assert!(body["total_tokens"].as_u64().unwrap() >= 1);
    assert!(body["total_tokens"].as_u64().unwrap() < 100);
}

#[tokio::test]
async fn health_reports_liveness_and_flips_on_drain() {
    let (state, router) = setup(fast_config()).await;

    let response = router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert!(body["active_connections"].is_u64());
    assert!(body["active_streams"].is_u64());

    state.begin_drain();
    let response = router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // New work is rejected while draining.
    let response = router
        .oneshot(infer_request(json!({ "model": "stub", "prompt": "hi" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "shutting_down");
}

#[tokio::test]
async fn connection_cap_rejects_with_503() {
    let mut config = fast_config();
    config.max_connections = 1;
    let (state, router) = setup(config).await;

    let _held = state.track_connection().unwrap();
    let response = router
        .oneshot(infer_request(json!({ "model": "stub", "prompt": "hi" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "overloaded");
}

#[tokio::test]
async fn models_endpoint_lists_versions_and_active() {
    let (state, router) = setup(fast_config()).await;
    let mut v2 = ModelConfig::new("stub", "2.0.0");
    v2.warmup_tokens = 0;
    state.registry().load(v2).await.unwrap();

    let response = router
        .oneshot(Request::get("/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["total_models"], 1);
    assert_eq!(body["models"][0]["name"], "stub");
    assert_eq!(
        body["models"][0]["versions"],
        json!(["1.0.0", "2.0.0"])
    );
    assert_eq!(body["models"][0]["active"], "1.0.0");
}

#[tokio::test]
async fn metrics_reflect_completed_requests() {
    let (_state, router) = setup(fast_config()).await;

    let response = router
        .clone()
        .oneshot(infer_request(json!({
            "model": "stub", "prompt": "hi", "max_tokens": 4
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The runner records the completion right after the final push; give
    // it a beat before reading the aggregates.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = router
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_body(response).await;
    let stub = &body["stub"];
    assert_eq!(stub["request_count"], 1);
    assert_eq!(stub["error_count"], 0);
    assert_eq!(stub["total_tokens"], 4);
    assert!(stub["latency_ms"]["p50"].is_f64() || stub["latency_ms"]["p50"].is_u64());
}

#[tokio::test]
async fn status_is_a_composite_view() {
    let (_state, router) = setup(fast_config()).await;

    let response = router
        .clone()
        .oneshot(infer_request(json!({
            "model": "stub", "prompt": "hi", "max_tokens": 1
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = router
        .oneshot(Request::get("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["is_draining"], false);
    assert_eq!(body["loaded_models"][0]["name"], "stub");
    assert_eq!(body["schedulers"]["stub"]["total_requests"], 1);
    assert_eq!(body["model_stats"][0]["requests"], 1);
}

#[tokio::test]
async fn in_flight_requests_complete_during_drain() {
    let config = fast_config();
    let registry = Arc::new(ModelRegistry::new());
    registry
        .register_loader("slow", stub_loader(Duration::from_millis(20)), false)
        .unwrap();
    let mut model_config = ModelConfig::new("slow", "1.0.0");
    model_config.warmup_tokens = 0;
    registry.load(model_config).await.unwrap();

    let state = AppState::new(config, registry);
    let router = build_router(Arc::clone(&state));

    let in_flight = {
        let router = router.clone();
        tokio::spawn(async move {
            router
                .oneshot(infer_request(json!({
                    "model": "slow", "prompt": "hi", "max_tokens": 5
                })))
                .await
                .unwrap()
        })
    };

    // Let the request get admitted, then start draining.
    tokio::time::sleep(Duration::from_millis(30)).await;
    state.begin_drain();

    let response = in_flight.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["completion_reason"], "done");
    assert_eq!(body["total_tokens"], 5);
}
