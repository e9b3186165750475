//! HTTP endpoints and wire parsing

use crate::error::ApiError;
use crate::state::AppState;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rill_scheduler::BatchSlot;
use rill_stream::StreamConsumer;
use rill_types::{
    CompletionReason, InferenceRequest, InferenceResponse, Priority, ServeError, StreamToken,
};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Build the application router with its middleware stack.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/infer", post(infer))
        .route("/infer_stream", post(infer_stream))
        .route("/health", get(health))
        .route("/models", get(models))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Parse the request body by hand so every rejection is a 400 with a
/// message naming the field, rather than the extractor's default.
fn parse_request(body: &Value, default_timeout: Duration) -> Result<InferenceRequest, ServeError> {
    let object = body
        .as_object()
        .ok_or_else(|| ServeError::validation("request body must be a JSON object"))?;

    let model = object
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| ServeError::validation("missing required field: model"))?;
    let prompt = object
        .get("prompt")
        .and_then(Value::as_str)
        .ok_or_else(|| ServeError::validation("missing required field: prompt"))?;

    let mut request = InferenceRequest::new(model, prompt).with_timeout(default_timeout);

    if let Some(value) = object.get("max_tokens") {
        request.max_tokens = value
            .as_u64()
            .ok_or_else(|| ServeError::validation("max_tokens must be a positive integer"))?
            as usize;
    }
    if let Some(value) = object.get("temperature") {
        request.temperature = value
            .as_f64()
            .ok_or_else(|| ServeError::validation("temperature must be a number"))?
            as f32;
    }
    if let Some(value) = object.get("top_p") {
        request.top_p = value
            .as_f64()
            .ok_or_else(|| ServeError::validation("top_p must be a number"))?
            as f32;
    }
    if let Some(value) = object.get("priority") {
        let text = value
            .as_str()
            .ok_or_else(|| ServeError::validation("priority must be a string"))?;
        request.priority = Priority::parse(text)?;
    }
    if let Some(value) = object.get("client_id") {
        let text = value
            .as_str()
            .ok_or_else(|| ServeError::validation("client_id must be a string"))?;
        request.client_id = Some(text.into());
    }
    if let Some(value) = object.get("timeout_s") {
        let seconds = value
            .as_f64()
            .ok_or_else(|| ServeError::validation("timeout_s must be a number"))?;
        if seconds <= 0.0 {
            return Err(ServeError::validation("timeout_s must be positive"));
        }
        request.timeout = Duration::from_secs_f64(seconds);
    }
    if let Some(value) = object.get("metadata") {
        let map = value
            .as_object()
            .ok_or_else(|| ServeError::validation("metadata must be an object"))?;
        request.metadata = map.clone().into_iter().collect();
    }

    request.validate()?;
    Ok(request)
}

fn peer_key(connect_info: &Option<ConnectInfo<SocketAddr>>) -> String {
    connect_info
        .as_ref()
        .map(|info| info.0.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Shared admission path: connection guard, parse, model resolution,
/// middleware, stream creation, enqueue.
fn admit(
    state: &Arc<AppState>,
    body: &Value,
    peer: &str,
) -> Result<(InferenceRequest, StreamConsumer), ApiError> {
    let request = parse_request(body, state.config().request_timeout())?;

    let model = state.registry().lookup(&request.model)?;
    let max_seq = model.config().max_seq_length;
    if request.max_tokens > max_seq {
        return Err(ServeError::validation(format!(
            "max_tokens {} exceeds model max_seq_length {}",
            request.max_tokens, max_seq
        ))
        .into());
    }

    state.chain().admit(&request, peer)?;

    let (producer, consumer) = state.streams().create(request.id.clone(), None)?;
    let scheduler = state.scheduler_for(&request.model);
    if let Err(e) = scheduler.enqueue(BatchSlot::new(request.clone(), producer)) {
        state
            .streams()
            .close(&request.id, rill_stream::CloseReason::Cancelled);
        return Err(e.into());
    }
    debug!(request = %request.id, model = %request.model, "request enqueued");
    Ok((request, consumer))
}

/// `POST /infer` — collect every token, answer with one JSON document.
async fn infer(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let guard = state.track_connection()?;
    let started = tokio::time::Instant::now();
    let peer = peer_key(&connect_info);
    let (request, mut consumer) = admit(&state, &body, &peer)?;

    let mut tokens: Vec<StreamToken> = Vec::new();
    let mut reason = None;
    while let Some(token) = consumer.next().await {
        let end = token.end_of_stream;
        if !(end && token.token.is_empty()) {
            tokens.push(token);
        }
        if end {
            reason = Some(CompletionReason::Done);
            break;
        }
    }
    let completion_reason = reason.unwrap_or_else(|| consumer.completion_reason());
    if completion_reason == CompletionReason::Error {
        // A failed batch returns no partial success in collected mode.
        let message = consumer
            .error_message()
            .unwrap_or_else(|| "generation failed".to_string());
        return Err(ServeError::inference(message).into());
    }

    let response = InferenceResponse {
        request_id: request.id,
        model: request.model,
        total_tokens: tokens.len(),
        tokens,
        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        completion_reason,
    };
    drop(guard);
    Ok(Json(response).into_response())
}

/// `POST /infer_stream` — newline-delimited JSON, one object per token,
/// flushed as produced, terminated by `{"end": true, ...}`.
async fn infer_stream(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let guard = state.track_connection()?;
    let peer = peer_key(&connect_info);
    let (_request, mut consumer) = admit(&state, &body, &peer)?;

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(16);
    tokio::spawn(async move {
        // The guard lives for as long as the body is being written.
        let _guard = guard;
        let mut reason = None;
        while let Some(token) = consumer.next().await {
            let end = token.end_of_stream;
            if !(end && token.token.is_empty()) {
                let line = match serde_json::to_string(&token) {
                    Ok(line) => line,
                    Err(_) => break,
                };
                if tx.send(Ok(Bytes::from(line + "\n"))).await.is_err() {
                    // Client hung up; dropping the consumer cancels the
                    // stream and the runner discards further tokens.
                    return;
                }
            }
            if end {
                reason = Some(CompletionReason::Done);
                break;
            }
        }
        let reason = reason.unwrap_or_else(|| consumer.completion_reason());
        let terminal = match consumer.error_message() {
            Some(message) => {
                json!({ "end": true, "completion_reason": reason, "error": message })
            }
            None => json!({ "end": true, "completion_reason": reason }),
        };
        let _ = tx
            .send(Ok(Bytes::from(format!("{terminal}\n"))))
            .await;
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| ServeError::internal(format!("failed to build response: {e}")))?;
    Ok(response)
}

/// `GET /health` — liveness summary; 503 while draining.
async fn health(State(state): State<Arc<AppState>>) -> Response {
    if state.is_draining() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "draining" })),
        )
            .into_response();
    }
    Json(json!({
        "status": "healthy",
        "active_connections": state.connection_count(),
        "active_streams": state.streams().active_streams(),
    }))
    .into_response()
}

/// `GET /models` — loaded names, versions and the active version.
async fn models(State(state): State<Arc<AppState>>) -> Response {
    let listings = state.registry().list_models();
    Json(json!({
        "total_models": listings.len(),
        "models": listings,
    }))
    .into_response()
}

/// `GET /metrics` — per-model sliding-window aggregates.
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    Json(state.chain().metrics().all()).into_response()
}

/// `GET /status` — composite debug view.
async fn status(State(state): State<Arc<AppState>>) -> Response {
    let listings = state.registry().list_models();
    let model_stats: Vec<_> = listings
        .iter()
        .filter_map(|listing| state.registry().model_stats(&listing.name))
        .collect();
    Json(json!({
        "is_draining": state.is_draining(),
        "active_connections": state.connection_count(),
        "active_streams": state.streams().active_streams(),
        "loaded_models": listings,
        "model_stats": model_stats,
        "schedulers": state.scheduler_stats(),
    }))
    .into_response()
}
