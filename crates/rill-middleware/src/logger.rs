//! Structured request logging

use rill_types::InferenceRequest;
use tracing::{error, info};

/// Emits one structured record at admission and one at completion.
///
/// Records go through `tracing` with key-value fields; the subscriber
/// installed at startup decides between single-line key=value and JSON.
pub struct RequestLogger;

impl RequestLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn log_admitted(&self, request: &InferenceRequest, client_key: &str) {
        info!(
            target: "rill::requests",
            event = "request_admitted",
            request_id = %request.id,
            client_id = %client_key,
            model = %request.model,
            priority = request.priority.as_str(),
            prompt_length = request.prompt.len(),
            max_tokens = request.max_tokens,
            "request admitted"
        );
    }

    pub fn log_completed(
        &self,
        request_id: &rill_types::RequestId,
        model: &str,
        tokens_generated: u64,
        latency_ms: f64,
        outcome: &str,
        error: Option<&str>,
    ) {
        match error {
            Some(message) => error!(
                target: "rill::requests",
                event = "request_completed",
                request_id = %request_id,
                model = %model,
                tokens_generated,
                latency_ms,
                outcome,
                error = %message,
                "request failed"
            ),
            None => info!(
                target: "rill::requests",
                event = "request_completed",
                request_id = %request_id,
                model = %model,
                tokens_generated,
                latency_ms,
                outcome,
                "request completed"
            ),
        }
    }
}

impl Default for RequestLogger {
    fn default() -> Self {
        Self::new()
    }
}
