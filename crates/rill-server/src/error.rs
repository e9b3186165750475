//! HTTP mapping for serve errors

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rill_types::ServeError;
use serde_json::json;

/// Newtype so the error enum stays transport-free in `rill-types`.
#[derive(Debug)]
pub struct ApiError(pub ServeError);

impl From<ServeError> for ApiError {
    fn from(err: ServeError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ServeError::Validation { .. } | ServeError::Serialization { .. } => {
                StatusCode::BAD_REQUEST
            }
            ServeError::UnknownModel { .. } => StatusCode::NOT_FOUND,
            ServeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServeError::QueueFull { .. }
            | ServeError::Overloaded { .. }
            | ServeError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ServeError::Inference { .. }
            | ServeError::LoadError { .. }
            | ServeError::WarmupError { .. }
            | ServeError::AlreadyLoaded { .. }
            | ServeError::Timeout { .. }
            | ServeError::Io { .. }
            | ServeError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match &self.0 {
            ServeError::Validation { .. } => "validation_error",
            ServeError::Serialization { .. } => "validation_error",
            ServeError::UnknownModel { .. } => "unknown_model",
            ServeError::RateLimited { .. } => "rate_limited",
            ServeError::QueueFull { .. } => "queue_full",
            ServeError::Overloaded { .. } => "overloaded",
            ServeError::ShuttingDown => "shutting_down",
            ServeError::Inference { .. } => "inference_error",
            ServeError::LoadError { .. } => "load_error",
            ServeError::WarmupError { .. } => "warmup_error",
            ServeError::AlreadyLoaded { .. } => "already_loaded",
            ServeError::Timeout { .. } => "timeout",
            ServeError::Io { .. } => "io_error",
            ServeError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "message": self.0.to_string(),
                "type": self.error_type(),
            }
        }));

        let mut response = (status, body).into_response();
        if matches!(self.0, ServeError::QueueFull { .. }) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}
