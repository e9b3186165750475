//! Request, response and token types for inference

use crate::errors::{Result, ServeError};
use crate::ids::{ClientId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Priority classes applied at batch formation, strictly ordered HIGH > NORMAL > LOW.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Parse the wire form ("HIGH" | "NORMAL" | "LOW").
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "HIGH" => Ok(Self::High),
            "NORMAL" => Ok(Self::Normal),
            "LOW" => Ok(Self::Low),
            other => Err(ServeError::validation(format!(
                "priority must be one of HIGH, NORMAL, LOW, got {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Normal => "NORMAL",
            Self::Low => "LOW",
        }
    }
}

/// An inference request as it travels through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Unique request identifier
    pub id: RequestId,
    /// Model name to run against
    pub model: String,
    /// Input prompt text
    pub prompt: String,
    /// Maximum number of tokens to generate
    pub max_tokens: usize,
    /// Sampling temperature
    pub temperature: f32,
    /// Top-p nucleus sampling
    pub top_p: f32,
    /// Scheduling priority
    pub priority: Priority,
    /// Per-request wall-time budget
    pub timeout: Duration,
    /// Caller-supplied identifier
    pub client_id: Option<ClientId>,
    /// Request creation timestamp
    pub created_at: DateTime<Utc>,
    /// Opaque metadata bag
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InferenceRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            model: model.into(),
            prompt: prompt.into(),
            max_tokens: 100,
            temperature: 1.0,
            top_p: 0.95,
            priority: Priority::Normal,
            timeout: Duration::from_secs_f64(30.0),
            client_id: None,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<ClientId>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Validate parameter ranges. `max_tokens` against the model's sequence
    /// limit is checked separately, once the model is resolved.
    pub fn validate(&self) -> Result<()> {
        if self.model.is_empty() {
            return Err(ServeError::validation("model must not be empty"));
        }
        if self.max_tokens == 0 {
            return Err(ServeError::validation("max_tokens must be positive"));
        }
        if self.temperature < 0.0 {
            return Err(ServeError::validation("temperature must be >= 0"));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ServeError::validation("top_p must be in [0, 1]"));
        }
        if self.timeout.is_zero() {
            return Err(ServeError::validation("timeout must be positive"));
        }
        Ok(())
    }
}

/// A single generated token. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamToken {
    /// Token text
    pub token: String,
    /// Token id in the model's vocabulary
    pub token_id: u32,
    /// Log-probability, when the backend reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprob: Option<f32>,
    /// Terminal marker: no further tokens follow on this stream
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end_of_stream: bool,
    /// Special-token marker (BOS/EOS/padding and friends)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_special: bool,
}

impl StreamToken {
    pub fn new(token: impl Into<String>, token_id: u32) -> Self {
        Self {
            token: token.into(),
            token_id,
            logprob: None,
            end_of_stream: false,
            is_special: false,
        }
    }

    pub fn with_logprob(mut self, logprob: f32) -> Self {
        self.logprob = Some(logprob);
        self
    }

    /// A terminal marker token carrying no text.
    pub fn end_marker() -> Self {
        Self {
            token: String::new(),
            token_id: 0,
            logprob: None,
            end_of_stream: true,
            is_special: true,
        }
    }
}

/// Why a request's stream terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Done,
    Timeout,
    Error,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// Complete (non-streaming) inference response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub request_id: RequestId,
    pub model: String,
    /// Tokens in production order
    pub tokens: Vec<StreamToken>,
    pub total_tokens: usize,
    /// Total wall time in milliseconds
    pub latency_ms: f64,
    pub completion_reason: CompletionReason,
}
