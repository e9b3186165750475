//! # Rill Types
//!
//! Shared types for the rillserve inference server: identifiers, errors,
//! request/response payloads and configuration.
//!
//! Every other crate in the workspace depends on this one and nothing in
//! here depends on the async runtime, so the types stay usable from both
//! sync and async contexts.

pub mod config;
pub mod errors;
pub mod ids;
pub mod requests;

pub use config::{BatchConfig, ModelConfig, ServerConfig, StreamConfig};
pub use errors::{Result, ServeError};
pub use ids::{BatchId, ClientId, RequestId};
pub use requests::{
    CompletionReason, InferenceRequest, InferenceResponse, Priority, StreamToken,
};
