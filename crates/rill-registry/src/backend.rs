//! The pluggable model capability

use async_trait::async_trait;
use rill_types::{Result, StreamToken};
use tokio::sync::mpsc;

/// One prompt's worth of generation parameters inside a batch.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
}

/// A token emitted for one slot of a batch. Slot indices match the order
/// of the `GenerateRequest` list passed to [`ModelBackend::generate`].
#[derive(Debug, Clone)]
pub struct BatchEmission {
    pub slot: usize,
    pub token: StreamToken,
}

/// The capability a model implementation must expose.
///
/// `generate` receives the whole batch in scheduler order and may emit
/// tokens incrementally through `emitter`; the runner fans them out to the
/// per-request streams as they arrive. The backend decides its own tensor
/// packing. When the receiver is gone (every request in the batch already
/// terminated) `emitter.send` fails; backends should treat that as a
/// cancellation and return.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn generate(
        &self,
        batch: Vec<GenerateRequest>,
        emitter: mpsc::Sender<BatchEmission>,
    ) -> Result<()>;

    /// Liveness probe. Backends without one are assumed healthy.
    async fn health_check(&self) -> bool {
        true
    }

    /// Invoked once after the last reference to an unloaded version drops.
    async fn cleanup(&self) {}
}
