//! Deterministic stub backend for tests and the demo binary

use crate::backend::{BatchEmission, GenerateRequest, ModelBackend};
use async_trait::async_trait;
use rill_types::{Result, ServeError, StreamToken};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A model that emits `tok0 tok1 ...` for every prompt, interleaving slots
/// the way a batched decoder produces one token per sequence per step.
///
/// Knobs cover what the tests need: a per-step delay to exercise timeouts
/// and idle sweeps, and a failure message to exercise batch-atomic error
/// propagation. Counters expose how often generate/cleanup ran.
pub struct StubBackend {
    step_delay: Duration,
    fail_with: Option<String>,
    healthy: std::sync::atomic::AtomicBool,
    pub generate_calls: AtomicU64,
    pub cleanup_calls: Arc<AtomicU64>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            step_delay: Duration::ZERO,
            fail_with: None,
            healthy: std::sync::atomic::AtomicBool::new(true),
            generate_calls: AtomicU64::new(0),
            cleanup_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sleep this long between decode steps.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Every generate call fails with this message.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Share the cleanup counter before handing the backend away.
    pub fn cleanup_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.cleanup_calls)
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelBackend for StubBackend {
    async fn generate(
        &self,
        batch: Vec<GenerateRequest>,
        emitter: mpsc::Sender<BatchEmission>,
    ) -> Result<()> {
        self.generate_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(message) = &self.fail_with {
            return Err(ServeError::inference(message.clone()));
        }

        let max_steps = batch.iter().map(|r| r.max_tokens).max().unwrap_or(0);
        for step in 0..max_steps {
            for (slot, request) in batch.iter().enumerate() {
                if step >= request.max_tokens {
                    continue;
                }
                let mut token = StreamToken::new(format!("tok{step}"), step as u32)
                    .with_logprob(-0.1 * (step as f32 + 1.0));
                if step + 1 == request.max_tokens {
                    token.end_of_stream = true;
                }
                if emitter.send(BatchEmission { slot, token }).await.is_err() {
                    // Every stream in the batch is gone.
                    return Ok(());
                }
            }
            if !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn cleanup(&self) {
        self.cleanup_calls.fetch_add(1, Ordering::Relaxed);
    }
}
