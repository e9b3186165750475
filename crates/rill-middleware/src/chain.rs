//! Ordered middleware chain

use crate::{MetricsCollector, RateLimiter, RequestLogger};
use rill_types::{InferenceRequest, RequestId, Result, ServeError};
use std::sync::Arc;

/// Runs rate limiting, then logging, on admission; records metrics and the
/// completion log entry when a request finishes.
///
/// The limiter and collector are shared so background sweeps and the
/// metrics endpoints can reach them directly.
pub struct MiddlewareChain {
    rate_limiter: Arc<RateLimiter>,
    logger: RequestLogger,
    metrics: Arc<MetricsCollector>,
}

impl MiddlewareChain {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        logger: RequestLogger,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            rate_limiter,
            logger,
            metrics,
        }
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// The rate-limit key: the caller-supplied id, or the peer address.
    pub fn client_key(request: &InferenceRequest, peer_addr: &str) -> String {
        request
            .client_id
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(|| peer_addr.to_string())
    }

    /// Admit or reject a request. Rejections are logged but do not touch
    /// the error metrics; they never reached the model.
    pub fn admit(&self, request: &InferenceRequest, peer_addr: &str) -> Result<()> {
        let key = Self::client_key(request, peer_addr);
        if !self.rate_limiter.check(&key) {
            return Err(ServeError::rate_limited(key));
        }
        self.logger.log_admitted(request, &key);
        Ok(())
    }

    /// Record a completed (admitted) request.
    pub fn record_completion(
        &self,
        request_id: &RequestId,
        model: &str,
        latency_ms: f64,
        tokens_generated: u64,
        outcome: &str,
        error: Option<&str>,
    ) {
        self.logger.log_completed(
            request_id,
            model,
            tokens_generated,
            latency_ms,
            outcome,
            error,
        );
        self.metrics
            .record(model, latency_ms, tokens_generated, error.is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(capacity: u32) -> MiddlewareChain {
        MiddlewareChain::new(
            Arc::new(RateLimiter::new(capacity)),
            RequestLogger::new(),
            Arc::new(MetricsCollector::new(100)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn admit_rejects_past_capacity() {
        let chain = chain(2);
        let request = InferenceRequest::new("gpt2", "hi").with_client_id("alice");

        assert!(chain.admit(&request, "1.2.3.4:5").is_ok());
        assert!(chain.admit(&request, "1.2.3.4:5").is_ok());
        let err = chain.admit(&request, "1.2.3.4:5").unwrap_err();
        assert!(matches!(err, ServeError::RateLimited { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_client_id_falls_back_to_peer_address() {
        let chain = chain(1);
        let request = InferenceRequest::new("gpt2", "hi");

        assert!(chain.admit(&request, "10.0.0.1:9000").is_ok());
        assert!(chain.admit(&request, "10.0.0.1:9000").is_err());
        // A different peer is a different bucket.
        assert!(chain.admit(&request, "10.0.0.2:9000").is_ok());
    }

    #[tokio::test]
    async fn completion_feeds_metrics() {
        let chain = chain(10);
        let id = RequestId::new();
        chain.record_completion(&id, "gpt2", 12.5, 7, "done", None);
        chain.record_completion(&id, "gpt2", 50.0, 0, "error", Some("model exploded"));

        let metrics = chain.metrics().snapshot("gpt2");
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.total_tokens, 7);
    }
}
