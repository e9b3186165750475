//! Sliding-window latency and throughput metrics

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;

pub const DEFAULT_WINDOW_SIZE: usize = 1000;

#[derive(Clone, Copy)]
struct Sample {
    latency_ms: f64,
    tokens: u64,
    error: bool,
    completed_at: Instant,
}

#[derive(Default)]
struct ModelWindow {
    samples: VecDeque<Sample>,
    /// Lifetime counters, not windowed.
    request_count: u64,
    error_count: u64,
    token_count: u64,
}

/// Exact latency percentiles over the current window.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencySummary {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Aggregates for one model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelMetrics {
    pub model: String,
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<LatencySummary>,
    pub tokens_per_second: f64,
}

/// Retains the last N completed requests per model.
///
/// Appends take the window lock briefly; percentile queries copy the
/// latency slice under the lock and sort the copy outside it.
pub struct MetricsCollector {
    window_size: usize,
    windows: Mutex<HashMap<String, ModelWindow>>,
}

impl MetricsCollector {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, model: &str, latency_ms: f64, tokens: u64, error: bool) {
        let mut windows = self.windows.lock();
        let window = windows.entry(model.to_string()).or_default();
        window.samples.push_back(Sample {
            latency_ms,
            tokens,
            error,
            completed_at: Instant::now(),
        });
        while window.samples.len() > self.window_size {
            window.samples.pop_front();
        }
        window.request_count += 1;
        window.token_count += tokens;
        if error {
            window.error_count += 1;
        }
    }

    pub fn snapshot(&self, model: &str) -> ModelMetrics {
        let (latencies, counts, window_tokens, span) = {
            let windows = self.windows.lock();
            match windows.get(model) {
                None => {
                    return ModelMetrics {
                        model: model.to_string(),
                        request_count: 0,
                        error_count: 0,
                        error_rate: 0.0,
                        total_tokens: 0,
                        latency_ms: None,
                        tokens_per_second: 0.0,
                    }
                }
                Some(window) => {
                    let latencies: Vec<f64> =
                        window.samples.iter().map(|s| s.latency_ms).collect();
                    let window_tokens: u64 = window.samples.iter().map(|s| s.tokens).sum();
                    let span = match (window.samples.front(), window.samples.back()) {
                        (Some(first), Some(last)) => last
                            .completed_at
                            .saturating_duration_since(first.completed_at)
                            .as_secs_f64(),
                        _ => 0.0,
                    };
                    (
                        latencies,
                        (window.request_count, window.error_count, window.token_count),
                        window_tokens,
                        span,
                    )
                }
            }
        };

        let (request_count, error_count, total_tokens) = counts;
        ModelMetrics {
            model: model.to_string(),
            request_count,
            error_count,
            error_rate: if request_count > 0 {
                error_count as f64 / request_count as f64
            } else {
                0.0
            },
            total_tokens,
            latency_ms: summarize(latencies),
            tokens_per_second: if span > 0.0 {
                window_tokens as f64 / span
            } else {
                0.0
            },
        }
    }

    pub fn all(&self) -> HashMap<String, ModelMetrics> {
        let names: Vec<String> = self.windows.lock().keys().cloned().collect();
        names
            .into_iter()
            .map(|name| {
                let snapshot = self.snapshot(&name);
                (name, snapshot)
            })
            .collect()
    }

    /// Current window occupancy for a model, for invariant checks.
    pub fn window_len(&self, model: &str) -> usize {
        self.windows
            .lock()
            .get(model)
            .map(|w| w.samples.len())
            .unwrap_or(0)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

/// Exact nearest-rank percentiles over the window snapshot.
fn summarize(mut latencies: Vec<f64>) -> Option<LatencySummary> {
    if latencies.is_empty() {
        return None;
    }
    latencies.sort_by(|a, b| a.total_cmp(b));
    let n = latencies.len();
    let rank = |q: f64| -> f64 {
        let idx = ((n as f64 * q).ceil() as usize).max(1) - 1;
        latencies[idx.min(n - 1)]
    };
    Some(LatencySummary {
        p50: rank(0.50),
        p95: rank(0.95),
        p99: rank(0.99),
        min: latencies[0],
        max: latencies[n - 1],
        mean: latencies.iter().sum::<f64>() / n as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_model_has_no_latency_summary() {
        let collector = MetricsCollector::new(10);
        let metrics = collector.snapshot("gpt2");
        assert_eq!(metrics.request_count, 0);
        assert!(metrics.latency_ms.is_none());
        assert_eq!(metrics.error_rate, 0.0);
    }

    #[tokio::test]
    async fn window_never_exceeds_capacity() {
        let collector = MetricsCollector::new(5);
        for i in 0..20 {
            collector.record("gpt2", i as f64, 1, false);
        }
        assert_eq!(collector.window_len("gpt2"), 5);

        // The window keeps the most recent samples.
        let metrics = collector.snapshot("gpt2");
        let latency = metrics.latency_ms.unwrap();
        assert_eq!(latency.min, 15.0);
        assert_eq!(latency.max, 19.0);
        // Lifetime counters are not windowed.
        assert_eq!(metrics.request_count, 20);
    }

    #[tokio::test]
    async fn percentiles_are_exact_over_the_window() {
        let collector = MetricsCollector::new(1000);
        for i in 1..=100 {
            collector.record("gpt2", i as f64, 1, false);
        }
        let latency = collector.snapshot("gpt2").latency_ms.unwrap();
        assert_eq!(latency.p50, 50.0);
        assert_eq!(latency.p95, 95.0);
        assert_eq!(latency.p99, 99.0);
        assert_eq!(latency.min, 1.0);
        assert_eq!(latency.max, 100.0);
        assert!((latency.mean - 50.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn single_sample_percentiles() {
        let collector = MetricsCollector::new(10);
        collector.record("gpt2", 42.0, 3, false);
        let latency = collector.snapshot("gpt2").latency_ms.unwrap();
        assert_eq!(latency.p50, 42.0);
        assert_eq!(latency.p99, 42.0);
    }

    #[tokio::test]
    async fn error_rate_counts_errors() {
        let collector = MetricsCollector::new(10);
        collector.record("gpt2", 10.0, 0, true);
        collector.record("gpt2", 10.0, 5, false);
        collector.record("gpt2", 10.0, 5, false);
        collector.record("gpt2", 10.0, 0, true);

        let metrics = collector.snapshot("gpt2");
        assert_eq!(metrics.error_count, 2);
        assert!((metrics.error_rate - 0.5).abs() < 1e-9);
        assert_eq!(metrics.total_tokens, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_per_second_over_window_span() {
        let collector = MetricsCollector::new(10);
        collector.record("gpt2", 1.0, 30, false);
        tokio::time::advance(Duration::from_secs(2)).await;
        collector.record("gpt2", 1.0, 30, false);

        let metrics = collector.snapshot("gpt2");
        // 60 tokens over a 2 s window span.
        assert!((metrics.tokens_per_second - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn all_models_reported() {
        let collector = MetricsCollector::new(10);
        collector.record("a", 1.0, 1, false);
        collector.record("b", 2.0, 1, false);
        let all = collector.all();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("a") && all.contains_key("b"));
    }
}
