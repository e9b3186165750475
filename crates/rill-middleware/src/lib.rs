//! # Rill Middleware
//!
//! The three request-path middleware: a per-caller token-bucket rate
//! limiter, a structured request logger, and a per-model sliding-window
//! metrics collector. [`MiddlewareChain`] runs them in that order on
//! admission and records outcomes on completion.

mod chain;
mod logger;
mod metrics;
mod rate_limit;

pub use chain::MiddlewareChain;
pub use logger::RequestLogger;
pub use metrics::{LatencySummary, MetricsCollector, ModelMetrics};
pub use rate_limit::{ClientBucketStats, RateLimiter};
