//! Token-bucket rate limiter keyed by caller id

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

const DEFAULT_COST: f64 = 1.0;
const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(600);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Per-client view for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ClientBucketStats {
    pub available_tokens: f64,
    pub capacity: f64,
}

/// Token bucket per caller id, refilled at `capacity / 60 s`.
///
/// Buckets idle longer than the eviction interval are dropped; without
/// that, adversarial caller ids grow the map without bound.
pub struct RateLimiter {
    capacity: f64,
    refill_per_second: f64,
    cost: f64,
    idle_eviction: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(capacity_per_minute: u32) -> Self {
        let capacity = capacity_per_minute as f64;
        Self {
            capacity,
            refill_per_second: capacity / 60.0,
            cost: DEFAULT_COST,
            idle_eviction: DEFAULT_IDLE_EVICTION,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_idle_eviction(mut self, idle_eviction: Duration) -> Self {
        self.idle_eviction = idle_eviction;
        self
    }

    /// Refill the caller's bucket and try to take one request's worth.
    pub fn check(&self, client: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(client.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_second).min(self.capacity);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= self.cost {
            bucket.tokens -= self.cost;
            true
        } else {
            warn!(client = %client, "rate limit exceeded");
            false
        }
    }

    pub fn client_stats(&self, client: &str) -> ClientBucketStats {
        let buckets = self.buckets.lock();
        let available = buckets
            .get(client)
            .map(|b| b.tokens)
            .unwrap_or(self.capacity);
        ClientBucketStats {
            available_tokens: available,
            capacity: self.capacity,
        }
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Drop buckets idle past the eviction interval. Returns how many went.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) < self.idle_eviction);
        let evicted = before - buckets.len();
        if evicted > 0 {
            debug!(evicted, "evicted idle rate-limit buckets");
        }
        evicted
    }

    /// Background eviction sweep until shutdown flips.
    pub fn spawn_evictor(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(limiter.idle_eviction / 2);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        limiter.evict_idle();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
