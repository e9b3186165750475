//! Composition root shared by every handler

use crate::runner;
use parking_lot::RwLock;
use rill_middleware::{MetricsCollector, MiddlewareChain, RateLimiter, RequestLogger};
use rill_registry::ModelRegistry;
use rill_scheduler::BatchScheduler;
use rill_stream::{CloseReason, StreamManager};
use rill_types::{Result, ServeError, ServerConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Process-scoped state: the registry, stream manager, middleware chain and
/// the per-model schedulers. Passed explicitly into the HTTP frontend
/// rather than living in globals.
pub struct AppState {
    config: ServerConfig,
    registry: Arc<ModelRegistry>,
    streams: Arc<StreamManager>,
    chain: Arc<MiddlewareChain>,
    schedulers: RwLock<HashMap<String, Arc<BatchScheduler>>>,
    active_connections: AtomicUsize,
    draining: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl AppState {
    pub fn new(config: ServerConfig, registry: Arc<ModelRegistry>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let chain = MiddlewareChain::new(
            Arc::new(RateLimiter::new(config.rate_limit_per_minute)),
            RequestLogger::new(),
            Arc::new(MetricsCollector::default()),
        );
        Arc::new(Self {
            streams: Arc::new(StreamManager::new(config.stream_config())),
            chain: Arc::new(chain),
            config,
            registry,
            schedulers: RwLock::new(HashMap::new()),
            active_connections: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn chain(&self) -> &Arc<MiddlewareChain> {
        &self.chain
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Flip the draining flag: `/health` starts answering 503 and new
    /// requests are rejected.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Release);
        info!("server draining, rejecting new requests");
    }

    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Admit a connection, or reject when draining or at the cap.
    pub fn track_connection(self: &Arc<Self>) -> Result<ConnectionGuard> {
        if self.is_draining() {
            return Err(ServeError::ShuttingDown);
        }
        let previous = self.active_connections.fetch_add(1, Ordering::AcqRel);
        if previous >= self.config.max_connections {
            self.active_connections.fetch_sub(1, Ordering::AcqRel);
            return Err(ServeError::overloaded(format!(
                "connection limit {} reached",
                self.config.max_connections
            )));
        }
        Ok(ConnectionGuard {
            state: Arc::clone(self),
        })
    }

    /// The scheduler for a model name, created (with its runner task) on
    /// the first request for that name.
    pub fn scheduler_for(self: &Arc<Self>, model: &str) -> Arc<BatchScheduler> {
        if let Some(scheduler) = self.schedulers.read().get(model) {
            return Arc::clone(scheduler);
        }

        let mut schedulers = self.schedulers.write();
        // Re-check under the write lock; another request may have won.
        if let Some(scheduler) = schedulers.get(model) {
            return Arc::clone(scheduler);
        }
        let scheduler = Arc::new(BatchScheduler::new(model, self.config.batch_config()));
        schedulers.insert(model.to_string(), Arc::clone(&scheduler));
        debug!(model = %model, "created scheduler and runner");
        runner::spawn_runner(Arc::clone(self), Arc::clone(&scheduler));
        scheduler
    }

    pub fn scheduler_stats(&self) -> HashMap<String, rill_scheduler::SchedulerStats> {
        self.schedulers
            .read()
            .iter()
            .map(|(name, s)| (name.clone(), s.stats()))
            .collect()
    }

    /// Cancel every slot still waiting in a queue (shutdown path).
    pub fn cancel_queued(&self) {
        let schedulers: Vec<Arc<BatchScheduler>> =
            self.schedulers.read().values().cloned().collect();
        for scheduler in schedulers {
            for slot in scheduler.drain_all() {
                slot.producer.close(CloseReason::Shutdown);
            }
        }
    }
}

/// RAII connection counter.
pub struct ConnectionGuard {
    state: Arc<AppState>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}
