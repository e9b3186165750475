//! # Rill Scheduler
//!
//! Per-model batch formation. Requests wait in three bounded FIFO queues,
//! one per priority class; the inference runner pulls batches, which form
//! when either the size cap or the wait deadline trips.
//!
//! Priority is strict: a batch always drains HIGH before NORMAL before LOW.
//! A steady stream of HIGH traffic can starve LOW; upstream rate limits are
//! the only bound on that.

use parking_lot::Mutex;
use rill_stream::StreamProducer;
use rill_types::{BatchConfig, BatchId, InferenceRequest, Priority, Result, ServeError};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// A queued request paired with the producer half of its token stream.
pub struct BatchSlot {
    pub request: InferenceRequest,
    pub producer: StreamProducer,
    pub enqueued_at: Instant,
}

impl BatchSlot {
    pub fn new(request: InferenceRequest, producer: StreamProducer) -> Self {
        Self {
            request,
            producer,
            enqueued_at: Instant::now(),
        }
    }
}

/// An ordered batch handed to the inference runner.
pub struct Batch {
    pub id: BatchId,
    pub slots: Vec<BatchSlot>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[derive(Default)]
struct Queues {
    high: VecDeque<BatchSlot>,
    normal: VecDeque<BatchSlot>,
    low: VecDeque<BatchSlot>,
}

impl Queues {
    fn total(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<BatchSlot> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    /// Drain up to `max` slots in strict (priority, FIFO) order.
    fn drain(&mut self, max: usize) -> Vec<BatchSlot> {
        let mut batch = Vec::with_capacity(max.min(self.total()));
        for queue in [&mut self.high, &mut self.normal, &mut self.low] {
            while batch.len() < max {
                match queue.pop_front() {
                    Some(slot) => batch.push(slot),
                    None => break,
                }
            }
        }
        batch
    }
}

/// Queue depth by priority level.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueDepth {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
}

/// Scheduler performance counters.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub model: String,
    pub total_requests: u64,
    pub total_batches: u64,
    pub avg_batch_size: f64,
    pub avg_wait_ms: f64,
    pub queue_depth: QueueDepth,
}

/// One scheduler exists per active model name.
pub struct BatchScheduler {
    model: String,
    config: BatchConfig,
    queues: Mutex<Queues>,
    /// Wakes the puller when a slot arrives.
    notify: Notify,
    total_requests: AtomicU64,
    total_batches: AtomicU64,
    total_wait_us: AtomicU64,
}

impl BatchScheduler {
    pub fn new(model: impl Into<String>, config: BatchConfig) -> Self {
        Self {
            model: model.into(),
            config,
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            total_requests: AtomicU64::new(0),
            total_batches: AtomicU64::new(0),
            total_wait_us: AtomicU64::new(0),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Enqueue a slot into its priority queue.
    ///
    /// Returns queue-full when that priority's queue is at capacity; the
    /// caller surfaces this as a 503 with a retry hint.
    pub fn enqueue(&self, slot: BatchSlot) -> Result<()> {
        let priority = slot.request.priority;
        {
            let mut queues = self.queues.lock();
            let queue = queues.queue_mut(priority);
            if queue.len() >= self.config.queue_capacity {
                warn!(
                    model = %self.model,
                    priority = priority.as_str(),
                    "queue full, rejecting request"
                );
                return Err(ServeError::queue_full(&self.model));
            }
            queue.push_back(slot);
        }
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }

    /// Pull the next batch. Blocks until at least one slot is available,
    /// then forms a batch of 1..=max_batch_size:
    ///
    /// 1. A deadline of `max_wait` starts when the first slot is observed.
    /// 2. The scheduler returns early once the queued total reaches the
    ///    size cap.
    /// 3. Otherwise it drains once at the deadline, in strict priority
    ///    order, taking whatever is there.
    ///
    /// Draining only at the deadline is what lets a HIGH slot enqueued
    /// late in the window still lead the batch.
    pub async fn next_batch(&self) -> Batch {
        loop {
            if self.queued_total() == 0 {
                self.notify.notified().await;
                continue;
            }

            let started = Instant::now();
            let deadline = started + self.config.max_wait;
            while self.queued_total() < self.config.max_batch_size {
                if timeout_at(deadline, self.notify.notified()).await.is_err() {
                    break;
                }
            }

            let slots = self.queues.lock().drain(self.config.max_batch_size);
            if slots.is_empty() {
                continue;
            }

            let batch = Batch {
                id: BatchId::new(),
                slots,
            };
            let waited = started.elapsed();
            self.total_batches.fetch_add(1, Ordering::Relaxed);
            self.total_wait_us
                .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
            debug!(
                model = %self.model,
                batch = %batch.id,
                size = batch.len(),
                waited_ms = waited.as_millis() as u64,
                "formed batch"
            );
            return batch;
        }
    }

    pub fn queued_total(&self) -> usize {
        self.queues.lock().total()
    }

    pub fn queue_depth(&self) -> QueueDepth {
        let queues = self.queues.lock();
        QueueDepth {
            high: queues.high.len(),
            normal: queues.normal.len(),
            low: queues.low.len(),
            total: queues.total(),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let requests = self.total_requests.load(Ordering::Relaxed);
        let batches = self.total_batches.load(Ordering::Relaxed);
        let wait_us = self.total_wait_us.load(Ordering::Relaxed);
        SchedulerStats {
            model: self.model.clone(),
            total_requests: requests,
            total_batches: batches,
            avg_batch_size: if batches > 0 {
                requests as f64 / batches as f64
            } else {
                0.0
            },
            avg_wait_ms: if batches > 0 {
                wait_us as f64 / 1000.0 / batches as f64
            } else {
                0.0
            },
            queue_depth: self.queue_depth(),
        }
    }

    /// Drain every queued slot, for shutdown cancellation.
    pub fn drain_all(&self) -> Vec<BatchSlot> {
        let mut queues = self.queues.lock();
        let total = queues.total();
        queues.drain(total)
    }
}
