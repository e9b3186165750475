//! Ownership and lifecycle of all live streams

use crate::stream::{CloseReason, StreamConsumer, StreamProducer, StreamShared};
use parking_lot::RwLock;
use rill_types::{Result, ServeError, StreamConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

struct StreamEntry {
    shared: Arc<StreamShared>,
    /// Closed entries survive one sweep so late drainers still observe the
    /// terminal state, then get reaped on the next.
    reap_on_next_sweep: bool,
}

/// Point-in-time view of one stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub request_id: String,
    pub elapsed_seconds: f64,
    pub token_count: u64,
    pub tokens_per_second: f64,
    pub backpressure_events: u64,
    pub is_closed: bool,
}

/// Creates, closes, sweeps and reaps the per-request token streams.
pub struct StreamManager {
    config: StreamConfig,
    streams: RwLock<HashMap<rill_types::RequestId, StreamEntry>>,
}

impl StreamManager {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            streams: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Allocate a stream for a request. Fails if the id is already live.
    pub fn create(
        &self,
        id: rill_types::RequestId,
        idle_timeout: Option<Duration>,
    ) -> Result<(StreamProducer, StreamConsumer)> {
        let mut streams = self.streams.write();
        if streams.contains_key(&id) {
            return Err(ServeError::internal(format!("stream {id} already exists")));
        }

        let (tx, rx) = mpsc::channel(self.config.buffer_size);
        let shared = Arc::new(StreamShared::new(
            id.clone(),
            tx,
            idle_timeout.unwrap_or(self.config.idle_timeout),
            self.config.push_wait,
        ));
        streams.insert(
            id.clone(),
            StreamEntry {
                shared: Arc::clone(&shared),
                reap_on_next_sweep: false,
            },
        );
        debug!(stream = %id, "created stream");

        Ok((
            StreamProducer::new(Arc::clone(&shared)),
            StreamConsumer::new(rx, shared),
        ))
    }

    /// Close a stream by id. Unknown ids are ignored; close is idempotent.
    pub fn close(&self, id: &rill_types::RequestId, reason: CloseReason) {
        if let Some(entry) = self.streams.read().get(id) {
            entry.shared.close(reason);
        }
    }

    /// Count of open (not yet closed) streams.
    pub fn active_streams(&self) -> usize {
        self.streams
            .read()
            .values()
            .filter(|e| !e.shared.is_closed())
            .count()
    }

    pub fn stream_stats(&self, id: &rill_types::RequestId) -> Option<StreamStats> {
        let streams = self.streams.read();
        let entry = streams.get(id)?;
        let shared = &entry.shared;
        let elapsed = shared.created_at().elapsed().as_secs_f64();
        let tokens = shared.token_count();
        Some(StreamStats {
            request_id: id.to_string(),
            elapsed_seconds: elapsed,
            token_count: tokens,
            tokens_per_second: if elapsed > 0.0 {
                tokens as f64 / elapsed
            } else {
                0.0
            },
            backpressure_events: shared.backpressure_events(),
            is_closed: shared.is_closed(),
        })
    }

    /// One sweep pass: close streams idle past their timeout (strictly
    /// greater, so a cadence exactly matching the timeout never closes a
    /// healthy stream), and reap streams that were already closed on the
    /// previous pass. Returns the number closed as idle.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut closed = 0;
        let mut reap = Vec::new();

        let mut streams = self.streams.write();
        for (id, entry) in streams.iter_mut() {
            if entry.shared.is_closed() {
                if entry.reap_on_next_sweep {
                    reap.push(id.clone());
                } else {
                    entry.reap_on_next_sweep = true;
                }
            } else if entry.shared.idle_age(now) > entry.shared.idle_timeout() {
                entry.shared.close(CloseReason::Idle);
                closed += 1;
            }
        }
        for id in &reap {
            streams.remove(id);
        }
        if closed > 0 || !reap.is_empty() {
            debug!(closed_idle = closed, reaped = reap.len(), "stream sweep");
        }
        closed
    }

    /// Background sweep at the configured cadence, until shutdown flips.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.config.sweep_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        manager.sweep();
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

    /// Close every stream and drop the table.
    pub fn shutdown(&self) {
        let mut streams = self.streams.write();
        let count = streams.len();
        for entry in streams.values() {
            entry.shared.close(CloseReason::Shutdown);
        }
        streams.clear();
        info!(streams = count, "stream manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::PushOutcome;
    use rill_types::{RequestId, StreamToken};

    fn test_config(buffer: usize) -> StreamConfig {
        StreamConfig {
            buffer_size: buffer,
            push_wait: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn tokens_arrive_in_push_order() {
        let manager = StreamManager::new(test_config(16));
        let (producer, mut consumer) = manager.create(RequestId::new(), None).unwrap();

        for i in 0..10u32 {
            let outcome = producer.push(StreamToken::new(format!("t{i}"), i)).await;
            assert_eq!(outcome, PushOutcome::Accepted);
        }
        producer.close(CloseReason::Done);

        let mut seen = Vec::new();
        while let Some(token) = consumer.next().await {
            seen.push(token.token_id);
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(consumer.completion_reason(), rill_types::CompletionReason::Done);
    }

    #[tokio::test]
    async fn duplicate_stream_id_rejected() {
        let manager = StreamManager::new(test_config(4));
        let id = RequestId::new();
        let _pair = manager.create(id.clone(), None).unwrap();
        assert!(manager.create(id, None).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumer_closes_stream() {
        let manager = StreamManager::new(test_config(100));
        let (producer, mut consumer) = manager.create(RequestId::new(), None).unwrap();

        let reader = tokio::spawn(async move {
            // Read one token, stall for 5 s, then drain whatever is left.
            let first = consumer.next().await;
            assert!(first.is_some());
            tokio::time::sleep(Duration::from_secs(5)).await;
            let mut delivered = 1;
            while consumer.next().await.is_some() {
                delivered += 1;
            }
            delivered
        });

        let mut pushed = 0;
        let mut closed = false;
        for i in 0..200u32 {
            match producer.push(StreamToken::new("x", i)).await {
                PushOutcome::Accepted | PushOutcome::Backpressured => pushed += 1,
                PushOutcome::Closed => {
                    closed = true;
                    break;
                }
            }
        }

        assert!(closed, "producer should observe the slow-consumer close");
        assert_eq!(producer.shared().close_reason(), Some(CloseReason::SlowConsumer));
        assert!(producer.shared().backpressure_events() >= 1);

        let delivered = reader.await.unwrap();
        // One read up front plus the full buffer; nothing pushed after the
        // close can appear.
        assert!(delivered >= 100 && delivered <= pushed + 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_first_reason_wins() {
        let manager = StreamManager::new(test_config(4));
        let (producer, _consumer) = manager.create(RequestId::new(), None).unwrap();

        producer.close(CloseReason::RequestTimeout);
        producer.close(CloseReason::Done);
        assert_eq!(
            producer.shared().close_reason(),
            Some(CloseReason::RequestTimeout)
        );
    }

    #[tokio::test]
    async fn push_after_close_is_permanent() {
        let manager = StreamManager::new(test_config(4));
        let (producer, _consumer) = manager.create(RequestId::new(), None).unwrap();

        producer.close(CloseReason::InferenceError);
        assert_eq!(
            producer.push(StreamToken::new("x", 0)).await,
            PushOutcome::Closed
        );
        assert_eq!(
            producer.push(StreamToken::new("y", 1)).await,
            PushOutcome::Closed
        );
    }

    #[tokio::test]
    async fn consumer_wakes_on_close() {
        let manager = StreamManager::new(test_config(4));
        let (producer, mut consumer) = manager.create(RequestId::new(), None).unwrap();

        let handle = tokio::spawn(async move {
            let token = consumer.next().await;
            (token, consumer.completion_reason())
        });

        tokio::task::yield_now().await;
        producer.close(CloseReason::InferenceError);

        let (token, reason) = handle.await.unwrap();
        assert!(token.is_none());
        assert_eq!(reason, rill_types::CompletionReason::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_closes_then_reaps() {
        let mut config = test_config(4);
        config.idle_timeout = Duration::from_secs(60);
        let manager = StreamManager::new(config);
        let id = RequestId::new();
        let (_producer, _consumer) = manager.create(id.clone(), None).unwrap();

        // Not yet idle long enough.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(manager.sweep(), 0);
        assert_eq!(manager.active_streams(), 1);

        // Past the idle timeout: closed but retained for one more sweep.
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(manager.sweep(), 1);
        assert_eq!(manager.active_streams(), 0);
        let stats = manager.stream_stats(&id).expect("retained after close");
        assert!(stats.is_closed);

        // Next sweep reaps it.
        manager.sweep();
        assert!(manager.stream_stats(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_exactly_equal_to_timeout_does_not_close() {
        let mut config = test_config(4);
        config.idle_timeout = Duration::from_secs(60);
        let manager = StreamManager::new(config);
        let (_producer, _consumer) = manager.create(RequestId::new(), None).unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(manager.sweep(), 0);
        assert_eq!(manager.active_streams(), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let manager = StreamManager::new(test_config(4));
        let (p1, _c1) = manager.create(RequestId::new(), None).unwrap();
        let (p2, _c2) = manager.create(RequestId::new(), None).unwrap();

        manager.shutdown();
        assert!(p1.is_closed());
        assert!(p2.is_closed());
        assert_eq!(p1.shared().close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(manager.active_streams(), 0);
    }
}
