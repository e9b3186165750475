//! A single bounded token stream

use parking_lot::Mutex;
use rill_types::{CompletionReason, RequestId, StreamToken};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Why a stream was closed. The first close wins; later calls are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Generation finished normally
    Done,
    /// The consumer failed to drain within the push wait
    SlowConsumer,
    /// No token arrived within the idle timeout
    Idle,
    /// The request exceeded its wall-time budget
    RequestTimeout,
    /// The model raised while generating for this batch
    InferenceError,
    /// The client went away
    Cancelled,
    /// Server shutdown cancelled the stream
    Shutdown,
}

impl CloseReason {
    /// The client-facing completion reason for this close.
    ///
    /// A slow-consumer close truncates the body but earlier tokens were
    /// delivered, so it reports as a normal completion.
    pub fn completion_reason(&self) -> CompletionReason {
        match self {
            Self::Done | Self::SlowConsumer => CompletionReason::Done,
            Self::Idle | Self::RequestTimeout => CompletionReason::Timeout,
            Self::InferenceError | Self::Cancelled | Self::Shutdown => CompletionReason::Error,
        }
    }
}

/// Result of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Inserted without waiting
    Accepted,
    /// Inserted after waiting for buffer room
    Backpressured,
    /// The stream is closed; the producer must stop pushing to it
    Closed,
}

/// State shared between producer, consumer and the manager.
pub struct StreamShared {
    id: RequestId,
    closed: AtomicBool,
    reason: Mutex<Option<CloseReason>>,
    error_message: Mutex<Option<String>>,
    /// Producer side of the channel. Taken (dropped) on close so a blocked
    /// consumer wakes promptly.
    tx: Mutex<Option<mpsc::Sender<StreamToken>>>,
    created_at: Instant,
    last_token_at: Mutex<Instant>,
    idle_timeout: Duration,
    push_wait: Duration,
    tokens: AtomicU64,
    backpressure_events: AtomicU64,
}

impl StreamShared {
    pub(crate) fn new(
        id: RequestId,
        tx: mpsc::Sender<StreamToken>,
        idle_timeout: Duration,
        push_wait: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
            error_message: Mutex::new(None),
            tx: Mutex::new(Some(tx)),
            created_at: now,
            last_token_at: Mutex::new(now),
            idle_timeout,
            push_wait,
            tokens: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the stream. Idempotent; the first reason wins.
    pub fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.reason.lock() = Some(reason);
        // Dropping the sender ends the consumer's recv() once buffered
        // tokens are drained.
        self.tx.lock().take();
        debug!(
            stream = %self.id,
            reason = ?reason,
            tokens = self.tokens.load(Ordering::Relaxed),
            backpressure_events = self.backpressure_events.load(Ordering::Relaxed),
            "stream closed"
        );
    }

    /// Close with the inference-error reason, carrying the model's message
    /// for the response writer.
    pub fn close_with_error(&self, message: impl Into<String>) {
        {
            let mut error = self.error_message.lock();
            if error.is_none() {
                *error = Some(message.into());
            }
        }
        self.close(CloseReason::InferenceError);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.reason.lock()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error_message.lock().clone()
    }

    pub fn token_count(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    pub fn backpressure_events(&self) -> u64 {
        self.backpressure_events.load(Ordering::Relaxed)
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn idle_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_token_at.lock())
    }

    pub(crate) fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn record_token(&self) {
        self.tokens.fetch_add(1, Ordering::Relaxed);
        *self.last_token_at.lock() = Instant::now();
    }
}

/// Producer half: held by the inference runner.
pub struct StreamProducer {
    shared: Arc<StreamShared>,
}

impl StreamProducer {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    pub fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    pub fn id(&self) -> &RequestId {
        self.shared.id()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn close(&self, reason: CloseReason) {
        self.shared.close(reason);
    }

    /// Push one token.
    ///
    /// Tries a non-blocking insert first; on a full buffer it waits up to
    /// the configured push wait, and if the buffer is still full the stream
    /// is closed as a slow consumer. A [`PushOutcome::Closed`] result is
    /// permanent for this stream.
    pub async fn push(&self, token: StreamToken) -> PushOutcome {
        if self.shared.is_closed() {
            return PushOutcome::Closed;
        }
        let tx = match self.shared.tx.lock().clone() {
            Some(tx) => tx,
            None => return PushOutcome::Closed,
        };

        match tx.try_send(token) {
            Ok(()) => {
                self.shared.record_token();
                PushOutcome::Accepted
            }
            Err(mpsc::error::TrySendError::Full(token)) => {
                self.shared
                    .backpressure_events
                    .fetch_add(1, Ordering::Relaxed);
                warn!(stream = %self.shared.id, "stream buffer full, waiting for room");
                match timeout(self.shared.push_wait, tx.send(token)).await {
                    Ok(Ok(())) => {
                        self.shared.record_token();
                        PushOutcome::Backpressured
                    }
                    Ok(Err(_)) => {
                        // Receiver dropped while we waited.
                        self.shared.close(CloseReason::Cancelled);
                        PushOutcome::Closed
                    }
                    Err(_) => {
                        warn!(stream = %self.shared.id, "consumer too slow, closing stream");
                        self.shared.close(CloseReason::SlowConsumer);
                        PushOutcome::Closed
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.close(CloseReason::Cancelled);
                PushOutcome::Closed
            }
        }
    }
}

/// Consumer half: held by the HTTP response writer.
pub struct StreamConsumer {
    rx: mpsc::Receiver<StreamToken>,
    shared: Arc<StreamShared>,
}

impl StreamConsumer {
    pub(crate) fn new(rx: mpsc::Receiver<StreamToken>, shared: Arc<StreamShared>) -> Self {
        Self { rx, shared }
    }

    pub fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    /// Receive the next token in push order.
    ///
    /// Returns `None` once the stream is closed and the buffer is drained,
    /// or after the idle timeout elapses with no token (the stream is then
    /// closed as idle).
    pub async fn next(&mut self) -> Option<StreamToken> {
        match timeout(self.shared.idle_timeout, self.rx.recv()).await {
            Ok(Some(token)) => Some(token),
            Ok(None) => None,
            Err(_) => {
                warn!(stream = %self.shared.id, "no token within idle timeout");
                self.shared.close(CloseReason::Idle);
                None
            }
        }
    }

    /// Terminal reason after `next` has returned `None`. Defaults to
    /// cancelled if the producer vanished without closing.
    pub fn completion_reason(&self) -> CompletionReason {
        self.shared
            .close_reason()
            .unwrap_or(CloseReason::Cancelled)
            .completion_reason()
    }

    /// The model's error message when the stream failed.
    pub fn error_message(&self) -> Option<String> {
        self.shared.error_message()
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        // A consumer going away (client disconnect) cancels the stream.
        if !self.shared.is_closed() {
            self.shared.close(CloseReason::Cancelled);
        }
    }
}
