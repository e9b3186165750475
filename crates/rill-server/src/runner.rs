//! The inference runner: one task per model name
//!
//! Pulls batches from the scheduler, drives the active model version and
//! fans emitted tokens into the originating streams. Per-request token
//! caps and wall-time budgets are enforced here; the backend is never
//! interrupted mid-batch, its output for finished requests is discarded.

use crate::state::AppState;
use rill_registry::{BatchEmission, GenerateRequest, LoadedModel};
use rill_scheduler::{Batch, BatchScheduler, BatchSlot};
use rill_stream::{CloseReason, PushOutcome};
use rill_types::ServeError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, warn};

pub(crate) fn spawn_runner(
    state: Arc<AppState>,
    scheduler: Arc<BatchScheduler>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown = state.shutdown_signal();
    tokio::spawn(async move {
        loop {
            let batch = tokio::select! {
                batch = scheduler.next_batch() => batch,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            run_batch(&state, &scheduler, batch).await;
        }
        debug!(model = scheduler.model(), "runner stopped");
    })
}

struct ActiveSlot {
    slot: BatchSlot,
    deadline: Instant,
    emitted: u64,
    finished: bool,
}

async fn run_batch(state: &Arc<AppState>, scheduler: &BatchScheduler, batch: Batch) {
    let model = match state.registry().lookup(scheduler.model()) {
        Ok(model) => model,
        Err(e) => {
            // The model vanished between admission and batch formation.
            error!(model = scheduler.model(), error = %e, "batch has no model");
            for slot in batch.slots {
                slot.producer.shared().close_with_error(e.to_string());
                record_completion(state, &slot, 0, "error", Some(&e.to_string()));
            }
            return;
        }
    };

    let batch_id = batch.id;
    let generate_batch: Vec<GenerateRequest> = batch
        .slots
        .iter()
        .map(|slot| GenerateRequest {
            prompt: slot.request.prompt.clone(),
            max_tokens: slot.request.max_tokens,
            temperature: slot.request.temperature,
            top_p: slot.request.top_p,
        })
        .collect();

    let mut slots: Vec<ActiveSlot> = batch
        .slots
        .into_iter()
        .map(|slot| ActiveSlot {
            deadline: slot.enqueued_at + slot.request.timeout,
            slot,
            emitted: 0,
            finished: false,
        })
        .collect();
    let mut open = slots.len();
    for _ in &slots {
        model.record_request();
    }

    let capacity = (slots.len() * 4).max(16);
    let (tx, mut rx) = mpsc::channel::<BatchEmission>(capacity);
    let backend = Arc::clone(model.backend());
    let generation = tokio::spawn(async move { backend.generate(generate_batch, tx).await });

    while open > 0 {
        let Some(next_deadline) = slots
            .iter()
            .filter(|s| !s.finished)
            .map(|s| s.deadline)
            .min()
        else {
            break;
        };

        match timeout_at(next_deadline, rx.recv()).await {
            Ok(Some(BatchEmission { slot: index, token })) => {
                let Some(active) = slots.get_mut(index) else {
                    warn!(batch = %batch_id, index, "backend emitted for unknown slot");
                    continue;
                };
                if active.finished {
                    // Late output for a terminated request is dropped.
                    continue;
                }

                let is_end = token.end_of_stream;
                match active.slot.producer.push(token).await {
                    PushOutcome::Accepted | PushOutcome::Backpressured => {
                        active.emitted += 1;
                        if is_end || active.emitted >= active.slot.request.max_tokens as u64 {
                            finish(state, &model, active, CloseReason::Done, &mut open);
                        }
                    }
                    PushOutcome::Closed => {
                        // Slow consumer or client gone; reason already set.
                        let reason = active
                            .slot
                            .producer
                            .shared()
                            .close_reason()
                            .unwrap_or(CloseReason::Cancelled);
                        finish(state, &model, active, reason, &mut open);
                    }
                }
            }
            Ok(None) => break,
            Err(_) => {
                let now = Instant::now();
                for active in slots.iter_mut() {
                    if !active.finished && active.deadline <= now {
                        warn!(request = %active.slot.request.id, "request exceeded its timeout");
                        finish(state, &model, active, CloseReason::RequestTimeout, &mut open);
                    }
                }
            }
        }
    }
    // Dropping the receiver tells the backend every consumer is gone.
    drop(rx);

    let result = match generation.await {
        Ok(result) => result,
        Err(join_error) => Err(ServeError::internal(format!(
            "generation task failed: {join_error}"
        ))),
    };

    match result {
        Ok(()) => {
            // The model finished early for whatever stayed open.
            for active in slots.iter_mut() {
                if !active.finished {
                    finish(state, &model, active, CloseReason::Done, &mut open);
                }
            }
        }
        Err(e) => {
            // A batch is atomic for failure purposes: every request still
            // in flight fails, tokens already streamed stay delivered.
            error!(batch = %batch_id, model = scheduler.model(), error = %e, "inference failed");
            let message = e.to_string();
            for active in slots.iter_mut() {
                if !active.finished {
                    active.finished = true;
                    active.slot.producer.shared().close_with_error(message.clone());
                    model.record_error();
                    model.record_tokens(active.emitted);
                    record_completion(state, &active.slot, active.emitted, "error", Some(&message));
                }
            }
        }
    }
}

/// Terminate one slot: close its stream, bump model counters and record
/// the completion through the middleware chain.
fn finish(
    state: &Arc<AppState>,
    model: &Arc<LoadedModel>,
    active: &mut ActiveSlot,
    reason: CloseReason,
    open: &mut usize,
) {
    active.finished = true;
    *open -= 1;
    active.slot.producer.close(reason);
    model.record_tokens(active.emitted);

    let outcome = match reason {
        CloseReason::Done => "done",
        CloseReason::SlowConsumer => "slow_consumer",
        CloseReason::RequestTimeout => "request_timeout",
        CloseReason::Idle => "idle_timeout",
        CloseReason::Cancelled => "cancelled",
        CloseReason::InferenceError => "error",
        CloseReason::Shutdown => "shutdown",
    };
    record_completion(state, &active.slot, active.emitted, outcome, None);
}

fn record_completion(
    state: &Arc<AppState>,
    slot: &BatchSlot,
    tokens: u64,
    outcome: &str,
    error: Option<&str>,
) {
    let latency_ms = slot.enqueued_at.elapsed().as_secs_f64() * 1000.0;
    state.chain().record_completion(
        &slot.request.id,
        &slot.request.model,
        latency_ms,
        tokens,
        outcome,
        error,
    );
}
