//! # Rill Stream
//!
//! Per-request token streams with backpressure, and the manager that owns
//! them.
//!
//! Each stream is a bounded single-producer/single-consumer channel from the
//! inference runner to the HTTP response writer. Closing a stream is the
//! universal cancellation primitive: per-request timeouts, connection drops
//! and shutdown all funnel through [`StreamShared::close`], and every waiter
//! observes the closed state within one bounded wakeup.

mod manager;
mod stream;

pub use manager::{StreamManager, StreamStats};
pub use stream::{CloseReason, PushOutcome, StreamConsumer, StreamProducer, StreamShared};
