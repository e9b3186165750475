//! # Rill Registry
//!
//! Model lifecycle: loader registration, load with warm-up, versioned
//! hot-swap, drain-on-unload and health monitoring.
//!
//! The registry publishes `Arc<LoadedModel>` handles. A version switch only
//! changes which handle future lookups return; in-flight work keeps its
//! handle and finishes on the old version undisturbed.

mod backend;
mod registry;
mod stub;

pub use backend::{BatchEmission, GenerateRequest, ModelBackend};
pub use registry::{LoadedModel, LoaderFn, LoaderFuture, ModelListing, ModelRegistry, ModelStats};
pub use stub::StubBackend;
