//! # Rill Server
//!
//! The HTTP frontend and composition root: accepts inference requests,
//! runs the middleware chain, enqueues into the per-model batch scheduler,
//! and binds each response body to its token stream. One inference runner
//! task per model name pulls batches and fans generated tokens out.

mod api;
mod error;
mod runner;
mod state;

pub use api::build_router;
pub use error::ApiError;
pub use state::{AppState, ConnectionGuard};

use rill_registry::ModelRegistry;
use rill_types::{Result, ServeError, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Bind, serve and drain on shutdown.
///
/// Blocks until the process receives a shutdown signal and the drain
/// completes (or its budget runs out).
pub async fn run_server(config: ServerConfig, registry: Arc<ModelRegistry>) -> Result<()> {
    config.validate()?;
    let state = AppState::new(config.clone(), registry);

    // Background sweeps run detached until the shutdown flag flips.
    let shutdown_rx = state.shutdown_signal();
    let _sweeper = state.streams().spawn_sweeper(shutdown_rx.clone());
    let _evictor = state.chain().rate_limiter().spawn_evictor(shutdown_rx);

    let app = build_router(Arc::clone(&state));
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServeError::Io {
            message: format!("failed to bind {addr}: {e}"),
        })?;
    info!(address = %addr, "rillserve listening");

    let drain_state = Arc::clone(&state);
    let graceful = async move {
        shutdown_requested().await;
        info!("shutdown signal received, draining");
        drain_state.begin_drain();

        let deadline = tokio::time::Instant::now() + drain_state.config().graceful_shutdown_timeout();
        while drain_state.connection_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = drain_state.connection_count();
        if remaining > 0 {
            warn!(connections = remaining, "drain budget exhausted, closing anyway");
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(graceful)
    .await
    .map_err(|e| ServeError::Io {
        message: format!("server error: {e}"),
    })?;

    // Transport closed: cancel what is left and drain the registry.
    state.cancel_queued();
    state.streams().shutdown();
    state.signal_shutdown();
    state.registry().shutdown().await;
    info!("rillserve stopped");
    Ok(())
}

async fn shutdown_requested() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        // Without a signal handler the server would never drain; park
        // forever instead of busy-erroring.
        std::future::pending::<()>().await;
    }
}
