//! rillserve binary: config loading, tracing setup and a demo model

use clap::Parser;
use rill_registry::{LoaderFn, ModelBackend, ModelRegistry, StubBackend};
use rill_server::run_server;
use rill_types::{ModelConfig, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rillserve", version, about = "Low-latency streaming inference server")]
struct Args {
    /// Bind host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Path to a TOML config file; environment variables apply otherwise
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Name to serve the built-in stub model under
    #[arg(long, default_value = "stub")]
    model: String,

    /// Stub model inter-step delay in milliseconds
    #[arg(long, default_value_t = 10)]
    token_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::from_env()?,
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let registry = Arc::new(ModelRegistry::new());

    // The binary ships a stub backend so the server is drivable end to end
    // without real weights; production deployments register their own
    // loaders through the library API.
    let token_delay = Duration::from_millis(args.token_delay_ms);
    let loader: LoaderFn = Arc::new(move |_config| {
        Box::pin(async move {
            Ok(Arc::new(StubBackend::new().with_step_delay(token_delay)) as Arc<dyn ModelBackend>)
        })
    });
    registry.register_loader(args.model.as_str(), loader, false)?;
    registry
        .load(ModelConfig::new(args.model.as_str(), "1.0.0"))
        .await?;
    info!(model = %args.model, "demo model loaded");

    run_server(config, registry).await?;
    Ok(())
}
