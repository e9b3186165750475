//! Configuration for the rillserve server, models and batching
//!
//! All tunables live here so the composition root can load one file (or the
//! environment) and hand each subsystem its slice.

use crate::errors::{Result, ServeError};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Admission cap on concurrent connections
    pub max_connections: usize,
    /// Default per-request wall limit in seconds
    pub request_timeout_s: f64,
    /// Scheduler batch size cap
    pub max_batch_size: usize,
    /// Scheduler batch deadline in milliseconds
    pub max_batch_wait_ms: u64,
    /// Per-client token bucket capacity (refilled over one minute)
    pub rate_limit_per_minute: u32,
    /// Drain budget on shutdown, in seconds
    pub graceful_shutdown_timeout_s: f64,
    /// Per-stream token buffer capacity
    pub stream_buffer_size: usize,
    /// Idle stream timeout in seconds
    pub stream_idle_timeout_s: f64,
    /// Log level filter (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_connections: 256,
            request_timeout_s: 30.0,
            max_batch_size: 32,
            max_batch_wait_ms: 50,
            rate_limit_per_minute: 10_000,
            graceful_shutdown_timeout_s: 30.0,
            stream_buffer_size: 100,
            stream_idle_timeout_s: 60.0,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServeError::Io {
                message: format!("failed to read config file: {e}"),
            })?;
        let config: Self = toml::from_str(&content).map_err(|e| ServeError::Serialization {
            message: format!("failed to parse config file: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `RILL_*` environment variables on the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("RILL_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("RILL_PORT") {
            config.port = port
                .parse()
                .map_err(|_| ServeError::validation("invalid RILL_PORT"))?;
        }
        if let Ok(max_conns) = std::env::var("RILL_MAX_CONNECTIONS") {
            config.max_connections = max_conns
                .parse()
                .map_err(|_| ServeError::validation("invalid RILL_MAX_CONNECTIONS"))?;
        }
        if let Ok(batch) = std::env::var("RILL_MAX_BATCH_SIZE") {
            config.max_batch_size = batch
                .parse()
                .map_err(|_| ServeError::validation("invalid RILL_MAX_BATCH_SIZE"))?;
        }
        if let Ok(wait) = std::env::var("RILL_MAX_BATCH_WAIT_MS") {
            config.max_batch_wait_ms = wait
                .parse()
                .map_err(|_| ServeError::validation("invalid RILL_MAX_BATCH_WAIT_MS"))?;
        }
        if let Ok(rate) = std::env::var("RILL_RATE_LIMIT_PER_MINUTE") {
            config.rate_limit_per_minute = rate
                .parse()
                .map_err(|_| ServeError::validation("invalid RILL_RATE_LIMIT_PER_MINUTE"))?;
        }
        if let Ok(level) = std::env::var("RILL_LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ServeError::validation("port must not be 0"));
        }
        if self.max_connections == 0 {
            return Err(ServeError::validation("max_connections must be positive"));
        }
        if self.request_timeout_s <= 0.0 {
            return Err(ServeError::validation("request_timeout_s must be positive"));
        }
        if self.max_batch_size == 0 {
            return Err(ServeError::validation("max_batch_size must be positive"));
        }
        if self.stream_buffer_size == 0 {
            return Err(ServeError::validation(
                "stream_buffer_size must be positive",
            ));
        }
        if !["trace", "debug", "info", "warn", "error"].contains(&self.log_level.as_str()) {
            return Err(ServeError::validation(
                "log_level must be one of: trace, debug, info, warn, error",
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_s)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.graceful_shutdown_timeout_s)
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size,
            max_wait: Duration::from_millis(self.max_batch_wait_ms),
            ..BatchConfig::default()
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            buffer_size: self.stream_buffer_size,
            idle_timeout: Duration::from_secs_f64(self.stream_idle_timeout_s),
            ..StreamConfig::default()
        }
    }
}

/// Batch scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Size cap per batch
    pub max_batch_size: usize,
    /// Deadline from the first queued item to batch emission
    pub max_wait: Duration,
    /// Bounded capacity of each priority queue
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_wait: Duration::from_millis(50),
            queue_capacity: 1024,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(ServeError::validation("max_batch_size must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(ServeError::validation("queue_capacity must be positive"));
        }
        Ok(())
    }
}

/// Token stream tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bounded token buffer per stream
    pub buffer_size: usize,
    /// How long a push waits for buffer room before the stream is
    /// closed as a slow consumer
    pub push_wait: Duration,
    /// A stream receiving no tokens for this long is closed as idle
    pub idle_timeout: Duration,
    /// Cadence of the idle sweep
    pub sweep_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            push_wait: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration for a single model version.
///
/// Two configs with identical (name, version) describe the same entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model family name
    pub name: String,
    /// Semver version string, used for ordering
    pub version: String,
    /// Where the loader finds the weights, when it needs a path
    #[serde(default)]
    pub model_path: Option<String>,
    /// Device hint, passed through to the loader verbatim
    #[serde(default = "default_device")]
    pub device: String,
    /// Precision hint (f16, f32, ...)
    #[serde(default = "default_dtype")]
    pub dtype: String,
    /// Whether the weights are quantized
    #[serde(default)]
    pub quantized: bool,
    /// Upper bound on prompt + generation length
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    /// Tokens of dummy generation run at load time
    #[serde(default = "default_warmup_tokens")]
    pub warmup_tokens: usize,
    /// Opaque metadata bag
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_dtype() -> String {
    "f32".to_string()
}

fn default_max_seq_length() -> usize {
    2048
}

fn default_warmup_tokens() -> usize {
    100
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            model_path: None,
            device: default_device(),
            dtype: default_dtype(),
            quantized: false,
            max_seq_length: default_max_seq_length(),
            warmup_tokens: default_warmup_tokens(),
            metadata: HashMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ServeError::validation("model name must not be empty"));
        }
        self.semver()?;
        if self.max_seq_length == 0 {
            return Err(ServeError::validation("max_seq_length must be positive"));
        }
        Ok(())
    }

    /// Parsed semver version, for ordering.
    pub fn semver(&self) -> Result<Version> {
        // Accept short forms like "1.0" the way tags are usually written.
        let normalized = match self.version.matches('.').count() {
            0 => format!("{}.0.0", self.version),
            1 => format!("{}.0", self.version),
            _ => self.version.clone(),
        };
        Version::parse(&normalized).map_err(|e| {
            ServeError::validation(format!("invalid model version {:?}: {e}", self.version))
        })
    }
}

impl PartialEq for ModelConfig {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.version == other.version
    }
}

impl Eq for ModelConfig {}
