//! Tests for configuration types

use rill_types::{BatchConfig, ModelConfig, ServerConfig, StreamConfig};
use std::time::Duration;

#[test]
fn server_config_defaults() {
    let config = ServerConfig::default();
    assert_eq!(config.port, 8000);
    assert_eq!(config.max_connections, 256);
    assert_eq!(config.max_batch_size, 32);
    assert_eq!(config.max_batch_wait_ms, 50);
    assert_eq!(config.rate_limit_per_minute, 10_000);
    assert_eq!(config.stream_buffer_size, 100);
    assert!((config.stream_idle_timeout_s - 60.0).abs() < f64::EPSILON);
    assert!(config.validate().is_ok());
}

#[test]
fn server_config_rejects_bad_values() {
    let mut config = ServerConfig::default();
    config.port = 0;
    assert!(config.validate().is_err());

    let mut config = ServerConfig::default();
    config.max_connections = 0;
    assert!(config.validate().is_err());

    let mut config = ServerConfig::default();
    config.request_timeout_s = 0.0;
    assert!(config.validate().is_err());

    let mut config = ServerConfig::default();
    config.log_level = "verbose".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn server_config_bind_address() {
    let config = ServerConfig::default();
    assert_eq!(config.bind_address(), "0.0.0.0:8000");
}

#[test]
fn server_config_derives_subsystem_configs() {
    let mut config = ServerConfig::default();
    config.max_batch_size = 8;
    config.max_batch_wait_ms = 25;
    config.stream_buffer_size = 10;

    let batch = config.batch_config();
    assert_eq!(batch.max_batch_size, 8);
    assert_eq!(batch.max_wait, Duration::from_millis(25));

    let stream = config.stream_config();
    assert_eq!(stream.buffer_size, 10);
    assert_eq!(stream.idle_timeout, Duration::from_secs(60));
}

#[test]
fn server_config_parses_toml() {
    let toml = r#"
        host = "127.0.0.1"
        port = 9001
        max_batch_size = 16
    "#;
    let config: ServerConfig = toml::from_str(toml).unwrap();
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 9001);
    assert_eq!(config.max_batch_size, 16);
    // Unspecified fields fall back to defaults.
    assert_eq!(config.max_connections, 256);
}

#[test]
fn batch_config_validation() {
    assert!(BatchConfig::default().validate().is_ok());

    let mut config = BatchConfig::default();
    config.max_batch_size = 0;
    assert!(config.validate().is_err());

    let mut config = BatchConfig::default();
    config.queue_capacity = 0;
    assert!(config.validate().is_err());
}

#[test]
fn stream_config_defaults() {
    let config = StreamConfig::default();
    assert_eq!(config.buffer_size, 100);
    assert_eq!(config.push_wait, Duration::from_secs(1));
    assert_eq!(config.idle_timeout, Duration::from_secs(60));
    assert_eq!(config.sweep_interval, Duration::from_secs(10));
}

#[test]
fn model_config_equality_is_name_and_version() {
    let a = ModelConfig::new("gpt2", "1.0.0");
    let mut b = ModelConfig::new("gpt2", "1.0.0");
    b.device = "cuda".to_string();
    b.warmup_tokens = 5;
    assert_eq!(a, b);

    let c = ModelConfig::new("gpt2", "2.0.0");
    assert_ne!(a, c);
}

#[test]
fn model_config_semver_ordering() {
    let v1 = ModelConfig::new("m", "1.0.0").semver().unwrap();
    let v2 = ModelConfig::new("m", "2.0.0").semver().unwrap();
    assert!(v2 > v1);

    // Short version tags are accepted.
    let short = ModelConfig::new("m", "1.0").semver().unwrap();
    assert_eq!(short, v1);

    assert!(ModelConfig::new("m", "not-a-version").semver().is_err());
}

#[test]
fn model_config_validation() {
    assert!(ModelConfig::new("gpt2", "1.0.0").validate().is_ok());
    assert!(ModelConfig::new("", "1.0.0").validate().is_err());

    let mut config = ModelConfig::new("gpt2", "1.0.0");
    config.max_seq_length = 0;
    assert!(config.validate().is_err());
}
