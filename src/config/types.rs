//! Configuration Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and per-connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP literal or `localhost`; empty binds every interface
    pub host: String,
    pub port: u32,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// `0s` disables the write deadline
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// `0s` disables the unregistered-connection sweep
    #[serde(with = "humantime_serde")]
    pub registration_timeout: Duration,
    /// `0s` turns TCP keep-alive off
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    pub queue_capacity: usize,
    pub read_buffer_size: usize,
    pub pool_size: usize,
    /// Deliver routed writes to every matching connection instead of the first
    pub multi_target: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub ansi: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7000,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            registration_timeout: Duration::ZERO,
            keepalive_interval: Duration::from_secs(30),
            queue_capacity: 256,
            read_buffer_size: 4096,
            pool_size: 16,
            multi_target: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}
