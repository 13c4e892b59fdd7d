//! Configuration Manager

use super::{Config, ServerConfig};
use crate::error::ManagerError;
use crate::Result;
use anyhow::{bail, Context};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_IO_TIMEOUT: Duration = Duration::from_secs(100 * 60);
const MAX_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_KEEPALIVE: Duration = Duration::from_secs(2 * 60 * 60);
const MAX_QUEUE_CAPACITY: usize = 65536;
const MIN_READ_BUFFER: usize = 512;
const MAX_READ_BUFFER: usize = 1024 * 1024;
const MAX_POOL_SIZE: usize = 10000;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(host) = std::env::var("CONNFACTORY_HOST") {
            config.server.host = host;
        }

        if let Ok(port) = std::env::var("CONNFACTORY_PORT") {
            config.server.port = port
                .parse::<u32>()
                .with_context(|| format!("Invalid CONNFACTORY_PORT: {}", port))?;
        }

        if let Ok(timeout) = std::env::var("CONNFACTORY_READ_TIMEOUT") {
            config.server.read_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid CONNFACTORY_READ_TIMEOUT: {}", timeout))?;
        }

        if let Ok(timeout) = std::env::var("CONNFACTORY_WRITE_TIMEOUT") {
            config.server.write_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid CONNFACTORY_WRITE_TIMEOUT: {}", timeout))?;
        }

        if let Ok(timeout) = std::env::var("CONNFACTORY_REGISTRATION_TIMEOUT") {
            config.server.registration_timeout = humantime::parse_duration(&timeout)
                .with_context(|| {
                    format!("Invalid CONNFACTORY_REGISTRATION_TIMEOUT: {}", timeout)
                })?;
        }

        if let Ok(interval) = std::env::var("CONNFACTORY_KEEPALIVE_INTERVAL") {
            config.server.keepalive_interval = humantime::parse_duration(&interval)
                .with_context(|| format!("Invalid CONNFACTORY_KEEPALIVE_INTERVAL: {}", interval))?;
        }

        if let Ok(size) = std::env::var("CONNFACTORY_READ_BUFFER_SIZE") {
            config.server.read_buffer_size = size
                .parse::<usize>()
                .with_context(|| format!("Invalid CONNFACTORY_READ_BUFFER_SIZE: {}", size))?;
        }

        if let Ok(size) = std::env::var("CONNFACTORY_POOL_SIZE") {
            config.server.pool_size = size
                .parse::<usize>()
                .with_context(|| format!("Invalid CONNFACTORY_POOL_SIZE: {}", size))?;
        }

        if let Ok(capacity) = std::env::var("CONNFACTORY_QUEUE_CAPACITY") {
            config.server.queue_capacity = capacity
                .parse::<usize>()
                .with_context(|| format!("Invalid CONNFACTORY_QUEUE_CAPACITY: {}", capacity))?;
        }

        if let Ok(multi) = std::env::var("CONNFACTORY_MULTI_TARGET") {
            config.server.multi_target = multi
                .parse::<bool>()
                .with_context(|| format!("Invalid CONNFACTORY_MULTI_TARGET: {}", multi))?;
        }

        if let Ok(log_level) = std::env::var("CONNFACTORY_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server
            .bind_addr()
            .with_context(|| "Server configuration validation failed")?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        host: Option<&str>,
        port: Option<u16>,
        log_level: Option<&str>,
    ) {
        if let Some(host) = host {
            self.server.host = host.to_string();
            tracing::info!("CLI override: host set to {}", host);
        }

        if let Some(port) = port {
            self.server.port = u32::from(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(level) = log_level {
            self.logging.level = level.to_string();
        }
    }
}

impl ServerConfig {
    /// Resolve host and port into the listen address
    pub fn bind_addr(&self) -> std::result::Result<SocketAddr, ManagerError> {
        let ip = match self.host.trim() {
            "" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
            host => host
                .parse::<IpAddr>()
                .map_err(|_| ManagerError::HostNotValid(self.host.clone()))?,
        };

        let port = u16::try_from(self.port).map_err(|_| ManagerError::PortNotValid(self.port))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Pull every timeout and size into its supported range
    pub fn clamped(mut self) -> Self {
        self.read_timeout = self.read_timeout.clamp(MIN_TIMEOUT, MAX_IO_TIMEOUT);
        self.write_timeout = clamp_optional(self.write_timeout, MAX_IO_TIMEOUT);
        self.registration_timeout =
            clamp_optional(self.registration_timeout, MAX_REGISTRATION_TIMEOUT);
        self.keepalive_interval = clamp_optional(self.keepalive_interval, MAX_KEEPALIVE);
        self.queue_capacity = self.queue_capacity.clamp(1, MAX_QUEUE_CAPACITY);
        self.read_buffer_size = self.read_buffer_size.clamp(MIN_READ_BUFFER, MAX_READ_BUFFER);
        self.pool_size = self.pool_size.min(MAX_POOL_SIZE);
        self
    }
}

/// Zero stays zero (feature disabled); anything else is clamped.
fn clamp_optional(value: Duration, max: Duration) -> Duration {
    if value.is_zero() {
        value
    } else {
        value.clamp(MIN_TIMEOUT, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_bind_addr_validation() {
        let mut server = ServerConfig::default();
        server.host = "localhost".to_string();
        server.port = 8080;
        assert_eq!(server.bind_addr().unwrap(), "127.0.0.1:8080".parse().unwrap());

        server.host = "not a host".to_string();
        assert!(matches!(server.bind_addr(), Err(ManagerError::HostNotValid(_))));

        server.host = "::1".to_string();
        server.port = 70000;
        assert!(matches!(server.bind_addr(), Err(ManagerError::PortNotValid(70000))));
    }

    #[test]
    fn test_timeouts_are_clamped() {
        let server = ServerConfig {
            read_timeout: Duration::from_millis(10),
            write_timeout: Duration::from_secs(24 * 60 * 60),
            registration_timeout: Duration::ZERO,
            keepalive_interval: Duration::from_millis(1),
            queue_capacity: 0,
            read_buffer_size: 1,
            ..ServerConfig::default()
        }
        .clamped();

        assert_eq!(server.read_timeout, Duration::from_secs(1));
        assert_eq!(server.write_timeout, Duration::from_secs(6000));
        assert_eq!(server.registration_timeout, Duration::ZERO);
        assert_eq!(server.keepalive_interval, Duration::from_secs(1));
        assert_eq!(server.queue_capacity, 1);
        assert_eq!(server.read_buffer_size, 512);
    }

    #[test]
    fn test_load_from_env_covers_pool_and_socket_settings() {
        std::env::set_var("CONNFACTORY_KEEPALIVE_INTERVAL", "0s");
        std::env::set_var("CONNFACTORY_READ_BUFFER_SIZE", "8192");
        std::env::set_var("CONNFACTORY_POOL_SIZE", "3");

        let config = ConfigManager::load_from_env().unwrap();
        assert_eq!(config.server.keepalive_interval, Duration::ZERO);
        assert_eq!(config.server.read_buffer_size, 8192);
        assert_eq!(config.server.pool_size, 3);

        std::env::set_var("CONNFACTORY_POOL_SIZE", "lots");
        let err = ConfigManager::load_from_env().unwrap_err();
        assert!(format!("{:#}", err).contains("CONNFACTORY_POOL_SIZE"), "{:#}", err);

        for name in [
            "CONNFACTORY_KEEPALIVE_INTERVAL",
            "CONNFACTORY_READ_BUFFER_SIZE",
            "CONNFACTORY_POOL_SIZE",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }
}
