//! connfactory - line echo server on top of the connection factory
//!
//! Serves the newline-delimited demo protocol from [`connfactory::echo`],
//! sweeps connection health on an interval and logs the report as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use connfactory::{
    config::{Config, ConfigManager},
    echo::LineEchoHandler,
    handler_factory, ConnectionManager, SendMessage, ShutdownCoordinator,
};

/// CLI arguments for connfactory
#[derive(Parser, Debug)]
#[command(name = "connfactory")]
#[command(about = "Concurrent TCP connection factory - line echo server")]
#[command(version)]
#[command(long_about = "
Concurrent TCP connection factory - line echo server

Every line sent by a client is echoed back. `ID <name>` registers the
connection under <name>; registered connections appear in the periodic
health report.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  CONNFACTORY_HOST                  - Bind host (e.g., 127.0.0.1)
  CONNFACTORY_PORT                  - Bind port
  CONNFACTORY_READ_TIMEOUT          - Read timeout (e.g., 60s)
  CONNFACTORY_WRITE_TIMEOUT         - Write timeout (0s disables)
  CONNFACTORY_REGISTRATION_TIMEOUT  - Registration timeout (0s disables)
  CONNFACTORY_KEEPALIVE_INTERVAL    - TCP keep-alive idle time (0s disables)
  CONNFACTORY_READ_BUFFER_SIZE      - Per-read buffer size in bytes
  CONNFACTORY_POOL_SIZE             - Idle workers kept for reuse
  CONNFACTORY_QUEUE_CAPACITY        - Outbound queue capacity per connection
  CONNFACTORY_MULTI_TARGET          - Deliver routed writes to every match
  CONNFACTORY_LOG_LEVEL             - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "connfactory.toml")]
    pub config: PathBuf,

    /// Bind host (overrides config file)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Interval between health sweeps
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub health_interval: Duration,

    /// Greeting line sent on every new connection
    #[arg(long)]
    pub greeting: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };
    config.merge_with_cli_args(
        args.host.as_deref(),
        args.port,
        args.log_level.as_deref(),
    );
    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&config, args.verbose)?;
    info!("Starting connfactory v{}", env!("CARGO_PKG_VERSION"));

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind address: {}", config.server.bind_addr()?);
        info!("  Read timeout: {:?}", config.server.read_timeout);
        info!("  Write timeout: {:?}", config.server.write_timeout);
        info!("  Registration timeout: {:?}", config.server.registration_timeout);
        info!("  Queue capacity: {}", config.server.queue_capacity);
        return Ok(());
    }

    let greeting = args
        .greeting
        .map(|line| vec![SendMessage::new(format!("{}\n", line))])
        .unwrap_or_default();
    let manager = Arc::new(
        ConnectionManager::new(config.server.clone(), handler_factory(LineEchoHandler::new))?
            .with_greeting(greeting),
    );

    let shutdown_coordinator = ShutdownCoordinator::new();

    let server_handle = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if let Err(e) = manager.listen().await {
                error!("Server error: {}", e);
            }
        })
    };

    let health_handle = {
        let manager = Arc::clone(&manager);
        let mut shutdown_rx = shutdown_coordinator.subscribe();
        let every = args.health_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let report = manager.health_report().await;
                        let stats = manager.stats();
                        match serde_json::to_string(&report) {
                            Ok(json) => info!(active = stats.active_connections, "health: {}", json),
                            Err(e) => error!("Failed to encode health report: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    };

    info!("Press Ctrl+C or send SIGTERM/SIGINT to shut down");
    if let Err(e) = shutdown_coordinator.listen_for_signals().await {
        error!("Error setting up signal handlers: {}", e);
    }
    shutdown_coordinator.trigger(&manager);

    if let Err(e) = server_handle.await {
        error!("Server task failed: {}", e);
    }
    let _ = health_handle.await;

    let stats = manager.stats();
    info!(
        "Server shutdown complete: {} connections served, {} messages sent",
        stats.total_accepted, stats.messages_sent
    );
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &Config, verbose: bool) -> Result<()> {
    let log_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(config.logging.ansi),
        )
        .with(env_filter)
        .init();

    Ok(())
}
