//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM / SIGINT and fans the signal out to the connection
//! manager and any background tasks that subscribed.

use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::connection::ConnectionManager;
use crate::Result;

/// Shutdown coordinator that manages the shutdown process
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating shutdown");
        }

        Ok(())
    }

    /// Notify subscribers and stop the connection manager
    pub fn trigger(&self, manager: &Arc<ConnectionManager>) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("No shutdown subscribers were listening");
        }
        manager.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::echo::LineEchoHandler;
    use crate::connection::handler_factory;

    #[tokio::test]
    async fn test_trigger_broadcasts_and_stops_manager() {
        let coordinator = ShutdownCoordinator::new();
        let mut receiver = coordinator.subscribe();
        let manager = Arc::new(
            ConnectionManager::new(ServerConfig::default(), handler_factory(LineEchoHandler::new))
                .unwrap(),
        );

        coordinator.trigger(&manager);

        assert!(receiver.recv().await.is_ok());
        assert!(manager.is_shutting_down());
    }
}
