//! Connection Manager Implementation

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::handler::HandlerFactory;
use super::pool::WorkerPool;
use super::stats::{ConnectionStats, StatsCollector};
use super::types::{SendMessage, WorkerInfo};
use super::worker::{ConnectionIo, ConnectionWorker, WorkerSettings};
use crate::config::ServerConfig;
use crate::error::ManagerError;

/// Extra silence tolerated past the read timeout before a socket is
/// treated as half-open.
const ANOMALY_GRACE: Duration = Duration::from_secs(20);
const ACCEPT_RESTART_DELAY: Duration = Duration::from_millis(100);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts TCP connections and runs each one on a pooled worker
pub struct ConnectionManager {
    config: ServerConfig,
    bind_addr: SocketAddr,
    factory: HandlerFactory,
    greeting: Vec<SendMessage>,
    pool: WorkerPool,
    registry: RwLock<HashMap<u64, Arc<ConnectionWorker>>>,
    stats: Arc<StatsCollector>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown_flag: AtomicBool,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Create a new ConnectionManager.
    ///
    /// Timeouts are clamped into range; an unusable host or port is rejected
    /// here, before any socket is opened.
    pub fn new(config: ServerConfig, factory: HandlerFactory) -> Result<Self, ManagerError> {
        let config = config.clamped();
        let bind_addr = config.bind_addr()?;
        let stats = Arc::new(StatsCollector::default());
        let pool = WorkerPool::new(
            WorkerSettings::from(&config),
            config.pool_size,
            Arc::clone(&stats),
        );

        Ok(Self {
            config,
            bind_addr,
            factory,
            greeting: Vec::new(),
            pool,
            registry: RwLock::new(HashMap::new()),
            stats,
            local_addr: Mutex::new(None),
            shutdown_flag: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Messages queued on every new connection
    pub fn with_greeting(mut self, greeting: Vec<SendMessage>) -> Self {
        self.greeting = greeting;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until shutdown
    pub async fn listen(self: &Arc<Self>) -> Result<(), ManagerError> {
        info!("Binding TCP listener to {}", self.bind_addr);
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| ManagerError::Bind {
                addr: self.bind_addr,
                source,
            })?;

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    ///
    /// The accept loop runs in its own task and is restarted if it panics.
    /// Once it stops, every live connection is disconnected.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ManagerError> {
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        info!("Accepting connections on {}", addr);

        let listener = Arc::new(listener);
        while !self.is_shutting_down() {
            let manager = Arc::clone(self);
            let accept_listener = Arc::clone(&listener);
            let handle = tokio::spawn(async move { manager.accept_loop(&accept_listener).await });

            match handle.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    error!("Accept loop crashed: {}", panic_message(e.into_panic()));
                    self.stats.record_accept_restart();
                    tokio::time::sleep(ACCEPT_RESTART_DELAY).await;
                }
                Err(e) => {
                    error!("Accept loop aborted: {}", e);
                    break;
                }
            }
        }
        drop(listener);

        info!("Connection acceptance loop stopped");
        self.disconnect_all("server shutdown").await;
        Ok(())
    }

    async fn accept_loop(self: &Arc<Self>, listener: &TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.handle_accept(stream, addr).await,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }

    async fn handle_accept(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        if self.is_shutting_down() {
            debug!("Rejecting connection from {} due to shutdown", addr);
            return;
        }

        if let Err(e) = self.apply_keepalive(&stream) {
            warn!("Failed to configure keep-alive for {}: {}", addr, e);
        }

        let worker = self.pool.acquire();
        let bound = catch_unwind(AssertUnwindSafe(|| {
            worker.connect(stream, (self.factory)(), &self.greeting)
        }));
        let io = match bound {
            Ok(Ok(io)) => io,
            Ok(Err(e)) => {
                error!("Failed to bind connection from {}: {}", addr, e);
                return;
            }
            Err(panic) => {
                let reason = panic_message(panic);
                error!(
                    socket_id = worker.socket_id(),
                    "Handler setup for {} panicked: {}", addr, reason
                );
                self.stats.record_panic();
                worker.disconnect(&reason);
                self.pool.release(worker);
                return;
            }
        };

        info!(socket_id = worker.socket_id(), peer = %addr, "connection accepted");
        self.registry
            .write()
            .await
            .insert(worker.socket_id(), Arc::clone(&worker));

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run_connection(worker, io).await });
    }

    fn apply_keepalive(&self, stream: &TcpStream) -> std::io::Result<()> {
        let socket = SockRef::from(stream);
        if self.config.keepalive_interval.is_zero() {
            return socket.set_keepalive(false);
        }
        let keepalive = TcpKeepalive::new().with_time(self.config.keepalive_interval);
        socket.set_tcp_keepalive(&keepalive)
    }

    /// Run both loops of one connection, then deregister and pool the worker.
    #[instrument(skip_all, fields(socket_id = worker.socket_id()))]
    async fn run_connection(self: Arc<Self>, worker: Arc<ConnectionWorker>, io: ConnectionIo) {
        let ConnectionIo { reader, writer } = io;

        let recv = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                if let Err(reason) = worker.recv(reader).await {
                    worker.disconnect(&reason);
                }
            })
        };
        let send = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                if let Err(reason) = worker.send_loop(writer).await {
                    worker.disconnect(&reason);
                }
            })
        };

        tokio::join!(
            self.supervise(&worker, recv),
            self.supervise(&worker, send)
        );

        worker.disconnect("connection closed");
        self.registry.write().await.remove(&worker.socket_id());
        self.pool.release(worker);
    }

    /// Turn a panic inside a connection task into an orderly disconnect.
    async fn supervise(&self, worker: &ConnectionWorker, task: JoinHandle<()>) {
        if let Err(e) = task.await {
            let reason = if e.is_panic() {
                self.stats.record_panic();
                panic_message(e.into_panic())
            } else {
                "connection task cancelled".to_string()
            };
            error!(socket_id = worker.socket_id(), "Connection task failed: {}", reason);
            worker.disconnect(&reason);
        }
    }

    /// Stop accepting connections. In-flight connections are disconnected by
    /// the serving task once the accept loop exits; nothing waits for them.
    pub fn shutdown(&self) {
        info!("Initiating shutdown of connection manager");
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    async fn snapshot(&self) -> Vec<Arc<ConnectionWorker>> {
        self.registry.read().await.values().cloned().collect()
    }

    async fn disconnect_all(&self, reason: &str) {
        let workers = self.snapshot().await;
        if !workers.is_empty() {
            info!("Disconnecting {} connections: {}", workers.len(), reason);
        }
        for worker in workers {
            worker.disconnect(reason);
        }
    }

    /// Sweep every live connection.
    ///
    /// Connections silent for longer than the read timeout plus a grace period
    /// are dropped as half-open, and connections that never registered within
    /// the registration timeout are dropped as well. Returns the handler
    /// status of every remaining registered connection.
    pub async fn health_report(&self) -> HashMap<u64, serde_json::Value> {
        let mut report = HashMap::new();
        let mut stale = Vec::new();
        let registration_timeout = self.config.registration_timeout;

        for worker in self.snapshot().await {
            let socket_id = worker.socket_id();
            if !worker.is_active() {
                stale.push(socket_id);
                continue;
            }

            if worker.idle_read() > self.config.read_timeout + ANOMALY_GRACE {
                warn!(socket_id, "no reads for {:?}, dropping", worker.idle_read());
                worker.disconnect("socket anomaly");
                continue;
            }

            let status = worker.health_report();
            if !registration_timeout.is_zero()
                && worker.idle_write() > registration_timeout
                && worker.queued() == 0
                && status.is_none()
            {
                warn!(socket_id, "connection never registered, dropping");
                worker.disconnect("unregistered connection");
                continue;
            }

            if let Some(status) = status {
                report.insert(socket_id, status);
            }
        }

        if !stale.is_empty() {
            let mut registry = self.registry.write().await;
            for socket_id in stale {
                if registry.get(&socket_id).is_some_and(|w| !w.is_active()) {
                    registry.remove(&socket_id);
                }
            }
        }

        report
    }

    /// Queue `messages` on the connection(s) owning `target`.
    ///
    /// Stops at the first match unless `multi_target` is configured. Returns
    /// whether any connection took the messages.
    pub async fn write_to(&self, target: &str, messages: &[SendMessage]) -> bool {
        let mut delivered = false;
        for worker in self.snapshot().await {
            if worker.write_to(target, messages) {
                delivered = true;
                if !self.config.multi_target {
                    break;
                }
            }
        }
        delivered
    }

    /// Address the listener is bound to, once serving
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Get the number of active connections
    pub fn active_connections(&self) -> usize {
        self.stats.active()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    /// Get information about all registered connections
    pub async fn connection_info(&self) -> Vec<WorkerInfo> {
        self.snapshot().await.iter().map(|w| w.info()).collect()
    }

    /// Number of idle workers waiting in the pool
    pub fn pooled_workers(&self) -> usize {
        self.pool.idle()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "connection task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::handler::{handler_factory, ConnectionHandler};
    use crate::connection::types::Received;

    #[derive(Default)]
    struct Reasons(Mutex<Vec<String>>);

    struct Silent {
        reasons: Arc<Reasons>,
        registered: bool,
    }

    impl ConnectionHandler for Silent {
        fn on_disconnect(&mut self, reason: &str) {
            self.reasons.0.lock().push(reason.to_string());
        }

        fn on_receive(&mut self, data: &[u8]) -> Received {
            Received::consumed(data.len())
        }

        fn report_status(&self) -> Option<serde_json::Value> {
            self.registered.then(|| serde_json::json!({ "registered": true }))
        }
    }

    fn config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            read_timeout: Duration::from_secs(2),
            registration_timeout: Duration::from_secs(1),
            pool_size: 2,
            ..ServerConfig::default()
        }
    }

    async fn start(registered: bool) -> (Arc<ConnectionManager>, Arc<Reasons>, TcpStream) {
        let reasons = Arc::new(Reasons::default());
        let factory = {
            let reasons = Arc::clone(&reasons);
            handler_factory(move || Silent {
                reasons: Arc::clone(&reasons),
                registered,
            })
        };
        let manager = Arc::new(ConnectionManager::new(config(), factory).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.serve(listener).await });
        }

        let client = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            if manager.active_connections() == 1 && !manager.snapshot().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (manager, reasons, client)
    }

    async fn wait_for_reason(reasons: &Reasons) -> Vec<String> {
        for _ in 0..100 {
            let seen = reasons.0.lock().clone();
            if !seen.is_empty() {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Vec::new()
    }

    #[test]
    fn test_invalid_host_rejected_at_construction() {
        let factory = handler_factory(|| Silent {
            reasons: Arc::new(Reasons::default()),
            registered: true,
        });
        let config = ServerConfig {
            host: "nope".to_string(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            ConnectionManager::new(config, factory),
            Err(ManagerError::HostNotValid(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_socket_is_swept() {
        let (manager, reasons, _client) = start(true).await;
        let worker = manager.snapshot().await.pop().unwrap();

        assert_eq!(manager.health_report().await.len(), 1);

        worker.backdate_read(Duration::from_secs(25));
        assert!(manager.health_report().await.is_empty());
        assert_eq!(wait_for_reason(&reasons).await, vec!["socket anomaly".to_string()]);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_unregistered_connection_is_swept() {
        let (manager, reasons, _client) = start(false).await;
        let worker = manager.snapshot().await.pop().unwrap();

        assert!(manager.health_report().await.is_empty());
        assert!(worker.is_active());

        worker.backdate_write(Duration::from_secs(5));
        manager.health_report().await;
        assert_eq!(
            wait_for_reason(&reasons).await,
            vec!["unregistered connection".to_string()]
        );
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_closed_workers_leave_registry() {
        let (manager, _reasons, client) = start(true).await;
        drop(client);

        for _ in 0..100 {
            if manager.snapshot().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.health_report().await.is_empty());
        assert!(manager.snapshot().await.is_empty());
        assert_eq!(manager.active_connections(), 0);
        manager.shutdown();
    }

    struct Fragile {
        reasons: Arc<Reasons>,
        explode: bool,
    }

    impl ConnectionHandler for Fragile {
        fn on_connect(&mut self, _stream: &TcpStream) {
            if self.explode {
                panic!("connect hook exploded");
            }
        }

        fn on_disconnect(&mut self, reason: &str) {
            self.reasons.0.lock().push(reason.to_string());
        }

        fn on_receive(&mut self, data: &[u8]) -> Received {
            Received::consumed(data.len())
        }
    }

    #[tokio::test]
    async fn test_panicking_connect_hook_returns_worker_to_pool() {
        let reasons = Arc::new(Reasons::default());
        let built = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let factory = {
            let reasons = Arc::clone(&reasons);
            let built = Arc::clone(&built);
            handler_factory(move || Fragile {
                reasons: Arc::clone(&reasons),
                explode: built.fetch_add(1, Ordering::SeqCst) == 0,
            })
        };
        let manager = Arc::new(ConnectionManager::new(config(), factory).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.serve(listener).await });
        }

        let _doomed = TcpStream::connect(addr).await.unwrap();
        assert_eq!(
            wait_for_reason(&reasons).await,
            vec!["connect hook exploded".to_string()]
        );
        for _ in 0..100 {
            if manager.pooled_workers() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.stats().recovered_panics, 1);
        assert_eq!(manager.active_connections(), 0);
        assert_eq!(manager.pooled_workers(), 2);
        assert!(manager.snapshot().await.is_empty());

        let _healthy = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            if !manager.snapshot().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.snapshot().await.len(), 1);
        assert_eq!(manager.active_connections(), 1);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_keepalive_follows_config() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        for (interval, expected) in [(Duration::ZERO, false), (Duration::from_secs(30), true)] {
            let config = ServerConfig {
                keepalive_interval: interval,
                ..config()
            };
            let factory = handler_factory(|| Silent {
                reasons: Arc::new(Reasons::default()),
                registered: true,
            });
            let manager = ConnectionManager::new(config, factory).unwrap();

            let client = TcpStream::connect(addr).await.unwrap();
            let (server, _) = listener.accept().await.unwrap();
            SockRef::from(&server).set_keepalive(!expected).unwrap();

            manager.apply_keepalive(&server).unwrap();
            assert_eq!(SockRef::from(&server).keepalive().unwrap(), expected);
            drop(client);
        }
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7_u8)), "connection task panicked");
    }
}
