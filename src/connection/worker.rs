//! Connection Worker
//!
//! Drives one TCP socket: pumps inbound bytes through the handler, pumps
//! outbound messages from the priority queue to the wire, and tears the
//! connection down exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::handler::ConnectionHandler;
use super::stats::StatsCollector;
use super::types::{SendMessage, WorkerInfo, WorkerState};
use crate::config::ServerConfig;
use crate::error::QueueError;
use crate::queue::BoundedPriorityQueue;

/// Per-worker knobs taken from the server configuration.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub read_timeout: Duration,
    /// Zero disables the write deadline
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub read_buffer_size: usize,
}

impl From<&ServerConfig> for WorkerSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            queue_capacity: config.queue_capacity,
            read_buffer_size: config.read_buffer_size,
        }
    }
}

/// Socket halves handed to the receive and send loops by [`ConnectionWorker::connect`].
pub struct ConnectionIo {
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
}

/// A pooled per-socket worker.
///
/// Idle workers sit in the pool with a closed queue and no handler. `connect`
/// makes a worker active; `disconnect` moves it to closing, and the pool puts
/// it back to idle on release.
pub struct ConnectionWorker {
    socket_id: u64,
    settings: WorkerSettings,
    state: AtomicU8,
    remote_addr: Mutex<Option<SocketAddr>>,
    queue: BoundedPriorityQueue<SendMessage>,
    last_read_at: Mutex<Instant>,
    last_write_at: Mutex<Instant>,
    cancel: Mutex<CancellationToken>,
    handler: Mutex<Option<Box<dyn ConnectionHandler>>>,
    read_cache: Mutex<BytesMut>,
    stats: Arc<StatsCollector>,
}

impl ConnectionWorker {
    /// Create an idle worker for pool slot `socket_id`
    pub fn new(socket_id: u64, settings: WorkerSettings, stats: Arc<StatsCollector>) -> Self {
        let queue = BoundedPriorityQueue::new(settings.queue_capacity);
        queue.close();

        let now = Instant::now();
        Self {
            socket_id,
            settings,
            state: AtomicU8::new(WorkerState::Idle as u8),
            remote_addr: Mutex::new(None),
            queue,
            last_read_at: Mutex::new(now),
            last_write_at: Mutex::new(now),
            cancel: Mutex::new(CancellationToken::new()),
            handler: Mutex::new(None),
            read_cache: Mutex::new(BytesMut::new()),
            stats,
        }
    }

    pub fn socket_id(&self) -> u64 {
        self.socket_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock()
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == WorkerState::Active
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Time since the last successful read
    pub fn idle_read(&self) -> Duration {
        self.last_read_at.lock().elapsed()
    }

    /// Time since the last successful write
    pub fn idle_write(&self) -> Duration {
        self.last_write_at.lock().elapsed()
    }

    /// Bind an accepted socket to this worker.
    ///
    /// Fires the handler's connect hook and queues `greeting` before the
    /// socket halves are handed back for the two loops.
    pub fn connect(
        &self,
        stream: TcpStream,
        handler: Box<dyn ConnectionHandler>,
        greeting: &[SendMessage],
    ) -> std::io::Result<ConnectionIo> {
        if self
            .state
            .compare_exchange(
                WorkerState::Idle as u8,
                WorkerState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(std::io::Error::other(format!(
                "worker {} is already in use",
                self.socket_id
            )));
        }

        *self.remote_addr.lock() = stream.peer_addr().ok();
        *self.cancel.lock() = CancellationToken::new();
        // Pooled workers come back with a closed queue; anything else still
        // holds a previous connection's messages
        if let Err(QueueError::NotClosed) = self.queue.reset() {
            warn!(socket_id = self.socket_id, "send queue was left open, discarding it");
            self.queue.close();
        }
        self.queue.open();

        let now = Instant::now();
        *self.last_read_at.lock() = now;
        *self.last_write_at.lock() = now;

        // Counted before the hook; a panicking hook is balanced by its disconnect
        self.stats.connection_opened();
        {
            let mut slot = self.handler.lock();
            let handler = slot.insert(handler);
            handler.on_connect(&stream);
        }

        for message in greeting {
            if let Err(e) = self.send(message.clone()) {
                warn!(socket_id = self.socket_id, "failed to queue greeting: {}", e);
            }
        }

        let (reader, writer) = stream.into_split();
        Ok(ConnectionIo { reader, writer })
    }

    /// Queue a message for this connection
    pub fn send(&self, message: SendMessage) -> Result<(), QueueError> {
        self.queue.put(message.priority, message)
    }

    /// Token cancelled when this connection is torn down
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Receive loop. Returns the disconnect reason once the connection can no
    /// longer be read.
    #[instrument(name = "recv", skip_all, fields(socket_id = self.socket_id))]
    pub async fn recv(&self, mut reader: OwnedReadHalf) -> Result<(), String> {
        let cancel = self.cancel_token();
        let mut buf = vec![0u8; self.settings.read_buffer_size];

        while self.is_active() {
            let read = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = timeout(self.settings.read_timeout, reader.read(&mut buf)) => read,
            };

            // tokio reports end of stream as a zero-byte read
            let n = match read {
                Err(_) => return Err("read timeout".to_string()),
                Ok(Ok(0)) => return Err("remote closed".to_string()),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(format!("read error: {}", e)),
            };

            *self.last_read_at.lock() = Instant::now();
            self.stats.record_read(n);

            for reply in self.feed(&buf[..n]) {
                if let Err(e) = self.send(reply) {
                    self.stats.record_dropped_reply();
                    debug!("dropping reply: {}", e);
                }
            }
        }

        Ok(())
    }

    /// Prepend the carried-over partial frame and let the handler parse.
    fn feed(&self, data: &[u8]) -> Vec<SendMessage> {
        let mut cache = self.read_cache.lock();
        cache.extend_from_slice(data);

        let mut handler = self.handler.lock();
        let Some(handler) = handler.as_mut() else {
            return Vec::new();
        };

        let received = handler.on_receive(&cache);
        let consumed = received.consumed.min(cache.len());
        cache.advance(consumed);
        received.replies
    }

    /// Send loop. Returns the disconnect reason once the connection can no
    /// longer be written.
    #[instrument(name = "send", skip_all, fields(socket_id = self.socket_id))]
    pub async fn send_loop(&self, mut writer: OwnedWriteHalf) -> Result<(), String> {
        let cancel = self.cancel_token();
        let pace = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(pace);

        loop {
            let message = self
                .queue
                .get_with_cancel(&cancel)
                .await
                .map_err(|e| format!("send queue: {}", e))?;

            // A peer that stops reading must not pin the writer past disconnect
            let write = async {
                if self.settings.write_timeout.is_zero() {
                    writer
                        .write_all(&message.data)
                        .await
                        .map_err(|e| format!("write error: {}", e))
                } else {
                    match timeout(self.settings.write_timeout, writer.write_all(&message.data)).await {
                        Ok(written) => written.map_err(|e| format!("write error: {}", e)),
                        Err(_) => Err("write timeout".to_string()),
                    }
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                written = write => written?,
            }

            *self.last_write_at.lock() = Instant::now();
            self.stats.record_write(message.data.len());

            if tracing::enabled!(tracing::Level::DEBUG) {
                if let Some(handler) = self.handler.lock().as_ref() {
                    debug!(bytes = message.data.len(), "sent: {}", handler.format_for_log(&message.data));
                }
            }

            if !message.interval.is_zero() {
                pace.as_mut()
                    .reset(tokio::time::Instant::now() + message.interval);
                tokio::select! {
                    _ = &mut pace => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
            }
        }
    }

    /// Tear the connection down. Only the first call does anything; it
    /// returns whether this call was the one that closed the connection.
    pub fn disconnect(&self, reason: &str) -> bool {
        if self
            .state
            .compare_exchange(
                WorkerState::Active as u8,
                WorkerState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        info!(
            socket_id = self.socket_id,
            peer = ?self.remote_addr(),
            reason,
            "connection closed"
        );

        self.cancel.lock().cancel();
        self.queue.close();
        self.read_cache.lock().clear();
        if let Some(handler) = self.handler.lock().as_mut() {
            handler.on_disconnect(reason);
        }
        self.stats.connection_closed();
        true
    }

    /// Queue `messages` if this connection owns `target`
    pub fn write_to(&self, target: &str, messages: &[SendMessage]) -> bool {
        if !self.is_active() {
            return false;
        }

        let owns = self
            .handler
            .lock()
            .as_ref()
            .is_some_and(|handler| handler.matches_target(target));
        if !owns {
            return false;
        }

        for message in messages {
            if let Err(e) = self.send(message.clone()) {
                warn!(socket_id = self.socket_id, route = target, "failed to queue message: {}", e);
            }
        }
        true
    }

    /// Handler-reported status; `None` for inactive or unregistered connections
    pub fn health_report(&self) -> Option<serde_json::Value> {
        if !self.is_active() {
            return None;
        }
        self.handler.lock().as_ref()?.report_status()
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            socket_id: self.socket_id,
            remote_addr: self.remote_addr(),
            state: self.state(),
            idle_read_ms: self.idle_read().as_millis() as u64,
            idle_write_ms: self.idle_write().as_millis() as u64,
            queued: self.queued(),
        }
    }

    /// Return a torn-down worker to idle. Active workers are left alone.
    pub(crate) fn reset_for_pool(&self) -> bool {
        if self.state() == WorkerState::Active {
            return false;
        }
        self.queue.close();
        *self.handler.lock() = None;
        *self.remote_addr.lock() = None;
        self.read_cache.lock().clear();
        self.state.store(WorkerState::Idle as u8, Ordering::Release);
        true
    }

    #[cfg(test)]
    pub(crate) fn backdate_read(&self, by: Duration) {
        let mut last = self.last_read_at.lock();
        if let Some(earlier) = last.checked_sub(by) {
            *last = earlier;
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_write(&self, by: Duration) {
        let mut last = self.last_write_at.lock();
        if let Some(earlier) = last.checked_sub(by) {
            *last = earlier;
        }
    }
}
