//! Connection Types

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::queue::Priority;

/// An outbound message queued on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMessage {
    pub data: Bytes,
    /// Pause the send loop for this long after the message is written
    pub interval: Duration,
    pub priority: Priority,
}

impl SendMessage {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            interval: Duration::ZERO,
            priority: Priority::NORMAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of feeding inbound bytes to a handler.
#[derive(Debug, Default)]
pub struct Received {
    /// Number of leading bytes the handler parsed. The rest is kept and
    /// prepended to the next read.
    pub consumed: usize,
    pub replies: Vec<SendMessage>,
}

impl Received {
    pub fn consumed(consumed: usize) -> Self {
        Self {
            consumed,
            replies: Vec::new(),
        }
    }

    pub fn with_reply(mut self, reply: SendMessage) -> Self {
        self.replies.push(reply);
        self
    }
}

/// Lifecycle of a pooled worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Active = 1,
    Closing = 2,
}

impl WorkerState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Active,
            2 => WorkerState::Closing,
            _ => WorkerState::Idle,
        }
    }
}

/// Point-in-time view of a worker, for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub socket_id: u64,
    pub remote_addr: Option<SocketAddr>,
    pub state: WorkerState,
    pub idle_read_ms: u64,
    pub idle_write_ms: u64,
    pub queued: usize,
}
