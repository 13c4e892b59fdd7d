//! Error Types
//!
//! Typed failures surfaced by the queue and the connection manager.

use std::net::SocketAddr;
use thiserror::Error;

/// Failures returned by [`BoundedPriorityQueue`](crate::queue::BoundedPriorityQueue).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("queue is full")]
    Full,

    #[error("timed out waiting for an item")]
    Timeout,

    #[error("queue must be closed before it can be reset")]
    NotClosed,

    #[error("priority {0} is outside 1..=9")]
    InvalidPriority(u8),
}

/// Failures raised while building or running a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("host '{0}' is not a valid bind address")]
    HostNotValid(String),

    #[error("port {0} is out of range")]
    PortNotValid(u32),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
