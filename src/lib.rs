//! connfactory
//!
//! Concurrent TCP connection factory: accepts inbound connections, runs each
//! one on a pooled worker with independent receive and send loops, and feeds
//! outbound traffic through a bounded priority queue. Framing is left to a
//! caller-supplied [`ConnectionHandler`].

pub mod config;
pub mod connection;
pub mod echo;
pub mod error;
pub mod queue;
pub mod shutdown;

pub use config::Config;
pub use connection::{
    handler_factory, ConnectionHandler, ConnectionManager, HandlerFactory, Received, SendMessage,
};
pub use error::{ManagerError, QueueError};
pub use queue::{BoundedPriorityQueue, Priority};
pub use shutdown::ShutdownCoordinator;

/// Common error type for application and configuration plumbing
pub type Result<T> = anyhow::Result<T>;
