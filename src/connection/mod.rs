//! Connection Management Module
//!
//! Handles TCP connection acceptance, per-connection workers, and their
//! lifecycle.

pub mod handler;
pub mod manager;
pub mod pool;
pub mod stats;
pub mod types;
pub mod worker;

pub use handler::{handler_factory, ConnectionHandler, HandlerFactory};
pub use manager::ConnectionManager;
pub use pool::WorkerPool;
pub use stats::ConnectionStats;
pub use types::{Received, SendMessage, WorkerInfo, WorkerState};
pub use worker::{ConnectionWorker, WorkerSettings};
