//! Queue Module
//!
//! Bounded, priority-ordered, cancellable queue backing each connection's
//! outbound path.

pub mod bounded;
pub mod types;

pub use bounded::BoundedPriorityQueue;
pub use types::Priority;
