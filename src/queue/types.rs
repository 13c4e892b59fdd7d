//! Queue Types

use std::cmp::Ordering;
use std::fmt;

use crate::error::QueueError;

/// Delivery priority in `1..=9`; higher values are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const LOWEST: Priority = Priority(1);
    pub const LOW: Priority = Priority(3);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(7);
    pub const HIGHEST: Priority = Priority(9);

    /// Build a priority from any value in `1..=9`.
    pub fn new(value: u8) -> Result<Self, QueueError> {
        if (1..=9).contains(&value) {
            Ok(Priority(value))
        } else {
            Err(QueueError::InvalidPriority(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = QueueError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Heap entry. `seq` is the insertion counter used to keep FIFO order
/// inside a priority band.
#[derive(Debug)]
pub(crate) struct QueueItem<T> {
    pub priority: Priority,
    pub seq: u64,
    pub payload: T,
}

impl<T> PartialEq for QueueItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for QueueItem<T> {}

impl<T> PartialOrd for QueueItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap: higher priority wins, then the older item.
impl<T> Ord for QueueItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
