//! Worker Pool
//!
//! Free list of idle [`ConnectionWorker`]s. A pool slot keeps its socket id
//! for its whole life, so ids are reused by every connection the slot serves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::stats::StatsCollector;
use super::worker::{ConnectionWorker, WorkerSettings};

/// Socket ids are unique across every pool in the process.
static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

pub struct WorkerPool {
    free: Mutex<Vec<Arc<ConnectionWorker>>>,
    settings: WorkerSettings,
    retain: usize,
    created: AtomicU64,
    stats: Arc<StatsCollector>,
}

impl WorkerPool {
    /// Create a pool prewarmed with `size` idle workers. At most `size`
    /// released workers are kept for reuse.
    pub fn new(settings: WorkerSettings, size: usize, stats: Arc<StatsCollector>) -> Self {
        let pool = Self {
            free: Mutex::new(Vec::with_capacity(size)),
            settings,
            retain: size,
            created: AtomicU64::new(0),
            stats,
        };

        let prewarmed: Vec<_> = (0..size).map(|_| pool.build()).collect();
        *pool.free.lock() = prewarmed;
        pool
    }

    fn build(&self) -> Arc<ConnectionWorker> {
        let socket_id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
        Arc::new(ConnectionWorker::new(
            socket_id,
            self.settings,
            Arc::clone(&self.stats),
        ))
    }

    /// Take an idle worker, building a new slot when the free list is empty
    pub fn acquire(&self) -> Arc<ConnectionWorker> {
        if let Some(worker) = self.free.lock().pop() {
            debug!(socket_id = worker.socket_id(), "reusing pooled worker");
            return worker;
        }
        self.build()
    }

    /// Hand a torn-down worker back
    pub fn release(&self, worker: Arc<ConnectionWorker>) {
        if !worker.reset_for_pool() {
            warn!(
                socket_id = worker.socket_id(),
                "refusing to pool a worker that is still active"
            );
            return;
        }

        let mut free = self.free.lock();
        if free.len() < self.retain {
            free.push(worker);
        }
    }

    /// Number of idle workers waiting in the pool
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of slots this pool has ever built
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}
