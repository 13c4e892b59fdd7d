//! Connection Statistics

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Counters shared by the manager and every worker
#[derive(Debug, Default)]
pub struct StatsCollector {
    accepted: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    disconnects: AtomicU64,
    messages_sent: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    dropped_replies: AtomicU64,
    recovered_panics: AtomicU64,
    accept_restarts: AtomicU64,
}

impl StatsCollector {
    pub fn connection_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        let current = self.active.fetch_add(1, Ordering::Relaxed) + 1;

        let mut peak = self.peak_active.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_active.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => peak = x,
            }
        }
    }

    pub fn connection_closed(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped_reply(&self) {
        self.dropped_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.recovered_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accept_restart(&self) {
        self.accept_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            total_accepted: self.accepted.load(Ordering::Relaxed),
            active_connections: self.active.load(Ordering::Relaxed),
            peak_connections: self.peak_active.load(Ordering::Relaxed),
            total_disconnects: self.disconnects.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            dropped_replies: self.dropped_replies.load(Ordering::Relaxed),
            recovered_panics: self.recovered_panics.load(Ordering::Relaxed),
            accept_restarts: self.accept_restarts.load(Ordering::Relaxed),
        }
    }
}

/// Connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_accepted: u64,
    pub active_connections: usize,
    pub peak_connections: usize,
    pub total_disconnects: u64,
    pub messages_sent: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub dropped_replies: u64,
    pub recovered_panics: u64,
    pub accept_restarts: u64,
}
