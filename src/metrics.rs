//! Server-wide counters, grounded in the reference `metrics.h`/`metrics.c`:
//! a fixed set of atomics with no cross-counter transaction — a snapshot can
//! observe e.g. `bytes_sent` updated before `bytes_transferred`.
//!
//! All counters reset to zero on process start; nothing here persists across
//! restarts.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct Metrics {
    total_connections: AtomicU64,
    current_connections: AtomicU64,
    bytes_transferred: AtomicU64,
    successful_connections: AtomicU64,
    failed_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Point-in-time read of every counter, for the management plane's STATS
/// command.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    pub total_connections: u64,
    pub current_connections: u64,
    pub bytes_transferred: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics {
            total_connections: AtomicU64::new(0),
            current_connections: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            successful_connections: AtomicU64::new(0),
            failed_connections: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.current_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.current_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_success(&self) {
        self.successful_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            current_connections: self.current_connections.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            successful_connections: self.successful_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Metrics {
        Metrics::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Metrics;

    #[test]
    fn opened_then_closed_nets_to_zero_current() {
        let m = Metrics::new();
        m.connection_opened();
        m.connection_opened();
        m.connection_closed();
        let snap = m.snapshot();
        assert_eq!(snap.total_connections, 2);
        assert_eq!(snap.current_connections, 1);
    }

    #[test]
    fn bytes_sent_and_received_fold_into_transferred() {
        let m = Metrics::new();
        m.add_bytes_sent(10);
        m.add_bytes_received(5);
        let snap = m.snapshot();
        assert_eq!(snap.bytes_sent, 10);
        assert_eq!(snap.bytes_received, 5);
        assert_eq!(snap.bytes_transferred, 15);
    }

    #[test]
    fn success_and_failure_counters_are_independent() {
        let m = Metrics::new();
        m.connection_success();
        m.connection_failed();
        m.connection_failed();
        let snap = m.snapshot();
        assert_eq!(snap.successful_connections, 1);
        assert_eq!(snap.failed_connections, 2);
    }
}
