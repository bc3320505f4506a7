//! Atomic counters for hot-path metrics
//!
//! Lock-free counters safe to update from any tunnel task.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();

/// Atomic metrics counters
pub struct Metrics {
    // Tunnel lifecycle
    pub tunnels_total: AtomicU64,
    pub tunnels_active: AtomicU64,

    // Failure classes
    pub handshake_failures: AtomicU64,
    pub resolve_failures: AtomicU64,
    pub connect_failures: AtomicU64,
    pub timeouts_total: AtomicU64,
    pub errors_total: AtomicU64,

    // Traffic, counted in client-side plaintext bytes
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    pub chunks_up: AtomicU64,
    pub chunks_down: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            tunnels_total: AtomicU64::new(0),
            tunnels_active: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            resolve_failures: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            timeouts_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            chunks_up: AtomicU64::new(0),
            chunks_down: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn tunnel_opened(&self) {
        self.tunnels_total.fetch_add(1, Ordering::Relaxed);
        self.tunnels_active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn tunnel_closed(&self) {
        self.tunnels_active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn resolve_failure(&self) {
        self.resolve_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes_up(&self, count: u64) {
        self.bytes_up.fetch_add(count, Ordering::Relaxed);
        self.chunks_up.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes_down(&self, count: u64) {
        self.bytes_down.fetch_add(count, Ordering::Relaxed);
        self.chunks_down.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tunnels_total: self.tunnels_total.load(Ordering::Relaxed),
            tunnels_active: self.tunnels_active.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            resolve_failures: self.resolve_failures.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            chunks_up: self.chunks_up.load(Ordering::Relaxed),
            chunks_down: self.chunks_down.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of counters for reporting
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub tunnels_total: u64,
    pub tunnels_active: u64,
    pub handshake_failures: u64,
    pub resolve_failures: u64,
    pub connect_failures: u64,
    pub timeouts_total: u64,
    pub errors_total: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub chunks_up: u64,
    pub chunks_down: u64,
}
