//! Live tunnel registry
//!
//! Tracks every tunnel from creation to final teardown and provides fast
//! lookup plus a broadcast shutdown signal. Traversal goes through
//! `for_each_snapshot` only, so callers can never hold an iterator across a
//! suspension point.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::info;

use crate::metrics::METRICS;

/// Unique tunnel identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelId(u64);

impl std::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Registry entry for one live tunnel
#[derive(Debug, Clone, Copy)]
pub struct TunnelEntry {
    pub client_addr: SocketAddr,
    pub opened_at: Instant,
}

/// Set of live tunnels, keyed by id
pub struct TunnelRegistry {
    tunnels: DashMap<TunnelId, TunnelEntry>,
    next_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tunnels: DashMap::new(),
            next_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Register a new tunnel
    pub fn insert(&self, client_addr: SocketAddr) -> TunnelId {
        let id = TunnelId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.tunnels.insert(
            id,
            TunnelEntry {
                client_addr,
                opened_at: Instant::now(),
            },
        );
        METRICS.tunnel_opened();
        info!(tunnel_id = %id, %client_addr, "Client connected");
        id
    }

    /// Unregister a tunnel at final teardown
    pub fn remove(&self, id: TunnelId) {
        if let Some((_, entry)) = self.tunnels.remove(&id) {
            METRICS.tunnel_closed();
            info!(
                tunnel_id = %id,
                client_addr = %entry.client_addr,
                duration_secs = entry.opened_at.elapsed().as_secs_f64(),
                "Client disconnected"
            );
        }
    }

    /// Number of live tunnels
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Receiver for the process-wide shutdown signal
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every tunnel to shut down
    pub fn shutdown_all(&self) {
        info!(tunnels = self.len(), "Signaling shutdown to all tunnels");
        let _ = self.shutdown_tx.send(());
    }

    /// Visit every live tunnel over a snapshot, safe against concurrent
    /// removal from within the callback. No map guard is held while the
    /// callback runs.
    pub fn for_each_snapshot(&self, mut visit: impl FnMut(TunnelId, &TunnelEntry)) {
        let snapshot: Vec<(TunnelId, TunnelEntry)> = self
            .tunnels
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        for (id, entry) in &snapshot {
            visit(*id, entry);
        }
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_lifecycle() {
        let registry = TunnelRegistry::new();
        let addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();

        let a = registry.insert(addr);
        let b = registry.insert(addr);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        registry.remove(a);
        assert_eq!(registry.len(), 1);
        // Double remove is harmless.
        registry.remove(a);
        assert_eq!(registry.len(), 1);
        registry.remove(b);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_tolerates_removal_in_callback() {
        let registry = TunnelRegistry::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let ids: Vec<_> = (0..4).map(|_| registry.insert(addr)).collect();

        let mut seen = 0;
        registry.for_each_snapshot(|id, _| {
            seen += 1;
            // Removing the visited id mid-iteration must not panic or skip.
            registry.remove(id);
        });
        assert_eq!(seen, ids.len());
        assert!(registry.is_empty());
    }
}
