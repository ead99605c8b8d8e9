//! Connection identity and lifetime tracking.
//!
//! # Responsibilities
//! - Number connections so log lines and registry lookups can refer to them
//! - Count open connections and wake the drainer when the last one closes

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::observability::metrics;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Counts {
    open: AtomicU64,
    closed_all: Notify,
}

/// Shared count of open connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    counts: Arc<Counts>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `id` as open until the returned guard drops.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        let open = self.counts.open.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_connections(open as usize);
        tracing::trace!(connection_id = %id, open, "Connection opened");
        ConnectionGuard {
            counts: Arc::clone(&self.counts),
            id,
        }
    }

    pub fn active_count(&self) -> u64 {
        self.counts.open.load(Ordering::SeqCst)
    }

    /// Wait for every tracked connection to close. `false` if `deadline`
    /// passed first.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.counts.closed_all.notified();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }
}

/// Keeps one connection counted while alive.
#[derive(Debug)]
pub struct ConnectionGuard {
    counts: Arc<Counts>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let open = self.counts.open.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_active_connections(open as usize);
        if open == 0 {
            self.counts.closed_all.notify_waiters();
        }
        tracing::trace!(connection_id = %self.id, open, "Connection closed");
    }
}
