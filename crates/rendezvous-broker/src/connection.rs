//! Connection identity and lifecycle notifications.
//!
//! The transport owns the actual sockets; the broker only needs to know
//! *which* connection owns a registration and *when* that connection goes
//! away.  [`ConnectionLifecycle`] hands out a [`ConnectionGuard`] per accepted
//! connection; dropping the guard notifies every [`ConnectionObserver`]
//! synchronously so that stored callbacks are purged before the next offer
//! can reach them.
//!
//! # Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use rendezvous_broker::connection::{ConnectionId, ConnectionLifecycle, ConnectionObserver};
//! struct Printer;
//! impl ConnectionObserver for Printer {
//!     fn connection_closed(&self, id: ConnectionId) {
//!         println!("{id} closed");
//!     }
//! }
//!
//! let lifecycle = ConnectionLifecycle::new(vec![Arc::new(Printer)]);
//! let guard = lifecycle.open();
//! assert_eq!(lifecycle.open_count(), 1);
//! drop(guard);
//! assert_eq!(lifecycle.open_count(), 0);
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique, time-ordered identifier of a client connection (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Receives a notification when a connection closes.
///
/// Called on the thread that drops the [`ConnectionGuard`]; implementations
/// must not block or await.
pub trait ConnectionObserver: Send + Sync {
    fn connection_closed(&self, id: ConnectionId);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Tracks open connections and fans out close notifications.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct ConnectionLifecycle {
    inner: Arc<LifecycleInner>,
}

struct LifecycleInner {
    observers: Vec<Arc<dyn ConnectionObserver>>,
    open: DashMap<ConnectionId, DateTime<Utc>>,
}

impl ConnectionLifecycle {
    /// Create a lifecycle that notifies the given observers, in order.
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn ConnectionObserver>>) -> Self {
        Self {
            inner: Arc::new(LifecycleInner {
                observers,
                open: DashMap::new(),
            }),
        }
    }

    /// Register a newly accepted connection.
    pub fn open(&self) -> ConnectionGuard {
        let id = ConnectionId::new();
        self.inner.open.insert(id, Utc::now());
        tracing::debug!(connection = %id, "connection opened");
        ConnectionGuard {
            id,
            lifecycle: self.clone(),
        }
    }

    /// Number of connections whose guard is still alive.
    pub fn open_count(&self) -> usize {
        self.inner.open.len()
    }

    /// Whether the given connection is still open.
    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.inner.open.contains_key(&id)
    }

    fn close(&self, id: ConnectionId) {
        let Some((_, opened_at)) = self.inner.open.remove(&id) else {
            return;
        };

        for observer in &self.inner.observers {
            observer.connection_closed(id);
        }

        let lived_ms = (Utc::now() - opened_at).num_milliseconds();
        tracing::debug!(connection = %id, lived_ms, "connection closed");
    }
}

/// Ownership token for one open connection.
///
/// Dropping it closes the connection and purges everything the connection
/// registered with the broker.
pub struct ConnectionGuard {
    id: ConnectionId,
    lifecycle: ConnectionLifecycle,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Close explicitly.  Equivalent to dropping the guard.
    pub fn close(self) {
        drop(self);
    }
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard").field("id", &self.id).finish()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.lifecycle.close(self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        closed: Mutex<Vec<ConnectionId>>,
    }

    impl ConnectionObserver for Recorder {
        fn connection_closed(&self, id: ConnectionId) {
            self.closed.lock().unwrap().push(id);
        }
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn dropping_guard_notifies_observers_once() {
        let recorder = Arc::new(Recorder::default());
        let lifecycle = ConnectionLifecycle::new(vec![recorder.clone()]);

        let guard = lifecycle.open();
        let id = guard.id();
        assert!(lifecycle.is_open(id));

        guard.close();

        assert!(!lifecycle.is_open(id));
        assert_eq!(*recorder.closed.lock().unwrap(), vec![id]);
    }

    #[test]
    fn every_observer_is_notified() {
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let lifecycle = ConnectionLifecycle::new(vec![a.clone(), b.clone()]);

        drop(lifecycle.open());

        assert_eq!(a.closed.lock().unwrap().len(), 1);
        assert_eq!(b.closed.lock().unwrap().len(), 1);
    }

    #[test]
    fn open_count_tracks_live_guards() {
        let lifecycle = ConnectionLifecycle::new(Vec::new());
        let g1 = lifecycle.open();
        let g2 = lifecycle.open();
        assert_eq!(lifecycle.open_count(), 2);

        drop(g1);
        assert_eq!(lifecycle.open_count(), 1);
        drop(g2);
        assert_eq!(lifecycle.open_count(), 0);
    }
}
