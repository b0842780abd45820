//! Keyed registry of pending callbacks.
//!
//! [`CallbackRegistry`] stores callbacks under an opaque key, remembers which
//! connection owns each one, and enforces an optional per-connection cap per
//! key.  It is the building block for the "waiting" side of every pairing
//! relation.
//!
//! Internally the registry is backed by two [`DashMap`]s: the key slots
//! themselves and an owner index used to purge a connection on disconnect.
//! All mutations of one key happen under that key's shard lock, so
//! `add`/`remove`/`take` on the same key are serialised while unrelated keys
//! proceed independently.
//!
//! Lock order is always *slot, then owner index*; the purge path releases the
//! owner index before touching any slot.
//!
//! # Example
//!
//! ```rust
//! # use rendezvous_broker::connection::ConnectionId;
//! # use rendezvous_broker::registry::CallbackRegistry;
//! let registry = CallbackRegistry::with_max_per_owner(1);
//! let conn = ConnectionId::new();
//!
//! let id = registry.add("abc", conn, "callback").unwrap();
//! assert!(registry.add("abc", conn, "second").is_err());
//!
//! assert_eq!(registry.take("abc", id), Some("callback"));
//! assert!(registry.is_empty());
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionId;
use crate::error::{BrokerError, Result};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Identifier of one registration, unique within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackId(u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

struct Registration<C> {
    id: CallbackId,
    owner: ConnectionId,
    callback: C,
    registered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent keyed callback registry backed by [`DashMap`].
///
/// The registry is cheaply cloneable (`Arc`-backed) and `Send + Sync` when
/// `C` is.
pub struct CallbackRegistry<C> {
    inner: Arc<RegistryInner<C>>,
}

struct RegistryInner<C> {
    slots: DashMap<String, Vec<Registration<C>>>,
    owners: DashMap<ConnectionId, HashSet<String>>,
    max_per_owner: Option<usize>,
    next_id: AtomicU64,
}

impl<C> Clone for CallbackRegistry<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> CallbackRegistry<C> {
    /// Create a registry without a per-connection cap.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a registry where each connection may hold at most `max`
    /// callbacks per key.
    #[must_use]
    pub fn with_max_per_owner(max: usize) -> Self {
        Self::build(Some(max))
    }

    fn build(max_per_owner: Option<usize>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: DashMap::new(),
                owners: DashMap::new(),
                max_per_owner,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The per-connection cap, if any.
    pub fn max_per_owner(&self) -> Option<usize> {
        self.inner.max_per_owner
    }

    /// Store `callback` under `key` on behalf of `owner`.
    ///
    /// Fails with [`BrokerError::CapacityExceeded`] when `owner` already holds
    /// the maximum number of callbacks for `key`.
    pub fn add(&self, key: &str, owner: ConnectionId, callback: C) -> Result<CallbackId> {
        let mut slot = self.inner.slots.entry(key.to_owned()).or_default();

        if let Some(max) = self.inner.max_per_owner {
            let held = slot.iter().filter(|r| r.owner == owner).count();
            if held >= max {
                tracing::debug!(key, connection = %owner, max, "waiting callback rejected: capacity exceeded");
                let empty = slot.is_empty();
                drop(slot);
                if empty {
                    self.prune(key);
                }
                return Err(BrokerError::CapacityExceeded {
                    connection: owner,
                    key: key.to_owned(),
                    max,
                });
            }
        }

        let id = CallbackId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        slot.push(Registration {
            id,
            owner,
            callback,
            registered_at: Utc::now(),
        });
        self.inner
            .owners
            .entry(owner)
            .or_default()
            .insert(key.to_owned());

        tracing::trace!(key, connection = %owner, callback = %id, "callback registered");

        Ok(id)
    }

    /// Remove one registration.  Removing an absent entry is a no-op.
    ///
    /// Returns whether anything was removed.
    pub fn remove(&self, key: &str, id: CallbackId) -> bool {
        self.take(key, id).is_some()
    }

    /// Atomically remove a registration and hand back its callback.
    ///
    /// When several parties race to fire the same registration, exactly one
    /// of them receives `Some`.
    pub fn take(&self, key: &str, id: CallbackId) -> Option<C> {
        let mut slot = self.inner.slots.get_mut(key)?;
        let pos = slot.iter().position(|r| r.id == id)?;
        let registration = slot.remove(pos);

        if !slot.iter().any(|r| r.owner == registration.owner) {
            if let Some(mut keys) = self.inner.owners.get_mut(&registration.owner) {
                keys.remove(key);
            }
            self.inner
                .owners
                .remove_if(&registration.owner, |_, keys| keys.is_empty());
        }

        let empty = slot.is_empty();
        drop(slot);
        if empty {
            self.prune(key);
        }

        tracing::trace!(key, callback = %id, "callback removed");

        Some(registration.callback)
    }

    /// Purge every callback owned by `owner`, across all keys.
    ///
    /// Returns the number of callbacks removed.
    pub fn remove_all_for_connection(&self, owner: ConnectionId) -> usize {
        let Some((_, keys)) = self.inner.owners.remove(&owner) else {
            return 0;
        };

        let mut removed = 0;
        for key in &keys {
            let Some(mut slot) = self.inner.slots.get_mut(key.as_str()) else {
                continue;
            };
            let before = slot.len();
            slot.retain(|r| r.owner != owner);
            removed += before - slot.len();

            let empty = slot.is_empty();
            drop(slot);
            if empty {
                self.prune(key);
            }
        }

        if removed > 0 {
            tracing::debug!(connection = %owner, removed, "purged callbacks of closed connection");
        }
        removed
    }

    /// Number of callbacks stored under `key`.
    pub fn count(&self, key: &str) -> usize {
        self.inner.slots.get(key).map(|s| s.len()).unwrap_or(0)
    }

    /// Number of callbacks `owner` holds under `key`.
    pub fn count_for_owner(&self, key: &str, owner: ConnectionId) -> usize {
        self.inner
            .slots
            .get(key)
            .map(|s| s.iter().filter(|r| r.owner == owner).count())
            .unwrap_or(0)
    }

    /// Total number of stored callbacks.
    pub fn len(&self) -> usize {
        self.inner.slots.iter().map(|s| s.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    /// Number of keys with at least one callback.
    pub fn key_count(&self) -> usize {
        self.inner.slots.len()
    }

    /// Registration time of the longest-waiting callback.
    pub fn oldest_registration(&self) -> Option<DateTime<Utc>> {
        self.inner
            .slots
            .iter()
            .filter_map(|s| s.value().iter().map(|r| r.registered_at).min())
            .min()
    }

    fn prune(&self, key: &str) {
        self.inner.slots.remove_if(key, |_, slot| slot.is_empty());
    }
}

impl<C: Clone> CallbackRegistry<C> {
    /// Snapshot of every callback stored under `key`, in registration order.
    ///
    /// Does not remove anything.
    pub fn get_all(&self, key: &str) -> Vec<(CallbackId, C)> {
        self.inner
            .slots
            .get(key)
            .map(|slot| slot.iter().map(|r| (r.id, r.callback.clone())).collect())
            .unwrap_or_default()
    }
}

impl<C> Default for CallbackRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
