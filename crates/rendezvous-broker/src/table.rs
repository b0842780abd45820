//! Per-relation rendezvous state.
//!
//! A [`RendezvousTable`] holds the two halves of one pairing relation:
//!
//! - **offering** -- at most one standing [`Offer`] per key.  Later offers
//!   overwrite earlier ones; an offer is re-used for every consumer that
//!   arrives while it stands.
//! - **waiting** -- a [`CallbackRegistry`] of consumers parked until an offer
//!   arrives for their key.
//!
//! Offers carry a per-table sequence number assigned under the key's entry
//! lock, so the stored offer for a key always has the highest sequence ever
//! stored for it.  A new persistent waiter may be reached by the offer
//! standing when it registered through two paths (its own lookup and that
//! offer's dispatch); the sequence decides which of the two delivers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, Shared};
use tokio::sync::mpsc;

use crate::connection::ConnectionId;
use crate::pairing::{Outcome, Producer};
use crate::registry::CallbackRegistry;

/// A producer result that may be awaited by several parties.
///
/// Lazy: the producer is not invoked until the first party polls it.
pub(crate) type PendingOutcome<T> = Shared<BoxFuture<'static, Outcome<T>>>;

// ---------------------------------------------------------------------------
// Offers
// ---------------------------------------------------------------------------

/// A standing offer from a source connection.
pub struct Offer<T> {
    pub(crate) seq: u64,
    pub(crate) owner: ConnectionId,
    pub(crate) producer: Arc<dyn Producer<T>>,
    pub(crate) offered_at: DateTime<Utc>,
}

impl<T> Clone for Offer<T> {
    fn clone(&self) -> Self {
        Self {
            seq: self.seq,
            owner: self.owner,
            producer: Arc::clone(&self.producer),
            offered_at: self.offered_at,
        }
    }
}

impl<T> Offer<T> {
    /// Connection that made this offer.
    pub fn owner(&self) -> ConnectionId {
        self.owner
    }

    /// When the offer was stored.
    pub fn offered_at(&self) -> DateTime<Utc> {
        self.offered_at
    }
}

// ---------------------------------------------------------------------------
// Waiters
// ---------------------------------------------------------------------------

/// Whether a waiter leaves the table after its first delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retention {
    Once,
    Persistent,
}

/// A parked consumer.  Deliveries are queued on `jobs` and resolved by
/// whoever holds the receiving end, in queue order.
pub(crate) struct Waiter<T> {
    pub(crate) retention: Retention,
    standing: Mutex<StandingClaim>,
    jobs: mpsc::UnboundedSender<PendingOutcome<T>>,
}

/// Which offer the waiter's own registration-time lookup delivers.
#[derive(Debug)]
enum StandingClaim {
    /// Lookup not done yet; offers dispatched to the waiter so far.
    Pending { dispatched: Vec<u64> },
    /// Lookup done; `None` when it delivered nothing.
    Settled(Option<u64>),
}

impl<T> Waiter<T> {
    pub(crate) fn new(retention: Retention, jobs: mpsc::UnboundedSender<PendingOutcome<T>>) -> Self {
        Self {
            retention,
            standing: Mutex::new(StandingClaim::Pending {
                dispatched: Vec::new(),
            }),
            jobs,
        }
    }

    /// Claim offer `seq` from that offer's dispatch.
    ///
    /// Returns `false` only when the registration-time lookup already
    /// delivered this exact offer.
    pub(crate) fn claim(&self, seq: u64) -> bool {
        let mut standing = self.standing.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *standing {
            StandingClaim::Pending { dispatched } => {
                dispatched.push(seq);
                true
            }
            StandingClaim::Settled(delivered) => *delivered != Some(seq),
        }
    }

    /// Claim the offer found standing at registration time, if any.
    ///
    /// Must be called exactly once per persistent waiter.  Returns `false`
    /// when there is nothing to deliver: no standing offer, or a dispatch
    /// already handed the waiter this offer or a newer one.
    pub(crate) fn claim_standing(&self, seq: Option<u64>) -> bool {
        let mut standing = self.standing.lock().unwrap_or_else(|e| e.into_inner());
        let claimed = match (&*standing, seq) {
            (StandingClaim::Pending { dispatched }, Some(seq)) => {
                dispatched.iter().all(|&d| d < seq)
            }
            _ => false,
        };
        *standing = StandingClaim::Settled(seq.filter(|_| claimed));
        claimed
    }

    /// Queue a result.  Returns `false` if the receiving side is gone.
    pub(crate) fn enqueue(&self, pending: PendingOutcome<T>) -> bool {
        self.jobs.send(pending).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// The offering and waiting maps of one pairing relation.
pub struct RendezvousTable<T> {
    offering: DashMap<String, Offer<T>>,
    waiting: CallbackRegistry<Arc<Waiter<T>>>,
    next_seq: AtomicU64,
}

impl<T> RendezvousTable<T> {
    /// Create an empty table whose waiting side allows `max_per_owner`
    /// registrations per connection and key.
    #[must_use]
    pub fn new(max_per_owner: usize) -> Self {
        Self {
            offering: DashMap::new(),
            waiting: CallbackRegistry::with_max_per_owner(max_per_owner),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Store `producer` as the standing offer for `key`, replacing any
    /// previous one.
    pub(crate) fn store_offer(
        &self,
        key: &str,
        owner: ConnectionId,
        producer: Arc<dyn Producer<T>>,
    ) -> Offer<T> {
        let entry = self.offering.entry(key.to_owned());
        let offer = Offer {
            seq: self.next_seq.fetch_add(1, Ordering::AcqRel) + 1,
            owner,
            producer,
            offered_at: Utc::now(),
        };
        let replaced = match entry {
            Entry::Occupied(mut occupied) => Some(occupied.insert(offer.clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(offer.clone());
                None
            }
        };

        if let Some(previous) = replaced {
            tracing::debug!(
                key,
                previous_owner = %previous.owner,
                owner = %owner,
                "standing offer replaced"
            );
        }
        offer
    }

    /// The standing offer for `key`, if any.
    pub fn offer_for(&self, key: &str) -> Option<Offer<T>> {
        self.offering.get(key).map(|o| o.value().clone())
    }

    /// Remove every standing offer made by `owner`.
    ///
    /// Offers that another connection has since overwritten are untouched.
    pub(crate) fn withdraw_offers_of(&self, owner: ConnectionId) -> usize {
        let before = self.offering.len();
        self.offering.retain(|_, offer| offer.owner != owner);
        before.saturating_sub(self.offering.len())
    }

    pub(crate) fn waiting(&self) -> &CallbackRegistry<Arc<Waiter<T>>> {
        &self.waiting
    }

    /// Number of keys with a standing offer.
    pub fn offering_count(&self) -> usize {
        self.offering.len()
    }

    /// Number of parked consumers across all keys.
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Number of keys with at least one parked consumer.
    pub fn waiting_key_count(&self) -> usize {
        self.waiting.key_count()
    }

    /// When the longest-parked consumer registered.
    pub fn oldest_waiting_since(&self) -> Option<DateTime<Utc>> {
        self.waiting.oldest_registration()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProducerError;
    use crate::pairing::FnProducer;

    fn producer(value: &'static str) -> Arc<dyn Producer<String>> {
        Arc::new(FnProducer::new(move || async move {
            Ok::<_, ProducerError>(value.to_owned())
        }))
    }

    #[test]
    fn store_offer_overwrites_and_bumps_sequence() {
        let table = RendezvousTable::<String>::new(1);
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        let first = table.store_offer("k", a, producer("one"));
        let second = table.store_offer("k", b, producer("two"));

        assert!(second.seq > first.seq);
        let standing = table.offer_for("k").unwrap();
        assert_eq!(standing.owner(), b);
        assert_eq!(standing.seq, second.seq);
        assert_eq!(table.offering_count(), 1);
    }

    #[test]
    fn withdraw_only_touches_own_offers() {
        let table = RendezvousTable::<String>::new(1);
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        table.store_offer("k1", a, producer("a"));
        table.store_offer("k2", a, producer("a"));
        table.store_offer("k3", b, producer("b"));
        // b takes over k2.
        table.store_offer("k2", b, producer("b"));

        assert_eq!(table.withdraw_offers_of(a), 1);
        assert!(table.offer_for("k1").is_none());
        assert_eq!(table.offer_for("k2").unwrap().owner(), b);
        assert_eq!(table.offer_for("k3").unwrap().owner(), b);
    }

    #[test]
    fn dispatch_never_collides_with_other_offers() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let waiter = Waiter::<String>::new(Retention::Persistent, tx);

        assert!(!waiter.claim_standing(None));
        // Concurrent offers may dispatch out of sequence order; each counts.
        assert!(waiter.claim(3));
        assert!(waiter.claim(2));
    }

    #[test]
    fn standing_offer_is_delivered_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let waiter = Waiter::<String>::new(Retention::Persistent, tx);

        assert!(waiter.claim_standing(Some(4)));
        assert!(!waiter.claim(4));
        assert!(waiter.claim(5));
    }

    #[test]
    fn dispatch_first_wins_the_standing_offer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let waiter = Waiter::<String>::new(Retention::Persistent, tx);

        assert!(waiter.claim(4));
        assert!(!waiter.claim_standing(Some(4)));
        // Settled without a delivery: later dispatches all go through.
        assert!(waiter.claim(5));
    }

    #[test]
    fn superseded_standing_offer_is_skipped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let waiter = Waiter::<String>::new(Retention::Persistent, tx);

        // A newer offer reached the waiter before its lookup ran.
        assert!(waiter.claim(7));
        assert!(!waiter.claim_standing(Some(6)));
    }
}
