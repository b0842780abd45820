//! The pairing algorithm.
//!
//! A [`PairingService`] resolves the arrival-order race between producers
//! ("sources") and consumers ("targets") that share a correlation key:
//!
//! ```text
//!  offer(k, p)                    request(k) / listen(k, c)
//!      |                                   |
//!      |  1. store offering[k] = p         |  1. offering[k]? -> invoke it
//!      |  2. snapshot waiting[k]           |  2. register in waiting[k]
//!      |  3. claim + dispatch each waiter  |  3. re-check offering[k]
//!      v                                   v
//! ```
//!
//! Because an offer is stored *before* the waiting side is read, and a
//! waiter registers *before* re-reading the offering side, at least one of
//! the two parties always sees the other.  Claims make sure it is at most
//! one: a one-shot waiter is claimed by atomically taking it out of the
//! registry.  A persistent waiter takes every offer dispatched to it, except
//! the one its own registration-time lookup already delivered.
//!
//! Producer invocations are lazy shared futures; the waiter that receives one
//! drives it.  A persistent listener resolves its queue strictly in order, so
//! consecutive offers reach it in call order even when a later producer
//! finishes first.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::FanOutPolicy;
use crate::connection::{ConnectionId, ConnectionObserver};
use crate::error::{BrokerError, ProducerError, Result};
use crate::key::CorrelationKey;
use crate::registry::CallbackId;
use crate::table::{Offer, PendingOutcome, RendezvousTable, Retention, Waiter};

/// What a producer hands back: its value, or the reason it failed.
pub type Outcome<T> = std::result::Result<T, ProducerError>;

// ---------------------------------------------------------------------------
// Callback traits
// ---------------------------------------------------------------------------

/// The source side of a pairing: computes a result on demand.
///
/// May be invoked many times; every consumer that arrives while the offer
/// stands triggers an invocation.
#[async_trait]
pub trait Producer<T>: Send + Sync {
    async fn produce(&self) -> Outcome<T>;
}

/// The target side of a persistent pairing: receives every result.
#[async_trait]
pub trait Consumer<T>: Send + Sync {
    async fn deliver(&self, outcome: Outcome<T>);
}

/// [`Producer`] backed by an async closure.
pub struct FnProducer<F>(F);

impl<F> FnProducer<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<T, F, Fut> Producer<T> for FnProducer<F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome<T>> + Send + 'static,
{
    async fn produce(&self) -> Outcome<T> {
        (self.0)().await
    }
}

/// [`Consumer`] that forwards every outcome into a channel.
pub struct ChannelConsumer<T> {
    tx: mpsc::UnboundedSender<Outcome<T>>,
}

impl<T> ChannelConsumer<T> {
    /// Create a consumer and the receiver its outcomes arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outcome<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl<T: Send + 'static> Consumer<T> for ChannelConsumer<T> {
    async fn deliver(&self, outcome: Outcome<T>) {
        // A closed receiver means the consumer no longer cares.
        let _ = self.tx.send(outcome);
    }
}

// ---------------------------------------------------------------------------
// Relations
// ---------------------------------------------------------------------------

/// The two pairing relations served by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingRelation {
    /// Typable key -> real target key (or denial).
    KeyTranslation,
    /// Rendezvous key -> new deployment descriptor.
    DeploymentNotification,
}

impl PairingRelation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeyTranslation => "key_translation",
            Self::DeploymentNotification => "deployment_notification",
        }
    }
}

/// Point-in-time counters for one relation.
#[derive(Debug, Clone, Serialize)]
pub struct RelationStats {
    pub relation: PairingRelation,
    /// Keys with a standing offer.
    pub offering: usize,
    /// Parked consumers across all keys.
    pub waiting: usize,
    /// Keys with at least one parked consumer.
    pub waiting_keys: usize,
    /// Registration time of the longest-parked consumer.
    pub oldest_waiting_since: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Race-free pairing of producers and consumers for one relation.
pub struct PairingService<T> {
    relation: PairingRelation,
    fan_out: FanOutPolicy,
    table: RendezvousTable<T>,
}

impl<T> PairingService<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a service for `relation`.
    #[must_use]
    pub fn new(relation: PairingRelation, max_per_connection: usize, fan_out: FanOutPolicy) -> Self {
        Self {
            relation,
            fan_out,
            table: RendezvousTable::new(max_per_connection),
        }
    }

    pub fn relation(&self) -> PairingRelation {
        self.relation
    }

    pub fn table(&self) -> &RendezvousTable<T> {
        &self.table
    }

    /// Publish `producer` under `key`.
    ///
    /// Every consumer currently waiting on `key` is dispatched, and the
    /// producer stays available to consumers arriving later until it is
    /// overwritten or its owner disconnects.  Returns the number of waiting
    /// consumers this offer reached.
    pub fn offer(
        &self,
        key: &CorrelationKey,
        owner: ConnectionId,
        producer: Arc<dyn Producer<T>>,
    ) -> usize {
        let offer = self.table.store_offer(key.as_str(), owner, producer);
        let reached = self.notify_waiting(key.as_str(), &offer);

        tracing::info!(
            relation = self.relation.as_str(),
            key = %key,
            connection = %owner,
            reached,
            "offer stored"
        );
        reached
    }

    /// Obtain exactly one result for `key`.
    ///
    /// Served immediately from a standing offer when there is one; otherwise
    /// parks until the next offer for `key`.  There is no timeout: the wait
    /// ends on delivery or when the future is dropped, which also withdraws
    /// the registration.
    pub async fn request(&self, key: &CorrelationKey, owner: ConnectionId) -> Result<T> {
        if let Some(offer) = self.table.offer_for(key.as_str()) {
            tracing::debug!(
                relation = self.relation.as_str(),
                key = %key,
                connection = %owner,
                "request served from standing offer"
            );
            return Ok(offer.producer.produce().await?);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let waiter = Arc::new(Waiter::new(Retention::Once, tx));
        let id = self.table.waiting().add(key.as_str(), owner, waiter)?;
        let _registration = Registration {
            table: &self.table,
            key: key.as_str(),
            id,
        };

        // An offer may have landed between the first lookup and the
        // registration; whoever takes the waiter out of the registry serves it.
        if let Some(offer) = self.table.offer_for(key.as_str()) {
            if self.table.waiting().take(key.as_str(), id).is_some() {
                return Ok(offer.producer.produce().await?);
            }
        }

        tracing::debug!(
            relation = self.relation.as_str(),
            key = %key,
            connection = %owner,
            "request parked"
        );

        match rx.recv().await {
            Some(pending) => Ok(pending.await?),
            None => Err(BrokerError::Abandoned {
                key: key.to_string(),
            }),
        }
    }

    /// Subscribe `consumer` to every future offer for `key`.
    ///
    /// If an offer already stands, the consumer receives its result right
    /// away.  The registration lives until [`PairingService::unlisten`] or
    /// until `owner` disconnects.
    ///
    /// # Panics
    ///
    /// Spawns the consumer's delivery task, so it panics when called outside
    /// a tokio runtime.
    pub fn listen(
        &self,
        key: &CorrelationKey,
        owner: ConnectionId,
        consumer: Arc<dyn Consumer<T>>,
    ) -> Result<CallbackId> {
        let (tx, rx) = mpsc::unbounded_channel();
        let waiter = Arc::new(Waiter::new(Retention::Persistent, tx));
        let id = self
            .table
            .waiting()
            .add(key.as_str(), owner, Arc::clone(&waiter))?;

        tokio::spawn(deliver_in_order(rx, consumer));

        let standing = self.table.offer_for(key.as_str());
        let claimed = waiter.claim_standing(standing.as_ref().map(|offer| offer.seq));
        let immediate = match standing {
            Some(offer) if claimed => waiter.enqueue(invoke(&offer)),
            _ => false,
        };

        tracing::info!(
            relation = self.relation.as_str(),
            key = %key,
            connection = %owner,
            callback = %id,
            immediate,
            "listener registered"
        );
        Ok(id)
    }

    /// Withdraw a listener.  No-op if it is already gone.
    pub fn unlisten(&self, key: &CorrelationKey, id: CallbackId) -> bool {
        self.table.waiting().remove(key.as_str(), id)
    }

    /// Counters for status reporting.
    pub fn stats(&self) -> RelationStats {
        RelationStats {
            relation: self.relation,
            offering: self.table.offering_count(),
            waiting: self.table.waiting_count(),
            waiting_keys: self.table.waiting_key_count(),
            oldest_waiting_since: self.table.oldest_waiting_since(),
        }
    }

    /// Dispatch `offer` to every waiter currently parked on `key`.
    fn notify_waiting(&self, key: &str, offer: &Offer<T>) -> usize {
        let mut shared: Option<PendingOutcome<T>> = None;
        let mut reached = 0;

        for (id, waiter) in self.table.waiting().get_all(key) {
            let pending = match self.fan_out {
                FanOutPolicy::PerConsumer => invoke(offer),
                FanOutPolicy::Shared => shared.get_or_insert_with(|| invoke(offer)).clone(),
            };
            if self.dispatch(key, id, &waiter, offer, pending) {
                reached += 1;
            }
        }
        reached
    }

    /// Claim `waiter` for `offer` and queue `pending` on it.
    fn dispatch(
        &self,
        key: &str,
        id: CallbackId,
        waiter: &Waiter<T>,
        offer: &Offer<T>,
        pending: PendingOutcome<T>,
    ) -> bool {
        let claimed = match waiter.retention {
            Retention::Once => self.table.waiting().take(key, id).is_some(),
            Retention::Persistent => waiter.claim(offer.seq),
        };
        if !claimed {
            tracing::trace!(relation = self.relation.as_str(), key, callback = %id, "waiter already served");
            return false;
        }

        let queued = waiter.enqueue(pending);
        tracing::debug!(
            relation = self.relation.as_str(),
            key,
            callback = %id,
            offer_seq = offer.seq,
            queued,
            "waiter dispatched"
        );
        queued
    }
}

impl<T> ConnectionObserver for PairingService<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn connection_closed(&self, id: ConnectionId) {
        let waiters = self.table.waiting().remove_all_for_connection(id);
        let offers = self.table.withdraw_offers_of(id);
        if waiters > 0 || offers > 0 {
            tracing::info!(
                relation = self.relation.as_str(),
                connection = %id,
                waiters,
                offers,
                "connection state purged"
            );
        }
    }
}

/// Removes a one-shot registration when the waiting request goes away.
struct Registration<'a, T> {
    table: &'a RendezvousTable<T>,
    key: &'a str,
    id: CallbackId,
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        self.table.waiting().remove(self.key, self.id);
    }
}

fn invoke<T>(offer: &Offer<T>) -> PendingOutcome<T>
where
    T: Clone + Send + Sync + 'static,
{
    let producer = Arc::clone(&offer.producer);
    async move { producer.produce().await }.boxed().shared()
}

async fn deliver_in_order<T>(
    mut rx: mpsc::UnboundedReceiver<PendingOutcome<T>>,
    consumer: Arc<dyn Consumer<T>>,
) where
    T: Clone + Send + Sync + 'static,
{
    while let Some(pending) = rx.recv().await {
        consumer.deliver(pending.await).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
