//! Rendezvous broker kernel.
//!
//! This crate pairs two classes of long-lived client connections -- sources
//! that can produce a result on demand and targets that wait for one -- by an
//! opaque correlation key, regardless of which side arrives first:
//!
//! - **[`registry`]** -- Concurrent keyed callback registry with a
//!   per-connection cap, backed by [`dashmap::DashMap`].
//! - **[`table`]** -- The offering/waiting pair of maps for one relation.
//! - **[`pairing`]** -- The race-free offer / request / listen algorithm and
//!   the [`Producer`] / [`Consumer`] callback traits.
//! - **[`connection`]** -- Connection identity and close notifications that
//!   purge a connection's registrations.
//! - **[`broker`]** -- The [`Broker`] owning both relations (key translation
//!   and deployment notification) and the per-connection sessions.
//! - **[`key`]** / **[`config`]** / **[`error`]** -- Key validation,
//!   limits and policies, and error types via [`thiserror`].
//!
//! The broker is transport-agnostic; all public types are `Send + Sync` and
//! designed for use within a multi-threaded tokio runtime.

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod key;
pub mod pairing;
pub mod registry;
pub mod table;

// Re-export the most commonly used types at the crate root for convenience.
pub use broker::{
    Broker, BrokerStats, KeyTranslation, NewDeploymentMessage, SourceSession, TargetSession,
};
pub use config::{BrokerConfig, FanOutPolicy};
pub use connection::{ConnectionGuard, ConnectionId, ConnectionLifecycle, ConnectionObserver};
pub use error::{BrokerError, ProducerError, Result};
pub use key::{CorrelationKey, KeyKind};
pub use pairing::{
    ChannelConsumer, Consumer, FnProducer, Outcome, PairingRelation, PairingService, Producer,
    RelationStats,
};
pub use registry::{CallbackId, CallbackRegistry};
pub use table::{Offer, RendezvousTable};
