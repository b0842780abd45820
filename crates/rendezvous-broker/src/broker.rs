//! The broker and its per-connection sessions.
//!
//! [`Broker`] owns one [`PairingService`] per relation plus the
//! [`ConnectionLifecycle`] that purges them on disconnect.  Transports never
//! touch the services directly: they open a [`SourceSession`] or
//! [`TargetSession`] per accepted connection and call the operations on it.
//! Dropping a session closes its connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BrokerConfig;
use crate::connection::{ConnectionGuard, ConnectionId, ConnectionLifecycle, ConnectionObserver};
use crate::error::{BrokerError, Result};
use crate::key::{CorrelationKey, KeyKind};
use crate::pairing::{Consumer, PairingRelation, PairingService, Producer, RelationStats};
use crate::registry::CallbackId;

/// Result of a key translation: the target's real key, or `None` when the
/// source denies the translation.
pub type KeyTranslation = Option<String>;

/// Sent from a source to waiting targets when a new deployment is about to
/// be made.  Opaque to the broker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NewDeploymentMessage(pub serde_json::Value);

/// Snapshot of broker state for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub started_at: DateTime<Utc>,
    pub open_connections: usize,
    pub relations: Vec<RelationStats>,
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Owner of all pairing state.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.  Created once at
/// process start and injected into the transport.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    translations: Arc<PairingService<KeyTranslation>>,
    deployments: Arc<PairingService<NewDeploymentMessage>>,
    lifecycle: ConnectionLifecycle,
    started_at: DateTime<Utc>,
}

impl Broker {
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        let translations = Arc::new(PairingService::new(
            PairingRelation::KeyTranslation,
            config.max_listeners_per_connection,
            config.fan_out,
        ));
        let deployments = Arc::new(PairingService::new(
            PairingRelation::DeploymentNotification,
            config.max_listeners_per_connection,
            config.fan_out,
        ));
        let observers = vec![
            translations.clone() as Arc<dyn ConnectionObserver>,
            deployments.clone() as Arc<dyn ConnectionObserver>,
        ];

        tracing::info!(
            max_listeners_per_connection = config.max_listeners_per_connection,
            fan_out = ?config.fan_out,
            "broker initialized"
        );

        Self {
            inner: Arc::new(BrokerInner {
                config,
                translations,
                deployments,
                lifecycle: ConnectionLifecycle::new(observers),
                started_at: Utc::now(),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Accept a connection from a source (the deploying tool).
    pub fn open_source_session(&self) -> SourceSession {
        let guard = self.inner.lifecycle.open();
        tracing::info!(connection = %guard.id(), "source connected");
        SourceSession {
            broker: self.clone(),
            guard,
            offering_translation: AtomicBool::new(false),
        }
    }

    /// Accept a connection from a target (the auto-puller).
    pub fn open_target_session(&self) -> TargetSession {
        let guard = self.inner.lifecycle.open();
        tracing::info!(connection = %guard.id(), "target connected");
        TargetSession {
            broker: self.clone(),
            guard,
        }
    }

    pub fn translations(&self) -> &PairingService<KeyTranslation> {
        &self.inner.translations
    }

    pub fn deployments(&self) -> &PairingService<NewDeploymentMessage> {
        &self.inner.deployments
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            started_at: self.inner.started_at,
            open_connections: self.inner.lifecycle.open_count(),
            relations: vec![self.inner.translations.stats(), self.inner.deployments.stats()],
        }
    }

    fn key(&self, kind: KeyKind, raw: &str) -> Result<CorrelationKey> {
        CorrelationKey::parse(kind, raw, &self.inner.config)
    }
}

// ---------------------------------------------------------------------------
// Source session
// ---------------------------------------------------------------------------

/// Operations available to a source connection.
#[derive(Debug)]
pub struct SourceSession {
    broker: Broker,
    guard: ConnectionGuard,
    offering_translation: AtomicBool,
}

impl SourceSession {
    pub fn id(&self) -> ConnectionId {
        self.guard.id()
    }

    /// Offer to translate `typable_key` for targets that ask for it.
    ///
    /// Allowed once per session, whatever the key, to make brute-forcing the
    /// short key space with many listeners expensive.
    pub fn offer_typing_friendly_key_translation(
        &self,
        typable_key: &str,
        producer: Arc<dyn Producer<KeyTranslation>>,
    ) -> Result<()> {
        let key = self.broker.key(KeyKind::Typable, typable_key)?;

        if self
            .offering_translation
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!(connection = %self.id(), "second key translation offer rejected");
            return Err(BrokerError::AlreadyOffering {
                connection: self.id(),
            });
        }

        self.broker.translations().offer(&key, self.id(), producer);
        Ok(())
    }

    /// Announce a new deployment for `rendezvous_key`.  Re-callable.
    pub fn offer_new_deployment(
        &self,
        rendezvous_key: &str,
        producer: Arc<dyn Producer<NewDeploymentMessage>>,
    ) -> Result<()> {
        let key = self.broker.key(KeyKind::Rendezvous, rendezvous_key)?;
        self.broker.deployments().offer(&key, self.id(), producer);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Target session
// ---------------------------------------------------------------------------

/// Operations available to a target connection.
#[derive(Debug)]
pub struct TargetSession {
    broker: Broker,
    guard: ConnectionGuard,
}

impl TargetSession {
    pub fn id(&self) -> ConnectionId {
        self.guard.id()
    }

    /// Resolve `typable_key` to the target's real key.
    ///
    /// Waits for a source if none is offering yet.  `Ok(None)` means the
    /// source denied the translation.
    pub async fn typing_friendly_key_to_target_hex_key(
        &self,
        typable_key: &str,
    ) -> Result<KeyTranslation> {
        let key = self.broker.key(KeyKind::Typable, typable_key)?;
        self.broker.translations().request(&key, self.id()).await
    }

    /// Get notified of every deployment announced for `rendezvous_key`.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen_for_new_deployments(
        &self,
        rendezvous_key: &str,
        consumer: Arc<dyn Consumer<NewDeploymentMessage>>,
    ) -> Result<CallbackId> {
        let key = self.broker.key(KeyKind::Rendezvous, rendezvous_key)?;
        self.broker.deployments().listen(&key, self.id(), consumer)
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.inner.config)
            .field("started_at", &self.inner.started_at)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ProducerError;
    use crate::pairing::{ChannelConsumer, FnProducer};

    fn hex_key(value: &'static str) -> Arc<dyn Producer<KeyTranslation>> {
        Arc::new(FnProducer::new(move || async move {
            Ok::<_, ProducerError>(Some(value.to_owned()))
        }))
    }

    fn deployment(version: u32) -> Arc<dyn Producer<NewDeploymentMessage>> {
        Arc::new(FnProducer::new(move || async move {
            Ok::<_, ProducerError>(NewDeploymentMessage(json!({ "version": version })))
        }))
    }

    #[tokio::test]
    async fn second_translation_offer_is_rejected() {
        let broker = Broker::new(BrokerConfig::default());
        let source = broker.open_source_session();

        source
            .offer_typing_friendly_key_translation("abc", hex_key("deadbeef"))
            .unwrap();
        let err = source
            .offer_typing_friendly_key_translation("other", hex_key("cafe"))
            .unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyOffering { .. }));

        // A fresh session may offer again.
        broker
            .open_source_session()
            .offer_typing_friendly_key_translation("xyz", hex_key("cafe"))
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_key_does_not_consume_the_guard() {
        let broker = Broker::new(BrokerConfig::default());
        let source = broker.open_source_session();

        let err = source
            .offer_typing_friendly_key_translation("much-too-long", hex_key("x"))
            .unwrap_err();
        assert!(matches!(err, BrokerError::MalformedKey { max: 10, .. }));

        source
            .offer_typing_friendly_key_translation("ok", hex_key("x"))
            .unwrap();
    }

    #[tokio::test]
    async fn denial_is_a_value_not_an_error() {
        let broker = Broker::new(BrokerConfig::default());
        let source = broker.open_source_session();
        let deny: Arc<dyn Producer<KeyTranslation>> =
            Arc::new(FnProducer::new(|| async { Ok::<_, ProducerError>(None) }));
        source.offer_typing_friendly_key_translation("abc", deny).unwrap();

        let target = broker.open_target_session();
        let got = target.typing_friendly_key_to_target_hex_key("abc").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn closing_the_source_withdraws_its_offer() {
        let broker = Broker::new(BrokerConfig::default());
        let source = broker.open_source_session();
        source.offer_new_deployment("rk1", deployment(1)).unwrap();
        assert_eq!(broker.deployments().stats().offering, 1);

        drop(source);
        assert_eq!(broker.deployments().stats().offering, 0);
        assert_eq!(broker.stats().open_connections, 0);
    }

    #[tokio::test]
    async fn closing_the_target_purges_its_listener() {
        let broker = Broker::new(BrokerConfig::default());
        let target = broker.open_target_session();
        let (consumer, _rx) = ChannelConsumer::channel();
        target
            .listen_for_new_deployments("rk1", Arc::new(consumer))
            .unwrap();
        assert_eq!(broker.deployments().stats().waiting, 1);

        drop(target);
        assert_eq!(broker.deployments().stats().waiting, 0);

        let source = broker.open_source_session();
        source.offer_new_deployment("rk1", deployment(1)).unwrap();
    }

    #[tokio::test]
    async fn stats_cover_both_relations() {
        let broker = Broker::new(BrokerConfig::default());
        let _source = broker.open_source_session();
        let stats = broker.stats();
        assert_eq!(stats.open_connections, 1);
        assert_eq!(stats.relations.len(), 2);
        assert_eq!(stats.relations[0].relation, PairingRelation::KeyTranslation);
        assert_eq!(stats.relations[1].relation, PairingRelation::DeploymentNotification);
    }
}
