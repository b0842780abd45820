//! Broker configuration.
//!
//! [`BrokerConfig`] holds the anti-abuse limits and the delivery policy
//! shared by both pairing relations.  Defaults match the deployed service;
//! the builder-style `with_*` methods allow callers to tweak single fields.

use serde::{Deserialize, Serialize};

/// How many times a producer is invoked when one offer reaches several
/// waiting consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutPolicy {
    /// Invoke the producer once for every consumer the offer reaches.
    ///
    /// Every consumer gets a fresh result, which suits producers that mint
    /// per-consumer values.
    #[default]
    PerConsumer,
    /// Invoke the producer once per offer and hand a clone of the single
    /// result to every consumer the offer reaches.
    ///
    /// Use this when the producer is not idempotent (e.g. it issues a
    /// one-time token).
    Shared,
}

/// Limits and policies for the rendezvous broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Maximum waiting callbacks one connection may hold per key.
    ///
    /// Default: **1**.
    pub max_listeners_per_connection: usize,

    /// Maximum length of a human-typable key, in characters.
    ///
    /// Default: **10**.
    pub typable_key_max_len: usize,

    /// Maximum length of a rendezvous key, in characters.
    ///
    /// Default: **64**.
    pub rendezvous_key_max_len: usize,

    /// Producer invocation policy for offers reaching several consumers.
    ///
    /// Default: [`FanOutPolicy::PerConsumer`].
    pub fan_out: FanOutPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_listeners_per_connection: 1,
            typable_key_max_len: 10,
            rendezvous_key_max_len: 64,
            fan_out: FanOutPolicy::PerConsumer,
        }
    }
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_listeners_per_connection(mut self, max: usize) -> Self {
        self.max_listeners_per_connection = max;
        self
    }

    pub fn with_typable_key_max_len(mut self, max: usize) -> Self {
        self.typable_key_max_len = max;
        self
    }

    pub fn with_rendezvous_key_max_len(mut self, max: usize) -> Self {
        self.rendezvous_key_max_len = max;
        self
    }

    pub fn with_fan_out(mut self, policy: FanOutPolicy) -> Self {
        self.fan_out = policy;
        self
    }
}
