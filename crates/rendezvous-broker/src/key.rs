//! Correlation keys.
//!
//! A key is an opaque string; the only thing the broker checks is its length,
//! which depends on the kind of key.  Validation happens at the session
//! surface so that nothing oversized ever reaches the tables.

use std::borrow::Borrow;
use std::fmt;

use serde::Serialize;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};

/// Which length limit applies to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Short key a human types on the target machine.
    Typable,
    /// Key derived from the target's public key.
    Rendezvous,
}

impl KeyKind {
    /// Maximum length, in characters, under the given config.
    pub fn max_len(self, config: &BrokerConfig) -> usize {
        match self {
            Self::Typable => config.typable_key_max_len,
            Self::Rendezvous => config.rendezvous_key_max_len,
        }
    }
}

/// A validated correlation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    /// Validate `raw` against the limit for `kind`.
    pub fn parse(kind: KeyKind, raw: impl Into<String>, config: &BrokerConfig) -> Result<Self> {
        let raw = raw.into();
        let len = raw.chars().count();
        let max = kind.max_len(config);
        if len > max {
            return Err(BrokerError::MalformedKey { len, max });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CorrelationKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CorrelationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
