//! Broker error types.
//!
//! Every public broker operation surfaces failures through [`BrokerError`].
//! Producer-side failures are carried separately as [`ProducerError`] because
//! they travel *through* the broker to a waiting consumer rather than being
//! raised by the broker itself.

use crate::connection::ConnectionId;

/// Unified error type for the rendezvous broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    // -- Validation errors --------------------------------------------------
    /// The correlation key is longer than its kind permits.
    #[error("malformed key: {len} characters exceeds the maximum of {max}")]
    MalformedKey {
        /// Length of the rejected key, in characters.
        len: usize,
        /// Maximum length allowed for this key kind.
        max: usize,
    },

    // -- Guard errors -------------------------------------------------------
    /// The source session already offered a key translation.
    #[error("connection {connection} is already offering a key translation")]
    AlreadyOffering { connection: ConnectionId },

    /// The connection already holds the maximum number of waiting callbacks
    /// for this key.
    #[error("connection {connection} exceeded {max} waiting callback(s) for key `{key}`")]
    CapacityExceeded {
        connection: ConnectionId,
        key: String,
        max: usize,
    },

    // -- Delivery errors ----------------------------------------------------
    /// The producer that served this request failed.
    #[error(transparent)]
    Producer(#[from] ProducerError),

    /// The waiting registration was purged before any producer arrived.
    ///
    /// Only observable by callers that keep polling after their connection
    /// closed; the transport normally drops such calls instead.
    #[error("waiting request for key `{key}` was abandoned")]
    Abandoned { key: String },
}

/// Failure reported by a producer while computing a result.
///
/// Cloneable so that one failed invocation can be fanned out to every
/// consumer that shared it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("producer failed: {reason}")]
pub struct ProducerError {
    pub reason: String,
}

impl ProducerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the broker crate.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_error_is_transparent() {
        let err = BrokerError::from(ProducerError::new("source went away"));
        assert_eq!(err.to_string(), "producer failed: source went away");
    }

    #[test]
    fn malformed_key_message() {
        let err = BrokerError::MalformedKey { len: 11, max: 10 };
        assert_eq!(
            err.to_string(),
            "malformed key: 11 characters exceeds the maximum of 10"
        );
    }
}
