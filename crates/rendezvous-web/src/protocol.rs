//! WebSocket wire protocol.
//!
//! Every frame is a JSON object tagged by `type`.  Clients number their calls
//! with `call_id`; the server echoes it in the matching `ack`, `result` or
//! `error`, and in every later `produce` / `callback` that belongs to the
//! same call.
//!
//! ```text
//! source                     server                      target
//!   | offer_new_deployment{1}  |                            |
//!   |------------------------->|  listen_for_new_deployments{7}
//!   |<------------ ack{1} -----|<---------------------------|
//!   |<-- produce{1, inv 3} ----|                            |
//!   |-- produced{inv 3, v} --->|------- callback{7, v} ---->|
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use rendezvous_broker::BrokerError;

/// Frame sent by a source or target client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // -- Source calls -------------------------------------------------------
    OfferTypingFriendlyKeyTranslation { call_id: u64, key: String },
    OfferNewDeployment { call_id: u64, key: String },

    /// Answer to a `produce` request.
    Produced { invocation_id: u64, value: Value },
    /// The source could not compute a result.
    ProduceFailed { invocation_id: u64, message: String },

    // -- Target calls -------------------------------------------------------
    TypingFriendlyKeyToTargetHexKey { call_id: u64, key: String },
    ListenForNewDeployments { call_id: u64, key: String },
}

/// Frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The call was accepted.
    Ack { call_id: u64 },
    /// Single-shot result of a call.
    Result { call_id: u64, value: Value },
    /// The call failed.  `call_id` is absent when the frame itself could not
    /// be parsed.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<u64>,
        kind: ErrorKind,
        message: String,
    },
    /// Asks a source to run the producer it offered with call `call_id`.
    Produce { call_id: u64, invocation_id: u64 },
    /// Delivers a result to a target listening with call `call_id`.
    Callback { call_id: u64, value: Value },
    /// The producer serving a listening target failed.
    CallbackFailed { call_id: u64, message: String },
}

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AlreadyOffering,
    CapacityExceeded,
    MalformedKey,
    ProducerFailed,
    Abandoned,
    /// The call is not available on this endpoint.
    Unsupported,
    /// The frame was not valid protocol JSON.
    BadRequest,
}

impl From<&BrokerError> for ErrorKind {
    fn from(err: &BrokerError) -> Self {
        match err {
            BrokerError::MalformedKey { .. } => Self::MalformedKey,
            BrokerError::AlreadyOffering { .. } => Self::AlreadyOffering,
            BrokerError::CapacityExceeded { .. } => Self::CapacityExceeded,
            BrokerError::Producer(_) => Self::ProducerFailed,
            BrokerError::Abandoned { .. } => Self::Abandoned,
        }
    }
}

impl ServerMessage {
    /// Error frame for a failed broker call.
    pub fn broker_error(call_id: u64, err: &BrokerError) -> Self {
        Self::Error {
            call_id: Some(call_id),
            kind: err.into(),
            message: err.to_string(),
        }
    }

    pub fn error(call_id: Option<u64>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            call_id,
            kind,
            message: message.into(),
        }
    }
}

impl ClientMessage {
    /// The `call_id` of a call frame; `None` for producer answers.
    pub fn call_id(&self) -> Option<u64> {
        match self {
            Self::OfferTypingFriendlyKeyTranslation { call_id, .. }
            | Self::OfferNewDeployment { call_id, .. }
            | Self::TypingFriendlyKeyToTargetHexKey { call_id, .. }
            | Self::ListenForNewDeployments { call_id, .. } => Some(*call_id),
            Self::Produced { .. } | Self::ProduceFailed { .. } => None,
        }
    }
}
