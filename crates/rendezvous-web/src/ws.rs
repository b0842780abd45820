//! WebSocket handlers for sources and targets.
//!
//! Each accepted socket opens one broker session.  Frames are read in a loop
//! and dispatched to the session; replies and broker-initiated frames
//! (`produce`, `callback`) share one outbound queue drained by a writer task.
//!
//! On close, in-flight calls are aborted before the session is dropped, so a
//! call can never register after its connection has been purged.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use rendezvous_broker::{BrokerError, ConnectionId, ProducerError, SourceSession, TargetSession};

use crate::protocol::{ClientMessage, ErrorKind, ServerMessage};
use crate::remote::{Invocations, Outbound, RemoteConsumer, RemoteProducer};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Upgrade handler for `/sourceAPI`.
pub async fn source_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_source(socket, state))
}

/// Upgrade handler for `/targetAPI`.
pub async fn target_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_target(socket, state))
}

// ---------------------------------------------------------------------------
// Source connections
// ---------------------------------------------------------------------------

async fn handle_source(socket: WebSocket, state: Arc<AppState>) {
    let session = state.broker.open_source_session();
    let connection = session.id();
    let (sink, mut stream) = socket.split();
    let (outbound, writer) = spawn_writer(sink, connection);
    let invocations = Arc::new(Invocations::default());

    while let Some(frame) = next_frame(&mut stream, connection).await {
        match frame {
            Ok(msg) => handle_source_message(&session, &outbound, &invocations, msg),
            Err(message) => reject(&outbound, None, ErrorKind::BadRequest, message),
        }
    }

    // Withdraw offers first so no new invocation targets this socket.
    drop(session);
    writer.abort();
    let failed = invocations.fail_all();
    tracing::info!(connection = %connection, failed_invocations = failed, "source socket closed");
}

fn handle_source_message(
    session: &SourceSession,
    outbound: &Outbound,
    invocations: &Arc<Invocations>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::OfferTypingFriendlyKeyTranslation { call_id, key } => {
            let producer = RemoteProducer::new(call_id, outbound.clone(), invocations.clone());
            let result = session.offer_typing_friendly_key_translation(&key, Arc::new(producer));
            acknowledge(outbound, call_id, result);
        }
        ClientMessage::OfferNewDeployment { call_id, key } => {
            let producer = RemoteProducer::new(call_id, outbound.clone(), invocations.clone());
            let result = session.offer_new_deployment(&key, Arc::new(producer));
            acknowledge(outbound, call_id, result);
        }
        ClientMessage::Produced {
            invocation_id,
            value,
        } => {
            if !invocations.resolve(invocation_id, Ok(value)) {
                tracing::debug!(connection = %session.id(), invocation_id, "answer for unknown invocation");
            }
        }
        ClientMessage::ProduceFailed {
            invocation_id,
            message,
        } => {
            if !invocations.resolve(invocation_id, Err(ProducerError::new(message))) {
                tracing::debug!(connection = %session.id(), invocation_id, "failure for unknown invocation");
            }
        }
        other => unsupported(outbound, &other, "source"),
    }
}

// ---------------------------------------------------------------------------
// Target connections
// ---------------------------------------------------------------------------

async fn handle_target(socket: WebSocket, state: Arc<AppState>) {
    let session = Arc::new(state.broker.open_target_session());
    let connection = session.id();
    let (sink, mut stream) = socket.split();
    let (outbound, writer) = spawn_writer(sink, connection);
    let mut calls = JoinSet::new();

    while let Some(frame) = next_frame(&mut stream, connection).await {
        while calls.try_join_next().is_some() {}

        match frame {
            Ok(msg) => handle_target_message(&session, &outbound, &mut calls, msg),
            Err(message) => reject(&outbound, None, ErrorKind::BadRequest, message),
        }
    }

    let aborted = calls.len();
    calls.shutdown().await;
    drop(session);
    writer.abort();
    tracing::info!(connection = %connection, aborted_calls = aborted, "target socket closed");
}

fn handle_target_message(
    session: &Arc<TargetSession>,
    outbound: &Outbound,
    calls: &mut JoinSet<()>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::TypingFriendlyKeyToTargetHexKey { call_id, key } => {
            let session = Arc::clone(session);
            let outbound = outbound.clone();
            calls.spawn(async move {
                let frame = match session.typing_friendly_key_to_target_hex_key(&key).await {
                    Ok(translation) => ServerMessage::Result {
                        call_id,
                        value: Value::from(translation),
                    },
                    // The connection is being torn down; nobody to answer.
                    Err(BrokerError::Abandoned { .. }) => return,
                    Err(e) => ServerMessage::broker_error(call_id, &e),
                };
                let _ = outbound.send(frame);
            });
        }
        ClientMessage::ListenForNewDeployments { call_id, key } => {
            let consumer = RemoteConsumer::new(call_id, outbound.clone());
            let result = session
                .listen_for_new_deployments(&key, Arc::new(consumer))
                .map(|_| ());
            acknowledge(outbound, call_id, result);
        }
        other => unsupported(outbound, &other, "target"),
    }
}

// ---------------------------------------------------------------------------
// Socket plumbing
// ---------------------------------------------------------------------------

/// Read the next protocol frame.
///
/// Returns `None` once the socket is closed; `Some(Err(_))` carries a
/// description of a frame that could not be parsed.
async fn next_frame(
    stream: &mut SplitStream<WebSocket>,
    connection: ConnectionId,
) -> Option<Result<ClientMessage, String>> {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Binary(data)) => {
                tracing::warn!(connection = %connection, len = data.len(), "binary frame rejected");
                return Some(Err("binary frames are not supported".into()));
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return None,
            Err(e) => {
                tracing::debug!(connection = %connection, error = %e, "websocket error");
                return None;
            }
        };

        return Some(serde_json::from_str(text.as_str()).map_err(|e| {
            tracing::warn!(connection = %connection, error = %e, "invalid frame");
            format!("invalid message: {e}")
        }));
    }
    None
}

fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    connection: ConnectionId,
) -> (Outbound, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(connection = %connection, error = %e, "unserializable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });
    (tx, handle)
}

fn acknowledge(outbound: &Outbound, call_id: u64, result: rendezvous_broker::Result<()>) {
    let frame = match result {
        Ok(()) => ServerMessage::Ack { call_id },
        Err(e) => {
            tracing::debug!(call_id, error = %e, "call rejected");
            ServerMessage::broker_error(call_id, &e)
        }
    };
    let _ = outbound.send(frame);
}

fn reject(outbound: &Outbound, call_id: Option<u64>, kind: ErrorKind, message: String) {
    let _ = outbound.send(ServerMessage::error(call_id, kind, message));
}

fn unsupported(outbound: &Outbound, msg: &ClientMessage, endpoint: &str) {
    tracing::warn!(?msg, endpoint, "operation not available on this endpoint");
    reject(
        outbound,
        msg.call_id(),
        ErrorKind::Unsupported,
        format!("not available on the {endpoint} endpoint"),
    );
}
