//! Broker callbacks that live on the other end of a WebSocket.
//!
//! A source's producer is a [`RemoteProducer`]: invoking it sends a
//! `produce` frame and waits for the matching `produced` answer.  A target's
//! listener is a [`RemoteConsumer`]: delivering to it sends a `callback`
//! frame.  Both only hold the connection's outbound queue, so they never keep
//! a socket alive on their own.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use rendezvous_broker::{Consumer, Outcome, Producer, ProducerError};

use crate::protocol::ServerMessage;

/// Outbound frame queue of one connection.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

type Answer = std::result::Result<Value, ProducerError>;

// ---------------------------------------------------------------------------
// Invocation table
// ---------------------------------------------------------------------------

/// Producer invocations awaiting an answer from one source connection.
#[derive(Default)]
pub struct Invocations {
    pending: DashMap<u64, oneshot::Sender<Answer>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Invocations {
    /// Register a new invocation; `None` once the source is gone.
    fn begin(&self) -> Option<(InvocationGuard<'_>, oneshot::Receiver<Answer>)> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let guard = InvocationGuard {
            invocations: self,
            id,
        };

        // `fail_all` may have swept the table between the check and the
        // insert; the guard removes the entry again.
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some((guard, rx))
    }

    fn cancel(&self, id: u64) {
        self.pending.remove(&id);
    }

    /// Route a source's answer to the waiting invocation.
    ///
    /// Returns `false` for unknown or already answered invocations.
    pub fn resolve(&self, invocation_id: u64, answer: Answer) -> bool {
        match self.pending.remove(&invocation_id) {
            Some((_, tx)) => tx.send(answer).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding invocation and refuse new ones; used when the
    /// source disconnects.
    pub fn fail_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if self.resolve(id, Err(ProducerError::new("source disconnected"))) {
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Withdraws an invocation when its caller stops waiting for the answer.
struct InvocationGuard<'a> {
    invocations: &'a Invocations,
    id: u64,
}

impl Drop for InvocationGuard<'_> {
    fn drop(&mut self) {
        self.invocations.cancel(self.id);
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Producer implemented by a connected source client.
pub struct RemoteProducer<T> {
    call_id: u64,
    outbound: Outbound,
    invocations: Arc<Invocations>,
    _result: PhantomData<fn() -> T>,
}

impl<T> RemoteProducer<T> {
    pub fn new(call_id: u64, outbound: Outbound, invocations: Arc<Invocations>) -> Self {
        Self {
            call_id,
            outbound,
            invocations,
            _result: PhantomData,
        }
    }
}

#[async_trait]
impl<T> Producer<T> for RemoteProducer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn produce(&self) -> Outcome<T> {
        let Some((invocation, answer)) = self.invocations.begin() else {
            return Err(ProducerError::new("source disconnected"));
        };
        let invocation_id = invocation.id;
        let frame = ServerMessage::Produce {
            call_id: self.call_id,
            invocation_id,
        };
        if self.outbound.send(frame).is_err() {
            return Err(ProducerError::new("source disconnected"));
        }

        tracing::debug!(call_id = self.call_id, invocation_id, "producer invoked remotely");

        let value = answer
            .await
            .map_err(|_| ProducerError::new("source disconnected"))??;

        serde_json::from_value(value)
            .map_err(|e| ProducerError::new(format!("malformed producer result: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Consumer implemented by a connected target client.
pub struct RemoteConsumer<T> {
    call_id: u64,
    outbound: Outbound,
    _result: PhantomData<fn(T)>,
}

impl<T> RemoteConsumer<T> {
    pub fn new(call_id: u64, outbound: Outbound) -> Self {
        Self {
            call_id,
            outbound,
            _result: PhantomData,
        }
    }
}

#[async_trait]
impl<T> Consumer<T> for RemoteConsumer<T>
where
    T: Serialize + Send + 'static,
{
    async fn deliver(&self, outcome: Outcome<T>) {
        let call_id = self.call_id;
        let frame = match outcome.map(|v| serde_json::to_value(&v)) {
            Ok(Ok(value)) => ServerMessage::Callback { call_id, value },
            Ok(Err(e)) => ServerMessage::CallbackFailed {
                call_id,
                message: format!("unserializable result: {e}"),
            },
            Err(e) => ServerMessage::CallbackFailed {
                call_id,
                message: e.reason,
            },
        };
        if self.outbound.send(frame).is_err() {
            tracing::trace!(call_id, "delivery dropped: target connection gone");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn remote_producer_round_trip() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let invocations = Arc::new(Invocations::default());
        let producer = RemoteProducer::<Option<String>>::new(5, tx, invocations.clone());

        let call = tokio::spawn(async move { producer.produce().await });

        let frame = rx.recv().await.unwrap();
        let ServerMessage::Produce {
            call_id,
            invocation_id,
        } = frame
        else {
            panic!("expected produce frame, got {frame:?}");
        };
        assert_eq!(call_id, 5);

        assert!(invocations.resolve(invocation_id, Ok(json!("deadbeef"))));
        assert_eq!(call.await.unwrap().unwrap().as_deref(), Some("deadbeef"));
        assert!(invocations.is_empty());
    }

    #[tokio::test]
    async fn remote_producer_fails_when_source_leaves() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let invocations = Arc::new(Invocations::default());
        let producer = RemoteProducer::<Option<String>>::new(1, tx, invocations.clone());

        let call = tokio::spawn(async move { producer.produce().await });
        rx.recv().await.unwrap();

        assert_eq!(invocations.fail_all(), 1);
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.reason, "source disconnected");
    }

    #[tokio::test]
    async fn remote_producer_rejects_wrong_shape() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let invocations = Arc::new(Invocations::default());
        let producer = RemoteProducer::<Option<String>>::new(1, tx, invocations.clone());

        let call = tokio::spawn(async move { producer.produce().await });
        let Some(ServerMessage::Produce { invocation_id, .. }) = rx.recv().await else {
            panic!("expected produce frame");
        };
        invocations.resolve(invocation_id, Ok(json!(42)));

        let err = call.await.unwrap().unwrap_err();
        assert!(err.reason.starts_with("malformed producer result"));
    }

    #[tokio::test]
    async fn remote_producer_with_closed_outbound() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let invocations = Arc::new(Invocations::default());
        let producer = RemoteProducer::<Option<String>>::new(1, tx, invocations.clone());

        assert!(producer.produce().await.is_err());
        assert!(invocations.is_empty());
    }

    #[tokio::test]
    async fn remote_consumer_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = RemoteConsumer::<Option<String>>::new(8, tx);

        consumer.deliver(Ok(Some("cafe".into()))).await;
        consumer.deliver(Err(ProducerError::new("denied"))).await;

        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::Callback {
                call_id: 8,
                value: json!("cafe")
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::CallbackFailed {
                call_id: 8,
                message: "denied".into()
            }
        );
    }

    #[tokio::test]
    async fn abandoned_invocation_is_withdrawn() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let invocations = Arc::new(Invocations::default());
        let producer = RemoteProducer::<Option<String>>::new(1, tx, invocations.clone());

        let call = tokio::spawn(async move { producer.produce().await });
        let Some(ServerMessage::Produce { invocation_id, .. }) = rx.recv().await else {
            panic!("expected produce frame");
        };
        assert_eq!(invocations.len(), 1);

        // The requesting target went away before the source answered.
        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        assert!(invocations.is_empty());
        assert!(!invocations.resolve(invocation_id, Ok(json!("late"))));
    }

    #[tokio::test]
    async fn closed_invocations_refuse_new_calls() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let invocations = Arc::new(Invocations::default());
        let producer = RemoteProducer::<Option<String>>::new(1, tx, invocations.clone());

        assert_eq!(invocations.fail_all(), 0);
        assert!(invocations.is_closed());

        let err = producer.produce().await.unwrap_err();
        assert_eq!(err.reason, "source disconnected");
        assert!(invocations.is_empty());
        // Nothing was asked of the source.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn resolve_unknown_invocation() {
        let invocations = Invocations::default();
        assert!(!invocations.resolve(99, Ok(Value::Null)));
    }
}
