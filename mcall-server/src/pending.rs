use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use mcall::{Frame, MethodCallError};

use crate::{ConnectionId, PendingValue};

/// Per-connection registry of pending tickets.
///
/// Each registered pending value gets a watcher task that emits the
/// `_result_available` frame once the value resolves. Dropping the
/// registry aborts the watchers, abandoning every outstanding ticket
/// without emitting further frames.
#[derive(Debug)]
pub(crate) struct PendingRegistry {
    id: ConnectionId,
    out: UnboundedSender<Bytes>,
    next_ticket: u64,
    watchers: Vec<JoinHandle<()>>,
}

impl PendingRegistry {
    pub fn new(id: ConnectionId, out: UnboundedSender<Bytes>) -> Self {
        Self {
            id,
            out,
            next_ticket: 0,
            watchers: Vec::new(),
        }
    }

    /// Allocates a ticket for `pending` and spawns its watcher.
    pub fn register(&mut self, pending: PendingValue) -> String {
        self.next_ticket += 1;
        let ticket = format!("pending-{}", self.next_ticket);

        self.watchers.retain(|watcher| !watcher.is_finished());

        let id = self.id;
        let out = self.out.clone();
        let watcher_ticket = ticket.clone();
        self.watchers.push(tokio::spawn(async move {
            let outcome = match pending.outcome.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(description)) => Err(MethodCallError::method_failed(description)),
                Err(_) => Err(MethodCallError::method_failed("pending result abandoned")),
            };

            trace!(?id, ticket = %watcher_ticket, ok = outcome.is_ok(), "resolving pending ticket");

            let frame = Frame::ResultAvailable {
                ticket: watcher_ticket.clone(),
                outcome,
            };
            let bytes = match frame.to_bytes() {
                Ok(bytes) => bytes,
                Err(err) => {
                    let error = MethodCallError::unserializable_result(err.to_string());
                    match (Frame::ResultAvailable {
                        ticket: watcher_ticket,
                        outcome: Err(error),
                    })
                    .to_bytes()
                    {
                        Ok(bytes) => bytes,
                        Err(_) => return,
                    }
                }
            };

            let _ = out.send(bytes);
        }));

        ticket
    }
}

impl Drop for PendingRegistry {
    fn drop(&mut self) {
        for watcher in &self.watchers {
            watcher.abort();
        }
        if !self.watchers.is_empty() {
            debug!(id = ?self.id, outstanding = self.watchers.len(), "abandoning pending tickets");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::BytesMut;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio_util::codec::Decoder;

    use mcall::{ErrorCode, MethodCallCodec, Value};

    async fn next_frame(frames: &mut UnboundedReceiver<Bytes>) -> Frame {
        let bytes = frames.recv().await.expect("a frame should have been sent");
        let mut buffer = BytesMut::from(&bytes[..]);
        MethodCallCodec::new()
            .decode(&mut buffer)
            .unwrap()
            .expect("a complete frame")
    }

    #[tokio::test]
    async fn resolution_emits_a_result_available_frame() {
        let (out, mut frames) = unbounded_channel();
        let mut registry = PendingRegistry::new(ConnectionId(0), out);

        let (pending, resolver) = PendingValue::new();
        let ticket = registry.register(pending);
        assert_eq!(ticket, "pending-1");

        resolver.resolve(Value::Str("Cool!".into()));

        assert_eq!(
            next_frame(&mut frames).await,
            Frame::ResultAvailable {
                ticket,
                outcome: Ok(Value::Str("Cool!".into())),
            }
        );
    }

    #[tokio::test]
    async fn failure_emits_an_error_frame() {
        let (out, mut frames) = unbounded_channel();
        let mut registry = PendingRegistry::new(ConnectionId(0), out);

        let (pending, resolver) = PendingValue::new();
        let ticket = registry.register(pending);

        resolver.fail("bad");

        match next_frame(&mut frames).await {
            Frame::ResultAvailable {
                ticket: resolved,
                outcome: Err(error),
            } => {
                assert_eq!(resolved, ticket);
                assert_eq!(error.code(), ErrorCode::MethodFailed);
                assert_eq!(error.to_string(), "bad");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_resolver_counts_as_failure() {
        let (out, mut frames) = unbounded_channel();
        let mut registry = PendingRegistry::new(ConnectionId(0), out);

        let (pending, resolver) = PendingValue::new();
        let ticket = registry.register(pending);
        drop(resolver);

        match next_frame(&mut frames).await {
            Frame::ResultAvailable {
                ticket: resolved,
                outcome: Err(error),
            } => {
                assert_eq!(resolved, ticket);
                assert_eq!(error.code(), ErrorCode::MethodFailed);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tickets_are_unique_per_connection() {
        let (out, _frames) = unbounded_channel();
        let mut registry = PendingRegistry::new(ConnectionId(0), out);

        let (first, _keep_first) = PendingValue::new();
        let (second, _keep_second) = PendingValue::new();

        let first = registry.register(first);
        let second = registry.register(second);
        assert_ne!(first, second);
    }
}
