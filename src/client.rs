use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};

use crate::frame::{Frame, MethodCallCodec, Reply};
use crate::value::Value;
use crate::{MethodCallError, DEFAULT_PENDING_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT};

/// Per-protocol timeout configuration.
#[derive(Clone, Debug)]
pub struct ProtocolConfig {
    /// Maximum wait for the `_answer` to a request.
    pub response_timeout: Duration,
    /// Maximum wait for a `_result_available` frame once a pending ticket
    /// has been observed.
    pub pending_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        }
    }
}

#[derive(Debug)]
enum CallEvent {
    Answer(Result<Value, MethodCallError>),
    Pending,
}

type CallSink = mpsc::UnboundedSender<CallEvent>;

#[derive(Debug)]
struct ClientState {
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    next_seq: u32,
    in_flight: HashMap<u32, CallSink>,
    tickets: HashMap<String, u32>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ClientState>,
    config: ProtocolConfig,
    connected: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Client side of one live connection.
///
/// Outbound requests get a per-connection sequence number; inbound
/// `_answer` frames are matched back to the in-flight call by that
/// number, and `_result_available` frames by their pending ticket.
/// Cloning shares the connection.
#[derive(Clone, Debug)]
pub struct ClientProtocol {
    shared: Arc<Shared>,
}

impl ClientProtocol {
    /// Starts the read and write tasks for an established stream.
    pub fn spawn(stream: UnixStream, config: ProtocolConfig) -> Self {
        let (read, write) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(true);

        let shared = Arc::new(Shared {
            state: Mutex::new(ClientState {
                outbound: Some(outbound),
                next_seq: 0,
                in_flight: HashMap::new(),
                tickets: HashMap::new(),
            }),
            config,
            connected,
        });

        tokio::spawn(write_loop(write, outbound_rx));
        tokio::spawn(read_loop(shared.clone(), read));

        Self { shared }
    }

    /// Returns whether the underlying connection is still live.
    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Tears the connection down; every in-flight call fails with a
    /// connection-lost error.
    pub fn close(&self) {
        // Refuse new calls before the read task observes the change.
        self.shared.lock().outbound = None;
        self.shared.connected.send_replace(false);
    }

    /// Completes once the connection has been torn down.
    pub async fn closed(&self) {
        let mut connected = self.shared.connected.subscribe();
        while *connected.borrow_and_update() {
            if connected.changed().await.is_err() {
                return;
            }
        }
    }

    /// Serialises and sends one request, returning a handle to await the
    /// response on.
    ///
    /// Fails synchronously with a connection-lost error when the
    /// connection is gone, or with an unserializable-value error when an
    /// argument is outside the wire grammar; neither sends anything.
    pub fn start_call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<MethodCallHandle, MethodCallError> {
        let mut state = self.shared.lock();

        let outbound = match &state.outbound {
            Some(outbound) => outbound.clone(),
            None => return Err(MethodCallError::connection_lost()),
        };

        let seq = state.next_seq;
        let frame = Frame::Request {
            seq,
            method: method.to_owned(),
            args,
            kwargs,
        };
        let bytes = frame
            .to_bytes()
            .map_err(|err| MethodCallError::unserializable_value(err.to_string()))?;

        state.next_seq = state.next_seq.wrapping_add(1);

        let (sink, events) = mpsc::unbounded_channel();
        state.in_flight.insert(seq, sink);

        if outbound.send(bytes).is_err() {
            state.in_flight.remove(&seq);
            return Err(MethodCallError::connection_lost());
        }

        trace!(seq, method, "-> request");

        Ok(MethodCallHandle {
            shared: self.shared.clone(),
            seq,
            events,
        })
    }
}

/// Handle to one in-flight call.
#[derive(Debug)]
pub struct MethodCallHandle {
    shared: Arc<Shared>,
    seq: u32,
    events: mpsc::UnboundedReceiver<CallEvent>,
}

impl MethodCallHandle {
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Awaits the result, applying the response timeout and, once a
    /// pending ticket has been observed, the pending timeout.
    ///
    /// On timeout the call is retired so that a later matching frame is
    /// discarded.
    pub async fn wait(mut self) -> Result<Value, MethodCallError> {
        let config = self.shared.config.clone();

        let event = match timeout(config.response_timeout, self.events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => return Err(MethodCallError::connection_lost()),
            Err(_) => {
                self.abandon();
                return Err(MethodCallError::timed_out());
            }
        };

        match event {
            CallEvent::Answer(outcome) => outcome,
            CallEvent::Pending => match timeout(config.pending_timeout, self.events.recv()).await {
                Ok(Some(CallEvent::Answer(outcome))) => outcome,
                Ok(Some(CallEvent::Pending)) => {
                    warn!(seq = self.seq, "peer sent a second pending ticket");
                    self.abandon();
                    Err(MethodCallError::connection_lost())
                }
                Ok(None) => Err(MethodCallError::connection_lost()),
                Err(_) => {
                    self.abandon();
                    Err(MethodCallError::timed_out())
                }
            },
        }
    }

    fn abandon(&self) {
        let mut state = self.shared.lock();
        state.in_flight.remove(&self.seq);
        let seq = self.seq;
        state.tickets.retain(|_, owner| *owner != seq);
    }
}

async fn read_loop(shared: Arc<Shared>, read: OwnedReadHalf) {
    let mut frames = FramedRead::new(read, MethodCallCodec::new());
    let mut closed = shared.connected.subscribe();

    while *closed.borrow_and_update() {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    if !route_frame(&shared, frame) {
                        break;
                    }
                }
                Some(Err(err)) => {
                    debug!(%err, "dropping connection on framing error");
                    break;
                }
                None => {
                    debug!("connection closed by peer");
                    break;
                }
            },
            _ = closed.changed() => {
                if !*closed.borrow() {
                    break;
                }
            }
        }
    }

    teardown(&shared);
}

/// Routes one inbound frame; returns `false` when the wire is
/// inconsistent and the connection must be dropped.
fn route_frame(shared: &Arc<Shared>, frame: Frame) -> bool {
    let mut guard = shared.lock();
    let state = &mut *guard;

    match frame {
        Frame::Response { seq, reply } => match reply {
            Reply::Value {
                result,
                deferred: None,
            } => {
                trace!(seq, "<- answer");
                match state.in_flight.remove(&seq) {
                    Some(sink) => {
                        let _ = sink.send(CallEvent::Answer(Ok(result)));
                    }
                    None => trace!(seq, "discarding answer for a retired call"),
                }
            }
            Reply::Value {
                deferred: Some(ticket),
                ..
            } => {
                trace!(seq, %ticket, "<- pending ticket");
                if let Some(sink) = state.in_flight.get(&seq) {
                    let _ = sink.send(CallEvent::Pending);
                    state.tickets.insert(ticket, seq);
                }
            }
            Reply::Error(error) => {
                trace!(seq, %error, "<- error answer");
                if let Some(sink) = state.in_flight.remove(&seq) {
                    let _ = sink.send(CallEvent::Answer(Err(error)));
                }
            }
        },
        Frame::ResultAvailable { ticket, outcome } => {
            trace!(%ticket, "<- resolution");
            match state.tickets.remove(&ticket) {
                Some(seq) => {
                    if let Some(sink) = state.in_flight.remove(&seq) {
                        let _ = sink.send(CallEvent::Answer(outcome));
                    }
                }
                None => trace!(%ticket, "discarding resolution for an unknown ticket"),
            }
        }
        Frame::Request { method, .. } => {
            warn!(%method, "peer sent a request to the client side; dropping connection");
            return false;
        }
    }

    true
}

fn teardown(shared: &Arc<Shared>) {
    shared.connected.send_replace(false);

    let mut state = shared.lock();
    state.outbound = None;
    state.tickets.clear();

    // Fail in-flight calls in issue order.
    let mut seqs: Vec<u32> = state.in_flight.keys().copied().collect();
    seqs.sort_unstable();
    for seq in seqs {
        if let Some(sink) = state.in_flight.remove(&seq) {
            let _ = sink.send(CallEvent::Answer(Err(MethodCallError::connection_lost())));
        }
    }
}

async fn write_loop(mut write: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(bytes) = outbound.recv().await {
        if let Err(err) = write.write_all(&bytes).await {
            debug!(%err, "write failed; awaiting teardown");
            break;
        }
    }

    let _ = write.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::SinkExt;
    use pretty_assertions::assert_eq;
    use tokio_util::codec::Framed;

    fn fast_config() -> ProtocolConfig {
        ProtocolConfig {
            response_timeout: Duration::from_millis(100),
            pending_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn answer_resolves_matching_call() {
        let (near, far) = UnixStream::pair().unwrap();
        let protocol = ClientProtocol::spawn(near, ProtocolConfig::default());
        let mut peer = Framed::new(far, MethodCallCodec::new());

        let handle = protocol
            .start_call("motd", Vec::new(), BTreeMap::new())
            .unwrap();

        let request = peer.next().await.unwrap().unwrap();
        let seq = match request {
            Frame::Request { seq, ref method, .. } => {
                assert_eq!(method, "motd");
                seq
            }
            other => panic!("unexpected frame: {other:?}"),
        };

        peer.send(Frame::Response {
            seq,
            reply: Reply::Value {
                result: Value::Str("Words are cool".into()),
                deferred: None,
            },
        })
        .await
        .unwrap();

        assert_eq!(handle.wait().await.unwrap(), Value::Str("Words are cool".into()));
    }

    #[tokio::test]
    async fn pending_ticket_resolves_later() {
        let (near, far) = UnixStream::pair().unwrap();
        let protocol = ClientProtocol::spawn(near, ProtocolConfig::default());
        let mut peer = Framed::new(far, MethodCallCodec::new());

        let handle = protocol
            .start_call("google", vec![Value::Str("Landscape".into())], BTreeMap::new())
            .unwrap();

        let seq = match peer.next().await.unwrap().unwrap() {
            Frame::Request { seq, .. } => seq,
            other => panic!("unexpected frame: {other:?}"),
        };

        peer.send(Frame::Response {
            seq,
            reply: Reply::Value {
                result: Value::Null,
                deferred: Some("pending-1".to_owned()),
            },
        })
        .await
        .unwrap();

        peer.send(Frame::ResultAvailable {
            ticket: "pending-1".to_owned(),
            outcome: Ok(Value::Str("Cool!".into())),
        })
        .await
        .unwrap();

        assert_eq!(handle.wait().await.unwrap(), Value::Str("Cool!".into()));
    }

    #[tokio::test]
    async fn silent_peer_times_the_call_out() {
        let (near, far) = UnixStream::pair().unwrap();
        let protocol = ClientProtocol::spawn(near, fast_config());
        let _peer = Framed::new(far, MethodCallCodec::new());

        let handle = protocol
            .start_call("empty", Vec::new(), BTreeMap::new())
            .unwrap();

        let err = handle.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "timeout");
    }

    #[tokio::test]
    async fn peer_disconnect_fails_in_flight_calls() {
        let (near, far) = UnixStream::pair().unwrap();
        let protocol = ClientProtocol::spawn(near, ProtocolConfig::default());

        let handle = protocol
            .start_call("empty", Vec::new(), BTreeMap::new())
            .unwrap();

        drop(far);

        let err = handle.wait().await.unwrap_err();
        assert!(err.is_connection_lost());
        protocol.closed().await;
        assert!(!protocol.is_connected());
    }

    #[tokio::test]
    async fn closed_protocol_rejects_new_calls() {
        let (near, far) = UnixStream::pair().unwrap();
        let protocol = ClientProtocol::spawn(near, ProtocolConfig::default());
        let _far = far;

        protocol.close();
        protocol.closed().await;

        let err = protocol
            .start_call("empty", Vec::new(), BTreeMap::new())
            .unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn unserializable_argument_fails_synchronously() {
        let (near, far) = UnixStream::pair().unwrap();
        let protocol = ClientProtocol::spawn(near, ProtocolConfig::default());
        let _far = far;

        let oversize = Value::Str("x".repeat(crate::MAX_STRING_LEN + 1));
        let err = protocol
            .start_call("echo", vec![oversize], BTreeMap::new())
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::UnserializableValue);
    }
}
