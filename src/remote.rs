use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::client::ClientProtocol;
use crate::{ErrorCode, MethodCallError, Value};

type CallSlot = Arc<Mutex<Option<oneshot::Sender<Result<Value, MethodCallError>>>>>;

/// One buffered call: everything needed to (re)send it plus the slot the
/// caller is waiting on. An emptied slot is the tombstone of a call that
/// timed out or was abandoned.
#[derive(Debug)]
struct QueuedCall {
    issue: u64,
    method: String,
    args: Vec<Value>,
    kwargs: BTreeMap<String, Value>,
    deadline: Option<Instant>,
    slot: CallSlot,
}

impl QueuedCall {
    fn is_live(&self) -> bool {
        lock_slot(&self.slot).is_some()
    }

    fn deliver(&self, outcome: Result<Value, MethodCallError>) {
        if let Some(sender) = lock_slot(&self.slot).take() {
            let _ = sender.send(outcome);
        }
    }
}

fn lock_slot(
    slot: &CallSlot,
) -> MutexGuard<'_, Option<oneshot::Sender<Result<Value, MethodCallError>>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct RemoteState {
    protocol: Option<ClientProtocol>,
    queue: VecDeque<QueuedCall>,
    shutdown: bool,
}

#[derive(Debug)]
struct RemoteShared {
    state: Mutex<RemoteState>,
    retry_on_reconnect: bool,
    timeout: Option<Duration>,
    issued: AtomicU64,
}

/// Local stand-in for the peer object.
///
/// Each invocation returns an eventual value. While disconnected, calls
/// fail immediately with a connection-lost error unless retry-on-reconnect
/// is enabled, in which case they wait in a FIFO queue that is replayed
/// when the factory hands over a fresh protocol. The optional hard
/// deadline caps a call's total wall-clock time across any number of
/// retries.
#[derive(Clone, Debug)]
pub struct RemoteObject {
    shared: Arc<RemoteShared>,
}

impl RemoteObject {
    pub fn new(retry_on_reconnect: bool, timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(RemoteShared {
                state: Mutex::new(RemoteState {
                    protocol: None,
                    queue: VecDeque::new(),
                    shutdown: false,
                }),
                retry_on_reconnect,
                timeout,
                issued: AtomicU64::new(0),
            }),
        }
    }

    /// Invokes `method` on the peer with the given positional and named
    /// arguments.
    ///
    /// The call is dispatched (or queued) before the returned future is
    /// first polled, so issue order is the order of `call` invocations.
    pub fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> impl Future<Output = Result<Value, MethodCallError>> {
        let (sender, receiver) = oneshot::channel();
        let slot: CallSlot = Arc::new(Mutex::new(Some(sender)));

        let deadline = self.shared.timeout.map(|timeout| Instant::now() + timeout);
        if let Some(deadline) = deadline {
            let slot = slot.clone();
            tokio::spawn(async move {
                sleep_until(deadline).await;
                if let Some(sender) = lock_slot(&slot).take() {
                    let _ = sender.send(Err(MethodCallError::timed_out()));
                }
            });
        }

        let call = QueuedCall {
            issue: self.shared.issued.fetch_add(1, Ordering::Relaxed),
            method: method.to_owned(),
            args,
            kwargs,
            deadline,
            slot,
        };

        self.dispatch(call);

        async move {
            match receiver.await {
                Ok(outcome) => outcome,
                Err(_) => Err(MethodCallError::connection_lost()),
            }
        }
    }

    /// Binds a freshly connected protocol and replays queued calls in
    /// FIFO order. Calls whose deadline has already passed fail with a
    /// timeout instead of being replayed.
    pub fn handle_reconnect(&self, protocol: ClientProtocol) {
        let mut state = self.lock_state();

        if state.shutdown {
            protocol.close();
            return;
        }

        debug!(queued = state.queue.len(), "binding fresh client protocol");
        state.protocol = Some(protocol.clone());

        let mut pending = std::mem::take(&mut state.queue);
        while let Some(call) = pending.pop_front() {
            if let Err(call) = self.forward(&protocol, call) {
                // The fresh protocol is already gone again; keep the call
                // at the head and wait for the next reconnect.
                pending.push_front(call);
                break;
            }
        }
        state.queue = pending;
    }

    /// Halts the adapter: closes the bound protocol and fails every
    /// queued call with a connection-lost error.
    pub fn shutdown(&self) {
        let mut state = self.lock_state();
        state.shutdown = true;

        if let Some(protocol) = state.protocol.take() {
            protocol.close();
        }

        while let Some(call) = state.queue.pop_front() {
            call.deliver(Err(MethodCallError::connection_lost()));
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RemoteState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch(&self, call: QueuedCall) {
        let mut state = self.lock_state();

        if state.shutdown {
            call.deliver(Err(MethodCallError::connection_lost()));
            return;
        }

        let protocol = state
            .protocol
            .clone()
            .filter(ClientProtocol::is_connected);

        match protocol {
            Some(protocol) => {
                if let Err(call) = self.forward(&protocol, call) {
                    Self::enqueue(&mut state, call);
                }
            }
            None if self.shared.retry_on_reconnect => {
                trace!(method = %call.method, "queueing call while disconnected");
                Self::enqueue(&mut state, call);
            }
            None => call.deliver(Err(MethodCallError::connection_lost())),
        }
    }

    /// Inserts a call preserving issue order; calls that bounced off a
    /// dying connection land back in front of anything issued later.
    fn enqueue(state: &mut RemoteState, call: QueuedCall) {
        let at = state
            .queue
            .iter()
            .position(|queued| queued.issue > call.issue)
            .unwrap_or(state.queue.len());
        state.queue.insert(at, call);
    }

    fn requeue(&self, call: QueuedCall) {
        if !call.is_live() {
            return;
        }

        let mut state = self.lock_state();

        if state.shutdown {
            call.deliver(Err(MethodCallError::connection_lost()));
            return;
        }

        // A fresh protocol may already be bound by the time an in-flight
        // call bounces; only forward directly when nothing else is
        // waiting, otherwise order through the queue.
        let protocol = state
            .protocol
            .clone()
            .filter(ClientProtocol::is_connected);

        match protocol {
            Some(protocol) if state.queue.is_empty() => {
                if let Err(call) = self.forward(&protocol, call) {
                    Self::enqueue(&mut state, call);
                }
            }
            _ => Self::enqueue(&mut state, call),
        }
    }

    /// Sends one call on `protocol`. `Err(call)` hands the call back
    /// because the protocol was already disconnected (and retry is on).
    fn forward(&self, protocol: &ClientProtocol, call: QueuedCall) -> Result<(), QueuedCall> {
        if !call.is_live() {
            return Ok(());
        }

        if let Some(deadline) = call.deadline {
            if Instant::now() >= deadline {
                call.deliver(Err(MethodCallError::timed_out()));
                return Ok(());
            }
        }

        match protocol.start_call(&call.method, call.args.clone(), call.kwargs.clone()) {
            Ok(handle) => {
                let remote = self.clone();
                tokio::spawn(async move {
                    let outcome = handle.wait().await;
                    let lost = matches!(&outcome, Err(err) if err.code() == ErrorCode::ConnectionLost);
                    if lost && remote.shared.retry_on_reconnect {
                        trace!(method = %call.method, "requeueing call after connection loss");
                        remote.requeue(call);
                    } else {
                        call.deliver(outcome);
                    }
                });
                Ok(())
            }
            Err(err) if err.code() == ErrorCode::ConnectionLost && self.shared.retry_on_reconnect => {
                Err(call)
            }
            Err(err) => {
                call.deliver(Err(err));
                Ok(())
            }
        }
    }
}
