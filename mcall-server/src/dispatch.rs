use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use mcall::{Frame, MethodCallError, Reply, Value};

use crate::pending::PendingRegistry;
use crate::{MethodCallTarget, MethodResult};

/// Routes decoded requests to the target object, behind the method
/// allow-list.
#[derive(Debug)]
pub(crate) struct Dispatcher<T> {
    target: Arc<T>,
    methods: Arc<Vec<String>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            methods: self.methods.clone(),
        }
    }
}

impl<T: MethodCallTarget> Dispatcher<T> {
    pub fn new(target: Arc<T>, methods: Arc<Vec<String>>) -> Self {
        Self { target, methods }
    }

    fn allowed(&self, method: &str) -> bool {
        self.methods.iter().any(|allowed| allowed == method)
    }

    /// Handles one request and queues its `_answer` frame.
    ///
    /// The answer is encoded here so that a result outside the value
    /// grammar can be substituted with an unserializable-result error
    /// instead of tearing the connection down.
    pub async fn dispatch(
        &self,
        seq: u32,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        registry: &mut PendingRegistry,
        out: &UnboundedSender<Bytes>,
    ) -> Result<(), io::Error> {
        if !self.allowed(method) {
            debug!(%method, "rejecting unlisted method");
            return send_reply(out, seq, Reply::Error(MethodCallError::forbidden(method)));
        }

        let reply = match self.target.call(method, args, kwargs).await {
            Ok(MethodResult::Value(result)) => Reply::Value {
                result,
                deferred: None,
            },
            Ok(MethodResult::Pending(pending)) => {
                let ticket = registry.register(pending);
                trace!(seq, %ticket, "deferring result");
                Reply::Value {
                    result: Value::Null,
                    deferred: Some(ticket),
                }
            }
            Err(err) => Reply::Error(MethodCallError::method_failed(err.to_string())),
        };

        send_reply(out, seq, reply)
    }
}

fn send_reply(out: &UnboundedSender<Bytes>, seq: u32, reply: Reply) -> Result<(), io::Error> {
    let bytes = match (Frame::Response { seq, reply }).to_bytes() {
        Ok(bytes) => bytes,
        Err(err) => {
            let error = MethodCallError::unserializable_result(err.to_string());
            Frame::Response {
                seq,
                reply: Reply::Error(error),
            }
            .to_bytes()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?
        }
    };

    out.send(bytes)
        .map_err(|err| io::Error::new(io::ErrorKind::BrokenPipe, err.to_string()))
}
