use std::collections::BTreeMap;

use tokio::sync::oneshot;

use mcall::Value;

mod accept;
mod connection;
mod dispatch;
mod pending;
mod server;


pub use server::{MethodCallServerFactory, ServerHandle};

/// A re-export of [`async-trait`](https://docs.rs/async-trait) for convenience.
pub use async_trait::async_trait;

/// Connection identifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(usize);

/// Trait implemented by objects whose methods are remotely callable.
///
/// Only method names present in the factory allow-list are ever routed
/// here; the allow-list, not this trait, is the security boundary. An
/// `Err` travels back to the caller as a method-failed error carrying
/// the error's display form as its description.
#[async_trait]
pub trait MethodCallTarget: Send + Sync + 'static {
    async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> anyhow::Result<MethodResult>;
}

/// Outcome of a target method: an immediate value, or a pending value
/// whose result is delivered later on the same connection.
#[derive(Debug)]
pub enum MethodResult {
    Value(Value),
    Pending(PendingValue),
}

impl From<Value> for MethodResult {
    fn from(value: Value) -> Self {
        MethodResult::Value(value)
    }
}

/// A result that can only be determined later.
///
/// Returning one from a target method makes the server answer with a
/// pending ticket immediately; the paired [`PendingResolver`] fires the
/// `_result_available` frame. A resolver dropped without resolving
/// counts as a failure, so every ticket resolves exactly once (unless
/// the connection terminates first).
#[derive(Debug)]
pub struct PendingValue {
    pub(crate) outcome: oneshot::Receiver<Result<Value, String>>,
}

impl PendingValue {
    pub fn new() -> (PendingValue, PendingResolver) {
        let (sender, receiver) = oneshot::channel();
        (
            PendingValue { outcome: receiver },
            PendingResolver { outcome: sender },
        )
    }
}

/// Resolves or fails the result behind a pending ticket.
#[derive(Debug)]
pub struct PendingResolver {
    outcome: oneshot::Sender<Result<Value, String>>,
}

impl PendingResolver {
    pub fn resolve(self, value: Value) {
        let _ = self.outcome.send(Ok(value));
    }

    pub fn fail(self, description: impl Into<String>) {
        let _ = self.outcome.send(Err(description.into()));
    }
}
