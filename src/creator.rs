use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::client::ProtocolConfig;
use crate::factory::{BackoffConfig, FactoryEvent, FactoryHandle, MethodCallClientFactory};
use crate::remote::RemoteObject;
use crate::{MethodCallError, MethodCallResult};

/// Connects a [`RemoteObject`] to the peer listening on a Unix-socket
/// path, keeping it connected until [`disconnect`] is called.
///
/// Example usage:
///
/// ```rust,no_run
/// # async fn run() -> mcall::MethodCallResult<()> {
/// let mut creator = mcall::RemoteObjectCreator::new("/run/agent.sock")
///     .retry_on_reconnect(true)
///     .timeout(std::time::Duration::from_secs(5));
/// let remote = creator.connect().await?;
/// let motd = remote.call("motd", Vec::new(), Default::default()).await?;
/// creator.disconnect();
/// # Ok(())
/// # }
/// ```
///
/// [`disconnect`]: RemoteObjectCreator::disconnect
#[derive(Debug)]
pub struct RemoteObjectCreator {
    path: PathBuf,
    retry_on_reconnect: bool,
    timeout: Option<Duration>,
    backoff: BackoffConfig,
    protocol: ProtocolConfig,
    factory: Option<FactoryHandle>,
    remote: Option<RemoteObject>,
}

impl RemoteObjectCreator {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            retry_on_reconnect: false,
            timeout: None,
            backoff: BackoffConfig::default(),
            protocol: ProtocolConfig::default(),
            factory: None,
            remote: None,
        }
    }

    /// Queue calls issued while disconnected and replay them on
    /// reconnect instead of failing them.
    pub fn retry_on_reconnect(mut self, retry: bool) -> Self {
        self.retry_on_reconnect = retry;
        self
    }

    /// Hard per-call deadline, applied across retries.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn factor(mut self, factor: f64) -> Self {
        self.backoff.factor = factor;
        self
    }

    pub fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.backoff.initial_delay = initial_delay;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.backoff.max_delay = max_delay;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.backoff.max_retries = Some(max_retries);
        self
    }

    pub fn response_timeout(mut self, response_timeout: Duration) -> Self {
        self.protocol.response_timeout = response_timeout;
        self
    }

    pub fn pending_timeout(mut self, pending_timeout: Duration) -> Self {
        self.protocol.pending_timeout = pending_timeout;
        self
    }

    /// Starts the reconnecting factory and resolves once the first
    /// connection succeeds (or the attempt cap is exhausted).
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn connect(&mut self) -> MethodCallResult<RemoteObject> {
        let (notifier, mut events) = mpsc::unbounded_channel();

        let factory = MethodCallClientFactory::new(&self.path)
            .with_backoff(self.backoff.clone())
            .with_protocol(self.protocol.clone());
        self.factory = Some(factory.start(notifier));

        match events.recv().await {
            Some(FactoryEvent::Connected(protocol)) => {
                let remote = RemoteObject::new(self.retry_on_reconnect, self.timeout);
                remote.handle_reconnect(protocol);

                let listener = remote.clone();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if let FactoryEvent::Connected(protocol) = event {
                            listener.handle_reconnect(protocol);
                        }
                    }
                    debug!("factory gone; no further reconnects");
                });

                self.remote = Some(remote.clone());
                Ok(remote)
            }
            Some(FactoryEvent::GaveUp { attempts }) => {
                self.factory = None;
                Err(MethodCallError::backoff_exhausted(attempts))
            }
            None => Err(MethodCallError::connection_lost()),
        }
    }

    /// Halts reconnection, closes the live connection and fails every
    /// outstanding and queued call with a connection-lost error.
    pub fn disconnect(&mut self) {
        if let Some(factory) = self.factory.take() {
            factory.stop_trying();
        }
        if let Some(remote) = self.remote.take() {
            remote.shutdown();
        }
    }
}

impl Drop for RemoteObjectCreator {
    fn drop(&mut self) {
        self.disconnect();
    }
}
