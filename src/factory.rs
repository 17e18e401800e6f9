use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::{ClientProtocol, ProtocolConfig};

/// Default delay before the first reconnect attempt.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default cap on the reconnect delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default multiplier applied to the delay after every failed attempt.
pub const DEFAULT_FACTOR: f64 = 2.0;

/// Default relative jitter applied to every wait.
pub const DEFAULT_JITTER: f64 = 0.12;

/// Shape of the reconnect backoff.
///
/// The delay is multiplied by `factor` before each wait and capped at
/// `max_delay`; a `factor` below one shrinks the wait instead, which the
/// tests use for fast reconnects. A successful connection resets the
/// delay to `initial_delay`.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter: f64,
    /// Give up (and report it) after this many consecutive failed
    /// attempts. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            factor: DEFAULT_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
            max_retries: None,
        }
    }
}

/// Notification sent for every successful (re)connect, or once when the
/// attempt cap is exhausted.
#[derive(Debug)]
pub enum FactoryEvent {
    Connected(ClientProtocol),
    GaveUp { attempts: u32 },
}

#[derive(Debug)]
struct BackoffState {
    delay: Duration,
    retries: u32,
}

/// Maintains one live connection to a Unix-socket path, reconnecting
/// with exponential backoff whenever it fails or drops.
#[derive(Clone, Debug)]
pub struct MethodCallClientFactory {
    path: PathBuf,
    backoff: BackoffConfig,
    protocol: ProtocolConfig,
}

impl MethodCallClientFactory {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            backoff: BackoffConfig::default(),
            protocol: ProtocolConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    /// Starts the connect loop. Every successful connection is announced
    /// on `notifier`; there is exactly one live protocol at a time.
    pub fn start(self, notifier: mpsc::UnboundedSender<FactoryEvent>) -> FactoryHandle {
        let state = Arc::new(Mutex::new(BackoffState {
            delay: self.backoff.initial_delay,
            retries: 0,
        }));
        let (stop, stop_rx) = watch::channel(false);

        let join = tokio::spawn(run(self, notifier, state.clone(), stop_rx));

        FactoryHandle { stop, state, join }
    }
}

/// Handle to a running factory loop.
#[derive(Debug)]
pub struct FactoryHandle {
    stop: watch::Sender<bool>,
    state: Arc<Mutex<BackoffState>>,
    join: JoinHandle<()>,
}

impl FactoryHandle {
    /// Halts reconnection and closes the live connection, if any.
    pub fn stop_trying(&self) {
        self.stop.send_replace(true);
    }

    /// Number of consecutive failed attempts since the last success.
    pub fn retries(&self) -> u32 {
        self.lock_state().retries
    }

    /// The delay the next failed attempt would wait for.
    pub fn current_delay(&self) -> Duration {
        self.lock_state().delay
    }

    fn lock_state(&self) -> MutexGuard<'_, BackoffState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for FactoryHandle {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        self.join.abort();
    }
}

async fn run(
    factory: MethodCallClientFactory,
    notifier: mpsc::UnboundedSender<FactoryEvent>,
    state: Arc<Mutex<BackoffState>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        match UnixStream::connect(&factory.path).await {
            Ok(stream) => {
                {
                    let mut state = lock(&state);
                    state.delay = factory.backoff.initial_delay;
                    state.retries = 0;
                }

                let protocol = ClientProtocol::spawn(stream, factory.protocol.clone());
                info!(path = %factory.path.display(), "connected");

                if notifier
                    .send(FactoryEvent::Connected(protocol.clone()))
                    .is_err()
                {
                    protocol.close();
                    break;
                }

                tokio::select! {
                    _ = protocol.closed() => {
                        if *stop.borrow() {
                            break;
                        }
                        debug!(path = %factory.path.display(), "connection lost; reconnecting");
                    }
                    _ = wait_stop(&mut stop) => {
                        protocol.close();
                        break;
                    }
                }
            }
            Err(err) => {
                let (attempts, delay) = {
                    let mut state = lock(&state);
                    state.retries += 1;
                    state.delay = next_delay(
                        state.delay,
                        factory.backoff.factor,
                        factory.backoff.max_delay,
                    );
                    (state.retries, state.delay)
                };

                if let Some(max_retries) = factory.backoff.max_retries {
                    if attempts >= max_retries {
                        warn!(attempts, path = %factory.path.display(), "giving up reconnecting");
                        let _ = notifier.send(FactoryEvent::GaveUp { attempts });
                        break;
                    }
                }

                let wait = jittered(delay, factory.backoff.jitter);
                debug!(%err, ?wait, attempts, "connect failed; backing off");

                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = wait_stop(&mut stop) => break,
                }
            }
        }
    }
}

async fn wait_stop(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

fn lock(state: &Arc<Mutex<BackoffState>>) -> MutexGuard<'_, BackoffState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn next_delay(delay: Duration, factor: f64, max_delay: Duration) -> Duration {
    delay.mul_f64(factor.max(0.0)).min(max_delay)
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }

    let spread = rand::thread_rng().gen_range(-jitter..=jitter);
    delay.mul_f64((1.0 + spread).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn delay_grows_and_caps() {
        let max = Duration::from_secs(60);
        let mut delay = Duration::from_secs(1);

        delay = next_delay(delay, 2.0, max);
        assert_eq!(delay, Duration::from_secs(2));
        delay = next_delay(delay, 2.0, max);
        assert_eq!(delay, Duration::from_secs(4));

        for _ in 0..10 {
            delay = next_delay(delay, 2.0, max);
        }
        assert_eq!(delay, max);
    }

    #[test]
    fn fractional_factor_shrinks_delay() {
        let delay = next_delay(Duration::from_secs(1), 0.19, Duration::from_secs(60));
        assert_eq!(delay, Duration::from_millis(190));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let delay = Duration::from_secs(10);
        for _ in 0..100 {
            let wait = jittered(delay, DEFAULT_JITTER);
            assert!(wait >= delay.mul_f64(1.0 - DEFAULT_JITTER));
            assert!(wait <= delay.mul_f64(1.0 + DEFAULT_JITTER));
        }

        assert_eq!(jittered(delay, 0.0), delay);
    }
}
