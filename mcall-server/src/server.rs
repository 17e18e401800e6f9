use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::accept;
use crate::dispatch::Dispatcher;
use crate::MethodCallTarget;

/// Binds a target object to its method allow-list and listens for
/// method-call connections on a Unix-socket path.
///
/// Filesystem permissions on the socket path are the sole access
/// control.
#[derive(Debug)]
pub struct MethodCallServerFactory<T> {
    target: Arc<T>,
    methods: Arc<Vec<String>>,
}

impl<T: MethodCallTarget> MethodCallServerFactory<T> {
    pub fn new(target: T, methods: &[&str]) -> Self {
        Self {
            target: Arc::new(target),
            methods: Arc::new(methods.iter().map(|method| (*method).to_owned()).collect()),
        }
    }

    /// Binds `path` and starts accepting connections. A stale socket
    /// file at `path` is removed first so the path can be re-listened.
    pub async fn listen(&self, path: impl AsRef<Path>) -> io::Result<ServerHandle> {
        let path = path.as_ref().to_path_buf();

        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }

        let listener = UnixListener::bind(&path)?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(self.target.clone(), self.methods.clone());

        info!(path = %path.display(), "listening");
        let join = tokio::spawn(accept::accept_loop(listener, dispatcher, shutdown_rx));

        Ok(ServerHandle {
            path,
            shutdown,
            stopped: AtomicBool::new(false),
            join,
        })
    }
}

/// Handle to a listening server.
#[derive(Debug)]
pub struct ServerHandle {
    path: PathBuf,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    join: JoinHandle<()>,
}

impl ServerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops listening, tears down every open connection and unlinks the
    /// socket. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(path = %self.path.display(), "stopping server");
        self.shutdown.send_replace(true);
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
        self.join.abort();
    }
}
