use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::connection;
use crate::dispatch::Dispatcher;
use crate::{ConnectionId, MethodCallTarget};

/// Accepts client connections until the shutdown signal fires.
pub(crate) async fn accept_loop<T: MethodCallTarget>(
    listener: UnixListener,
    dispatcher: Dispatcher<T>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_id = 0usize;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let id = ConnectionId(next_id);
                    next_id += 1;
                    debug!(?id, "accepted connection");

                    tokio::spawn(connection::handle_connection(
                        stream,
                        id,
                        dispatcher.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    error!(%err, "accept failed");
                    break;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
