use std::io;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::try_join;
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};

use mcall::{Frame, MethodCallCodec};

use crate::dispatch::Dispatcher;
use crate::pending::PendingRegistry;
use crate::{ConnectionId, MethodCallTarget};

/// Runs one accepted connection: a framed read loop driving the
/// dispatcher, and a write task draining pre-encoded response frames.
pub(crate) async fn handle_connection<T: MethodCallTarget>(
    stream: UnixStream,
    id: ConnectionId,
    dispatcher: Dispatcher<T>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read, write) = stream.into_split();

    // direct channel between the read loop (and its pending-result
    // watchers) and the write loop
    let (to_write, from_read) = unbounded_channel();

    let result = tokio::select! {
        joined = async {
            try_join! {
                read_loop(id, read, dispatcher, to_write),
                write_loop(write, from_read),
            }
        } => joined.map(|_| ()),
        _ = wait_shutdown(&mut shutdown) => Ok(()),
    };

    match result {
        Ok(()) => debug!(?id, "connection closed"),
        Err(err) => debug!(?id, %err, "connection closed on error"),
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn read_loop<T: MethodCallTarget>(
    id: ConnectionId,
    read: OwnedReadHalf,
    dispatcher: Dispatcher<T>,
    to_write: UnboundedSender<Bytes>,
) -> Result<(), io::Error> {
    // Owned by the read loop so that dropping out of it abandons every
    // outstanding ticket without emitting further frames.
    let mut registry = PendingRegistry::new(id, to_write.clone());
    let mut frames = FramedRead::new(read, MethodCallCodec::new());

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Frame::Request {
                seq,
                method,
                args,
                kwargs,
            }) => {
                trace!(?id, seq, %method, "<- request");
                dispatcher
                    .dispatch(seq, &method, args, kwargs, &mut registry, &to_write)
                    .await?;
            }
            Ok(frame) => {
                warn!(?id, ?frame, "unexpected frame from client; dropping connection");
                break;
            }
            Err(err) => {
                debug!(?id, %err, "dropping connection on framing error");
                break;
            }
        }
    }

    Ok(())
}

async fn write_loop(
    mut write: OwnedWriteHalf,
    mut from_read: UnboundedReceiver<Bytes>,
) -> Result<(), io::Error> {
    while let Some(bytes) = from_read.recv().await {
        write.write_all(&bytes).await?;
    }

    let _ = write.shutdown().await;

    Ok(())
}
