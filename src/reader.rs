//! Background reader: one task per live socket.
//!
//! DESIGN
//! ======
//! The task decodes length-prefixed frames from the read half and dispatches
//! each one by command. Heartbeat replies are written on their own tasks so a
//! slow write never stalls dispatch. Responses and pushed events are routed
//! purely by correlation id.
//!
//! ERROR HANDLING
//! ==============
//! - End of stream: the socket is closed and a reconnect cycle starts.
//! - Read errors, undecodable frames, and `BadRequest`: the connection is torn
//!   down and `ConnectionEvent::Failed` is broadcast.
//!
//! Recovery always runs on a separate task because `disconnect` aborts the
//! reader handle.

use std::sync::Arc;

use frames::{CodecError, Command, Frame, FrameCodec};
use futures::StreamExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::connection::Inner;
use crate::error::ConnectionError;
use crate::events::{ConnectionEvent, DisconnectReason};
use crate::socket::{self, ConnectionState};

enum Exit {
    Stopped,
    EndOfStream,
    ReadError(std::io::Error),
    Decode(CodecError),
    BadRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Handled,
    Fatal,
}

/// Start the reader for socket `generation`.
pub(crate) fn spawn(
    inner: Arc<Inner>,
    read_half: OwnedReadHalf,
    token: CancellationToken,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match run(&inner, read_half, &token).await {
            Exit::Stopped => debug!(connection_id = %inner.id, "reader stopped"),
            Exit::EndOfStream => {
                info!(connection_id = %inner.id, "server closed the connection");
                tokio::spawn(reconnect(inner, generation));
            }
            Exit::ReadError(e) => {
                tokio::spawn(fail(inner, generation, DisconnectReason::ReadError, ConnectionError::Io(e)));
            }
            Exit::Decode(e) => {
                tokio::spawn(fail(inner, generation, DisconnectReason::DecodeError, ConnectionError::Codec(e)));
            }
            Exit::BadRequest => {
                tokio::spawn(fail(inner, generation, DisconnectReason::BadRequest, ConnectionError::BadRequest));
            }
        }
    })
}

async fn run(inner: &Arc<Inner>, read_half: OwnedReadHalf, token: &CancellationToken) -> Exit {
    let mut frames = FramedRead::new(read_half, FrameCodec::new(inner.config.max_frame_length));

    loop {
        if token.is_cancelled() || !inner.is_connected() {
            return Exit::Stopped;
        }

        let next = tokio::select! {
            () = token.cancelled() => return Exit::Stopped,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                if dispatch(inner, frame) == Dispatch::Fatal {
                    return Exit::BadRequest;
                }
            }
            Some(Err(CodecError::Io(e))) => return Exit::ReadError(e),
            Some(Err(e)) => return Exit::Decode(e),
            None => return Exit::EndOfStream,
        }
    }
}

/// Route one inbound frame.
pub(crate) fn dispatch(inner: &Arc<Inner>, frame: Frame) -> Dispatch {
    match frame.command {
        Command::HeartbeatRequest => {
            trace!(connection_id = %inner.id, correlation_id = %frame.correlation_id, "heartbeat");
            spawn_write(inner, Frame::heartbeat_response(frame.correlation_id));
        }
        Command::Pong => {
            // An explicit `Connection::ping` may be waiting on this id.
            let _ = inner.requests.complete(frame);
            spawn_write(inner, Frame::ping());
        }
        Command::BadRequest => {
            warn!(connection_id = %inner.id, correlation_id = %frame.correlation_id, "server reported a bad request");
            return Dispatch::Fatal;
        }
        command if is_routable(command) => route(inner, frame),
        command => {
            debug!(connection_id = %inner.id, ?command, "ignoring frame");
        }
    }
    Dispatch::Handled
}

fn route(inner: &Inner, frame: Frame) {
    let Err(frame) = inner.requests.complete(frame) else {
        return;
    };
    if let Err(frame) = inner.subscriptions.deliver(frame) {
        trace!(
            connection_id = %inner.id,
            correlation_id = %frame.correlation_id,
            command = ?frame.command,
            "no receiver for frame"
        );
    }
}

fn is_routable(command: Command) -> bool {
    matches!(
        command,
        Command::WriteEventsCompleted
            | Command::DeleteStreamCompleted
            | Command::ReadEventCompleted
            | Command::ReadStreamEventsForwardCompleted
            | Command::ReadStreamEventsBackwardCompleted
            | Command::ReadAllEventsForwardCompleted
            | Command::ReadAllEventsBackwardCompleted
            | Command::SubscriptionConfirmation
            | Command::StreamEventAppeared
            | Command::SubscriptionDropped
            | Command::PersistentSubscriptionConfirmation
            | Command::PersistentSubscriptionStreamEventAppeared
            | Command::CreatePersistentSubscriptionCompleted
            | Command::NotHandled
            | Command::NotAuthenticated
            | Command::Authenticated
            | Command::ClientIdentified
    )
}

fn spawn_write(inner: &Arc<Inner>, frame: Frame) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let command = frame.command;
        let correlation_id = frame.correlation_id;
        if let Err(e) = socket::write(&inner, frame).await {
            warn!(connection_id = %inner.id, ?command, %correlation_id, error = %e, "background write failed");
        }
    });
}

// =============================================================================
// RECOVERY
// =============================================================================

async fn reconnect(inner: Arc<Inner>, generation: u64) {
    let lifecycle = inner.lifecycle();
    if lifecycle.is_cancelled() {
        return;
    }

    match socket::disconnect_live(&inner, generation, DisconnectReason::EndOfStream).await {
        None => {
            debug!(connection_id = %inner.id, generation, "socket already replaced, skipping reconnect");
            return;
        }
        Some(Err(e)) => debug!(connection_id = %inner.id, error = %e, "close after end of stream failed"),
        Some(Ok(())) => {}
    }
    inner.set_state(ConnectionState::Broken);
    inner.emit(ConnectionEvent::Reconnecting);

    if let Err(e) = socket::connect_with_retry(&inner, &lifecycle).await {
        if lifecycle.is_cancelled() {
            return;
        }
        error!(connection_id = %inner.id, error = %e, "reconnect failed");
        inner.emit(ConnectionEvent::Failed { error: Arc::new(e) });
    }
}

async fn fail(inner: Arc<Inner>, generation: u64, reason: DisconnectReason, error: ConnectionError) {
    match socket::disconnect_live(&inner, generation, reason).await {
        None => {
            debug!(connection_id = %inner.id, generation, %error, "socket already replaced, dropping failure");
            return;
        }
        Some(Err(e)) => debug!(connection_id = %inner.id, error = %e, "close after failure failed"),
        Some(Ok(())) => {}
    }
    error!(connection_id = %inner.id, ?reason, %error, "connection failed");
    inner.emit(ConnectionEvent::Failed { error: Arc::new(error) });
}

#[cfg(test)]
#[path = "reader_test.rs"]
mod tests;
