//! Socket ownership and the connect/reconnect state machine.
//!
//! DESIGN
//! ======
//! A connection owns at most one socket at a time. The read half belongs to
//! the reader task; the write half sits behind an async mutex so concurrent
//! senders serialize whole frames. The `connected` flag, state, per-socket
//! cancellation token, and reader handle live together under one std mutex.
//!
//! Connect cycles are serialized by `Inner::connect_lock`. A cycle makes up to
//! `max_reconnects` dial attempts with `reconnection_delay` between failures.
//! Backoff waits race the lifecycle token, so `Connection::close` interrupts
//! them.
//!
//! ERROR HANDLING
//! ==============
//! Initial discovery failures abort the cycle. Discovery failures between
//! attempts are logged and the previous endpoint is reused. Exhausting the
//! attempt budget tears down both correlation tables before returning
//! `RetryLimitReached`.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use frames::{Frame, FrameCodec};
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Endpoint;
use crate::connection::Inner;
use crate::error::ConnectionError;
use crate::events::{ConnectionEvent, DisconnectReason};
use crate::reader;

// =============================================================================
// DIALER
// =============================================================================

/// Opens the TCP stream for an endpoint.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, endpoint: &Endpoint) -> io::Result<TcpStream>;
}

/// Plain TCP dialer with Nagle disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, endpoint: &Endpoint) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((endpoint.address.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

// =============================================================================
// SOCKET STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    /// The peer ended the stream; a reconnect cycle follows.
    Broken,
}

#[derive(Default)]
pub(crate) struct SocketState {
    pub(crate) connected: bool,
    pub(crate) state: ConnectionState,
    /// Child of the lifecycle token; cancelled when this socket goes away.
    pub(crate) token: CancellationToken,
    pub(crate) reader: Option<JoinHandle<()>>,
    /// Bumped for every attached socket; recovery tasks carry the one they serve.
    pub(crate) generation: u64,
}

pub(crate) type FrameWriter = FramedWrite<OwnedWriteHalf, FrameCodec>;

// =============================================================================
// CONNECT
// =============================================================================

/// Run one connect cycle. Returns immediately if a socket is already open.
pub(crate) async fn connect_with_retry(inner: &Arc<Inner>, lifecycle: &CancellationToken) -> Result<(), ConnectionError> {
    let _cycle = inner.connect_lock.lock().await;
    if inner.is_connected() {
        return Ok(());
    }
    if lifecycle.is_cancelled() {
        return Err(ConnectionError::ConnectionClosed);
    }
    inner.set_state(ConnectionState::Connecting);

    if let Some(discoverer) = &inner.config.discoverer {
        match discoverer.discover().await {
            Ok(endpoint) => inner.set_endpoint(endpoint),
            Err(e) => {
                warn!(connection_id = %inner.id, error = %e, "endpoint discovery failed");
                inner.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        }
    }

    // Zero attempts goes straight to teardown.
    let max = inner.config.max_reconnects;
    for attempt in 1..=max {
        let endpoint = inner.endpoint();
        debug!(connection_id = %inner.id, %endpoint, attempt, max, "dialing");

        let dialed = tokio::select! {
            () = lifecycle.cancelled() => return Err(abandon(inner)),
            result = inner.config.dialer.dial(&endpoint) => result,
        };
        match dialed {
            Ok(stream) => return attach(inner, stream, lifecycle, endpoint).await,
            Err(e) => {
                let e = ConnectionError::Dial { endpoint, source: e };
                warn!(connection_id = %inner.id, attempt, max, error = %e, "dial attempt failed");
            }
        }

        if attempt == max {
            break;
        }

        tokio::select! {
            () = lifecycle.cancelled() => return Err(abandon(inner)),
            () = tokio::time::sleep(inner.config.reconnection_delay) => {}
        }

        if let Some(discoverer) = &inner.config.discoverer {
            match discoverer.discover().await {
                Ok(endpoint) => inner.set_endpoint(endpoint),
                Err(e) => {
                    warn!(connection_id = %inner.id, error = %e, "rediscovery failed, keeping previous endpoint");
                }
            }
        }
    }

    teardown_tables(inner);
    inner.set_state(ConnectionState::Disconnected);
    error!(connection_id = %inner.id, attempts = max, "giving up on connect");
    Err(ConnectionError::RetryLimitReached { attempts: max })
}

fn abandon(inner: &Inner) -> ConnectionError {
    debug!(connection_id = %inner.id, "connect cancelled by close");
    inner.set_state(ConnectionState::Disconnected);
    ConnectionError::ConnectionClosed
}

/// Install a freshly dialed stream: writer first, then flag and reader.
async fn attach(
    inner: &Arc<Inner>,
    stream: TcpStream,
    lifecycle: &CancellationToken,
    endpoint: Endpoint,
) -> Result<(), ConnectionError> {
    let (read_half, write_half) = stream.into_split();
    let mut writer = inner.writer.lock().await;

    {
        let mut socket = inner.lock_socket();
        if lifecycle.is_cancelled() {
            socket.state = ConnectionState::Disconnected;
            return Err(ConnectionError::ConnectionClosed);
        }
        let token = lifecycle.child_token();
        socket.generation += 1;
        socket.connected = true;
        socket.state = ConnectionState::Connected;
        socket.token = token.clone();
        socket.reader = Some(reader::spawn(Arc::clone(inner), read_half, token, socket.generation));
    }

    *writer = Some(FramedWrite::new(write_half, FrameCodec::new(inner.config.max_frame_length)));
    drop(writer);

    info!(connection_id = %inner.id, %endpoint, "connected");
    inner.emit(ConnectionEvent::Connected { endpoint });
    Ok(())
}

// =============================================================================
// DISCONNECT
// =============================================================================

/// Tear down the current socket: clear the flag, stop the reader, close the
/// write half, then fail pending requests and drop subscriptions.
///
/// The close error, if any, is returned after the teardown has finished.
pub(crate) async fn disconnect(inner: &Arc<Inner>, reason: DisconnectReason) -> Result<(), ConnectionError> {
    let (was_connected, reader) = detach(&mut inner.lock_socket());
    finish_disconnect(inner, reason, was_connected, reader).await
}

/// Tear down socket `generation` only if it is still the live one.
///
/// Returns `None` without touching anything when that socket was already
/// torn down or a newer one has replaced it.
pub(crate) async fn disconnect_live(
    inner: &Arc<Inner>,
    generation: u64,
    reason: DisconnectReason,
) -> Option<Result<(), ConnectionError>> {
    let reader = {
        let mut socket = inner.lock_socket();
        if socket.generation != generation || !socket.connected {
            return None;
        }
        detach(&mut socket).1
    };
    Some(finish_disconnect(inner, reason, true, reader).await)
}

fn detach(socket: &mut SocketState) -> (bool, Option<JoinHandle<()>>) {
    let was_connected = socket.connected;
    socket.connected = false;
    socket.state = ConnectionState::Closing;
    socket.token.cancel();
    (was_connected, socket.reader.take())
}

async fn finish_disconnect(
    inner: &Arc<Inner>,
    reason: DisconnectReason,
    was_connected: bool,
    reader: Option<JoinHandle<()>>,
) -> Result<(), ConnectionError> {
    if let Some(reader) = reader {
        reader.abort();
    }

    let writer = inner.writer.lock().await.take();
    let closed = match writer {
        Some(mut writer) => writer.close().await.map_err(ConnectionError::from),
        None => Ok(()),
    };
    if let Err(e) = &closed {
        warn!(connection_id = %inner.id, error = %e, "socket close failed");
    }

    teardown_tables(inner);
    inner.set_state(ConnectionState::Disconnected);

    if was_connected {
        info!(connection_id = %inner.id, ?reason, "disconnected");
        inner.emit(ConnectionEvent::Disconnected { reason });
    }
    closed
}

fn teardown_tables(inner: &Inner) {
    let failed = inner.requests.fail_all();
    let dropped = inner.subscriptions.drop_all(inner.credentials.as_ref());
    if failed > 0 || dropped > 0 {
        debug!(connection_id = %inner.id, failed, dropped, "correlation tables cleared");
    }
}

// =============================================================================
// WRITE
// =============================================================================

pub(crate) async fn write(inner: &Inner, frame: Frame) -> Result<(), ConnectionError> {
    let mut writer = inner.writer.lock().await;
    let Some(sink) = writer.as_mut() else {
        return Err(ConnectionError::NotConnected);
    };
    sink.send(frame).await?;
    Ok(())
}
