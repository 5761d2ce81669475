//! Lifecycle notifications broadcast by a connection.

use std::sync::Arc;

use crate::config::Endpoint;
use crate::error::ConnectionError;

/// Why a socket was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the stream.
    EndOfStream,
    /// Reading from the socket failed.
    ReadError,
    /// An inbound frame could not be decoded.
    DecodeError,
    /// The peer answered with a bad-request frame.
    BadRequest,
    /// `Connection::close` was called.
    Closed,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { endpoint: Endpoint },
    Reconnecting,
    Disconnected { reason: DisconnectReason },
    Closed,
    /// A background reconnect gave up or a fatal frame arrived.
    Failed { error: Arc<ConnectionError> },
}
