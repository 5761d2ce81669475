//! Errors surfaced by connection operations.

use std::io;
use std::time::Duration;

use frames::CodecError;
use uuid::Uuid;

use crate::config::Endpoint;
use crate::discovery::DiscoveryError;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Endpoint discovery failed before the first dial.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    /// A single dial attempt failed.
    #[error("failed to dial {endpoint}: {source}")]
    Dial {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    /// Every dial attempt in a connect cycle failed.
    #[error("failed to reconnect: retry limit of {attempts} reached")]
    RetryLimitReached { attempts: u32 },
    /// No socket is open.
    #[error("not connected")]
    NotConnected,
    /// The connection closed before the exchange completed.
    #[error("connection closed")]
    ConnectionClosed,
    /// Another exchange already owns this correlation id.
    #[error("correlation id {0} is already in flight")]
    DuplicateCorrelationId(Uuid),
    /// No response arrived within the operation timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The peer rejected a frame as malformed.
    #[error("server rejected the request as malformed")]
    BadRequest,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
