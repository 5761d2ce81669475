//! Frame model and binary codec for the event store TCP protocol.
//!
//! This crate owns the wire representation used by the connection layer.
//! A frame body is laid out as:
//!
//! ```text
//! [command:1][flags:1][correlation_id:16][login_len:1 login pass_len:1 pass]?[payload]
//! ```
//!
//! On the socket every body is preceded by a little-endian `u32` length
//! prefix; [`FrameCodec`] owns that outer layer and the reassembly buffer.
//! Payloads stay opaque bytes (protobuf messages built by higher layers),
//! except for the few control messages in [`messages`].

mod codec;
pub mod messages;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

pub use codec::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, LENGTH_PREFIX_LEN};

/// Size of the fixed body header: command, flags and correlation id.
pub const HEADER_LEN: usize = 18;

const FLAG_AUTHENTICATED: u8 = 0x01;
const CORRELATION_ID_LEN: usize = 16;

/// Error returned by frame encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The body ended before a required field could be read.
    #[error("frame truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
    /// A frame (declared or encoded) exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },
    /// A login or password does not fit the one-byte length field.
    #[error("{field} is {len} bytes; at most 255 are allowed")]
    CredentialTooLong { field: &'static str, len: usize },
    /// Credentials on the wire are not valid UTF-8.
    #[error("{field} is not valid utf-8")]
    InvalidCredential { field: &'static str },
    /// The underlying socket failed while reading or writing frames.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// COMMANDS
// =============================================================================

/// Command byte of a frame.
///
/// Unrecognized bytes decode to [`Command::Unknown`] so newer servers do not
/// break older clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    HeartbeatRequest,
    HeartbeatResponse,
    Ping,
    Pong,
    WriteEvents,
    WriteEventsCompleted,
    DeleteStream,
    DeleteStreamCompleted,
    ReadEvent,
    ReadEventCompleted,
    ReadStreamEventsForward,
    ReadStreamEventsForwardCompleted,
    ReadStreamEventsBackward,
    ReadStreamEventsBackwardCompleted,
    ReadAllEventsForward,
    ReadAllEventsForwardCompleted,
    ReadAllEventsBackward,
    ReadAllEventsBackwardCompleted,
    SubscribeToStream,
    SubscriptionConfirmation,
    StreamEventAppeared,
    UnsubscribeFromStream,
    SubscriptionDropped,
    ConnectToPersistentSubscription,
    PersistentSubscriptionConfirmation,
    PersistentSubscriptionStreamEventAppeared,
    CreatePersistentSubscription,
    CreatePersistentSubscriptionCompleted,
    BadRequest,
    NotHandled,
    Authenticate,
    Authenticated,
    NotAuthenticated,
    IdentifyClient,
    ClientIdentified,
    Unknown(u8),
}

impl Command {
    /// Convert into the wire byte.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::HeartbeatRequest => 0x01,
            Self::HeartbeatResponse => 0x02,
            Self::Ping => 0x03,
            Self::Pong => 0x04,
            Self::WriteEvents => 0x82,
            Self::WriteEventsCompleted => 0x83,
            Self::DeleteStream => 0x8A,
            Self::DeleteStreamCompleted => 0x8B,
            Self::ReadEvent => 0xB0,
            Self::ReadEventCompleted => 0xB1,
            Self::ReadStreamEventsForward => 0xB2,
            Self::ReadStreamEventsForwardCompleted => 0xB3,
            Self::ReadStreamEventsBackward => 0xB4,
            Self::ReadStreamEventsBackwardCompleted => 0xB5,
            Self::ReadAllEventsForward => 0xB6,
            Self::ReadAllEventsForwardCompleted => 0xB7,
            Self::ReadAllEventsBackward => 0xB8,
            Self::ReadAllEventsBackwardCompleted => 0xB9,
            Self::SubscribeToStream => 0xC0,
            Self::SubscriptionConfirmation => 0xC1,
            Self::StreamEventAppeared => 0xC2,
            Self::UnsubscribeFromStream => 0xC3,
            Self::SubscriptionDropped => 0xC4,
            Self::ConnectToPersistentSubscription => 0xC5,
            Self::PersistentSubscriptionConfirmation => 0xC6,
            Self::PersistentSubscriptionStreamEventAppeared => 0xC7,
            Self::CreatePersistentSubscription => 0xC8,
            Self::CreatePersistentSubscriptionCompleted => 0xC9,
            Self::BadRequest => 0xF0,
            Self::NotHandled => 0xF1,
            Self::Authenticate => 0xF2,
            Self::Authenticated => 0xF3,
            Self::NotAuthenticated => 0xF4,
            Self::IdentifyClient => 0xF5,
            Self::ClientIdentified => 0xF6,
            Self::Unknown(byte) => byte,
        }
    }

    /// Parse a command from its wire byte.
    #[must_use]
    pub fn from_u8(byte: u8) -> Self {
        match byte {
            0x01 => Self::HeartbeatRequest,
            0x02 => Self::HeartbeatResponse,
            0x03 => Self::Ping,
            0x04 => Self::Pong,
            0x82 => Self::WriteEvents,
            0x83 => Self::WriteEventsCompleted,
            0x8A => Self::DeleteStream,
            0x8B => Self::DeleteStreamCompleted,
            0xB0 => Self::ReadEvent,
            0xB1 => Self::ReadEventCompleted,
            0xB2 => Self::ReadStreamEventsForward,
            0xB3 => Self::ReadStreamEventsForwardCompleted,
            0xB4 => Self::ReadStreamEventsBackward,
            0xB5 => Self::ReadStreamEventsBackwardCompleted,
            0xB6 => Self::ReadAllEventsForward,
            0xB7 => Self::ReadAllEventsForwardCompleted,
            0xB8 => Self::ReadAllEventsBackward,
            0xB9 => Self::ReadAllEventsBackwardCompleted,
            0xC0 => Self::SubscribeToStream,
            0xC1 => Self::SubscriptionConfirmation,
            0xC2 => Self::StreamEventAppeared,
            0xC3 => Self::UnsubscribeFromStream,
            0xC4 => Self::SubscriptionDropped,
            0xC5 => Self::ConnectToPersistentSubscription,
            0xC6 => Self::PersistentSubscriptionConfirmation,
            0xC7 => Self::PersistentSubscriptionStreamEventAppeared,
            0xC8 => Self::CreatePersistentSubscription,
            0xC9 => Self::CreatePersistentSubscriptionCompleted,
            0xF0 => Self::BadRequest,
            0xF1 => Self::NotHandled,
            0xF2 => Self::Authenticate,
            0xF3 => Self::Authenticated,
            0xF4 => Self::NotAuthenticated,
            0xF5 => Self::IdentifyClient,
            0xF6 => Self::ClientIdentified,
            other => Self::Unknown(other),
        }
    }
}

// =============================================================================
// CREDENTIALS
// =============================================================================

/// Login and password attached to authenticated frames.
///
/// Each field is limited to 255 bytes by the one-byte length prefix on the
/// wire; the limit is checked here so encoding never fails later.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    login: String,
    password: String,
}

impl Credentials {
    /// Build credentials, rejecting fields that do not fit on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::CredentialTooLong`] when either field exceeds 255 bytes.
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Result<Self, CodecError> {
        let login = login.into();
        let password = password.into();
        check_credential_len("login", &login)?;
        check_credential_len("password", &password)?;
        Ok(Self { login, password })
    }

    #[must_use]
    pub fn login(&self) -> &str {
        &self.login
    }

    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    fn encoded_len(&self) -> usize {
        2 + self.login.len() + self.password.len()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn check_credential_len(field: &'static str, value: &str) -> Result<(), CodecError> {
    if value.len() > usize::from(u8::MAX) {
        return Err(CodecError::CredentialTooLong { field, len: value.len() });
    }
    Ok(())
}

// =============================================================================
// FRAME
// =============================================================================

/// A single message on the store's TCP protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Operation or control code.
    pub command: Command,
    /// Identifier echoed by the server on every reply to this frame.
    pub correlation_id: Uuid,
    /// Present when the frame is sent on behalf of an authenticated user.
    pub credentials: Option<Credentials>,
    /// Opaque payload, usually a protobuf message.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame with a freshly generated correlation id.
    pub fn new(command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            correlation_id: Uuid::new_v4(),
            credentials: None,
            payload: payload.into(),
        }
    }

    /// Reply to a server heartbeat, echoing its correlation id.
    #[must_use]
    pub fn heartbeat_response(correlation_id: Uuid) -> Self {
        Self::new(Command::HeartbeatResponse, Bytes::new()).with_correlation_id(correlation_id)
    }

    /// A keepalive ping with a new correlation id.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(Command::Ping, Bytes::new())
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Length of the encoded body, excluding the socket length prefix.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.credentials.as_ref().map_or(0, Credentials::encoded_len) + self.payload.len()
    }
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

/// Encode a frame body (without the length prefix).
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(frame.encoded_len());
    write_body(frame, &mut out);
    out.to_vec()
}

/// Decode a frame body (without the length prefix).
///
/// # Errors
///
/// Returns [`CodecError::Truncated`] when the body is shorter than its
/// header or declared credentials, and [`CodecError::InvalidCredential`]
/// when credentials are not UTF-8.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    parse_body(Bytes::copy_from_slice(bytes))
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) fn write_body(frame: &Frame, out: &mut BytesMut) {
    out.put_u8(frame.command.as_u8());
    match &frame.credentials {
        Some(credentials) => {
            out.put_u8(FLAG_AUTHENTICATED);
            out.put_slice(&frame.correlation_id.to_bytes_le());
            // Lengths are bounded by `Credentials::new`.
            out.put_u8(credentials.login.len() as u8);
            out.put_slice(credentials.login.as_bytes());
            out.put_u8(credentials.password.len() as u8);
            out.put_slice(credentials.password.as_bytes());
        }
        None => {
            out.put_u8(0);
            out.put_slice(&frame.correlation_id.to_bytes_le());
        }
    }
    out.put_slice(&frame.payload);
}

pub(crate) fn parse_body(body: Bytes) -> Result<Frame, CodecError> {
    if body.len() < HEADER_LEN {
        return Err(CodecError::Truncated { needed: HEADER_LEN, available: body.len() });
    }

    let command = Command::from_u8(body[0]);
    let flags = body[1];
    let mut id = [0u8; CORRELATION_ID_LEN];
    id.copy_from_slice(&body[2..HEADER_LEN]);
    let correlation_id = Uuid::from_bytes_le(id);

    let mut offset = HEADER_LEN;
    let credentials = if flags & FLAG_AUTHENTICATED == 0 {
        None
    } else {
        let login = read_credential(&body, &mut offset, "login")?;
        let password = read_credential(&body, &mut offset, "password")?;
        Some(Credentials { login, password })
    };

    Ok(Frame { command, correlation_id, credentials, payload: body.slice(offset..) })
}

fn read_credential(body: &Bytes, offset: &mut usize, field: &'static str) -> Result<String, CodecError> {
    let Some(&len) = body.get(*offset) else {
        return Err(CodecError::Truncated { needed: *offset + 1, available: body.len() });
    };
    let start = *offset + 1;
    let end = start + usize::from(len);
    let Some(raw) = body.get(start..end) else {
        return Err(CodecError::Truncated { needed: end, available: body.len() });
    };
    *offset = end;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidCredential { field })
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
