//! Connection layer of an event-store TCP client.
//!
//! DESIGN
//! ======
//! A `Connection` owns one long-lived socket and multiplexes many concurrent
//! exchanges over it:
//!
//! - request/response pairs, matched by correlation id (`send`, `request`)
//! - server push streams (`subscribe`)
//! - heartbeat requests, answered by the reader off its dispatch path
//!
//! When the server ends the stream the connection reconnects on its own,
//! optionally re-resolving its endpoint through an `EndpointDiscoverer`.
//!
//! Frames and the wire codec live in the `frames` crate.

mod config;
mod connection;
mod correlation;
mod discovery;
mod error;
mod events;
mod reader;
mod socket;
mod subscription;

pub use config::{
    ConfigError, Configuration, DEFAULT_MAX_OPERATION_RETRIES, DEFAULT_MAX_RECONNECTS, DEFAULT_OPERATION_TIMEOUT_MS,
    DEFAULT_RECONNECTION_DELAY_MS, Endpoint,
};
pub use connection::Connection;
pub use correlation::PendingResponse;
pub use discovery::{DiscoveryError, EndpointDiscoverer, StaticDiscoverer};
pub use error::ConnectionError;
pub use events::{ConnectionEvent, DisconnectReason};
pub use socket::{ConnectionState, Dialer, TcpDialer};
pub use subscription::Subscription;

pub use frames::{Command, Credentials, Frame};
