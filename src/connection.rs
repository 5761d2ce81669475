//! The connection facade.
//!
//! DESIGN
//! ======
//! `Connection` is a cheap `Clone` handle over shared `Inner` state. Every
//! public operation can be called concurrently from any task.
//!
//! Two cancellation tokens govern lifetimes:
//!
//! - the lifecycle token spans `connect` to `close` and interrupts backoff
//! - the socket token is a child of it and stops the reader of one socket
//!
//! `close` cancels the lifecycle token; the next `connect` installs a fresh one.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frames::{Credentials, Frame};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::{ConfigError, Configuration, Endpoint};
use crate::correlation::{CorrelationTable, PendingResponse, SubscriptionTable};
use crate::error::ConnectionError;
use crate::events::{ConnectionEvent, DisconnectReason};
use crate::socket::{self, ConnectionState, FrameWriter, SocketState};
use crate::subscription::Subscription;

const EVENT_CAPACITY: usize = 64;

// =============================================================================
// SHARED STATE
// =============================================================================

pub(crate) struct Inner {
    pub(crate) id: Uuid,
    pub(crate) config: Configuration,
    pub(crate) credentials: Option<Credentials>,
    endpoint: Mutex<Endpoint>,
    socket: Mutex<SocketState>,
    pub(crate) writer: tokio::sync::Mutex<Option<FrameWriter>>,
    pub(crate) requests: Arc<CorrelationTable>,
    pub(crate) subscriptions: SubscriptionTable,
    /// Serializes connect cycles.
    pub(crate) connect_lock: tokio::sync::Mutex<()>,
    lifecycle: Mutex<CancellationToken>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Inner {
    pub(crate) fn lock_socket(&self) -> MutexGuard<'_, SocketState> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.lock_socket().connected
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.lock_socket().state = state;
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        self.endpoint.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_endpoint(&self, endpoint: Endpoint) {
        *self.endpoint.lock().unwrap_or_else(PoisonError::into_inner) = endpoint;
    }

    pub(crate) fn lifecycle(&self) -> CancellationToken {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Current lifecycle token, replaced first if a previous `close` cancelled it.
    fn renew_lifecycle(&self) -> CancellationToken {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if lifecycle.is_cancelled() {
            *lifecycle = CancellationToken::new();
        }
        lifecycle.clone()
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

/// A single logical connection to an event-store node.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint())
            .field("state", &self.state())
            .field("pending", &self.inner.requests.len())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Validate `config` and build an unconnected connection.
    ///
    /// # Errors
    ///
    /// See [`Configuration::validate`].
    pub fn new(config: Configuration) -> Result<Self, ConfigError> {
        let credentials = config.validate()?;
        let endpoint = config.endpoint();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let id = Uuid::new_v4();

        info!(connection_id = %id, %endpoint, discovery = config.discoverer.is_some(), "connection created");

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                config,
                credentials,
                endpoint: Mutex::new(endpoint),
                socket: Mutex::new(SocketState::default()),
                writer: tokio::sync::Mutex::new(None),
                requests: Arc::new(CorrelationTable::default()),
                subscriptions: SubscriptionTable::default(),
                connect_lock: tokio::sync::Mutex::new(()),
                lifecycle: Mutex::new(CancellationToken::new()),
                events,
            }),
        })
    }

    /// Open the socket, resolving the endpoint first when a discoverer is set.
    ///
    /// A no-op when already connected.
    ///
    /// # Errors
    ///
    /// - `Discovery` when the initial discovery fails
    /// - `RetryLimitReached` after `max_reconnects` failed dials
    /// - `ConnectionClosed` when `close` interrupts the attempt
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let lifecycle = self.inner.renew_lifecycle();
        socket::connect_with_retry(&self.inner, &lifecycle).await
    }

    /// Close the socket and stop any reconnect in progress.
    ///
    /// Every subscription receives one `SubscriptionDropped` notice and every
    /// pending request fails with `ConnectionClosed`.
    ///
    /// # Errors
    ///
    /// Returns the error from closing the socket; teardown still completes.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.inner.lifecycle().cancel();
        let result = socket::disconnect(&self.inner, DisconnectReason::Closed).await;
        info!(connection_id = %self.inner.id, "connection closed");
        self.inner.emit(ConnectionEvent::Closed);
        result
    }

    /// Register `frame`'s correlation id, then write the frame.
    ///
    /// # Errors
    ///
    /// `DuplicateCorrelationId` if the id is already in flight; `NotConnected`
    /// or a codec error if the write fails, in which case the id is released.
    pub async fn send(&self, frame: Frame) -> Result<PendingResponse, ConnectionError> {
        let correlation_id = frame.correlation_id;
        if self.inner.subscriptions.contains(&correlation_id) {
            return Err(ConnectionError::DuplicateCorrelationId(correlation_id));
        }
        let pending = PendingResponse::register(&self.inner.requests, correlation_id)?;
        socket::write(&self.inner, frame).await?;
        Ok(pending)
    }

    /// `send` and wait for the response within the operation timeout.
    ///
    /// # Errors
    ///
    /// Errors from `send`, plus `Timeout` and `ConnectionClosed`.
    pub async fn request(&self, frame: Frame) -> Result<Frame, ConnectionError> {
        self.send(frame)
            .await?
            .recv_timeout(self.inner.config.operation_timeout)
            .await
    }

    /// Register a subscription under `frame`'s correlation id, then write the frame.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::send`].
    pub async fn subscribe(&self, frame: Frame) -> Result<Subscription, ConnectionError> {
        let correlation_id = frame.correlation_id;
        if self.inner.requests.contains(&correlation_id) {
            return Err(ConnectionError::DuplicateCorrelationId(correlation_id));
        }
        let (serial, rx) = self.inner.subscriptions.register(correlation_id)?;
        let subscription = Subscription::new(correlation_id, serial, rx, self.clone());
        socket::write(&self.inner, frame).await?;
        Ok(subscription)
    }

    /// Write a frame without waiting for anything back.
    ///
    /// # Errors
    ///
    /// `NotConnected` or a codec error.
    pub async fn transmit(&self, frame: Frame) -> Result<(), ConnectionError> {
        socket::write(&self.inner, frame).await
    }

    /// Round-trip a ping and return the elapsed time.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::request`].
    pub async fn ping(&self) -> Result<Duration, ConnectionError> {
        let started = Instant::now();
        self.request(Frame::ping()).await?;
        Ok(started.elapsed())
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock_socket().state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// The endpoint last dialed or discovered.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint()
    }

    #[must_use]
    pub fn credentials(&self) -> Option<&Credentials> {
        self.inner.credentials.as_ref()
    }

    #[must_use]
    pub fn configuration(&self) -> &Configuration {
        &self.inner.config
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;

    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use frames::FrameCodec;
    use futures::StreamExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::Framed;

    use crate::discovery::{DiscoveryError, EndpointDiscoverer};
    use crate::socket::{Dialer, TcpDialer};

    pub const WAIT: Duration = Duration::from_secs(5);

    pub type Peer = Framed<TcpStream, FrameCodec>;

    /// Loopback listener standing in for a store node.
    pub struct FakeServer {
        listener: TcpListener,
        pub endpoint: Endpoint,
    }

    impl FakeServer {
        pub async fn bind() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
            let port = listener.local_addr().expect("local addr").port();
            Self { listener, endpoint: Endpoint::new("127.0.0.1", port) }
        }

        pub async fn accept(&self) -> Peer {
            let (stream, _) = tokio::time::timeout(WAIT, self.listener.accept())
                .await
                .expect("accept timed out")
                .expect("accept");
            Framed::new(stream, FrameCodec::default())
        }
    }

    pub async fn recv_frame(peer: &mut Peer) -> Frame {
        tokio::time::timeout(WAIT, peer.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("decode frame")
    }

    /// Dialer that fails a fixed number of times before dialing for real,
    /// recording the instant of every attempt.
    pub struct FlakyDialer {
        failures_left: AtomicU32,
        attempts: Mutex<Vec<Instant>>,
    }

    impl FlakyDialer {
        #[must_use]
        pub fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self { failures_left: AtomicU32::new(failures), attempts: Mutex::new(Vec::new()) })
        }

        #[must_use]
        pub fn always_failing() -> Arc<Self> {
            Self::new(u32::MAX)
        }

        pub fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().expect("attempts lock").clone()
        }
    }

    #[async_trait]
    impl Dialer for FlakyDialer {
        async fn dial(&self, endpoint: &Endpoint) -> io::Result<TcpStream> {
            self.attempts.lock().expect("attempts lock").push(Instant::now());
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused by test dialer"));
            }
            TcpDialer.dial(endpoint).await
        }
    }

    /// Discoverer that answers from a fixed endpoint or always fails, counting calls.
    pub struct CountingDiscoverer {
        endpoint: Option<Endpoint>,
        calls: AtomicU32,
    }

    impl CountingDiscoverer {
        #[must_use]
        pub fn new(endpoint: Option<Endpoint>) -> Arc<Self> {
            Arc::new(Self { endpoint, calls: AtomicU32::new(0) })
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EndpointDiscoverer for CountingDiscoverer {
        async fn discover(&self) -> Result<Endpoint, DiscoveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.endpoint
                .clone()
                .ok_or_else(|| DiscoveryError::NoNodeAvailable("no nodes in test cluster".into()))
        }
    }

    #[must_use]
    pub fn test_config(endpoint: &Endpoint) -> Configuration {
        Configuration::new(endpoint.address.clone(), endpoint.port)
            .with_reconnection_delay(Duration::from_millis(20))
            .with_max_reconnects(3)
            .with_operation_timeout(Duration::from_secs(2))
    }

    /// A connected client plus the server side of its socket.
    pub async fn connected_pair() -> (Connection, Peer, FakeServer) {
        let server = FakeServer::bind().await;
        let connection = Connection::new(test_config(&server.endpoint)).expect("connection");
        connection.connect().await.expect("connect");
        let peer = server.accept().await;
        (connection, peer, server)
    }

    pub async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel")
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
