//! Subscription handle returned by `Connection::subscribe`.

use std::fmt;

use frames::Frame;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::ConnectionError;

/// A live server push stream keyed by its correlation id.
///
/// The stream ends after a `SubscriptionDropped` frame, which the server
/// sends on its own or the connection synthesizes on teardown. Dropping the
/// handle stops routing without telling the server; use `unsubscribe` for that.
pub struct Subscription {
    correlation_id: Uuid,
    serial: u64,
    rx: mpsc::UnboundedReceiver<Frame>,
    connection: Connection,
}

impl Subscription {
    pub(crate) fn new(
        correlation_id: Uuid,
        serial: u64,
        rx: mpsc::UnboundedReceiver<Frame>,
        connection: Connection,
    ) -> Self {
        Self { correlation_id, serial, rx, connection }
    }

    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Next pushed frame, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Stop routing and ask the server to end the subscription.
    ///
    /// # Errors
    ///
    /// Returns the write error if the unsubscribe notice could not be sent.
    pub async fn unsubscribe(self) -> Result<(), ConnectionError> {
        self.connection.inner.subscriptions.release(&self.correlation_id, self.serial);
        let notice = Frame::unsubscribe(self.correlation_id, self.connection.credentials().cloned());
        self.connection.transmit(notice).await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.connection.inner.subscriptions.release(&self.correlation_id, self.serial);
    }
}
