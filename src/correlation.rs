//! Correlation-id routing tables.
//!
//! DESIGN
//! ======
//! Two tables share the id space of a connection:
//!
//! - `CorrelationTable` maps an in-flight request to a one-shot reply
//!   channel. An entry is removed exactly once: on delivery, when the
//!   waiting `PendingResponse` is dropped (cancellation or timeout), or when
//!   the socket is torn down and every waiter is failed.
//! - `SubscriptionTable` maps a live subscription to an unbounded stream of
//!   pushed frames. Entries survive deliveries and end on a
//!   `SubscriptionDropped` frame, on unsubscribe or drop of the handle, or on
//!   teardown (each subscriber then receives a synthetic drop notice).
//!
//! Both wrap a `std::sync::Mutex<HashMap<..>>`; guards never cross an await.
//! Every entry carries a registration serial. Handles release their entry
//! only while the serial still matches, so a finished handle never evicts a
//! later registration that reuses its correlation id.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frames::messages::SubscriptionDropReason;
use frames::{Command, Credentials, Frame};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::ConnectionError;

type Reply = Result<Frame, ConnectionError>;

struct Slot<T> {
    serial: u64,
    tx: T,
}

/// Remove `correlation_id` only if it is still the registration numbered `serial`.
fn release<T>(map: &mut HashMap<Uuid, Slot<T>>, correlation_id: &Uuid, serial: u64) -> bool {
    if map.get(correlation_id).is_some_and(|slot| slot.serial == serial) {
        map.remove(correlation_id);
        return true;
    }
    false
}

// =============================================================================
// PENDING REQUESTS
// =============================================================================

#[derive(Default)]
pub(crate) struct CorrelationTable {
    pending: Mutex<HashMap<Uuid, Slot<oneshot::Sender<Reply>>>>,
    next_serial: AtomicU64,
}

impl CorrelationTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Slot<oneshot::Sender<Reply>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `correlation_id`. Returns the registration serial and the
    /// receiving end of the reply.
    pub(crate) fn register(&self, correlation_id: Uuid) -> Result<(u64, oneshot::Receiver<Reply>), ConnectionError> {
        match self.lock().entry(correlation_id) {
            Entry::Occupied(_) => Err(ConnectionError::DuplicateCorrelationId(correlation_id)),
            Entry::Vacant(slot) => {
                let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                slot.insert(Slot { serial, tx });
                Ok((serial, rx))
            }
        }
    }

    /// Hand `frame` to its waiter, removing the entry. Gives the frame back
    /// when nobody is waiting on its correlation id.
    pub(crate) fn complete(&self, frame: Frame) -> Result<(), Frame> {
        let Some(slot) = self.lock().remove(&frame.correlation_id) else {
            return Err(frame);
        };
        // A receiver that went away between lookup and send has nothing left to do.
        let _ = slot.tx.send(Ok(frame));
        Ok(())
    }

    pub(crate) fn release(&self, correlation_id: &Uuid, serial: u64) -> bool {
        release(&mut self.lock(), correlation_id, serial)
    }

    pub(crate) fn contains(&self, correlation_id: &Uuid) -> bool {
        self.lock().contains_key(correlation_id)
    }

    /// Fail every waiter with `ConnectionClosed` and empty the table.
    pub(crate) fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, slot) in drained {
            let _ = slot.tx.send(Err(ConnectionError::ConnectionClosed));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Handle to a request awaiting its response.
///
/// Dropping the handle before the response arrives releases the correlation id.
pub struct PendingResponse {
    correlation_id: Uuid,
    serial: u64,
    rx: oneshot::Receiver<Reply>,
    table: Arc<CorrelationTable>,
}

impl PendingResponse {
    pub(crate) fn register(table: &Arc<CorrelationTable>, correlation_id: Uuid) -> Result<Self, ConnectionError> {
        let (serial, rx) = table.register(correlation_id)?;
        Ok(Self { correlation_id, serial, rx, table: Arc::clone(table) })
    }

    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Wait for the response.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the socket was torn down first.
    pub async fn recv(mut self) -> Result<Frame, ConnectionError> {
        (&mut self.rx)
            .await
            .unwrap_or(Err(ConnectionError::ConnectionClosed))
    }

    /// Wait for the response for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when the deadline passes; the correlation id is released.
    pub async fn recv_timeout(self, timeout: Duration) -> Result<Frame, ConnectionError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .unwrap_or(Err(ConnectionError::Timeout(timeout)))
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.table.release(&self.correlation_id, self.serial);
    }
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

#[derive(Default)]
pub(crate) struct SubscriptionTable {
    live: Mutex<HashMap<Uuid, Slot<mpsc::UnboundedSender<Frame>>>>,
    next_serial: AtomicU64,
}

impl SubscriptionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Slot<mpsc::UnboundedSender<Frame>>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(
        &self,
        correlation_id: Uuid,
    ) -> Result<(u64, mpsc::UnboundedReceiver<Frame>), ConnectionError> {
        match self.lock().entry(correlation_id) {
            Entry::Occupied(_) => Err(ConnectionError::DuplicateCorrelationId(correlation_id)),
            Entry::Vacant(slot) => {
                let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = mpsc::unbounded_channel();
                slot.insert(Slot { serial, tx });
                Ok((serial, rx))
            }
        }
    }

    /// Push `frame` to its subscriber. A `SubscriptionDropped` frame ends the
    /// subscription after delivery. Gives the frame back when no subscription
    /// owns its correlation id.
    pub(crate) fn deliver(&self, frame: Frame) -> Result<(), Frame> {
        let mut live = self.lock();
        let Some(slot) = live.get(&frame.correlation_id) else {
            return Err(frame);
        };
        let correlation_id = frame.correlation_id;
        let ends = frame.command == Command::SubscriptionDropped;
        if slot.tx.send(frame).is_err() || ends {
            live.remove(&correlation_id);
        }
        Ok(())
    }

    pub(crate) fn release(&self, correlation_id: &Uuid, serial: u64) -> bool {
        release(&mut self.lock(), correlation_id, serial)
    }

    pub(crate) fn contains(&self, correlation_id: &Uuid) -> bool {
        self.lock().contains_key(correlation_id)
    }

    /// Send every subscriber one `SubscriptionDropped` notice carrying its own
    /// correlation id, then empty the table.
    pub(crate) fn drop_all(&self, credentials: Option<&Credentials>) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (correlation_id, slot) in drained {
            let notice = Frame::subscription_dropped(
                correlation_id,
                SubscriptionDropReason::Unsubscribed,
                credentials.cloned(),
            );
            let _ = slot.tx.send(notice);
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
#[path = "correlation_test.rs"]
mod tests;
