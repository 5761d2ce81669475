//! Protobuf control messages the connection layer builds itself.
//!
//! Operation payloads (writes, reads, subscribe requests) are encoded by the
//! higher-level operation builders; only the subscription teardown messages
//! are needed here.

use bytes::Bytes;
use prost::Message;
use uuid::Uuid;

use crate::{Command, Credentials, Frame};

/// Why a subscription stopped receiving events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum SubscriptionDropReason {
    Unsubscribed = 0,
    AccessDenied = 1,
    NotFound = 2,
    PersistentSubscriptionDeleted = 3,
    SubscriberMaxCountReached = 4,
}

/// Payload of a [`Command::SubscriptionDropped`] frame.
#[derive(Clone, PartialEq, Message)]
pub struct SubscriptionDropped {
    #[prost(enumeration = "SubscriptionDropReason", optional, tag = "1")]
    pub reason: Option<i32>,
}

/// Payload of a [`Command::UnsubscribeFromStream`] frame. Carries no fields.
#[derive(Clone, PartialEq, Message)]
pub struct UnsubscribeFromStream {}

impl Frame {
    /// Build the drop notification delivered to a subscriber.
    #[must_use]
    pub fn subscription_dropped(
        correlation_id: Uuid,
        reason: SubscriptionDropReason,
        credentials: Option<Credentials>,
    ) -> Self {
        let payload = SubscriptionDropped { reason: Some(reason as i32) }.encode_to_vec();
        Self::new(Command::SubscriptionDropped, payload)
            .with_correlation_id(correlation_id)
            .with_credentials(credentials)
    }

    /// Build the request that ends a volatile subscription server-side.
    #[must_use]
    pub fn unsubscribe(correlation_id: Uuid, credentials: Option<Credentials>) -> Self {
        Self::new(Command::UnsubscribeFromStream, UnsubscribeFromStream {}.encode_to_vec())
            .with_correlation_id(correlation_id)
            .with_credentials(credentials)
    }

    /// Decode the drop reason carried by a [`Command::SubscriptionDropped`] frame.
    ///
    /// Returns `None` for other commands or undecodable payloads.
    #[must_use]
    pub fn drop_reason(&self) -> Option<SubscriptionDropReason> {
        if self.command != Command::SubscriptionDropped {
            return None;
        }
        let message = SubscriptionDropped::decode(Bytes::clone(&self.payload)).ok()?;
        SubscriptionDropReason::try_from(message.reason.unwrap_or_default()).ok()
    }
}
