//! Publish/subscribe contracts (mechanics only).
//!
//! Delivery is **at-least-once**: a message that is not acked (or is nak'd)
//! comes back, so consumers must be idempotent. Ordering is best-effort FIFO
//! per subject within one consumer; there is no ordering across subjects or
//! across members of a queue group.
//!
//! ```text
//! Publisher ──publish──▶ broker stream ──fetch──▶ pump ──channel──▶ Subscription
//!                                                                     └─ ack / nak / term
//! ```
//!
//! ## Publishing
//!
//! Publishers own two fields of every change and event: `source` is always
//! overwritten with the publisher's configured name, and an empty `actorID`
//! on a change is filled from the task's identity. Everything else, trace
//! identifiers included, reaches subscribers exactly as the caller set it.
//! The publisher's trace travels in the `traceparent` header.
//!
//! ## Subscribing
//!
//! Each subscription is served by its own pump task (see [`crate::pump`]).
//! Cancel the token passed at subscribe time, or drop the [`Subscription`], to
//! stop it. The subscription also ends when its connection is drained or
//! closed. In every case the channel closes and `recv` returns `None`.
//!
//! ## Request/reply
//!
//! Auth relationship requests are not persisted. A request with nobody
//! listening fails at once with `Error::NoResponders`; one that gets no
//! answer in time fails with `Error::RequestTimeout`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use courier_core::Result;

use crate::{AuthRelationshipRequest, AuthRelationshipResponse, ChangeMessage, EventMessage, Message};

/// Typed stream of messages for one subscription.
///
/// `recv` returning `None` means the subscription ended: its token was
/// cancelled or the broker side went away. Dropping the subscription stops
/// its pump.
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: mpsc::Receiver<Message<T>>,
}

impl<T> Subscription<T> {
    pub fn new(receiver: mpsc::Receiver<Message<T>>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<Message<T>> {
        self.receiver.recv().await
    }

    /// Take a message if one is buffered.
    pub fn try_recv(&mut self) -> core::result::Result<Message<T>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Messages already buffered and waiting to be read.
    pub fn buffered(&self) -> usize {
        self.receiver.len()
    }

    pub fn into_stream(self) -> ReceiverStream<Message<T>> {
        ReceiverStream::new(self.receiver)
    }
}

/// Fire-and-forget publishing of changes and events.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish on `[prefix.]changes.<eventType>.<topic>`.
    async fn publish_change(&self, topic: &str, change: ChangeMessage) -> Result<()>;

    /// Publish on `[prefix.]events.<eventType>.<topic>`.
    async fn publish_event(&self, topic: &str, event: EventMessage) -> Result<()>;
}

/// Durable (queue group) or ephemeral subscriptions to changes and events.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to `[prefix.]changes.<topic>`; `topic` may use `*` and `>`.
    async fn subscribe_changes(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription<ChangeMessage>>;

    /// Subscribe to `[prefix.]events.<topic>`; `topic` may use `*` and `>`.
    async fn subscribe_events(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription<EventMessage>>;
}

/// Request side of the auth relationship exchange.
#[async_trait]
pub trait AuthRelationshipPublisher: Send + Sync {
    /// Send `request` and wait up to `timeout` for the correlated response.
    async fn publish_auth_relationship_request(
        &self,
        topic: &str,
        request: AuthRelationshipRequest,
        timeout: Duration,
    ) -> Result<Message<AuthRelationshipResponse>>;
}

/// Serving side of the auth relationship exchange.
#[async_trait]
pub trait AuthRelationshipSubscriber: Send + Sync {
    async fn subscribe_auth_relationship_requests(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription<AuthRelationshipRequest>>;
}

#[async_trait]
impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    async fn publish_change(&self, topic: &str, change: ChangeMessage) -> Result<()> {
        (**self).publish_change(topic, change).await
    }

    async fn publish_event(&self, topic: &str, event: EventMessage) -> Result<()> {
        (**self).publish_event(topic, event).await
    }
}

#[async_trait]
impl<S> Subscriber for Arc<S>
where
    S: Subscriber + ?Sized,
{
    async fn subscribe_changes(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription<ChangeMessage>> {
        (**self).subscribe_changes(topic, cancel).await
    }

    async fn subscribe_events(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription<EventMessage>> {
        (**self).subscribe_events(topic, cancel).await
    }
}
