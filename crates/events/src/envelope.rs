//! Received messages and their settlement.
//!
//! A [`Message<T>`] wraps one broker [`Delivery`] and the payload decoded from
//! it. Decoding happens once, when the pump receives the delivery.
//!
//! ## Decode failures
//!
//! A payload that does not decode into `T` does not end the subscription. The
//! message is still handed to the caller with [`Message::error`] set and
//! [`Message::payload`] empty, so the caller decides whether to `term` it
//! (poison message) or `nak` it (a newer consumer may understand it).
//!
//! ## Settlement
//!
//! `ack`, `nak` and `term` are mutually exclusive. The first call that
//! reaches the broker settles the message; every later call returns
//! `Error::AlreadySettled` without another round trip. A call that fails at
//! the broker leaves the message unsettled and can be retried.
//!
//! ```text
//! unsettled ──ack──▶ acked
//!     │ ├────nak──▶ redelivered later (delivery count + 1)
//!     │ └───term──▶ never redelivered
//!     └─ broker error: still unsettled
//! ```
//!
//! ## Metadata
//!
//! Stream position, delivery count and broker timestamp are read from the
//! delivery on first access and cached;
//! deliveries that did not come from a stream (auth relationship replies)
//! return `Error::NotStreamMessage`.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use courier_core::{Error, Result};
use courier_observability::{TRACEPARENT_HEADER, TraceContext};

/// Header carrying the publisher-assigned message id.
pub const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";

/// Stream position and redelivery state of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub stream: String,
    pub consumer: String,
    /// Position in the stream (stable across redeliveries).
    pub stream_sequence: u64,
    /// Position in this consumer's delivery order.
    pub consumer_sequence: u64,
    /// When the broker stored the message.
    pub timestamp: DateTime<Utc>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivered: u64,
    /// Messages left for this consumer after this one.
    pub pending: u64,
}

/// A raw delivery from the broker, before decoding.
///
/// Implemented by each transport. `ack`, `nak` and `term` talk to the broker;
/// transports without acknowledgements treat them as no-ops.
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    fn subject(&self) -> &str;

    fn payload(&self) -> &[u8];

    fn header(&self, name: &str) -> Option<&str>;

    /// Address a response should be sent to, if this delivery is a request.
    fn reply_subject(&self) -> Option<&str>;

    /// Stream metadata; `Error::NotStreamMessage` for non-persistent deliveries.
    fn metadata(&self) -> Result<DeliveryMetadata>;

    async fn ack(&self) -> Result<()>;

    async fn nak(&self, delay: Duration) -> Result<()>;

    async fn term(&self) -> Result<()>;

    /// Publish `payload` to this delivery's reply subject.
    async fn respond(&self, headers: HashMap<String, String>, payload: Vec<u8>) -> Result<()>;
}

/// A delivery decoded into `T`.
///
/// Decoding never fails the stream: a malformed payload yields a message whose
/// [`payload`](Message::payload) is `None` and whose [`error`](Message::error)
/// says why. Check the error before trusting the payload.
///
/// `ack`, `nak` and `term` settle the message. The first one to succeed wins;
/// any later call returns `Error::AlreadySettled` without reaching the broker.
pub struct Message<T> {
    delivery: Box<dyn Delivery>,
    payload: core::result::Result<T, Error>,
    metadata: OnceLock<DeliveryMetadata>,
    settled: AtomicBool,
}

impl<T> Message<T>
where
    T: DeserializeOwned,
{
    pub fn decode(delivery: Box<dyn Delivery>) -> Self {
        let payload = serde_json::from_slice(delivery.payload())
            .map_err(|err| Error::decode(format!("{}: {err}", delivery.subject())));

        Self {
            delivery,
            payload,
            metadata: OnceLock::new(),
            settled: AtomicBool::new(false),
        }
    }
}

impl<T> Message<T> {
    /// Publisher-assigned id, falling back to `<stream>:<sequence>`.
    pub fn id(&self) -> String {
        if let Some(id) = self.delivery.header(MESSAGE_ID_HEADER) {
            return id.to_string();
        }
        match self.metadata() {
            Ok(meta) => format!("{}:{}", meta.stream, meta.stream_sequence),
            Err(_) => String::new(),
        }
    }

    /// Subject the message was delivered on.
    pub fn topic(&self) -> &str {
        self.delivery.subject()
    }

    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref().ok()
    }

    /// Decode failure, if any.
    pub fn error(&self) -> Option<&Error> {
        self.payload.as_ref().err()
    }

    pub fn into_payload(self) -> Result<T> {
        self.payload
    }

    pub fn raw_payload(&self) -> &[u8] {
        self.delivery.payload()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.delivery.header(name)
    }

    pub fn reply_subject(&self) -> Option<&str> {
        self.delivery.reply_subject()
    }

    /// Trace context propagated by the publisher.
    pub fn trace_context(&self) -> Option<TraceContext> {
        self.header(TRACEPARENT_HEADER)
            .and_then(TraceContext::from_traceparent)
    }

    /// Stream metadata, resolved on first access and cached.
    pub fn metadata(&self) -> Result<&DeliveryMetadata> {
        if let Some(meta) = self.metadata.get() {
            return Ok(meta);
        }
        let meta = self.delivery.metadata()?;
        Ok(self.metadata.get_or_init(|| meta))
    }

    pub fn timestamp(&self) -> Result<DateTime<Utc>> {
        self.metadata().map(|m| m.timestamp)
    }

    pub fn delivery_count(&self) -> Result<u64> {
        self.metadata().map(|m| m.delivered)
    }

    pub fn sequence(&self) -> Result<u64> {
        self.metadata().map(|m| m.stream_sequence)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Mark the message processed.
    pub async fn ack(&self) -> Result<()> {
        self.settle(self.delivery.ack()).await
    }

    /// Ask for redelivery after `delay`.
    pub async fn nak(&self, delay: Duration) -> Result<()> {
        self.settle(self.delivery.nak(delay)).await
    }

    /// Stop redelivering this message for good.
    pub async fn term(&self) -> Result<()> {
        self.settle(self.delivery.term()).await
    }

    async fn settle<F>(&self, op: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadySettled);
        }

        let result = op.await;
        if result.is_err() {
            // Broker never saw it; the caller may try again.
            self.settled.store(false, Ordering::Release);
        }
        result
    }

    pub(crate) fn delivery(&self) -> &dyn Delivery {
        self.delivery.as_ref()
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic())
            .field("payload", &self.payload)
            .field("settled", &self.is_settled())
            .finish()
    }
}
