//! Broker deliveries behind the transport-agnostic [`Delivery`] trait.

use std::collections::HashMap;
use std::time::Duration;

use async_nats::HeaderMap;
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use courier_core::{Error, Result};
use courier_events::{Delivery, DeliveryMetadata};

/// A message pulled from a JetStream consumer.
pub(crate) struct JetStreamDelivery {
    message: jetstream::Message,
}

impl JetStreamDelivery {
    pub(crate) fn new(message: jetstream::Message) -> Self {
        Self { message }
    }
}

#[async_trait]
impl Delivery for JetStreamDelivery {
    fn subject(&self) -> &str {
        self.message.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        self.message.message.payload.as_ref()
    }

    fn header(&self, name: &str) -> Option<&str> {
        header(self.message.message.headers.as_ref(), name)
    }

    // The reply subject of a stream message is its ack address.
    fn reply_subject(&self) -> Option<&str> {
        None
    }

    fn metadata(&self) -> Result<DeliveryMetadata> {
        let info = self
            .message
            .info()
            .map_err(|e| Error::transport(format!("jetstream metadata: {e}")))?;

        Ok(DeliveryMetadata {
            stream: info.stream.to_string(),
            consumer: info.consumer.to_string(),
            stream_sequence: info.stream_sequence,
            consumer_sequence: info.consumer_sequence,
            timestamp: to_chrono(info.published),
            delivered: u64::try_from(info.delivered).unwrap_or_default(),
            pending: info.pending,
        })
    }

    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| Error::transport(format!("ack: {e}")))
    }

    async fn nak(&self, delay: Duration) -> Result<()> {
        let delay = (!delay.is_zero()).then_some(delay);
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| Error::transport(format!("nak: {e}")))
    }

    async fn term(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| Error::transport(format!("term: {e}")))
    }

    async fn respond(&self, _headers: HashMap<String, String>, _payload: Vec<u8>) -> Result<()> {
        Err(Error::MissingReplySubject)
    }
}

/// A core NATS message: no persistence, no acknowledgements.
///
/// Used for request/reply, where the reply subject is a requester's inbox.
pub(crate) struct CoreDelivery {
    message: async_nats::Message,
    client: async_nats::Client,
}

impl CoreDelivery {
    pub(crate) fn new(message: async_nats::Message, client: async_nats::Client) -> Self {
        Self { message, client }
    }
}

#[async_trait]
impl Delivery for CoreDelivery {
    fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    fn payload(&self) -> &[u8] {
        self.message.payload.as_ref()
    }

    fn header(&self, name: &str) -> Option<&str> {
        header(self.message.headers.as_ref(), name)
    }

    fn reply_subject(&self) -> Option<&str> {
        self.message.reply.as_ref().map(|s| s.as_str())
    }

    fn metadata(&self) -> Result<DeliveryMetadata> {
        Err(Error::NotStreamMessage)
    }

    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nak(&self, _delay: Duration) -> Result<()> {
        Ok(())
    }

    async fn term(&self) -> Result<()> {
        Ok(())
    }

    async fn respond(&self, headers: HashMap<String, String>, payload: Vec<u8>) -> Result<()> {
        let reply = self.message.reply.clone().ok_or(Error::MissingReplySubject)?;
        self.client
            .publish_with_headers(reply, header_map(&headers), Bytes::from(payload))
            .await
            .map_err(|e| Error::transport(format!("respond: {e}")))?;
        self.client
            .flush()
            .await
            .map_err(|e| Error::transport(format!("respond: {e}")))
    }
}

fn header<'a>(headers: Option<&'a HeaderMap>, name: &str) -> Option<&'a str> {
    headers?.get(name).map(|value| value.as_str())
}

pub(crate) fn header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

pub(crate) fn to_chrono(at: time::OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(at.unix_timestamp(), at.nanosecond()).unwrap_or_default()
}
