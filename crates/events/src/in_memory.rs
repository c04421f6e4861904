//! In-memory stream for tests/dev.
//!
//! Behaves like a single work-queue stream with explicit acks:
//! - sequences start at 1
//! - a fetched message stays in flight until acked, nak'd or terminated
//! - nak puts it back (after the delay) with its delivery count bumped
//! - [`InMemoryStream::close`] ends every consumer, like a drained connection
//!
//! No IO. Also implements [`Publisher`] and [`Subscriber`] so code written
//! against the bus traits can run without a broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use courier_core::{Error, Result, Subject, SubjectFamily};
use courier_observability::TRACEPARENT_HEADER;

use crate::bus::{Publisher, Subscriber, Subscription};
use crate::envelope::{Delivery, DeliveryMetadata};
use crate::pump::{self, PullSource, PumpConfig};
use crate::{ChangeMessage, EventMessage};

const STREAM_NAME: &str = "in-memory";
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A response sent through [`Delivery::respond`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedResponse {
    pub reply_subject: String,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Stored {
    sequence: u64,
    subject: String,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
    reply: Option<String>,
    timestamp: DateTime<Utc>,
    delivered: u64,
    available_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    last_sequence: u64,
    consumer_sequence: u64,
    ready: Vec<Stored>,
    in_flight: HashMap<u64, Stored>,
    failing_fetches: usize,
    unsubscribed: usize,
    closed: bool,
    responses: Vec<RecordedResponse>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    published: Notify,
}

/// In-memory stream. Cloning shares the same storage.
#[derive(Debug, Clone)]
pub struct InMemoryStream {
    shared: Arc<Shared>,
    source: String,
    pump: PumpConfig,
}

impl Default for InMemoryStream {
    fn default() -> Self {
        Self {
            shared: Arc::default(),
            source: STREAM_NAME.to_string(),
            pump: PumpConfig {
                fetch_timeout: Duration::from_millis(50),
                backoff: Duration::from_millis(50),
                ..PumpConfig::default()
            },
        }
    }
}

impl InMemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name stamped as `source` by the [`Publisher`] impl.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Pump settings used by the [`Subscriber`] impl.
    pub fn with_pump_config(mut self, config: PumpConfig) -> Self {
        self.pump = config;
        self
    }

    /// Append a raw message; returns its stream sequence.
    pub fn publish(&self, subject: &str, payload: Vec<u8>, headers: HashMap<String, String>) -> u64 {
        self.append(subject, payload, headers, None)
    }

    pub fn publish_json<T: Serialize>(&self, subject: &str, value: &T) -> Result<u64> {
        let payload = serde_json::to_vec(value)?;
        Ok(self.publish(subject, payload, HashMap::new()))
    }

    /// Append a message that expects a response on `reply_subject`.
    pub fn publish_request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
        reply_subject: &str,
    ) -> u64 {
        self.append(subject, payload, headers, Some(reply_subject.to_string()))
    }

    /// A pull consumer over messages whose subject matches `filter`.
    pub fn consumer(&self, filter: &str) -> InMemoryConsumer {
        InMemoryConsumer {
            stream: self.clone(),
            filter: filter.to_string(),
        }
    }

    /// Messages not yet acked or terminated.
    pub fn pending(&self) -> usize {
        let state = self.state();
        state.ready.len() + state.in_flight.len()
    }

    /// Messages fetched but not yet settled.
    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Make the next `n` fetches fail with a transport error.
    pub fn fail_next_fetches(&self, n: usize) {
        self.state().failing_fetches = n;
    }

    /// Close the stream: fetches and publishes fail with
    /// `Error::ConnectionClosed` from now on.
    pub fn close(&self) {
        self.state().closed = true;
        self.shared.published.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// How many consumers have unsubscribed.
    pub fn unsubscribed(&self) -> usize {
        self.state().unsubscribed
    }

    pub fn responses(&self) -> Vec<RecordedResponse> {
        self.state().responses.clone()
    }

    fn append(
        &self,
        subject: &str,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
        reply: Option<String>,
    ) -> u64 {
        let sequence = {
            let mut state = self.state();
            state.last_sequence += 1;
            let sequence = state.last_sequence;
            state.ready.push(Stored {
                sequence,
                subject: subject.to_string(),
                payload,
                headers,
                reply,
                timestamp: Utc::now(),
                delivered: 0,
                available_at: Instant::now(),
            });
            sequence
        };
        self.shared.published.notify_waiters();
        sequence
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_ready(&self, filter: &str, max: usize) -> Result<Vec<Box<dyn Delivery>>> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(Error::transport("in-memory stream: injected fetch failure"));
        }

        let now = Instant::now();
        let mut taken = Vec::new();
        let mut idx = 0;
        while idx < state.ready.len() && taken.len() < max {
            let candidate = &state.ready[idx];
            if candidate.available_at <= now && courier_core::matches(filter, &candidate.subject) {
                taken.push(state.ready.remove(idx));
            } else {
                idx += 1;
            }
        }

        let pending_after = state
            .ready
            .iter()
            .filter(|m| courier_core::matches(filter, &m.subject))
            .count() as u64;

        let mut out: Vec<Box<dyn Delivery>> = Vec::with_capacity(taken.len());
        for mut stored in taken {
            stored.delivered += 1;
            state.consumer_sequence += 1;
            let metadata = DeliveryMetadata {
                stream: STREAM_NAME.to_string(),
                consumer: filter.to_string(),
                stream_sequence: stored.sequence,
                consumer_sequence: state.consumer_sequence,
                timestamp: stored.timestamp,
                delivered: stored.delivered,
                pending: pending_after,
            };
            out.push(Box::new(InMemoryDelivery {
                stream: self.clone(),
                subject: stored.subject.clone(),
                payload: stored.payload.clone(),
                headers: stored.headers.clone(),
                reply: stored.reply.clone(),
                metadata,
            }));
            state.in_flight.insert(stored.sequence, stored);
        }
        Ok(out)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn settle(&self, sequence: u64) {
        self.state().in_flight.remove(&sequence);
    }

    fn requeue(&self, sequence: u64, delay: Duration) {
        {
            let mut state = self.state();
            let Some(mut stored) = state.in_flight.remove(&sequence) else {
                return;
            };
            stored.available_at = Instant::now() + delay;
            let pos = state.ready.partition_point(|m| m.sequence < sequence);
            state.ready.insert(pos, stored);
        }
        self.shared.published.notify_waiters();
    }
}

/// Pull consumer handed out by [`InMemoryStream::consumer`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    stream: InMemoryStream,
    filter: String,
}

#[async_trait]
impl PullSource for InMemoryConsumer {
    fn subject(&self) -> &str {
        &self.filter
    }

    async fn fetch(&mut self, max: usize, expires: Duration) -> Result<Vec<Box<dyn Delivery>>> {
        let deadline = Instant::now() + expires;
        loop {
            let batch = self.stream.take_ready(&self.filter, max)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            // Nak'd messages become ready without a notification; poll as well.
            let wait = (deadline - now).min(POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, self.stream.shared.published.notified()).await;
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.stream.state().unsubscribed += 1;
        Ok(())
    }
}

struct InMemoryDelivery {
    stream: InMemoryStream,
    subject: String,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
    reply: Option<String>,
    metadata: DeliveryMetadata,
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn reply_subject(&self) -> Option<&str> {
        self.reply.as_deref()
    }

    fn metadata(&self) -> Result<DeliveryMetadata> {
        Ok(self.metadata.clone())
    }

    async fn ack(&self) -> Result<()> {
        self.stream.settle(self.metadata.stream_sequence);
        Ok(())
    }

    async fn nak(&self, delay: Duration) -> Result<()> {
        self.stream.requeue(self.metadata.stream_sequence, delay);
        Ok(())
    }

    async fn term(&self) -> Result<()> {
        self.stream.settle(self.metadata.stream_sequence);
        Ok(())
    }

    async fn respond(&self, headers: HashMap<String, String>, payload: Vec<u8>) -> Result<()> {
        let reply_subject = self.reply.clone().ok_or(Error::MissingReplySubject)?;
        self.stream.state().responses.push(RecordedResponse {
            reply_subject,
            headers,
            payload,
        });
        Ok(())
    }
}

#[async_trait]
impl Publisher for InMemoryStream {
    async fn publish_change(&self, topic: &str, mut change: ChangeMessage) -> Result<()> {
        let ctx = change.prepare(&self.source)?;
        self.ensure_open()?;
        let subject = Subject::publish("", SubjectFamily::Changes, &change.event_type, topic)?;
        let headers = HashMap::from([(TRACEPARENT_HEADER.to_string(), ctx.to_traceparent())]);
        self.publish(subject.as_str(), serde_json::to_vec(&change)?, headers);
        Ok(())
    }

    async fn publish_event(&self, topic: &str, mut event: EventMessage) -> Result<()> {
        let ctx = event.prepare(&self.source)?;
        self.ensure_open()?;
        let subject = Subject::publish("", SubjectFamily::Events, &event.event_type, topic)?;
        let headers = HashMap::from([(TRACEPARENT_HEADER.to_string(), ctx.to_traceparent())]);
        self.publish(subject.as_str(), serde_json::to_vec(&event)?, headers);
        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryStream {
    async fn subscribe_changes(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription<ChangeMessage>> {
        let subject = Subject::subscribe("", SubjectFamily::Changes, topic)?;
        Ok(pump::spawn(self.consumer(subject.as_str()), self.pump.clone(), cancel))
    }

    async fn subscribe_events(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription<EventMessage>> {
        let subject = Subject::subscribe("", SubjectFamily::Events, topic)?;
        Ok(pump::spawn(self.consumer(subject.as_str()), self.pump.clone(), cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_auth::{ActorId, UNKNOWN_ACTOR, with_actor};

    #[tokio::test]
    async fn fetch_expires_empty_without_error() {
        let stream = InMemoryStream::new();
        let mut consumer = stream.consumer(">");
        let batch = consumer.fetch(5, Duration::from_millis(20)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn fetch_respects_filter() {
        let stream = InMemoryStream::new();
        stream.publish("changes.create.lb", b"{}".to_vec(), HashMap::new());
        stream.publish("events.rotated.cert", b"{}".to_vec(), HashMap::new());

        let mut consumer = stream.consumer("events.>");
        let batch = consumer.fetch(5, Duration::from_millis(20)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject(), "events.rotated.cert");
        assert_eq!(stream.in_flight(), 1);
        assert_eq!(stream.pending(), 2);
    }

    #[tokio::test]
    async fn nak_delay_holds_message_back() {
        let stream = InMemoryStream::new();
        stream.publish("changes.create.lb", b"{}".to_vec(), HashMap::new());

        let mut consumer = stream.consumer(">");
        let batch = consumer.fetch(1, Duration::from_millis(20)).await.unwrap();
        batch[0].nak(Duration::from_millis(100)).await.unwrap();

        let early = consumer.fetch(1, Duration::from_millis(10)).await.unwrap();
        assert!(early.is_empty());

        let later = consumer.fetch(1, Duration::from_millis(300)).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].metadata().unwrap().delivered, 2);
    }

    #[tokio::test]
    async fn publish_then_subscribe_preserves_fields() {
        let stream = InMemoryStream::new().with_source("loadbalancer-api");
        let cancel = CancellationToken::new();
        let mut sub = stream.subscribe_changes("lb", cancel.clone()).await.unwrap();

        let mut change = ChangeMessage::new("loadbal-abc", "update")
            .with_additional_subject("tnntten-123")
            .with_field_change("port", "80", "443");
        change.subject_fields.insert("name".to_string(), "edge".to_string());
        change
            .additional_data
            .insert("weight".to_string(), serde_json::json!(3));
        with_actor(ActorId::new("idntusr-1"), stream.publish_change("lb", change.clone()))
            .await
            .unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.topic(), "changes.update.lb");

        let mut expected = change;
        expected.source = "loadbalancer-api".to_string();
        expected.actor_id = "idntusr-1".to_string();
        assert_eq!(msg.payload().unwrap(), &expected);
        assert!(msg.trace_context().is_some());
        msg.ack().await.unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn caller_set_actor_and_trace_travel_unchanged() {
        let stream = InMemoryStream::new();
        let cancel = CancellationToken::new();
        let mut sub = stream.subscribe_changes(">", cancel.clone()).await.unwrap();

        let mut change = ChangeMessage::new("loadbal-abc", "create");
        change.actor_id = "idntusr-9".to_string();
        change.trace_id = "0af7651916cd43dd8448eb211c80319c".to_string();
        change.span_id = "b7ad6b7169203331".to_string();
        stream.publish_change("lb", change.clone()).await.unwrap();

        let msg = sub.recv().await.unwrap();
        let mut expected = change;
        expected.source = STREAM_NAME.to_string();
        assert_eq!(msg.payload().unwrap(), &expected);
        assert_eq!(
            msg.trace_context().unwrap().trace_id(),
            "0af7651916cd43dd8448eb211c80319c"
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn changes_default_to_unknown_actor() {
        let stream = InMemoryStream::new();
        let cancel = CancellationToken::new();
        let mut changes = stream.subscribe_changes(">", cancel.clone()).await.unwrap();
        let mut events = stream.subscribe_events("*.cert", cancel.clone()).await.unwrap();

        stream
            .publish_change("lb", ChangeMessage::new("loadbal-abc", "delete"))
            .await
            .unwrap();
        stream
            .publish_event("cert", EventMessage::new("certmgr-1", "rotated"))
            .await
            .unwrap();

        let change = changes.recv().await.unwrap();
        assert_eq!(change.payload().unwrap().actor_id, UNKNOWN_ACTOR);
        let event = events.recv().await.unwrap();
        assert_eq!(event.topic(), "events.rotated.cert");
        cancel.cancel();
    }

    #[tokio::test]
    async fn closed_stream_rejects_fetch_and_publish() {
        let stream = InMemoryStream::new();
        stream.close();

        let mut consumer = stream.consumer(">");
        assert_eq!(
            consumer.fetch(1, Duration::from_millis(20)).await.err(),
            Some(Error::ConnectionClosed)
        );
        let result = stream
            .publish_event("cert", EventMessage::new("certmgr-1", "rotated"))
            .await;
        assert_eq!(result, Err(Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn invalid_message_is_not_published() {
        let stream = InMemoryStream::new();
        let result = stream.publish_change("lb", ChangeMessage::new("", "create")).await;
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(stream.pending(), 0);
    }
}
