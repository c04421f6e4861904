//! Publishing changes and events to JetStream.

use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, instrument};
use uuid::Uuid;

use courier_core::{Error, Result, Subject, SubjectFamily};
use courier_events::{ChangeMessage, EventMessage, MESSAGE_ID_HEADER, Publisher};
use courier_observability::{TRACEPARENT_HEADER, TraceContext};

use crate::connection::NatsConnection;

/// Headers sent with every persisted message.
///
/// The message id lets the stream drop duplicates of a retried publish.
pub(crate) fn outbound_headers(trace: &TraceContext) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(MESSAGE_ID_HEADER, Uuid::now_v7().to_string().as_str());
    headers.insert(TRACEPARENT_HEADER, trace.to_traceparent().as_str());
    headers
}

impl NatsConnection {
    /// Hand `payload` to the stream without waiting for its ack.
    async fn publish_persistent(
        &self,
        subject: Subject,
        trace: &TraceContext,
        payload: Vec<u8>,
    ) -> Result<()> {
        let headers = outbound_headers(trace);
        let _ack = self
            .jetstream()
            .publish_with_headers(subject.to_string(), headers, Bytes::from(payload))
            .await
            .map_err(|e| Error::transport(format!("publish to {subject}: {e}")))?;

        debug!(%subject, trace_id = %trace.trace_id(), "published");
        Ok(())
    }
}

#[async_trait]
impl Publisher for NatsConnection {
    #[instrument(skip(self, change), fields(event_type = %change.event_type, subject_id = %change.subject_id), err)]
    async fn publish_change(&self, topic: &str, mut change: ChangeMessage) -> Result<()> {
        let trace = change.prepare(&self.config().source)?;
        let subject = self.publish_subject(SubjectFamily::Changes, &change.event_type, topic)?;
        let payload = serde_json::to_vec(&change)?;
        self.publish_persistent(subject, &trace, payload).await
    }

    #[instrument(skip(self, event), fields(event_type = %event.event_type, subject_id = %event.subject_id), err)]
    async fn publish_event(&self, topic: &str, mut event: EventMessage) -> Result<()> {
        let trace = event.prepare(&self.config().source)?;
        let subject = self.publish_subject(SubjectFamily::Events, &event.event_type, topic)?;
        let payload = serde_json::to_vec(&event)?;
        self.publish_persistent(subject, &trace, payload).await
    }
}
