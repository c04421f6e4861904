//! Auth relationship request/reply over core NATS.
//!
//! Requests are not persisted: a stream capturing the subject would answer
//! with its own publish ack instead of the permissions service's reply.

use std::time::Duration;

use async_nats::{Request, RequestErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use courier_core::{Error, Result, SubjectFamily};
use courier_events::{
    AuthRelationshipPublisher, AuthRelationshipRequest, AuthRelationshipResponse,
    AuthRelationshipSubscriber, Message, Subscription, pump,
};
use courier_observability::TraceContext;

use crate::connection::NatsConnection;
use crate::consumer::CoreSource;
use crate::delivery::CoreDelivery;
use crate::publisher::outbound_headers;

fn request_error(err: async_nats::RequestError, subject: &str, timeout: Duration) -> Error {
    match err.kind() {
        RequestErrorKind::NoResponders => Error::NoResponders,
        RequestErrorKind::TimedOut => Error::RequestTimeout(timeout),
        _ => Error::transport(format!("request on {subject}: {err}")),
    }
}

#[async_trait]
impl AuthRelationshipPublisher for NatsConnection {
    #[instrument(skip(self, request), fields(action = %request.action, object_id = %request.object_id), err)]
    async fn publish_auth_relationship_request(
        &self,
        topic: &str,
        mut request: AuthRelationshipRequest,
        timeout: Duration,
    ) -> Result<Message<AuthRelationshipResponse>> {
        let traceparent = request.prepare()?;
        let trace = TraceContext::from_traceparent(&traceparent).unwrap_or_else(TraceContext::new_root);

        let subject = self.publish_subject(
            SubjectFamily::AuthRelationships,
            request.action.as_str(),
            topic,
        )?;
        let payload = serde_json::to_vec(&request)?;

        let client = self.source();
        let inbox = client.new_inbox();
        let outgoing = Request::new()
            .payload(Bytes::from(payload))
            .headers(outbound_headers(&trace))
            .inbox(inbox)
            .timeout(Some(timeout));

        let reply = client
            .send_request(subject.to_string(), outgoing)
            .await
            .map_err(|e| request_error(e, subject.as_str(), timeout))?;

        debug!(%subject, "auth relationship response received");
        Ok(Message::decode(Box::new(CoreDelivery::new(reply, client.clone()))))
    }
}

#[async_trait]
impl AuthRelationshipSubscriber for NatsConnection {
    async fn subscribe_auth_relationship_requests(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription<AuthRelationshipRequest>> {
        let subject = self.subscribe_subject(SubjectFamily::AuthRelationships, topic)?;
        let source = CoreSource::subscribe(self, &subject).await?;

        let mut config = self.pump_config();
        config.auto_ack = false;
        Ok(pump::spawn(source, config, cancel))
    }
}
