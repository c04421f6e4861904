//! Pull sources feeding the subscription pump.
//!
//! - **JetStream**: one pull consumer per (subject, queue group). Durable when
//!   a queue group is configured, ephemeral otherwise.
//! - **Core**: a plain (queue) subscription, used for request/reply traffic
//!   that must not be persisted.

use std::time::Duration;

use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy, PullConsumer, pull};
use async_nats::jetstream::stream::Stream;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_core::{Error, Result, Subject, SubjectFamily};
use courier_events::{ChangeMessage, Delivery, EventMessage, PullSource, Subscriber, Subscription, pump};

use crate::config::DeliveryPolicy;
use crate::connection::{Liveness, NatsConnection};
use crate::delivery::{CoreDelivery, JetStreamDelivery};

pub(crate) struct JetStreamSource {
    subject: String,
    stream: Stream,
    consumer: PullConsumer,
    ephemeral: bool,
    liveness: Liveness,
}

impl JetStreamSource {
    /// Find the stream capturing `subject` and bind a pull consumer to it.
    pub(crate) async fn bind(conn: &NatsConnection, subject: &Subject) -> Result<Self> {
        let js = conn.jetstream();
        let cfg = conn.config();

        let stream_name = js
            .stream_by_subject(subject.as_str())
            .await
            .map_err(|e| Error::transport(format!("no stream for subject {subject}: {e}")))?;
        let stream = js
            .get_stream(&stream_name)
            .await
            .map_err(|e| Error::transport(format!("get stream {stream_name}: {e}")))?;

        let durable = conn.durable_name(subject);
        let ephemeral = durable.is_empty();
        let config = pull::Config {
            durable_name: (!ephemeral).then(|| durable.clone()),
            filter_subject: subject.to_string(),
            ack_policy: if cfg.ack_explicit {
                AckPolicy::Explicit
            } else {
                AckPolicy::None
            },
            deliver_policy: deliver_policy(&cfg.delivery_policy)?,
            inactive_threshold: if ephemeral {
                cfg.inactive_threshold
            } else {
                Duration::ZERO
            },
            ..Default::default()
        };

        let consumer = if ephemeral {
            warn!(
                %subject,
                "no queue group configured; ephemeral consumer will not survive a restart"
            );
            stream.create_consumer(config).await
        } else {
            stream.get_or_create_consumer(&durable, config).await
        }
        .map_err(|e| Error::transport(format!("create consumer on {stream_name}: {e}")))?;

        info!(
            %subject,
            stream = %stream_name,
            consumer = %consumer.cached_info().name,
            ephemeral,
            "bound pull consumer"
        );

        Ok(Self {
            subject: subject.to_string(),
            stream,
            consumer,
            ephemeral,
            liveness: conn.liveness(),
        })
    }
}

#[async_trait]
impl PullSource for JetStreamSource {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn fetch(&mut self, max: usize, expires: Duration) -> Result<Vec<Box<dyn Delivery>>> {
        self.liveness.check()?;

        // A batch pull waits server-side until `expires`; `fetch()` would not.
        let mut batch = self
            .consumer
            .batch()
            .max_messages(max)
            .expires(expires)
            .messages()
            .await
            .map_err(|e| self.liveness.error(format!("fetch: {e}")))?;

        let mut out: Vec<Box<dyn Delivery>> = Vec::with_capacity(max);
        while let Some(next) = batch.next().await {
            match next {
                Ok(message) => out.push(Box::new(JetStreamDelivery::new(message))),
                Err(err) if out.is_empty() => {
                    return Err(self.liveness.error(format!("fetch: {err}")));
                }
                Err(err) => {
                    // Keep what arrived; the next fetch surfaces a lasting failure.
                    warn!(error = %err, received = out.len(), "fetch ended early");
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        let name = self.consumer.cached_info().name.clone();
        if !self.ephemeral {
            debug!(consumer = %name, "keeping durable consumer");
            return Ok(());
        }
        if self.liveness.is_gone() {
            debug!(consumer = %name, "session gone; broker reaps the ephemeral consumer");
            return Ok(());
        }
        self.stream
            .delete_consumer(&name)
            .await
            .map_err(|e| Error::transport(format!("delete consumer {name}: {e}")))?;
        debug!(consumer = %name, "deleted ephemeral consumer");
        Ok(())
    }
}

pub(crate) struct CoreSource {
    subject: String,
    subscriber: async_nats::Subscriber,
    client: async_nats::Client,
    liveness: Liveness,
}

impl CoreSource {
    /// Subscribe to `subject`, joining the configured queue group if any.
    pub(crate) async fn subscribe(conn: &NatsConnection, subject: &Subject) -> Result<Self> {
        let client = conn.source().clone();
        let group = &conn.config().queue_group;

        let subscriber = if group.is_empty() {
            client.subscribe(subject.to_string()).await
        } else {
            client.queue_subscribe(subject.to_string(), group.clone()).await
        }
        .map_err(|e| Error::transport(format!("subscribe {subject}: {e}")))?;

        info!(%subject, queue_group = %group, "core subscription started");
        Ok(Self {
            subject: subject.to_string(),
            subscriber,
            client,
            liveness: conn.liveness(),
        })
    }
}

#[async_trait]
impl PullSource for CoreSource {
    fn subject(&self) -> &str {
        &self.subject
    }

    async fn fetch(&mut self, max: usize, expires: Duration) -> Result<Vec<Box<dyn Delivery>>> {
        self.liveness.check()?;
        let mut out: Vec<Box<dyn Delivery>> = Vec::new();

        let first = match tokio::time::timeout(expires, self.subscriber.next()).await {
            Err(_) => return Ok(out),
            // A core subscription never resumes once its stream has ended.
            Ok(None) => return Err(Error::ConnectionClosed),
            Ok(Some(message)) => message,
        };
        out.push(Box::new(CoreDelivery::new(first, self.client.clone())));

        // Take whatever else is already buffered, without waiting.
        while out.len() < max {
            match self.subscriber.next().now_or_never() {
                Some(Some(message)) => {
                    out.push(Box::new(CoreDelivery::new(message, self.client.clone())));
                }
                _ => break,
            }
        }
        Ok(out)
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        if self.liveness.is_gone() {
            return Ok(());
        }
        self.subscriber
            .unsubscribe()
            .await
            .map_err(|e| Error::transport(format!("unsubscribe {}: {e}", self.subject)))
    }
}

fn deliver_policy(policy: &DeliveryPolicy) -> Result<DeliverPolicy> {
    Ok(match *policy {
        DeliveryPolicy::All => DeliverPolicy::All,
        DeliveryPolicy::Last => DeliverPolicy::Last,
        DeliveryPolicy::LastPerSubject => DeliverPolicy::LastPerSubject,
        DeliveryPolicy::New => DeliverPolicy::New,
        DeliveryPolicy::StartSequence(start_sequence) => {
            DeliverPolicy::ByStartSequence { start_sequence }
        }
        DeliveryPolicy::StartTime(at) => {
            let nanos = at.timestamp_nanos_opt().ok_or_else(|| {
                Error::configuration(format!("delivery start time {at} is out of range"))
            })?;
            let start_time = time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
                .map_err(|e| Error::configuration(format!("delivery start time {at}: {e}")))?;
            DeliverPolicy::ByStartTime { start_time }
        }
    })
}

impl NatsConnection {
    async fn subscribe_stream<T>(
        &self,
        family: SubjectFamily,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let subject = self.subscribe_subject(family, topic)?;
        let source = JetStreamSource::bind(self, &subject).await?;
        Ok(pump::spawn(source, self.pump_config(), cancel))
    }
}

#[async_trait]
impl Subscriber for NatsConnection {
    async fn subscribe_changes(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription<ChangeMessage>> {
        self.subscribe_stream(SubjectFamily::Changes, topic, cancel).await
    }

    async fn subscribe_events(
        &self,
        topic: &str,
        cancel: CancellationToken,
    ) -> Result<Subscription<EventMessage>> {
        self.subscribe_stream(SubjectFamily::Events, topic, cancel).await
    }
}
