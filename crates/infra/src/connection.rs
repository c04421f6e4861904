//! NATS session lifecycle.
//!
//! A [`NatsConnection`] is created once per process and cloned into every
//! publisher and subscriber. Clones share the same broker session; shutting
//! down any of them drains the session for all.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::jetstream;
use async_nats::{Client, ConnectOptions, Event};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use courier_core::{Error, Result, Subject, SubjectFamily, durable_consumer_name};
use courier_events::PumpConfig;

use crate::config::NatsConfig;

#[derive(Clone)]
pub struct NatsConnection {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
    liveness: Liveness,
}

/// Whether the broker session can still serve its dependents.
///
/// Gone once a drain has started or the session has closed. Sources consult
/// it so their pumps stop instead of retrying against a dead session.
#[derive(Debug, Clone)]
pub(crate) struct Liveness {
    draining: Arc<AtomicBool>,
    closed: watch::Receiver<bool>,
}

impl Liveness {
    fn new(closed: watch::Receiver<bool>) -> Self {
        Self {
            draining: Arc::new(AtomicBool::new(false)),
            closed,
        }
    }

    fn start_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn is_gone(&self) -> bool {
        self.draining.load(Ordering::SeqCst) || self.is_closed()
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_gone() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// `ConnectionClosed` once the session is gone, a transport error otherwise.
    pub(crate) fn error(&self, context: impl Display) -> Error {
        if self.is_gone() {
            Error::ConnectionClosed
        } else {
            Error::transport(context.to_string())
        }
    }
}

impl core::fmt::Debug for NatsConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NatsConnection")
            .field("url", &self.inner.config.url)
            .field("source", &self.inner.config.source)
            .field("queue_group", &self.inner.config.queue_group)
            .finish()
    }
}

impl NatsConnection {
    /// Validate `config`, connect and open the JetStream context.
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        Self::connect_with_close_callback(config, || {}).await
    }

    /// Like [`connect`](Self::connect), running `on_close` when the broker
    /// session closes (after a drain, or when the server goes away for good).
    #[instrument(skip_all, fields(url = %config.url, source = %config.source), err)]
    pub async fn connect_with_close_callback<F>(config: NatsConfig, on_close: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let config = config.with_defaults();
        config.validate()?;

        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let on_close = Arc::new(on_close);

        let mut options = ConnectOptions::new()
            .name(config.source.clone())
            .connection_timeout(config.connect_timeout)
            .event_callback(move |event| {
                let on_close = Arc::clone(&on_close);
                let closed_tx = Arc::clone(&closed_tx);
                async move {
                    match event {
                        Event::Closed => {
                            on_close();
                            closed_tx.send_replace(true);
                            info!("nats connection closed");
                        }
                        Event::Disconnected => warn!("nats connection lost"),
                        Event::Connected => info!("nats connected"),
                        other => debug!(event = ?other, "nats event"),
                    }
                }
            });

        if let Some(token) = &config.token {
            options = options.token(token.clone());
        }
        if let Some(path) = &config.credentials_file {
            options = options.credentials_file(path).await.map_err(|e| {
                Error::configuration(format!("credentials file {}: {e}", path.display()))
            })?;
        }

        let client = tokio::time::timeout(config.connect_timeout, options.connect(config.url.as_str()))
            .await
            .map_err(|_| {
                Error::transport(format!(
                    "connect to {} timed out after {:?}",
                    config.url, config.connect_timeout
                ))
            })?
            .map_err(|e| Error::transport(format!("connect to {}: {e}", config.url)))?;

        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                jetstream,
                config,
                liveness: Liveness::new(closed_rx),
            }),
        })
    }

    /// Drain within the configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_within(self.inner.config.shutdown_timeout).await
    }

    /// Drain the session and wait for it to close.
    ///
    /// Waits at most `min(deadline, shutdown_timeout)`; past that returns
    /// `Error::ShutdownTimeout` and leaves the drain running in the
    /// background. Subscriptions stop fetching and close their channels
    /// once the drain starts.
    pub async fn shutdown_within(&self, deadline: Duration) -> Result<()> {
        let limit = deadline.min(self.inner.config.shutdown_timeout);
        info!(?limit, "draining nats connection");
        self.inner.liveness.start_draining();

        let mut closed = self.inner.liveness.closed.clone();
        let client = self.inner.client.clone();
        bounded(limit, async move {
            client
                .drain()
                .await
                .map_err(|e| Error::transport(format!("drain: {e}")))?;
            wait_closed(&mut closed).await;
            Ok(())
        })
        .await
    }

    /// The raw broker client. Do not drain or close it directly.
    pub fn source(&self) -> &Client {
        &self.inner.client
    }

    pub fn jetstream(&self) -> &jetstream::Context {
        &self.inner.jetstream
    }

    pub fn config(&self) -> &NatsConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.liveness.is_closed()
    }

    /// True once a shutdown has started or the session has closed.
    pub fn is_draining(&self) -> bool {
        self.inner.liveness.is_gone()
    }

    pub(crate) fn liveness(&self) -> Liveness {
        self.inner.liveness.clone()
    }

    /// `[publish_prefix.]<family>.<kind>.<topic>`
    pub fn publish_subject(&self, family: SubjectFamily, kind: &str, topic: &str) -> Result<Subject> {
        Subject::publish(&self.inner.config.publish_prefix, family, kind, topic)
    }

    /// `[subscribe_prefix.]<family>.<topic>`; `topic` may contain wildcards.
    pub fn subscribe_subject(&self, family: SubjectFamily, topic: &str) -> Result<Subject> {
        Subject::subscribe(&self.inner.config.subscribe_prefix, family, topic)
    }

    /// Durable consumer name for `subject` under the configured queue group;
    /// empty when no group is configured.
    pub fn durable_name(&self, subject: &Subject) -> String {
        durable_consumer_name(&self.inner.config.queue_group, subject.as_str())
    }

    pub(crate) fn pump_config(&self) -> PumpConfig {
        let cfg = &self.inner.config;
        PumpConfig {
            batch_size: cfg.fetch_batch_size,
            fetch_timeout: cfg.fetch_timeout,
            backoff: cfg.fetch_backoff,
            auto_ack: !cfg.manual_ack && cfg.ack_explicit,
        }
    }
}

/// Run `fut`, giving up with `Error::ShutdownTimeout` after `limit`.
pub(crate) async fn bounded<F>(limit: Duration, fut: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(?limit, "shutdown did not complete in time");
            Err(Error::ShutdownTimeout(limit))
        }
    }
}

/// Resolves once the close flag is set or its sender is gone.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}
