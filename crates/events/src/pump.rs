//! Subscription pump: pull deliveries from the broker into a bounded channel.
//!
//! One task per subscription:
//!
//! ```text
//! subscribing → fetching ⇄ backoff → draining → closed
//! ```
//!
//! The pump reserves room in the output channel *before* fetching and never
//! fetches more than that room, so a consumer that stops reading stalls the
//! fetches instead of growing a buffer. Cancelling the token (or dropping the
//! [`Subscription`]) drains the pump: it stops fetching, unsubscribes from the
//! broker and closes the channel. Channel closure is the only end-of-stream
//! signal.
//!
//! ## Fetch errors
//!
//! A failed fetch is logged and retried after a fixed backoff. A terminal
//! error (the connection was drained or closed) drains the pump instead, so
//! subscribers see their channel close rather than a retry loop that can
//! never succeed.
//!
//! ## Empty fetches
//!
//! A fetch is expected to wait up to its timeout for deliveries. When one
//! comes back empty sooner, the pump waits out the rest of that timeout
//! before fetching again, so an idle subscription issues at most one pull
//! per fetch timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use courier_core::Result;

use crate::bus::Subscription;
use crate::envelope::{Delivery, Message};

/// A broker-side consumer the pump pulls from.
#[async_trait]
pub trait PullSource: Send + 'static {
    /// Subject (or filter) this source is bound to; used for logging.
    fn subject(&self) -> &str;

    /// Up to `max` deliveries, waiting at most `expires`.
    ///
    /// An expiry with nothing to deliver is `Ok(vec![])`, not an error.
    async fn fetch(&mut self, max: usize, expires: Duration) -> Result<Vec<Box<dyn Delivery>>>;

    /// Release broker-side resources held for this subscription.
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Fetch tuning for one subscription.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Maximum deliveries per fetch; also the output channel capacity.
    pub batch_size: usize,
    /// How long a single fetch may wait for deliveries.
    pub fetch_timeout: Duration,
    /// Pause after a failed fetch.
    pub backoff: Duration,
    /// Ack each delivery before handing it to the caller.
    pub auto_ack: bool,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            fetch_timeout: Duration::from_secs(5),
            backoff: Duration::from_secs(5),
            auto_ack: false,
        }
    }
}

/// Spawn a pump task for `source` and return its output.
///
/// Must be called from within a tokio runtime.
pub fn spawn<T, S>(source: S, config: PumpConfig, cancel: CancellationToken) -> Subscription<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
    S: PullSource,
{
    let capacity = config.batch_size.max(1);
    let (tx, rx) = mpsc::channel(capacity);

    let span = info_span!("subscription", subject = %source.subject());
    tokio::spawn(run(source, config, tx, cancel).instrument(span));

    Subscription::new(rx)
}

async fn run<T, S>(
    mut source: S,
    config: PumpConfig,
    tx: mpsc::Sender<Message<T>>,
    cancel: CancellationToken,
) where
    T: DeserializeOwned + Send + Sync + 'static,
    S: PullSource,
{
    let batch_size = config.batch_size.max(1);
    debug!(batch_size, "subscription pump started");

    'pump: loop {
        // Wait for room downstream; this is where backpressure bites.
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'pump,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => break 'pump,
            },
        };
        let room = (tx.capacity() + 1).min(batch_size);

        let started = Instant::now();
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'pump,
            fetched = source.fetch(room, config.fetch_timeout) => fetched,
        };

        let deliveries = match fetched {
            Ok(deliveries) if deliveries.is_empty() => {
                drop(permit);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'pump,
                    _ = tokio::time::sleep_until(started + config.fetch_timeout) => continue 'pump,
                }
            }
            Ok(deliveries) => deliveries,
            Err(err) if err.is_terminal() => {
                drop(permit);
                info!(error = %err, "source closed, stopping subscription");
                break 'pump;
            }
            Err(err) => {
                drop(permit);
                warn!(error = %err, backoff = ?config.backoff, "fetch failed, backing off");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'pump,
                    _ = tokio::time::sleep(config.backoff) => continue 'pump,
                }
            }
        };

        let mut permit = Some(permit);
        for delivery in deliveries {
            let message = Message::<T>::decode(delivery);
            if let Some(err) = message.error() {
                // Left unsettled so the caller can term it.
                warn!(error = %err, "delivered message could not be decoded");
            } else if config.auto_ack {
                if let Err(err) = message.ack().await {
                    warn!(error = %err, "auto-ack failed");
                }
            }

            match permit.take() {
                Some(permit) => permit.send(message),
                None => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break 'pump,
                        sent = tx.send(message) => if sent.is_err() {
                            break 'pump;
                        },
                    }
                }
            }
        }
    }

    debug!("subscription draining");
    if let Err(err) = source.unsubscribe().await {
        warn!(error = %err, "unsubscribe failed");
    }
    drop(tx);
    debug!("subscription closed");
}
