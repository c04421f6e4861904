//! NATS JetStream transport for the courier bus traits.
//!
//! [`NatsConnection`] implements [`Publisher`](courier_events::Publisher),
//! [`Subscriber`](courier_events::Subscriber) and the auth relationship
//! request/reply traits. Changes and events go through JetStream; auth
//! relationship requests use core NATS request/reply.
//!
//! ## Consumers
//!
//! Subscriptions bind JetStream pull consumers. With a queue group configured
//! the consumer is durable, named from the group and a hash of the subject,
//! and shared by every member of the group. Without one it is ephemeral and
//! the broker removes it after `inactive_threshold` of inactivity.
//!
//! ## Lifecycle
//!
//! ```text
//! connect ──▶ open ──shutdown──▶ draining ──▶ closed
//! ```
//!
//! Once draining starts, every subscription built on the connection stops
//! fetching and closes its channel.

pub mod config;
pub mod connection;

mod consumer;
mod delivery;
mod publisher;
mod request;

pub use config::{DeliveryPolicy, NatsConfig};
pub use connection::NatsConnection;
