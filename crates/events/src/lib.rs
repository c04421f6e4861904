//! Typed messages and publish/subscribe contracts.
//!
//! Transport-agnostic: the NATS implementation lives in `courier-infra`,
//! and [`InMemoryStream`] backs tests and local development.

pub mod auth_relationship;
pub mod bus;
pub mod change;
pub mod envelope;
pub mod event;
pub mod in_memory;
pub mod pump;

mod trace;

pub use auth_relationship::{
    AuthRelationshipAction, AuthRelationshipRelation, AuthRelationshipRequest,
    AuthRelationshipResponse,
};
pub use bus::{
    AuthRelationshipPublisher, AuthRelationshipSubscriber, Publisher, Subscriber, Subscription,
};
pub use change::{ChangeMessage, FieldChange};
pub use envelope::{Delivery, DeliveryMetadata, MESSAGE_ID_HEADER, Message};
pub use event::EventMessage;
pub use in_memory::{InMemoryConsumer, InMemoryStream, RecordedResponse};
pub use pump::{PullSource, PumpConfig};
