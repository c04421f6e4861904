//! Transport error model.

use std::time::Duration;

use thiserror::Error;

/// Result type used across every courier crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by connections, publishers, subscribers and envelopes.
///
/// Construction problems (`Configuration`) are fatal to the caller. Outbound
/// problems (`Validation`) are rejected before anything is sent. Inbound
/// problems (`Decode`) stay attached to the offending envelope.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid or contradictory connection configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// An outbound message is missing a required field.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Connect, publish, fetch or ack failed at the broker.
    #[error("transport error: {0}")]
    Transport(String),

    /// A request found nobody listening on its subject.
    #[error("no responders available for request")]
    NoResponders,

    /// A request got no reply before its deadline.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// An inbound payload could not be decoded.
    #[error("failed to decode message: {0}")]
    Decode(String),

    /// `reply` was called on a message that was not a request.
    #[error("message has no reply subject")]
    MissingReplySubject,

    /// The message was already acked, nak'd or terminated.
    #[error("message already settled")]
    AlreadySettled,

    /// The delivery did not come from a persistent stream.
    #[error("message carries no stream metadata")]
    NotStreamMessage,

    /// The connection was drained or closed; nothing more will arrive.
    #[error("connection closed")]
    ConnectionClosed,

    /// Graceful drain did not finish within the allowed time.
    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// True for every broker-side failure, including `NoResponders`.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::NoResponders
                | Self::RequestTimeout(_)
                | Self::ConnectionClosed
        )
    }

    /// True when retrying cannot succeed because the session is gone.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            Self::Transport(err.to_string())
        } else {
            Self::Decode(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_responders_is_a_transport_error() {
        assert!(Error::NoResponders.is_transport());
        assert!(Error::transport("connection refused").is_transport());
        assert!(Error::RequestTimeout(Duration::from_secs(1)).is_transport());
    }

    #[test]
    fn only_a_closed_connection_is_terminal() {
        assert!(Error::ConnectionClosed.is_terminal());
        assert!(Error::ConnectionClosed.is_transport());
        assert!(!Error::transport("fetch: timed out").is_terminal());
        assert!(!Error::NoResponders.is_terminal());
    }

    #[test]
    fn validation_and_decode_are_not_transport_errors() {
        assert!(!Error::validation("eventType is required").is_transport());
        assert!(!Error::decode("expected value").is_transport());
        assert!(!Error::configuration("token and credentials file").is_transport());
    }

    #[test]
    fn json_syntax_errors_map_to_decode() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(Error::from(err), Error::Decode(_)));
    }
}
