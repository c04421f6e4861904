//! Auth relationship request/response exchange.
//!
//! A service that creates or deletes an object asks the permissions service to
//! write or delete the relationships tying that object to its owners, and
//! waits for the outcome. The request travels on
//! `[prefix.]auth.relationships.<action>.<topic>` with a broker-generated
//! reply subject; the response goes back on that subject.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use courier_core::{Error, Result};
use courier_observability::TRACEPARENT_HEADER;

use crate::Message;

/// What to do with the listed relationships.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthRelationshipAction {
    Write,
    Delete,
}

impl AuthRelationshipAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }
}

impl core::fmt::Display for AuthRelationshipAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(relation, subject)` edge from the request's object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRelationshipRelation {
    /// Relationship name, e.g. `owner` or `parent`.
    pub relation: String,

    #[serde(rename = "subjectID")]
    pub subject_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRelationshipRequest {
    pub action: AuthRelationshipAction,

    #[serde(rename = "objectID")]
    pub object_id: String,

    #[serde(default)]
    pub relations: Vec<AuthRelationshipRelation>,

    #[serde(rename = "traceContext", default, skip_serializing_if = "HashMap::is_empty")]
    pub trace_context: HashMap<String, String>,
}

impl AuthRelationshipRequest {
    pub fn new(action: AuthRelationshipAction, object_id: impl Into<String>) -> Self {
        Self {
            action,
            object_id: object_id.into(),
            relations: Vec::new(),
            trace_context: HashMap::new(),
        }
    }

    pub fn with_relation(mut self, relation: impl Into<String>, subject_id: impl Into<String>) -> Self {
        self.relations.push(AuthRelationshipRelation {
            relation: relation.into(),
            subject_id: subject_id.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.object_id.is_empty() {
            return Err(Error::validation("auth relationship request: objectID is required"));
        }
        if self.relations.is_empty() {
            return Err(Error::validation(
                "auth relationship request: at least one relation is required",
            ));
        }
        for (idx, rel) in self.relations.iter().enumerate() {
            if rel.relation.is_empty() {
                return Err(Error::validation(format!(
                    "auth relationship request: relations[{idx}].relation is required"
                )));
            }
            if rel.subject_id.is_empty() {
                return Err(Error::validation(format!(
                    "auth relationship request: relations[{idx}].subjectID is required"
                )));
            }
        }
        Ok(())
    }

    /// Validate and attach trace context; returns the `traceparent` to send.
    pub fn prepare(&mut self) -> Result<String> {
        self.validate()?;
        Ok(crate::trace::stamp_carrier(&mut self.trace_context).to_traceparent())
    }
}

/// Outcome of an auth relationship request. Empty `errors` means success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRelationshipResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,

    #[serde(rename = "traceContext", default, skip_serializing_if = "HashMap::is_empty")]
    pub trace_context: HashMap<String, String>,
}

impl AuthRelationshipResponse {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failed(errors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            errors: errors.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.errors.iter().any(String::is_empty) {
            return Err(Error::validation("auth relationship response: empty error message"));
        }
        Ok(())
    }
}

impl Message<AuthRelationshipRequest> {
    /// Answer this request on its reply subject.
    ///
    /// Fails with `Error::MissingReplySubject` when the message was not sent
    /// as a request.
    pub async fn reply(&self, mut response: AuthRelationshipResponse) -> Result<()> {
        response.validate()?;

        // Continue the requester's trace when it sent one.
        if courier_observability::propagation::extract(&response.trace_context).is_none() {
            if let Some(ctx) = self.trace_context() {
                courier_observability::propagation::inject(&mut response.trace_context, &ctx.child());
            }
        }
        let traceparent = crate::trace::stamp_carrier(&mut response.trace_context).to_traceparent();

        if self.reply_subject().is_none() {
            return Err(Error::MissingReplySubject);
        }

        let payload = serde_json::to_vec(&response)?;
        let headers = HashMap::from([(TRACEPARENT_HEADER.to_string(), traceparent)]);
        self.delivery().respond(headers, payload).await
    }
}
