use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{Error, Result};
use courier_observability::TraceContext;

/// A change made to a subject (create, update, delete, ...).
///
/// Published on `changes.<eventType>.<topic>`. `source` and, when empty,
/// `actorID` are filled in by the publisher; everything else travels as set
/// by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeMessage {
    /// ID of the object that was changed.
    #[serde(rename = "subjectID")]
    pub subject_id: String,

    /// Kind of change, e.g. `create`, `update`, `delete`.
    #[serde(rename = "eventType")]
    pub event_type: String,

    /// Other objects affected by the change (parents, owners, ...).
    #[serde(rename = "additionalSubjects", default, skip_serializing_if = "Vec::is_empty")]
    pub additional_subject_ids: Vec<String>,

    /// Who made the change.
    #[serde(rename = "actorID", default)]
    pub actor_id: String,

    /// Service that published the change.
    #[serde(default)]
    pub source: String,

    /// When the change happened.
    #[serde(default)]
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "traceID", default)]
    pub trace_id: String,

    #[serde(rename = "spanID", default)]
    pub span_id: String,

    /// Current field values of the subject, for consumers that filter on them.
    #[serde(rename = "subjectFields", default, skip_serializing_if = "HashMap::is_empty")]
    pub subject_fields: HashMap<String, String>,

    #[serde(rename = "fieldChanges", default, skip_serializing_if = "Vec::is_empty")]
    pub field_changes: Vec<FieldChange>,

    #[serde(rename = "additionalData", default, skip_serializing_if = "HashMap::is_empty")]
    pub additional_data: HashMap<String, serde_json::Value>,

    /// Propagated trace headers (`traceparent`).
    #[serde(rename = "traceContext", default, skip_serializing_if = "HashMap::is_empty")]
    pub trace_context: HashMap<String, String>,
}

/// Before/after value of a single field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,

    #[serde(rename = "previousValue", default)]
    pub previous_value: String,

    #[serde(rename = "currentValue", default)]
    pub current_value: String,
}

impl ChangeMessage {
    /// A change of `event_type` to `subject_id`, timestamped now.
    pub fn new(subject_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            ..Self::default()
        }
    }

    pub fn with_field_change(
        mut self,
        field: impl Into<String>,
        previous: impl Into<String>,
        current: impl Into<String>,
    ) -> Self {
        self.field_changes.push(FieldChange {
            field: field.into(),
            previous_value: previous.into(),
            current_value: current.into(),
        });
        self
    }

    pub fn with_additional_subject(mut self, id: impl Into<String>) -> Self {
        self.additional_subject_ids.push(id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_type.is_empty() {
            return Err(Error::validation("change message: eventType is required"));
        }
        if self.subject_id.is_empty() {
            return Err(Error::validation("change message: subjectID is required"));
        }
        Ok(())
    }

    /// Validate and stamp publisher-owned fields.
    ///
    /// Overwrites `source` and defaults an empty `actorID` from the task's
    /// identity (or `unknown-actor`). Every other field is left as the caller
    /// set it. Returns the trace context to send as headers.
    pub fn prepare(&mut self, source: &str) -> Result<TraceContext> {
        self.validate()?;

        self.source = source.to_string();
        self.actor_id = courier_auth::resolve_actor(&self.actor_id);

        Ok(crate::trace::resolve(
            &self.trace_id,
            &self.span_id,
            &self.trace_context,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_auth::{ActorId, UNKNOWN_ACTOR, with_actor};
    use proptest::prelude::*;

    fn sample() -> ChangeMessage {
        ChangeMessage::new("loadbal-abc123", "update")
            .with_field_change("name", "old", "new")
            .with_additional_subject("tnntten-xyz")
    }

    #[test]
    fn missing_event_type_is_rejected() {
        let mut msg = sample();
        msg.event_type.clear();
        assert!(matches!(msg.prepare("svc"), Err(Error::Validation(_))));
    }

    #[test]
    fn missing_subject_is_rejected() {
        let msg = ChangeMessage::new("", "create");
        assert!(matches!(msg.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn prepare_overwrites_source_and_defaults_actor() {
        let mut msg = sample();
        msg.source = "spoofed".to_string();
        msg.prepare("load-balancer-api").unwrap();

        assert_eq!(msg.source, "load-balancer-api");
        assert_eq!(msg.actor_id, UNKNOWN_ACTOR);
    }

    #[test]
    fn prepare_leaves_trace_fields_alone() {
        let original = sample();
        let mut msg = original.clone();
        let ctx = msg.prepare("svc").unwrap();

        assert!(msg.trace_id.is_empty());
        assert!(msg.span_id.is_empty());
        assert!(msg.trace_context.is_empty());
        assert_eq!(ctx.trace_id().len(), 32);

        let mut expected = original;
        expected.source = "svc".to_string();
        expected.actor_id = UNKNOWN_ACTOR.to_string();
        assert_eq!(msg, expected);
    }

    #[test]
    fn caller_trace_ids_name_the_header_trace() {
        let mut msg = sample();
        msg.trace_id = "0af7651916cd43dd8448eb211c80319c".to_string();
        msg.span_id = "b7ad6b7169203331".to_string();
        let ctx = msg.prepare("svc").unwrap();

        assert_eq!(ctx.trace_id(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(msg.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert!(msg.trace_context.is_empty());
    }

    #[test]
    fn unknown_actor_is_deterministic() {
        for _ in 0..5 {
            let mut msg = sample();
            msg.prepare("svc").unwrap();
            assert_eq!(msg.actor_id, "unknown-actor");
        }
    }

    #[tokio::test]
    async fn actor_comes_from_identity_context() {
        let mut msg = sample();
        with_actor(ActorId::new("idntusr-ctx"), async { msg.prepare("svc") })
            .await
            .unwrap();
        assert_eq!(msg.actor_id, "idntusr-ctx");
    }

    #[test]
    fn wire_field_names() {
        let mut msg = sample();
        msg.additional_data.insert("k".to_string(), serde_json::json!(1));
        let value = serde_json::to_value(&msg).unwrap();
        for key in [
            "subjectID",
            "eventType",
            "additionalSubjects",
            "actorID",
            "source",
            "timestamp",
            "traceID",
            "spanID",
            "fieldChanges",
            "additionalData",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["fieldChanges"][0]["previousValue"], "old");
    }

    #[test]
    fn decodes_minimal_payload() {
        let msg: ChangeMessage =
            serde_json::from_str(r#"{"subjectID":"loadbal-1","eventType":"delete"}"#).unwrap();
        assert_eq!(msg.subject_id, "loadbal-1");
        assert!(msg.field_changes.is_empty());
    }

    proptest! {
        #[test]
        fn json_round_trip_preserves_fields(
            subject in "[a-z]{7}-[a-zA-Z0-9]{1,12}",
            event_type in "[a-z]{1,10}",
            actor in "[a-z0-9-]{0,16}",
            fields in proptest::collection::hash_map("[a-z]{1,8}", "[a-z0-9 ]{0,8}", 0..4),
            secs in 0i64..4_000_000_000,
        ) {
            let mut msg = ChangeMessage::new(subject, event_type);
            msg.actor_id = actor;
            msg.subject_fields = fields;
            msg.timestamp = DateTime::from_timestamp(secs, 0).unwrap();

            let bytes = serde_json::to_vec(&msg).unwrap();
            let decoded: ChangeMessage = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(&decoded, &msg);

            let again: serde_json::Value = serde_json::from_slice(&serde_json::to_vec(&decoded).unwrap()).unwrap();
            let first: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(again, first);
        }
    }
}
