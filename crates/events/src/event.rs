use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{Error, Result};
use courier_observability::TraceContext;

/// Something that happened to a subject that is not a change to its fields
/// (a certificate rotated, an address was assigned, ...).
///
/// Published on `events.<eventType>.<topic>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "subjectID")]
    pub subject_id: String,

    #[serde(rename = "eventType")]
    pub event_type: String,

    #[serde(rename = "additionalSubjects", default, skip_serializing_if = "Vec::is_empty")]
    pub additional_subject_ids: Vec<String>,

    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub timestamp: DateTime<Utc>,

    #[serde(rename = "traceID", default)]
    pub trace_id: String,

    #[serde(rename = "spanID", default)]
    pub span_id: String,

    /// Free-form event details.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,

    #[serde(rename = "traceContext", default, skip_serializing_if = "HashMap::is_empty")]
    pub trace_context: HashMap<String, String>,
}

impl EventMessage {
    pub fn new(subject_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_type.is_empty() {
            return Err(Error::validation("event message: eventType is required"));
        }
        if self.subject_id.is_empty() {
            return Err(Error::validation("event message: subjectID is required"));
        }
        Ok(())
    }

    /// Validate and overwrite `source`; returns the trace for the headers.
    pub fn prepare(&mut self, source: &str) -> Result<TraceContext> {
        self.validate()?;
        self.source = source.to_string();

        Ok(crate::trace::resolve(
            &self.trace_id,
            &self.span_id,
            &self.trace_context,
        ))
    }
}
