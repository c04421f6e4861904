//! W3C trace-context propagation across the broker.
//!
//! ## Carriers
//!
//! Every outbound message carries a `traceparent` header. Auth relationship
//! payloads also carry it in their `traceContext` map, so the permissions
//! service can join the requester's trace even when headers are stripped.
//! Both are plain string maps, read and written with OpenTelemetry's
//! [`TraceContextPropagator`].
//!
//! ## Current trace
//!
//! The trace of an outbound message is the active `tracing` span's, as seen
//! through the OpenTelemetry layer installed by [`crate::tracing::init`].
//! When there is no such span (or the layer is not installed) a new root trace
//! is started.
//!
//! ## Continuing a trace
//!
//! A consumer reads the publisher's context from the delivery headers and
//! calls [`TraceContext::attach_to`] on the span it handles the message in.

use std::collections::HashMap;

use opentelemetry::Context;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Header/map key carrying the W3C trace parent.
pub const TRACEPARENT_HEADER: &str = "traceparent";

const TRACE_ID_HEX_LEN: usize = 32;
const SPAN_ID_HEX_LEN: usize = 16;

/// Trace and span identity of a unit of work.
#[derive(Debug, Clone)]
pub struct TraceContext {
    span: SpanContext,
}

impl PartialEq for TraceContext {
    // Whether the context arrived from another process does not change its identity.
    fn eq(&self, other: &Self) -> bool {
        self.span.trace_id() == other.span.trace_id()
            && self.span.span_id() == other.span.span_id()
            && self.span.trace_flags() == other.span.trace_flags()
    }
}

impl Eq for TraceContext {}

impl TraceContext {
    /// Start a new sampled trace.
    pub fn new_root() -> Self {
        let ids = RandomIdGenerator::default();
        Self {
            span: SpanContext::new(
                ids.new_trace_id(),
                ids.new_span_id(),
                TraceFlags::SAMPLED,
                false,
                TraceState::default(),
            ),
        }
    }

    /// A new span in the same trace.
    pub fn child(&self) -> Self {
        Self {
            span: SpanContext::new(
                self.span.trace_id(),
                RandomIdGenerator::default().new_span_id(),
                self.span.trace_flags(),
                false,
                self.span.trace_state().clone(),
            ),
        }
    }

    /// Context of the active `tracing` span, if it belongs to a trace.
    pub fn current() -> Option<Self> {
        Self::from_context(&tracing::Span::current().context())
    }

    /// Context for a new outbound message: the active span's, or a new root.
    pub fn outbound() -> Self {
        Self::current().unwrap_or_else(Self::new_root)
    }

    /// 32 lowercase hex characters.
    pub fn trace_id(&self) -> String {
        self.span.trace_id().to_string()
    }

    /// 16 lowercase hex characters.
    pub fn span_id(&self) -> String {
        self.span.span_id().to_string()
    }

    pub fn is_sampled(&self) -> bool {
        self.span.is_sampled()
    }

    pub fn span_context(&self) -> &SpanContext {
        &self.span
    }

    pub fn to_traceparent(&self) -> String {
        let mut carrier = HashMap::new();
        inject(&mut carrier, self);
        carrier.remove(TRACEPARENT_HEADER).unwrap_or_default()
    }

    /// Parse a `traceparent` value; invalid input yields `None`.
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let carrier = HashMap::from([(TRACEPARENT_HEADER.to_string(), value.trim().to_string())]);
        extract(&carrier)
    }

    /// Rebuild a sampled remote context from hex trace and span ids.
    pub fn from_ids(trace_id: &str, span_id: &str) -> Option<Self> {
        if trace_id.len() != TRACE_ID_HEX_LEN || span_id.len() != SPAN_ID_HEX_LEN {
            return None;
        }
        let span = SpanContext::new(
            TraceId::from_hex(trace_id).ok()?,
            SpanId::from_hex(span_id).ok()?,
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        span.is_valid().then_some(Self { span })
    }

    /// An OpenTelemetry context whose parent span is this one.
    pub fn to_context(&self) -> Context {
        Context::new().with_remote_span_context(self.span.clone())
    }

    /// Make `span` a child of this trace.
    pub fn attach_to(&self, span: &tracing::Span) {
        span.set_parent(self.to_context());
    }

    fn from_context(cx: &Context) -> Option<Self> {
        let span = cx.span().span_context().clone();
        span.is_valid().then_some(Self { span })
    }
}

/// Write `ctx` into a string map carrier.
pub fn inject(carrier: &mut HashMap<String, String>, ctx: &TraceContext) {
    TraceContextPropagator::new().inject_context(&ctx.to_context(), carrier);
}

/// Read a trace context from a string map carrier.
pub fn extract(carrier: &HashMap<String, String>) -> Option<TraceContext> {
    let cx = TraceContextPropagator::new().extract(carrier);
    TraceContext::from_context(&cx)
}
