//! Trace selection shared by every outbound message kind.

use std::collections::HashMap;

use courier_observability::propagation::{self, TraceContext};

/// Trace context for an outbound change or event.
///
/// A trace named on the message itself wins: first its `traceContext`
/// carrier, then its `traceID`/`spanID` pair. Otherwise the active span's
/// trace, or a new root. The message is not modified.
pub(crate) fn resolve(
    trace_id: &str,
    span_id: &str,
    carrier: &HashMap<String, String>,
) -> TraceContext {
    propagation::extract(carrier)
        .or_else(|| TraceContext::from_ids(trace_id, span_id))
        .unwrap_or_else(TraceContext::outbound)
}

/// Trace stamping for payloads whose only trace field is the carrier.
pub(crate) fn stamp_carrier(carrier: &mut HashMap<String, String>) -> TraceContext {
    match propagation::extract(carrier) {
        Some(ctx) => ctx,
        None => {
            let ctx = TraceContext::outbound();
            propagation::inject(carrier, &ctx);
            ctx
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_message_gets_a_new_trace() {
        let a = resolve("", "", &HashMap::new());
        let b = resolve("", "", &HashMap::new());
        assert_ne!(a.trace_id(), b.trace_id());
    }

    #[test]
    fn carrier_wins_over_ids() {
        let carried = TraceContext::new_root();
        let other = TraceContext::new_root();
        let mut carrier = HashMap::new();
        propagation::inject(&mut carrier, &carried);

        let ctx = resolve(&other.trace_id(), &other.span_id(), &carrier);
        assert_eq!(ctx, carried);
    }

    #[test]
    fn ids_are_used_without_carrier() {
        let existing = TraceContext::new_root();
        let ctx = resolve(&existing.trace_id(), &existing.span_id(), &HashMap::new());
        assert_eq!(ctx, existing);
    }

    #[test]
    fn carrier_is_reused_or_filled() {
        let existing = TraceContext::new_root();
        let mut carrier = HashMap::new();
        propagation::inject(&mut carrier, &existing);
        assert_eq!(stamp_carrier(&mut carrier), existing);

        let mut empty = HashMap::new();
        let ctx = stamp_carrier(&mut empty);
        assert_eq!(propagation::extract(&empty), Some(ctx));
    }
}
