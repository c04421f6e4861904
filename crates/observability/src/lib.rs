//! Logging setup and trace-context propagation across the broker.
//!
//! ```rust,ignore
//! courier_observability::init();
//!
//! let span = tracing::info_span!("create_loadbalancer");
//! async {
//!     // Published messages carry this span's trace in their `traceparent`.
//!     publisher.publish_change("loadbalancer", change).await
//! }
//! .instrument(span)
//! .await?;
//! ```

/// Initialize process-wide logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing subscriber configuration (filters, layers).
pub mod tracing;

/// W3C trace-context propagation through message headers and payloads.
pub mod propagation;

pub use propagation::{TRACEPARENT_HEADER, TraceContext};
