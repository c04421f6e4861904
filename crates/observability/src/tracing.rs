//! Process-wide subscriber setup.
//!
//! ## Layers
//!
//! - `EnvFilter` from `RUST_LOG`, defaulting to `info,async_nats=warn`
//! - an OpenTelemetry layer, so every `tracing` span has a W3C trace and span
//!   id that [`crate::propagation`] can put on outbound messages
//! - a formatter: JSON for services, plain text captured per test for tests
//!
//! No exporter is configured; spans are only given identities. A service that
//! ships traces installs its own subscriber and adds [`otel_layer`] to it.

use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Tracer, TracerProvider};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "info,async_nats=warn";
const TRACER_NAME: &str = "courier";

fn provider() -> &'static TracerProvider {
    static PROVIDER: OnceLock<TracerProvider> = OnceLock::new();
    PROVIDER.get_or_init(|| TracerProvider::builder().build())
}

/// Layer giving `tracing` spans OpenTelemetry trace identities.
pub fn otel_layer<S>() -> OpenTelemetryLayer<S, Tracer>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_opentelemetry::layer().with_tracer(provider().tracer(TRACER_NAME))
}

fn register_propagator() {
    global::set_text_map_propagator(TraceContextPropagator::new());
}

/// JSON logs for a service process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer())
        .with(
            fmt::layer()
                .json()
                .with_timer(fmt::time::SystemTime)
                .with_current_span(true)
                .with_target(true),
        )
        .try_init();

    if installed.is_ok() {
        register_propagator();
    }
}

/// Human-readable logs captured by the test harness.
pub fn init_for_tests() {
    let installed = tracing_subscriber::registry()
        .with(EnvFilter::new("debug"))
        .with(otel_layer())
        .with(fmt::layer().with_test_writer())
        .try_init();

    if installed.is_ok() {
        register_propagator();
    }
}
