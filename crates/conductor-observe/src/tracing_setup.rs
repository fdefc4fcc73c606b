//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry span export.
//!
//! # Usage
//!
//! ```no_run
//! // Structured logging at the given default level
//! conductor_observe::tracing_setup::init_tracing("warn", false).unwrap();
//! ```
//!
//! `RUST_LOG` takes precedence over the default filter when set.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Kept so the provider can be flushed on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Install the global tracing subscriber.
///
/// Always installs a `fmt` layer writing to stderr, so command output on
/// stdout stays machine-readable. With `enable_otel`, spans are also
/// bridged to OpenTelemetry through a stdout exporter.
///
/// # Errors
///
/// Returns an error if a global subscriber is already set or the filter
/// directive does not parse.
pub fn init_tracing(default_filter: &str, enable_otel: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)?,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    if enable_otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("conductor");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

/// Flush pending spans and shut down the tracer provider.
///
/// A no-op when OpenTelemetry was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
