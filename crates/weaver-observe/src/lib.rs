//! Observability for Weaver: subscriber setup, span attribute names, and an
//! OpenTelemetry telemetry sink.

pub mod otel_sink;
pub mod span_attrs;
pub mod tracing_setup;

pub use otel_sink::OtelSink;
