//! Execution telemetry: node spans and lifecycle events.
//!
//! The engine talks to a single [`Telemetry`] emitter, which fans every event
//! out to the configured [`TelemetrySink`]s. Sink failures are logged and
//! dropped; telemetry never changes the outcome of an execution.

pub mod emitter;
pub mod sink;

pub use emitter::Telemetry;
pub use sink::{BoxTelemetrySink, EventBusSink, NodeSpan, SpanStatus, TelemetrySink, TracingSink};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("telemetry sink unavailable: {0}")]
    Unavailable(String),

    #[error("failed to export telemetry: {0}")]
    Export(String),
}
