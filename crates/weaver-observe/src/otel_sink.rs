//! OpenTelemetry export of node spans.
//!
//! `OtelSink` plugs into the engine's telemetry emitter and turns every ended
//! node span into an OTel span on the global tracer provider, with the
//! original start time and measured duration. Execution events are not
//! exported here; the `tracing` bridge already carries them as log records.

use std::time::{Duration, SystemTime};

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{Span as _, SpanKind, Status, Tracer as _};
use opentelemetry::KeyValue;
use weaver_core::telemetry::sink::{NodeSpan, SpanStatus, TelemetrySink};
use weaver_core::telemetry::TelemetryError;
use weaver_types::event::ExecutionEvent;

use crate::span_attrs;

pub struct OtelSink {
    tracer: BoxedTracer,
}

impl OtelSink {
    /// Sink on the global tracer provider. Install the provider first
    /// (see [`crate::tracing_setup::init_tracing`]).
    pub fn new() -> Self {
        Self {
            tracer: global::tracer(span_attrs::TRACER_NAME),
        }
    }
}

impl Default for OtelSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OtelSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtelSink").finish_non_exhaustive()
    }
}

/// Attributes attached to an exported node span.
pub fn node_attributes(span: &NodeSpan, status: &SpanStatus, duration_ms: u64) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new(span_attrs::EXECUTION_ID, span.execution_id.to_string()),
        KeyValue::new(span_attrs::NODE_ID, span.node_id.clone()),
        KeyValue::new(span_attrs::NODE_TYPE, span.node_type.clone()),
        KeyValue::new(span_attrs::NODE_DURATION_MS, duration_ms as i64),
    ];
    if let Some(iteration) = span.iteration {
        attributes.push(KeyValue::new(span_attrs::NODE_ITERATION, iteration as i64));
    }
    if let SpanStatus::Error { code, .. } = status {
        attributes.push(KeyValue::new(span_attrs::ERROR_CODE, code.clone()));
    }
    attributes
}

impl TelemetrySink for OtelSink {
    async fn record_event(&self, _event: &ExecutionEvent) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn end_span(&self, span: &NodeSpan, status: &SpanStatus, duration_ms: u64) -> Result<(), TelemetryError> {
        let started = SystemTime::from(span.started_at);
        let mut otel_span = self
            .tracer
            .span_builder(span_attrs::node_span_name(&span.node_type))
            .with_kind(SpanKind::Internal)
            .with_start_time(started)
            .with_attributes(node_attributes(span, status, duration_ms))
            .start(&self.tracer);

        match status {
            SpanStatus::Ok => otel_span.set_status(Status::Ok),
            SpanStatus::Error { message, .. } => otel_span.set_status(Status::error(message.clone())),
        }
        otel_span.end_with_timestamp(started + Duration::from_millis(duration_ms));
        Ok(())
    }
}
