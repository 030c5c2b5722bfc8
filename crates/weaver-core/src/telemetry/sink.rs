//! Telemetry sink trait and the built-in sinks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use weaver_types::event::ExecutionEvent;

use super::TelemetryError;
use crate::event::bus::EventBus;

/// A node invocation being measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpan {
    pub span_id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
    pub started_at: DateTime<Utc>,
}

/// How a span ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error { code: String, message: String },
}

/// Receives spans and execution events.
///
/// Span hooks default to no-ops so event-only sinks implement one method.
pub trait TelemetrySink: Send + Sync {
    fn record_event(
        &self,
        event: &ExecutionEvent,
    ) -> impl Future<Output = Result<(), TelemetryError>> + Send;

    fn start_span(&self, _span: &NodeSpan) -> impl Future<Output = Result<(), TelemetryError>> + Send {
        async { Ok(()) }
    }

    fn end_span(
        &self,
        _span: &NodeSpan,
        _status: &SpanStatus,
        _duration_ms: u64,
    ) -> impl Future<Output = Result<(), TelemetryError>> + Send {
        async { Ok(()) }
    }
}

type BoxFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TelemetryError>> + Send + 'a>>;

/// Object-safe version of [`TelemetrySink`].
pub trait TelemetrySinkDyn: Send + Sync {
    fn record_event_boxed<'a>(&'a self, event: &'a ExecutionEvent) -> BoxFuture<'a>;
    fn start_span_boxed<'a>(&'a self, span: &'a NodeSpan) -> BoxFuture<'a>;
    fn end_span_boxed<'a>(&'a self, span: &'a NodeSpan, status: &'a SpanStatus, duration_ms: u64) -> BoxFuture<'a>;
}

impl<T: TelemetrySink> TelemetrySinkDyn for T {
    fn record_event_boxed<'a>(&'a self, event: &'a ExecutionEvent) -> BoxFuture<'a> {
        Box::pin(self.record_event(event))
    }

    fn start_span_boxed<'a>(&'a self, span: &'a NodeSpan) -> BoxFuture<'a> {
        Box::pin(self.start_span(span))
    }

    fn end_span_boxed<'a>(&'a self, span: &'a NodeSpan, status: &'a SpanStatus, duration_ms: u64) -> BoxFuture<'a> {
        Box::pin(self.end_span(span, status, duration_ms))
    }
}

/// Type-erased, cloneable telemetry sink.
#[derive(Clone)]
pub struct BoxTelemetrySink {
    inner: Arc<dyn TelemetrySinkDyn>,
    name: &'static str,
}

impl BoxTelemetrySink {
    pub fn new<T: TelemetrySink + 'static>(name: &'static str, sink: T) -> Self {
        Self {
            inner: Arc::new(sink),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn record_event(&self, event: &ExecutionEvent) -> Result<(), TelemetryError> {
        self.inner.record_event_boxed(event).await
    }

    pub async fn start_span(&self, span: &NodeSpan) -> Result<(), TelemetryError> {
        self.inner.start_span_boxed(span).await
    }

    pub async fn end_span(&self, span: &NodeSpan, status: &SpanStatus, duration_ms: u64) -> Result<(), TelemetryError> {
        self.inner.end_span_boxed(span, status, duration_ms).await
    }
}

impl std::fmt::Debug for BoxTelemetrySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTelemetrySink").field("name", &self.name).finish()
    }
}

/// Publishes events to an [`EventBus`]. Never fails: a bus with no
/// subscribers simply drops the event.
#[derive(Debug, Clone)]
pub struct EventBusSink {
    bus: EventBus,
}

impl EventBusSink {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl TelemetrySink for EventBusSink {
    async fn record_event(&self, event: &ExecutionEvent) -> Result<(), TelemetryError> {
        self.bus.publish(event.clone());
        Ok(())
    }
}

/// Writes events and spans to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    async fn record_event(&self, event: &ExecutionEvent) -> Result<(), TelemetryError> {
        let execution_id = event.execution_id();
        match event {
            ExecutionEvent::ExecutionStarted {
                workflow_name,
                total_nodes,
                ..
            } => tracing::info!(%execution_id, workflow = workflow_name.as_str(), total_nodes, "execution started"),
            ExecutionEvent::ExecutionCompleted { duration_ms, .. } => {
                tracing::info!(%execution_id, duration_ms, "execution completed");
            }
            ExecutionEvent::ExecutionFailed { error, node_id, .. } => {
                tracing::info!(%execution_id, node_id = node_id.as_deref(), error = error.as_str(), "execution failed");
            }
            ExecutionEvent::ExecutionCancelled { reason, .. } => {
                tracing::info!(%execution_id, reason = reason.as_str(), "execution cancelled");
            }
            ExecutionEvent::ExecutionPaused { reason, .. } => {
                tracing::info!(%execution_id, reason = reason.as_str(), "execution paused");
            }
            ExecutionEvent::NodeFailed {
                node_id,
                kind,
                error,
                will_retry,
                ..
            } => tracing::debug!(
                %execution_id,
                node_id = node_id.as_str(),
                code = kind.code(),
                will_retry,
                error = error.as_str(),
                "node failed"
            ),
            other => tracing::debug!(%execution_id, event = other.event_type(), "execution event"),
        }
        Ok(())
    }

    async fn end_span(&self, span: &NodeSpan, status: &SpanStatus, duration_ms: u64) -> Result<(), TelemetryError> {
        let ok = matches!(status, SpanStatus::Ok);
        tracing::debug!(
            execution_id = %span.execution_id,
            node_id = span.node_id.as_str(),
            node_type = span.node_type.as_str(),
            iteration = span.iteration,
            duration_ms,
            ok,
            "node span ended"
        );
        Ok(())
    }
}
