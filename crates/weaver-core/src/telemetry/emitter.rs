use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;
use weaver_types::event::ExecutionEvent;
use weaver_types::execution::{NodeError, SkipReason};

use super::sink::{BoxTelemetrySink, EventBusSink, NodeSpan, SpanStatus, TracingSink};
use crate::event::bus::EventBus;
use crate::workflow::compiler::PlanNode;

/// Fans spans and execution events out to every configured sink.
#[derive(Debug, Clone)]
pub struct Telemetry {
    bus: EventBus,
    sinks: Vec<BoxTelemetrySink>,
}

impl Telemetry {
    /// Telemetry publishing to `bus` and to `tracing`.
    pub fn new(bus: EventBus) -> Self {
        let sinks = vec![
            BoxTelemetrySink::new("event_bus", EventBusSink::new(bus.clone())),
            BoxTelemetrySink::new("tracing", TracingSink),
        ];
        Self { bus, sinks }
    }

    pub fn with_sink(mut self, sink: BoxTelemetrySink) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    async fn emit(&self, event: ExecutionEvent) {
        for sink in &self.sinks {
            if let Err(e) = sink.record_event(&event).await {
                tracing::warn!(
                    sink = sink.name(),
                    event = event.event_type(),
                    error = %e,
                    "telemetry sink failed to record event"
                );
            }
        }
    }

    // -- Spans --------------------------------------------------------------

    pub async fn create_span(&self, execution_id: Uuid, node: &PlanNode, iteration: Option<usize>) -> NodeSpan {
        let span = NodeSpan {
            span_id: Uuid::now_v7(),
            execution_id,
            node_id: node.id.clone(),
            node_type: node.node_type.to_string(),
            iteration,
            started_at: Utc::now(),
        };
        for sink in &self.sinks {
            if let Err(e) = sink.start_span(&span).await {
                tracing::warn!(sink = sink.name(), node_id = node.id.as_str(), error = %e, "telemetry sink failed to start span");
            }
        }
        span
    }

    /// End a span; returns its duration in milliseconds.
    pub async fn end_span(&self, span: &NodeSpan, status: SpanStatus) -> u64 {
        let duration_ms = (Utc::now() - span.started_at).num_milliseconds().max(0) as u64;
        for sink in &self.sinks {
            if let Err(e) = sink.end_span(span, &status, duration_ms).await {
                tracing::warn!(
                    sink = sink.name(),
                    node_id = span.node_id.as_str(),
                    error = %e,
                    "telemetry sink failed to end span"
                );
            }
        }
        duration_ms
    }

    // -- Execution lifecycle ------------------------------------------------

    pub async fn emit_execution_started(&self, execution_id: Uuid, workflow_name: &str, total_nodes: usize) {
        self.emit(ExecutionEvent::ExecutionStarted {
            execution_id,
            workflow_name: workflow_name.to_string(),
            total_nodes,
        })
        .await;
    }

    pub async fn emit_execution_progress(&self, execution_id: Uuid, finished: usize, total: usize) {
        let progress = if total == 0 {
            100
        } else {
            ((finished.min(total) * 100) / total) as u8
        };
        self.emit(ExecutionEvent::ExecutionProgress {
            execution_id,
            finished,
            total,
            progress,
        })
        .await;
    }

    pub async fn emit_execution_completed(&self, execution_id: Uuid, duration_ms: u64, outputs: Value) {
        self.emit(ExecutionEvent::ExecutionCompleted {
            execution_id,
            duration_ms,
            outputs,
        })
        .await;
    }

    pub async fn emit_execution_failed(&self, execution_id: Uuid, error: &str, node_id: Option<&str>) {
        self.emit(ExecutionEvent::ExecutionFailed {
            execution_id,
            error: error.to_string(),
            node_id: node_id.map(str::to_string),
        })
        .await;
    }

    pub async fn emit_execution_cancelled(&self, execution_id: Uuid, reason: &str) {
        self.emit(ExecutionEvent::ExecutionCancelled {
            execution_id,
            reason: reason.to_string(),
        })
        .await;
    }

    pub async fn emit_execution_paused(&self, execution_id: Uuid, reason: &str) {
        self.emit(ExecutionEvent::ExecutionPaused {
            execution_id,
            reason: reason.to_string(),
        })
        .await;
    }

    // -- Nodes --------------------------------------------------------------

    pub async fn emit_node_started(&self, execution_id: Uuid, node: &PlanNode, iteration: Option<usize>) {
        self.emit(ExecutionEvent::NodeStarted {
            execution_id,
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            node_type: node.node_type.to_string(),
            iteration,
        })
        .await;
    }

    pub async fn emit_node_completed(
        &self,
        execution_id: Uuid,
        node_id: &str,
        duration_ms: u64,
        credits: u64,
        iteration: Option<usize>,
    ) {
        self.emit(ExecutionEvent::NodeCompleted {
            execution_id,
            node_id: node_id.to_string(),
            duration_ms,
            credits,
            iteration,
        })
        .await;
    }

    pub async fn emit_node_failed(
        &self,
        execution_id: Uuid,
        node_id: &str,
        error: &NodeError,
        will_retry: bool,
        iteration: Option<usize>,
    ) {
        self.emit(ExecutionEvent::NodeFailed {
            execution_id,
            node_id: node_id.to_string(),
            kind: error.kind,
            error: error.message.clone(),
            will_retry,
            iteration,
        })
        .await;
    }

    pub async fn emit_node_skipped(&self, execution_id: Uuid, node_id: &str, reason: SkipReason) {
        self.emit(ExecutionEvent::NodeSkipped {
            execution_id,
            node_id: node_id.to_string(),
            reason,
        })
        .await;
    }
}
