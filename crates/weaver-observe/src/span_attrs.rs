//! Span attribute names for workflow execution telemetry.
//!
//! Used by [`crate::otel_sink::OtelSink`] when exporting node spans. Names are
//! namespaced under `weaver.` to stay clear of the OTel semantic conventions.

/// Name of the tracer every Weaver span is created with.
pub const TRACER_NAME: &str = "weaver";

// --- Execution ---

/// UUID of the execution the span belongs to.
pub const EXECUTION_ID: &str = "weaver.execution.id";

/// Workflow definition name.
pub const WORKFLOW_NAME: &str = "weaver.workflow.name";

// --- Node ---

pub const NODE_ID: &str = "weaver.node.id";

/// Wire name of the node type (e.g. "llm", "switch").
pub const NODE_TYPE: &str = "weaver.node.type";

/// Zero-based loop iteration; absent outside loop bodies.
pub const NODE_ITERATION: &str = "weaver.node.iteration";

pub const NODE_DURATION_MS: &str = "weaver.node.duration_ms";

// --- Outcome ---

/// Stable error code (`TIMEOUT`, `CREDIT_EXHAUSTED`, ...) of a failed node.
pub const ERROR_CODE: &str = "weaver.error.code";

/// Span name for a node invocation: `"node {type}"`.
pub fn node_span_name(node_type: &str) -> String {
    format!("node {node_type}")
}
