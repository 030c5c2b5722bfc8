//! Execution-time types shared between the engine and its collaborators.
//!
//! Everything here crosses the activity boundary or ends up in a serialized
//! execution result, so all types are `Serialize + Deserialize`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Status of a single node within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Executing,
    Completed,
    Failed,
    Skipped,
}

/// Why a node ended up skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Every inbound path was pruned by switch branch selection.
    BranchNotTaken,
    /// Every inbound path was cut by an upstream failure or skip.
    UpstreamFailed,
    /// Not reachable from the entry point.
    Unreachable,
    /// The execution was cancelled before the node ran.
    Cancelled,
    /// The execution stopped dispatching after an unrecovered failure.
    Halted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::BranchNotTaken => "branch not taken",
            SkipReason::UpstreamFailed => "upstream failed",
            SkipReason::Unreachable => "unreachable",
            SkipReason::Cancelled => "cancelled",
            SkipReason::Halted => "halted",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Node errors
// ---------------------------------------------------------------------------

/// Category of a node execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeErrorKind {
    Timeout,
    ValidationError,
    UnresolvedReference,
    CreditExhausted,
    LoopLimitExceeded,
    Cancelled,
    /// Provider- or activity-specific failure.
    Activity,
}

impl NodeErrorKind {
    /// Stable machine code.
    pub fn code(&self) -> &'static str {
        match self {
            NodeErrorKind::Timeout => "TIMEOUT",
            NodeErrorKind::ValidationError => "VALIDATION_ERROR",
            NodeErrorKind::UnresolvedReference => "UNRESOLVED_REFERENCE",
            NodeErrorKind::CreditExhausted => "CREDIT_EXHAUSTED",
            NodeErrorKind::LoopLimitExceeded => "LOOP_LIMIT_EXCEEDED",
            NodeErrorKind::Cancelled => "CANCELLED",
            NodeErrorKind::Activity => "ACTIVITY",
        }
    }
}

/// Error descriptor recorded for a failed node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub message: String,
    /// Whether the activity considers the failure transient.
    #[serde(default)]
    pub retryable: bool,
    /// Extra structured context (partial loop results, provider payloads).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl NodeError {
    pub fn new(kind: NodeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    pub fn activity(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::Activity, message)
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self {
            retryable: true,
            ..Self::new(
                NodeErrorKind::Timeout,
                format!("node timed out after {timeout_ms}ms"),
            )
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(NodeErrorKind::ValidationError, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for NodeError {}

// ---------------------------------------------------------------------------
// Activity results
// ---------------------------------------------------------------------------

/// Usage metrics reported by an activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    /// Pre-computed credit cost; overrides the engine's cost functions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<u64>,
}

/// Result returned by the node execution activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityResult {
    pub success: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<NodeMetrics>,
}

impl ActivityResult {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            metrics: None,
        }
    }

    pub fn failure(error: NodeError) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: NodeMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Normalize into `Ok(output)` or `Err(error)`.
    ///
    /// A result with `success = false` and no error descriptor becomes a
    /// generic activity error.
    pub fn into_outcome(self) -> Result<Value, NodeError> {
        if self.success {
            Ok(self.output)
        } else {
            Err(self
                .error
                .unwrap_or_else(|| NodeError::activity("activity reported failure without an error")))
        }
    }
}
