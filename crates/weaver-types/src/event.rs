//! Event types for the Weaver execution event bus.
//!
//! `ExecutionEvent` is broadcast while an execution runs. Wire names follow the
//! `scope:action` convention used by streaming clients (`node:started`,
//! `execution:completed`, ...).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::execution::{NodeErrorKind, SkipReason};

/// Events emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    #[serde(rename = "execution:started")]
    ExecutionStarted {
        execution_id: Uuid,
        workflow_name: String,
        total_nodes: usize,
    },

    /// Emitted after every node reaches a terminal state.
    #[serde(rename = "execution:progress")]
    ExecutionProgress {
        execution_id: Uuid,
        finished: usize,
        total: usize,
        /// Whole-number percentage (0-100).
        progress: u8,
    },

    #[serde(rename = "node:started")]
    NodeStarted {
        execution_id: Uuid,
        node_id: String,
        node_name: String,
        node_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<usize>,
    },

    #[serde(rename = "node:completed")]
    NodeCompleted {
        execution_id: Uuid,
        node_id: String,
        duration_ms: u64,
        credits: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<usize>,
    },

    #[serde(rename = "node:failed")]
    NodeFailed {
        execution_id: Uuid,
        node_id: String,
        kind: NodeErrorKind,
        error: String,
        will_retry: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<usize>,
    },

    #[serde(rename = "node:skipped")]
    NodeSkipped {
        execution_id: Uuid,
        node_id: String,
        reason: SkipReason,
    },

    #[serde(rename = "execution:completed")]
    ExecutionCompleted {
        execution_id: Uuid,
        duration_ms: u64,
        outputs: Value,
    },

    #[serde(rename = "execution:failed")]
    ExecutionFailed {
        execution_id: Uuid,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
    },

    #[serde(rename = "execution:cancelled")]
    ExecutionCancelled { execution_id: Uuid, reason: String },

    #[serde(rename = "execution:paused")]
    ExecutionPaused { execution_id: Uuid, reason: String },
}

impl ExecutionEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::ExecutionProgress { execution_id, .. }
            | ExecutionEvent::NodeStarted { execution_id, .. }
            | ExecutionEvent::NodeCompleted { execution_id, .. }
            | ExecutionEvent::NodeFailed { execution_id, .. }
            | ExecutionEvent::NodeSkipped { execution_id, .. }
            | ExecutionEvent::ExecutionCompleted { execution_id, .. }
            | ExecutionEvent::ExecutionFailed { execution_id, .. }
            | ExecutionEvent::ExecutionCancelled { execution_id, .. }
            | ExecutionEvent::ExecutionPaused { execution_id, .. } => *execution_id,
        }
    }

    /// Whether this event ends the execution's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::ExecutionCompleted { .. }
                | ExecutionEvent::ExecutionFailed { .. }
                | ExecutionEvent::ExecutionCancelled { .. }
        )
    }

    /// Wire name of the event (`node:started`, ...).
    pub fn event_type(&self) -> &'static str {
        match self {
            ExecutionEvent::ExecutionStarted { .. } => "execution:started",
            ExecutionEvent::ExecutionProgress { .. } => "execution:progress",
            ExecutionEvent::NodeStarted { .. } => "node:started",
            ExecutionEvent::NodeCompleted { .. } => "node:completed",
            ExecutionEvent::NodeFailed { .. } => "node:failed",
            ExecutionEvent::NodeSkipped { .. } => "node:skipped",
            ExecutionEvent::ExecutionCompleted { .. } => "execution:completed",
            ExecutionEvent::ExecutionFailed { .. } => "execution:failed",
            ExecutionEvent::ExecutionCancelled { .. } => "execution:cancelled",
            ExecutionEvent::ExecutionPaused { .. } => "execution:paused",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_use_scoped_wire_names() {
        let id = Uuid::nil();
        let event = ExecutionEvent::NodeStarted {
            execution_id: id,
            node_id: "decompose".to_string(),
            node_name: "Decompose".to_string(),
            node_type: "llm".to_string(),
            iteration: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "node:started");
        assert_eq!(value["node_id"], "decompose");
        assert!(value.get("iteration").is_none());
        assert_eq!(event.event_type(), "node:started");

        let back: ExecutionEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn progress_event_shape() {
        let event = ExecutionEvent::ExecutionProgress {
            execution_id: Uuid::nil(),
            finished: 3,
            total: 4,
            progress: 75,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "execution:progress");
        assert_eq!(value["progress"], json!(75));
    }

    #[test]
    fn terminal_events() {
        let id = Uuid::nil();
        assert!(ExecutionEvent::ExecutionCancelled {
            execution_id: id,
            reason: "user".to_string()
        }
        .is_terminal());
        assert!(!ExecutionEvent::ExecutionPaused {
            execution_id: id,
            reason: "host".to_string()
        }
        .is_terminal());
        assert_eq!(
            ExecutionEvent::NodeSkipped {
                execution_id: id,
                node_id: "x".to_string(),
                reason: SkipReason::BranchNotTaken,
            }
            .execution_id(),
            id
        );
    }
}
