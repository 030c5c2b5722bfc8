//! Workflow definition types for Weaver.
//!
//! `WorkflowDefinition` is the one external format the engine parses: a JSON
//! object of nodes keyed by id, an ordered edge list, and an entry point. The
//! visual editor, YAML files, and SDK callers all produce this shape.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The authored workflow graph.
///
/// Nodes are kept in a `BTreeMap` so every iteration over them is ordered by
/// id, independent of how the JSON object was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Node definitions keyed by node id.
    pub nodes: BTreeMap<String, NodeDefinition>,
    /// Ordered list of edges between nodes.
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
    /// Node id where execution starts.
    pub entry_point: String,
}

impl WorkflowDefinition {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.get(id)
    }
}

/// A single node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    /// Node type string (e.g. "llm", "switch"). Validated at compile time.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Display name.
    pub name: String,
    /// Opaque node configuration. String fields may contain `{{node.path}}` markers.
    #[serde(default)]
    pub config: Value,
    /// Canvas position. Cosmetic only.
    #[serde(default)]
    pub position: Position,
    /// Failure policy applied when the node's activity reports failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorPolicy>,
    /// Retry configuration applied by the activity layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Per-node timeout in milliseconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Canvas position coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A directed link between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDefinition {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Output handle on the source node (`case-<value>`, `default`, `loop-body`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Input handle on the target node (`loop-return` for loop back edges).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

// ---------------------------------------------------------------------------
// Node types
// ---------------------------------------------------------------------------

/// The closed set of node types the engine accepts.
///
/// Only `Switch` and `Loop` have scheduling-visible behavior; every other type
/// is an opaque activity invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    Input,
    Output,
    Llm,
    Transform,
    Loop,
    Switch,
    Code,
    Http,
    Vision,
    FileOperations,
    Wait,
    Database,
    Integration,
}

impl NodeType {
    /// All node types, in declaration order.
    pub const ALL: [NodeType; 13] = [
        NodeType::Input,
        NodeType::Output,
        NodeType::Llm,
        NodeType::Transform,
        NodeType::Loop,
        NodeType::Switch,
        NodeType::Code,
        NodeType::Http,
        NodeType::Vision,
        NodeType::FileOperations,
        NodeType::Wait,
        NodeType::Database,
        NodeType::Integration,
    ];

    /// Canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Input => "input",
            NodeType::Output => "output",
            NodeType::Llm => "llm",
            NodeType::Transform => "transform",
            NodeType::Loop => "loop",
            NodeType::Switch => "switch",
            NodeType::Code => "code",
            NodeType::Http => "http",
            NodeType::Vision => "vision",
            NodeType::FileOperations => "fileOperations",
            NodeType::Wait => "wait",
            NodeType::Database => "database",
            NodeType::Integration => "integration",
        }
    }

    /// Whether the scheduler must intercept this node type.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, NodeType::Switch | NodeType::Loop)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a node type string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown node type '{0}'")]
pub struct UnknownNodeType(pub String);

impl FromStr for NodeType {
    type Err = UnknownNodeType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(NodeType::Input),
            "output" => Ok(NodeType::Output),
            "llm" => Ok(NodeType::Llm),
            "transform" => Ok(NodeType::Transform),
            "loop" => Ok(NodeType::Loop),
            "switch" | "conditional" => Ok(NodeType::Switch),
            "code" => Ok(NodeType::Code),
            "http" => Ok(NodeType::Http),
            "vision" => Ok(NodeType::Vision),
            "fileOperations" | "file_operations" => Ok(NodeType::FileOperations),
            "wait" => Ok(NodeType::Wait),
            "database" => Ok(NodeType::Database),
            "integration" => Ok(NodeType::Integration),
            other => Err(UnknownNodeType(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Error policy
// ---------------------------------------------------------------------------

/// Node-level failure policy (`onError`).
///
/// ```json
/// { "strategy": "goto", "goto": "replan" }
/// { "strategy": "continue", "fallbackValue": { "items": [] } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Fail the execution (same as an absent policy).
    Fail,
    /// Treat the node as completed with a null or fallback output.
    Continue {
        #[serde(
            default,
            rename = "fallbackValue",
            skip_serializing_if = "Option::is_none"
        )]
        fallback_value: Option<Value>,
    },
    /// Skip the node's dependents and force the target node ready.
    Goto { goto: String },
}

impl ErrorPolicy {
    /// The goto target, if this is a goto policy.
    pub fn goto_target(&self) -> Option<&str> {
        match self {
            ErrorPolicy::Goto { goto } => Some(goto.as_str()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry Configuration
// ---------------------------------------------------------------------------

/// Retry configuration for a node's activity invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts; doubled after each failure.
    #[serde(default)]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
