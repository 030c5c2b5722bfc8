//! Execution context with write-once node outputs and scoped template resolution.
//!
//! `ExecutionContext` holds the caller's inputs, every node output recorded so
//! far, and scope variables (the `loop` binding inside loop iterations). Node
//! configs reference other values with `{{ ... }}` markers:
//!
//! - `{{inputs.task}}` -- a field of the workflow inputs
//! - `{{decompose.subtasks.0}}` -- a dot path into a node's output
//! - `{{loop.item}}` / `{{loop.index}}` -- the current iteration binding
//! - `{{primary.result ?? replan.result}}` -- first non-null alternative
//! - `{{summary.text?}}` -- optional reference, `null` when absent
//!
//! A node may only reference outputs of its transitive dependencies. Anything
//! that cannot be resolved is an explicit error, never a silent `null`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use weaver_types::execution::{NodeError, NodeErrorKind};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Reserved root for workflow inputs in template references.
pub const INPUTS_ROOT: &str = "inputs";

/// Scope variable bound inside loop iterations.
pub const LOOP_VARIABLE: &str = "loop";

/// Default maximum size of a single node output (1 MB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1_048_576;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("unresolved reference '{reference}': {reason}")]
    UnresolvedReference { reference: String, reason: String },

    #[error("output for node '{node_id}' was already recorded with a different value")]
    OutputAlreadyRecorded { node_id: String },

    #[error("failed to serialize output of node '{node_id}': {message}")]
    Serialization { node_id: String, message: String },
}

impl ContextError {
    fn unresolved(reference: &str, reason: impl Into<String>) -> Self {
        ContextError::UnresolvedReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ContextError> for NodeError {
    fn from(err: ContextError) -> Self {
        let kind = match err {
            ContextError::UnresolvedReference { .. } => NodeErrorKind::UnresolvedReference,
            _ => NodeErrorKind::ValidationError,
        };
        NodeError::new(kind, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Data flowing through one execution scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Caller-supplied inputs. Never modified.
    pub inputs: Value,
    /// Outputs keyed by node id. Grows monotonically.
    pub node_outputs: BTreeMap<String, Value>,
    /// Scope bindings such as `loop`.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

/// Outputs of the declared output nodes, plus any that never completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalOutputs {
    pub outputs: Map<String, Value>,
    /// Output nodes with no recorded value. Their slots are omitted.
    pub missing: Vec<String>,
}

impl ExecutionContext {
    pub fn new(inputs: Value) -> Self {
        Self::with_limit(inputs, DEFAULT_MAX_OUTPUT_BYTES)
    }

    pub fn with_limit(inputs: Value, max_output_bytes: usize) -> Self {
        Self {
            inputs,
            node_outputs: BTreeMap::new(),
            variables: BTreeMap::new(),
            max_output_bytes,
        }
    }

    /// Record a node's output.
    ///
    /// Outputs larger than `max_output_bytes` (serialized) are replaced with a
    /// truncation marker. Recording the same value twice is a no-op; a
    /// different value for an already-recorded node is rejected.
    pub fn record_output(&mut self, node_id: &str, output: Value) -> Result<(), ContextError> {
        let serialized = serde_json::to_string(&output).map_err(|e| ContextError::Serialization {
            node_id: node_id.to_string(),
            message: e.to_string(),
        })?;

        let output = if serialized.len() > self.max_output_bytes {
            tracing::warn!(
                node_id,
                size = serialized.len(),
                max = self.max_output_bytes,
                "node output exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": serialized.len(),
                "_message": format!(
                    "output exceeded {} byte limit and was truncated",
                    self.max_output_bytes
                )
            })
        } else {
            output
        };

        match self.node_outputs.get(node_id) {
            Some(existing) if *existing == output => Ok(()),
            Some(_) => Err(ContextError::OutputAlreadyRecorded {
                node_id: node_id.to_string(),
            }),
            None => {
                self.node_outputs.insert(node_id.to_string(), output);
                Ok(())
            }
        }
    }

    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.node_outputs.get(node_id)
    }

    /// A copy of this context with `loop` bound to `binding`.
    ///
    /// Outputs recorded in the child never reach the parent, so each loop
    /// iteration runs in its own namespace.
    pub fn child_scope(&self, binding: Value) -> Self {
        let mut child = self.clone();
        child.variables.insert(LOOP_VARIABLE.to_string(), binding);
        child
    }

    /// Substitute every `{{ ... }}` marker in the string leaves of `template`.
    pub fn resolve(
        &self,
        template: &Value,
        visible: &BTreeSet<String>,
    ) -> Result<Value, ContextError> {
        match template {
            Value::String(s) => self.resolve_str(s, visible),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item, visible))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (key, value) in map {
                    resolved.insert(key.clone(), self.resolve(value, visible)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve one string.
    ///
    /// A string that is exactly one marker yields the referenced value with
    /// its JSON type intact. Embedded markers are interpolated as text.
    pub fn resolve_str(
        &self,
        template: &str,
        visible: &BTreeSet<String>,
    ) -> Result<Value, ContextError> {
        if let Some(expr) = single_marker(template.trim()) {
            return self.evaluate(expr, visible);
        }
        if !template.contains("{{") {
            return Ok(Value::String(template.to_string()));
        }

        let mut result = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            let Some(len) = rest[start + 2..].find("}}") else {
                break;
            };
            result.push_str(&rest[..start]);
            let expr = &rest[start + 2..start + 2 + len];
            result.push_str(&value_to_string(&self.evaluate(expr, visible)?));
            rest = &rest[start + 2 + len + 2..];
        }
        result.push_str(rest);
        Ok(Value::String(result))
    }

    /// Evaluate the inside of a marker: one or more `??`-separated alternatives.
    fn evaluate(&self, expr: &str, visible: &BTreeSet<String>) -> Result<Value, ContextError> {
        let alternatives: Vec<&str> = expr.split("??").map(str::trim).collect();

        if let [single] = alternatives.as_slice() {
            return match single.strip_suffix('?') {
                Some(optional) => Ok(self.lookup(optional.trim(), visible)?.unwrap_or(Value::Null)),
                None => self
                    .lookup(single, visible)?
                    .ok_or_else(|| ContextError::unresolved(single, "no value at this path")),
            };
        }

        let mut saw_null = false;
        for alternative in &alternatives {
            let reference = alternative.strip_suffix('?').unwrap_or(alternative).trim();
            match self.lookup(reference, visible)? {
                Some(Value::Null) => saw_null = true,
                Some(value) => return Ok(value),
                None => {}
            }
        }
        if saw_null {
            Ok(Value::Null)
        } else {
            Err(ContextError::unresolved(
                expr.trim(),
                "no alternative produced a value",
            ))
        }
    }

    /// Look up one reference or literal.
    ///
    /// `Ok(None)` means the reference is legal but has no value yet. Invalid
    /// syntax and references to non-upstream nodes are errors.
    fn lookup(
        &self,
        reference: &str,
        visible: &BTreeSet<String>,
    ) -> Result<Option<Value>, ContextError> {
        if let Some(literal) = parse_literal(reference) {
            return Ok(Some(literal));
        }

        let mut segments = reference.split('.');
        let root = segments.next().unwrap_or_default();
        if root.is_empty() {
            return Err(ContextError::unresolved(reference, "empty reference"));
        }

        let base = if root == INPUTS_ROOT {
            Some(&self.inputs)
        } else if let Some(variable) = self.variables.get(root) {
            Some(variable)
        } else if visible.contains(root) {
            self.node_outputs.get(root)
        } else {
            return Err(ContextError::unresolved(
                reference,
                format!("'{root}' is not an upstream dependency of this node"),
            ));
        };

        let Some(mut current) = base else {
            return Ok(None);
        };
        for segment in segments {
            if segment.is_empty() {
                return Err(ContextError::unresolved(reference, "empty path segment"));
            }
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Ok(None),
            }
        }
        Ok(Some(current.clone()))
    }

    /// The context object handed to an activity: inputs, the outputs this node
    /// may see, and scope variables.
    ///
    /// ```json
    /// { "inputs": {..}, "nodes": { "<id>": <output>, .. }, "loop": {..} }
    /// ```
    pub fn visible_view(&self, visible: &BTreeSet<String>) -> Value {
        let nodes: Map<String, Value> = self
            .node_outputs
            .iter()
            .filter(|(id, _)| visible.contains(*id))
            .map(|(id, output)| (id.clone(), output.clone()))
            .collect();

        let mut view = Map::new();
        view.insert(INPUTS_ROOT.to_string(), self.inputs.clone());
        view.insert("nodes".to_string(), Value::Object(nodes));
        for (name, value) in &self.variables {
            view.insert(name.clone(), value.clone());
        }
        Value::Object(view)
    }

    /// Assemble the public result from the declared output nodes.
    ///
    /// Object outputs are merged key by key (the first node in `output_node_ids`
    /// wins a conflict); any other output is stored under its node id.
    pub fn build_final_outputs(&self, output_node_ids: &[String]) -> FinalOutputs {
        let mut final_outputs = FinalOutputs::default();
        for id in output_node_ids {
            match self.node_outputs.get(id) {
                Some(Value::Object(map)) => {
                    for (key, value) in map {
                        final_outputs
                            .outputs
                            .entry(key.clone())
                            .or_insert_with(|| value.clone());
                    }
                }
                Some(other) => {
                    final_outputs.outputs.insert(id.clone(), other.clone());
                }
                None => {
                    tracing::debug!(node_id = id.as_str(), "output node has no recorded value");
                    final_outputs.missing.push(id.clone());
                }
            }
        }
        final_outputs
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn single_marker(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        None
    } else {
        Some(inner)
    }
}

/// JSON literals usable as `??` fallbacks: strings, numbers, booleans, null.
/// Whether a reference root named `id` would resolve to something other than
/// a node output: the inputs, a scope variable, or a literal.
pub fn is_reserved_root(id: &str) -> bool {
    id == INPUTS_ROOT || id == LOOP_VARIABLE || parse_literal(id).is_some()
}

fn parse_literal(s: &str) -> Option<Value> {
    let first = s.chars().next()?;
    let literal_like = first == '"'
        || first == '-'
        || first.is_ascii_digit()
        || matches!(s, "true" | "false" | "null");
    if !literal_like {
        return None;
    }
    serde_json::from_str::<Value>(s)
        .ok()
        .filter(|v| !v.is_object() && !v.is_array())
}

/// Convert a JSON value to a display string for template interpolation.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
