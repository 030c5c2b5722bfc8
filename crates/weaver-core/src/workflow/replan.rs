//! Replanning hook for loops with `enableReplanning`.
//!
//! When an iteration's body fails, the loop asks a [`ReplanPolicy`] what to do
//! with the iterations that have not run yet. Completed iterations are never
//! re-executed and keep their result slots.

use serde_json::Value;
use weaver_types::execution::NodeError;

/// Snapshot of a loop at the moment an iteration failed.
#[derive(Debug)]
pub struct ReplanRequest<'a> {
    pub loop_node_id: &'a str,
    pub failed_index: usize,
    pub error: &'a NodeError,
    /// Result slot per iteration started so far (`None` for failed iterations).
    pub completed: &'a [Option<Value>],
    /// Items not yet started, in order.
    pub remaining: &'a [Value],
}

/// What the loop does next.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplanDecision {
    /// Leave the failed slot as `null` and continue with the remaining items.
    Skip,
    /// Leave the failed slot as `null` and run these items instead of the remaining ones.
    Substitute(Vec<Value>),
    /// Fail the loop node with the iteration's error.
    Abort,
}

/// Pluggable replanning strategy.
pub trait ReplanPolicy: Send + Sync {
    fn replan(&self, request: &ReplanRequest<'_>) -> ReplanDecision;
}

/// Default policy: drop the failed iteration and carry on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipFailedIteration;

impl ReplanPolicy for SkipFailedIteration {
    fn replan(&self, request: &ReplanRequest<'_>) -> ReplanDecision {
        tracing::debug!(
            loop_node_id = request.loop_node_id,
            failed_index = request.failed_index,
            remaining = request.remaining.len(),
            error = %request.error,
            "skipping failed iteration"
        );
        ReplanDecision::Skip
    }
}

/// Treat any iteration failure as fatal, as if replanning were disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortOnFailure;

impl ReplanPolicy for AbortOnFailure {
    fn replan(&self, _request: &ReplanRequest<'_>) -> ReplanDecision {
        ReplanDecision::Abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request<'a>(error: &'a NodeError, completed: &'a [Option<Value>], remaining: &'a [Value]) -> ReplanRequest<'a> {
        ReplanRequest {
            loop_node_id: "execute_subtasks",
            failed_index: 1,
            error,
            completed,
            remaining,
        }
    }

    #[test]
    fn builtin_policies() {
        let error = NodeError::activity("subtask failed");
        let completed = [Some(json!("a")), None];
        let remaining = [json!(["d"])];
        let req = request(&error, &completed, &remaining);
        assert_eq!(SkipFailedIteration.replan(&req), ReplanDecision::Skip);
        assert_eq!(AbortOnFailure.replan(&req), ReplanDecision::Abort);
    }
}
