//! Loop iteration bookkeeping.
//!
//! [`LoopState`] decides which item runs next, owns the per-iteration result
//! slots, enforces `maxIterations`, and applies the replanning policy when an
//! iteration fails. The engine drives the iterations themselves, running the
//! loop's body plan once per item in a child context.

use std::collections::{BTreeSet, VecDeque};

use serde_json::{json, Map, Value};
use weaver_types::execution::{NodeError, NodeErrorKind};

use super::compiler::{CompiledPlan, LimitPolicy, LoopContext};
use super::context::ExecutionContext;
use super::replan::{ReplanDecision, ReplanPolicy, ReplanRequest};

/// Resolve a loop's `iterateOver` source to the list of items.
pub fn resolve_items(
    source: &Value,
    context: &ExecutionContext,
    visible: &BTreeSet<String>,
) -> Result<Vec<Value>, NodeError> {
    match context.resolve(source, visible)? {
        Value::Array(items) => Ok(items),
        other => Err(NodeError::validation(format!(
            "iterateOver must resolve to an array, got {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Result of one iteration: the body's single output node's value, a map of
/// output values when the body has several, or the item itself for a body
/// with no output nodes.
pub fn iteration_result(body: &CompiledPlan, context: &ExecutionContext, item: &Value) -> Value {
    match body.output_node_ids.as_slice() {
        [] => item.clone(),
        [single] => context.output(single).cloned().unwrap_or(Value::Null),
        several => {
            let outputs: Map<String, Value> = several
                .iter()
                .filter_map(|id| context.output(id).map(|v| (id.clone(), v.clone())))
                .collect();
            Value::Object(outputs)
        }
    }
}

/// Progress of one loop node.
#[derive(Debug)]
pub struct LoopState {
    loop_node_id: String,
    remaining: VecDeque<Value>,
    /// One slot per started iteration; `None` until it succeeds.
    results: Vec<Option<Value>>,
    max_iterations: usize,
    on_limit_exceeded: LimitPolicy,
    replanning: bool,
    sequential: bool,
    limit_hit: bool,
    failure: Option<NodeError>,
}

impl LoopState {
    pub fn new(ctx: &LoopContext, items: Vec<Value>) -> Self {
        Self {
            loop_node_id: ctx.loop_node_id.clone(),
            remaining: items.into(),
            results: Vec::new(),
            max_iterations: ctx.max_iterations,
            on_limit_exceeded: ctx.on_limit_exceeded,
            replanning: ctx.enable_replanning,
            sequential: !ctx.allow_parallel,
            limit_hit: false,
            failure: None,
        }
    }

    /// The next iteration to start, if any.
    ///
    /// Returns `None` once the items run out, the iteration cap is reached,
    /// or an iteration failure stopped the loop.
    pub fn next_iteration(&mut self) -> Option<(usize, Value)> {
        if self.failure.is_some() || self.remaining.is_empty() {
            return None;
        }
        if self.results.len() >= self.max_iterations {
            if !self.limit_hit {
                tracing::debug!(
                    loop_node_id = self.loop_node_id.as_str(),
                    max_iterations = self.max_iterations,
                    dropped = self.remaining.len(),
                    "loop iteration cap reached"
                );
            }
            self.limit_hit = true;
            return None;
        }
        let item = self.remaining.pop_front()?;
        let index = self.results.len();
        self.results.push(None);
        Some((index, item))
    }

    /// The `loop` variable for an iteration: `{item, index, results}`.
    ///
    /// Sequential loops see every earlier result. Parallel iterations see an
    /// empty list, since earlier iterations may still be running.
    pub fn binding(&self, index: usize, item: &Value) -> Value {
        let results: Vec<Value> = if self.sequential {
            self.results[..index.min(self.results.len())]
                .iter()
                .map(|slot| slot.clone().unwrap_or(Value::Null))
                .collect()
        } else {
            Vec::new()
        };
        json!({ "item": item, "index": index, "results": results })
    }

    pub fn record_success(&mut self, index: usize, result: Value) {
        if let Some(slot) = self.results.get_mut(index) {
            *slot = Some(result);
        }
    }

    /// Handle a failed iteration, consulting `policy` when replanning is enabled.
    ///
    /// Without replanning, or when the policy aborts, no further iterations
    /// start and the loop fails once running iterations finish.
    pub fn record_failure(&mut self, index: usize, error: NodeError, policy: &dyn ReplanPolicy) {
        if self.failure.is_some() {
            return;
        }
        let decision = if self.replanning {
            let remaining: Vec<Value> = self.remaining.iter().cloned().collect();
            policy.replan(&ReplanRequest {
                loop_node_id: &self.loop_node_id,
                failed_index: index,
                error: &error,
                completed: &self.results,
                remaining: &remaining,
            })
        } else {
            ReplanDecision::Abort
        };

        match decision {
            ReplanDecision::Skip => {
                tracing::debug!(loop_node_id = self.loop_node_id.as_str(), index, "iteration skipped after failure");
            }
            ReplanDecision::Substitute(items) => {
                tracing::debug!(
                    loop_node_id = self.loop_node_id.as_str(),
                    index,
                    replaced = self.remaining.len(),
                    substituted = items.len(),
                    "remaining iterations replanned"
                );
                self.remaining = items.into();
            }
            ReplanDecision::Abort => {
                let mut details = error.details.clone().unwrap_or_else(|| json!({}));
                if let Value::Object(map) = &mut details {
                    map.insert("iteration".to_string(), json!(index));
                }
                self.failure = Some(error.with_details(details));
            }
        }
    }

    /// Stop starting iterations after a cancellation.
    pub fn cancel(&mut self) {
        if self.failure.is_none() {
            self.failure = Some(NodeError::new(NodeErrorKind::Cancelled, "loop cancelled"));
        }
    }

    fn results_value(&self) -> Value {
        Value::Array(
            self.results
                .iter()
                .map(|slot| slot.clone().unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// The loop node's output, `{"results": [...], "iterations": n}`, or its failure.
    pub fn finish(self) -> Result<Value, NodeError> {
        let iterations = self.results.len();
        let results = self.results_value();
        if let Some(error) = self.failure {
            return Err(error);
        }
        if self.limit_hit && self.on_limit_exceeded == LimitPolicy::Fail {
            let dropped = self.remaining.len();
            return Err(NodeError::new(
                NodeErrorKind::LoopLimitExceeded,
                format!(
                    "loop '{}' exceeded maxIterations ({}); {dropped} item(s) not run",
                    self.loop_node_id, self.max_iterations
                ),
            )
            .with_details(json!({ "results": results, "iterations": iterations })));
        }
        Ok(json!({ "results": results, "iterations": iterations }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::replan::{AbortOnFailure, SkipFailedIteration};
    use std::collections::BTreeMap;

    fn loop_ctx(max_iterations: usize, policy: LimitPolicy, replanning: bool, parallel: bool) -> LoopContext {
        LoopContext {
            loop_node_id: "each".to_string(),
            body_node_ids: vec!["work".to_string()],
            body: Box::new(CompiledPlan {
                name: "wf/each".to_string(),
                entry_points: vec!["work".to_string()],
                nodes: BTreeMap::new(),
                edges: Vec::new(),
                execution_levels: Vec::new(),
                output_node_ids: vec!["work".to_string()],
                loop_contexts: BTreeMap::new(),
                unreachable: Vec::new(),
            }),
            iterate_over: json!([]),
            max_iterations,
            allow_parallel: parallel,
            enable_replanning: replanning,
            on_limit_exceeded: policy,
        }
    }

    fn run_all(state: &mut LoopState) {
        while let Some((index, item)) = state.next_iteration() {
            state.record_success(index, json!({ "done": item }));
        }
    }

    struct Substitute;

    impl ReplanPolicy for Substitute {
        fn replan(&self, request: &ReplanRequest<'_>) -> ReplanDecision {
            assert_eq!(request.remaining, &[json!("c")]);
            ReplanDecision::Substitute(vec![json!("x"), json!("y")])
        }
    }

    #[test]
    fn resolves_template_sources() {
        let mut ctx = ExecutionContext::new(json!({ "groups": [["a"], ["b", "c"]] }));
        ctx.record_output("plan", json!({ "steps": [1, 2, 3] })).unwrap();
        let visible = BTreeSet::from(["plan".to_string()]);

        let items = resolve_items(&json!("{{inputs.groups}}"), &ctx, &visible).unwrap();
        assert_eq!(items.len(), 2);
        let items = resolve_items(&json!("{{plan.steps}}"), &ctx, &visible).unwrap();
        assert_eq!(items, vec![json!(1), json!(2), json!(3)]);

        let err = resolve_items(&json!("{{inputs.missing?}}"), &ctx, &visible).unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::ValidationError);
        let err = resolve_items(&json!("{{other.steps}}"), &ctx, &visible).unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::UnresolvedReference);
    }

    #[test]
    fn sequential_binding_sees_earlier_results() {
        let mut state = LoopState::new(&loop_ctx(10, LimitPolicy::Fail, false, false), vec![json!("a"), json!("b")]);
        let (i0, a) = state.next_iteration().unwrap();
        state.record_success(i0, json!("A"));
        let (i1, b) = state.next_iteration().unwrap();
        assert_eq!(a, json!("a"));
        assert_eq!(
            state.binding(i1, &b),
            json!({ "item": "b", "index": 1, "results": ["A"] })
        );
    }

    #[test]
    fn limit_fail_runs_cap_then_fails_with_partial_results() {
        let items = (0..5).map(|i| json!(i)).collect();
        let mut state = LoopState::new(&loop_ctx(3, LimitPolicy::Fail, false, false), items);
        run_all(&mut state);
        let err = state.finish().unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::LoopLimitExceeded);
        let details = err.details.unwrap();
        assert_eq!(details["iterations"], json!(3));
        assert_eq!(details["results"][2], json!({ "done": 2 }));
    }

    #[test]
    fn limit_truncate_completes() {
        let items = (0..5).map(|i| json!(i)).collect();
        let mut state = LoopState::new(&loop_ctx(3, LimitPolicy::Truncate, false, false), items);
        run_all(&mut state);
        let output = state.finish().unwrap();
        assert_eq!(output["iterations"], json!(3));
        assert_eq!(output["results"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn failure_without_replanning_stops_the_loop() {
        let mut state = LoopState::new(
            &loop_ctx(10, LimitPolicy::Fail, false, false),
            vec![json!("a"), json!("b"), json!("c")],
        );
        let (i, _) = state.next_iteration().unwrap();
        state.record_failure(i, NodeError::activity("boom"), &SkipFailedIteration);
        assert!(state.next_iteration().is_none());
        let err = state.finish().unwrap_err();
        assert_eq!(err.message, "boom");
        assert_eq!(err.details.unwrap()["iteration"], json!(0));
    }

    #[test]
    fn replanning_skip_and_substitute() {
        let mut state = LoopState::new(
            &loop_ctx(10, LimitPolicy::Fail, true, false),
            vec![json!("a"), json!("b"), json!("c")],
        );
        let (i, _) = state.next_iteration().unwrap();
        state.record_failure(i, NodeError::activity("a failed"), &SkipFailedIteration);
        let (i, _) = state.next_iteration().unwrap();
        state.record_failure(i, NodeError::activity("b failed"), &Substitute);
        run_all(&mut state);

        let output = state.finish().unwrap();
        assert_eq!(
            output["results"],
            json!([null, null, { "done": "x" }, { "done": "y" }])
        );
    }

    #[test]
    fn replanning_abort_fails() {
        let mut state = LoopState::new(&loop_ctx(10, LimitPolicy::Fail, true, true), vec![json!("a")]);
        let (i, _) = state.next_iteration().unwrap();
        state.record_failure(i, NodeError::activity("nope"), &AbortOnFailure);
        assert!(state.finish().is_err());
    }

    #[test]
    fn iteration_result_shapes() {
        let ctx = loop_ctx(1, LimitPolicy::Fail, false, false);
        let mut child = ExecutionContext::new(json!({}));
        assert_eq!(iteration_result(&ctx.body, &child, &json!("item")), Value::Null);
        child.record_output("work", json!({ "ok": true })).unwrap();
        assert_eq!(iteration_result(&ctx.body, &child, &json!("item")), json!({ "ok": true }));

        let mut body = (*ctx.body).clone();
        body.output_node_ids.clear();
        assert_eq!(iteration_result(&body, &child, &json!("item")), json!("item"));
    }
}
