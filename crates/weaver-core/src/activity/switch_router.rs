//! Expression-driven switch routing.
//!
//! `SwitchRouter` decorates another activity. Switch nodes whose config
//! declares `cases` are routed here by evaluating each case's JEXL `when`
//! clause against the node's context; the first match wins, otherwise the
//! `default` route is selected. Everything else goes to the wrapped activity.
//!
//! ```json
//! { "cases": [ { "route": "A", "when": "nodes.classify.label == 'bug'" } ] }
//! ```

use serde_json::{json, Value};
use weaver_types::execution::{ActivityResult, NodeError};
use weaver_types::workflow::NodeType;

use super::{ExecutionMeta, NodeActivity};
use crate::workflow::compiler::DEFAULT_HANDLE;
use crate::workflow::expression::ExpressionEvaluator;
use crate::workflow::switch::SELECTED_ROUTE_FIELD;

pub struct SwitchRouter<A> {
    inner: A,
    evaluator: ExpressionEvaluator,
}

impl<A: NodeActivity> SwitchRouter<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            evaluator: ExpressionEvaluator::new(),
        }
    }

    fn route(&self, cases: &[Value], context: &Value) -> Result<String, NodeError> {
        for case in cases {
            let route = case
                .get("route")
                .and_then(Value::as_str)
                .ok_or_else(|| NodeError::validation("switch case is missing 'route'"))?;
            let when = case
                .get("when")
                .and_then(Value::as_str)
                .ok_or_else(|| NodeError::validation(format!("switch case '{route}' is missing 'when'")))?;
            let matched = self
                .evaluator
                .evaluate_bool(when, context)
                .map_err(|e| NodeError::validation(format!("case '{route}': {e}")))?;
            if matched {
                return Ok(route.to_string());
            }
        }
        Ok(DEFAULT_HANDLE.to_string())
    }
}

impl<A: NodeActivity> NodeActivity for SwitchRouter<A> {
    async fn execute_node(
        &self,
        node_type: NodeType,
        config: &Value,
        context: &Value,
        meta: &ExecutionMeta,
    ) -> ActivityResult {
        let cases = match (node_type, config.get("cases")) {
            (NodeType::Switch, Some(Value::Array(cases))) => cases,
            _ => return self.inner.execute_node(node_type, config, context, meta).await,
        };
        match self.route(cases, context) {
            Ok(route) => {
                tracing::debug!(node_id = meta.node_id.as_str(), route = route.as_str(), "switch evaluated");
                ActivityResult::ok(json!({ SELECTED_ROUTE_FIELD: route }))
            }
            Err(error) => ActivityResult::failure(error),
        }
    }
}
