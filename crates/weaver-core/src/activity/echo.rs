//! Echo activity: a dependency-free backend for dry runs and demos.
//!
//! - `input` nodes return the workflow inputs
//! - `switch` nodes route to `config.route` (or `default`)
//! - `wait` nodes sleep for `config.durationMs`, honoring cancellation
//! - every other node returns its resolved config unchanged

use std::time::Duration;

use serde_json::{json, Value};
use weaver_types::execution::{ActivityResult, NodeError, NodeErrorKind};
use weaver_types::workflow::NodeType;

use super::{ExecutionMeta, NodeActivity};
use crate::workflow::switch::SELECTED_ROUTE_FIELD;

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoActivity;

impl NodeActivity for EchoActivity {
    async fn execute_node(
        &self,
        node_type: NodeType,
        config: &Value,
        context: &Value,
        meta: &ExecutionMeta,
    ) -> ActivityResult {
        tracing::debug!(node_id = meta.node_id.as_str(), %node_type, "echo activity");
        match node_type {
            NodeType::Input => ActivityResult::ok(context.get("inputs").cloned().unwrap_or(Value::Null)),
            NodeType::Switch => {
                let route = config
                    .get("route")
                    .and_then(Value::as_str)
                    .unwrap_or("default");
                ActivityResult::ok(json!({ SELECTED_ROUTE_FIELD: route }))
            }
            NodeType::Wait => {
                let ms = config.get("durationMs").and_then(Value::as_u64).unwrap_or(0);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => ActivityResult::ok(config.clone()),
                    _ = meta.cancel.cancelled() => ActivityResult::failure(NodeError::new(
                        NodeErrorKind::Cancelled,
                        "wait cancelled",
                    )),
                }
            }
            _ => ActivityResult::ok(config.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn meta() -> ExecutionMeta {
        ExecutionMeta {
            execution_id: Uuid::now_v7(),
            node_id: "n".to_string(),
            node_name: "N".to_string(),
            attempt: 1,
            iteration: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn echoes_config_and_inputs() {
        let ctx = json!({ "inputs": { "task": "t" }, "nodes": {} });
        let result = EchoActivity
            .execute_node(NodeType::Transform, &json!({ "x": 1 }), &ctx, &meta())
            .await;
        assert_eq!(result.output, json!({ "x": 1 }));

        let result = EchoActivity
            .execute_node(NodeType::Input, &json!({}), &ctx, &meta())
            .await;
        assert_eq!(result.output, json!({ "task": "t" }));
    }

    #[tokio::test]
    async fn switch_routes_from_config() {
        let result = EchoActivity
            .execute_node(NodeType::Switch, &json!({ "route": "B" }), &json!({}), &meta())
            .await;
        assert_eq!(result.output, json!({ "selectedRoute": "B" }));
    }

    #[tokio::test]
    async fn wait_observes_cancellation() {
        let meta = meta();
        meta.cancel.cancel();
        let result = EchoActivity
            .execute_node(NodeType::Wait, &json!({ "durationMs": 60_000 }), &json!({}), &meta)
            .await;
        assert_eq!(result.error.unwrap().kind, NodeErrorKind::Cancelled);
    }
}
