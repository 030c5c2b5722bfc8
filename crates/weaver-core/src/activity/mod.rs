//! Node execution activity contract.
//!
//! The engine never runs node bodies itself. Every node (other than loops,
//! which the engine drives) is handed to a [`NodeActivity`] together with its
//! resolved config and the view of upstream outputs it may see.

pub mod box_activity;
pub mod echo;
pub mod switch_router;

use std::future::Future;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weaver_types::execution::ActivityResult;
use weaver_types::workflow::NodeType;

/// Correlation data passed with every activity invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionMeta {
    pub execution_id: Uuid,
    pub node_id: String,
    pub node_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Loop iteration index when running inside a loop body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
    /// Cancelled when the execution is cancelled; activities should stop early.
    #[serde(skip)]
    pub cancel: CancellationToken,
}

/// Trait for node execution backends (LLM calls, HTTP, sandboxed code, ...).
///
/// Uses native async fn in traits (Rust 2024 edition, RPITIT).
/// For dynamic dispatch, use [`box_activity::BoxNodeActivity`].
///
/// Failures are reported in the returned [`ActivityResult`], never by
/// panicking. Timeouts and retries are applied by the engine around this call.
pub trait NodeActivity: Send + Sync {
    fn execute_node(
        &self,
        node_type: NodeType,
        config: &Value,
        context: &Value,
        meta: &ExecutionMeta,
    ) -> impl Future<Output = ActivityResult> + Send;
}
