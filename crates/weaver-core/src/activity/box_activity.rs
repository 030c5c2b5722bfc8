//! BoxNodeActivity -- object-safe dynamic dispatch wrapper for NodeActivity.
//!
//! 1. `NodeActivityDyn` is object-safe, returning boxed futures
//! 2. Blanket impl of `NodeActivityDyn` for every `T: NodeActivity`
//! 3. `BoxNodeActivity` wraps `Arc<dyn NodeActivityDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use weaver_types::execution::ActivityResult;
use weaver_types::workflow::NodeType;

use super::{ExecutionMeta, NodeActivity};

/// Object-safe version of [`NodeActivity`] with boxed futures.
pub trait NodeActivityDyn: Send + Sync {
    fn execute_node_boxed<'a>(
        &'a self,
        node_type: NodeType,
        config: &'a Value,
        context: &'a Value,
        meta: &'a ExecutionMeta,
    ) -> Pin<Box<dyn Future<Output = ActivityResult> + Send + 'a>>;
}

impl<T: NodeActivity> NodeActivityDyn for T {
    fn execute_node_boxed<'a>(
        &'a self,
        node_type: NodeType,
        config: &'a Value,
        context: &'a Value,
        meta: &'a ExecutionMeta,
    ) -> Pin<Box<dyn Future<Output = ActivityResult> + Send + 'a>> {
        Box::pin(self.execute_node(node_type, config, context, meta))
    }
}

/// Type-erased node activity, cheap to clone.
///
/// `NodeActivity` uses RPITIT and cannot be a trait object directly, so the
/// engine holds this wrapper instead.
#[derive(Clone)]
pub struct BoxNodeActivity {
    inner: Arc<dyn NodeActivityDyn + Send + Sync>,
}

impl BoxNodeActivity {
    pub fn new<T: NodeActivity + 'static>(activity: T) -> Self {
        Self {
            inner: Arc::new(activity),
        }
    }

    pub async fn execute_node(
        &self,
        node_type: NodeType,
        config: &Value,
        context: &Value,
        meta: &ExecutionMeta,
    ) -> ActivityResult {
        self.inner
            .execute_node_boxed(node_type, config, context, meta)
            .await
    }
}

impl std::fmt::Debug for BoxNodeActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxNodeActivity").finish_non_exhaustive()
    }
}
