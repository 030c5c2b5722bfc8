//! Switch branch selection.
//!
//! A switch node's activity returns `{"selectedRoute": "<label>"}`. The route
//! may also be given in handle form (`case-<label>`). Out-edges whose handle
//! matches the label are taken and the `default` edges are taken only when no
//! case matches. Every other edge is marked not-selected so the queue can
//! prune what lies behind it.

use serde_json::Value;
use weaver_types::execution::NodeError;

use super::compiler::{CompiledPlan, HandleType, PlanNode, CASE_PREFIX};
use super::queue::EdgeState;

/// Output field carrying the switch's chosen route.
pub const SELECTED_ROUTE_FIELD: &str = "selectedRoute";

/// Extract the selected route from a switch node's output.
pub fn selected_route(output: &Value) -> Result<&str, NodeError> {
    output
        .get(SELECTED_ROUTE_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            NodeError::validation(format!(
                "switch output must contain a string '{SELECTED_ROUTE_FIELD}' field"
            ))
        })
}

/// Decide the state of every data out-edge of a completed switch node.
///
/// Returns `(edge index, state)` pairs; recovery (goto) edges are not included.
pub fn route_edges(plan: &CompiledPlan, node: &PlanNode, route: &str) -> Vec<(usize, EdgeState)> {
    let data_edges: Vec<(usize, &HandleType)> = node
        .outbound
        .iter()
        .filter_map(|&index| plan.edge(index).map(|edge| (index, &edge.handle)))
        .filter(|(_, handle)| handle.is_data())
        .collect();

    let has_case = |wanted: &str| {
        data_edges
            .iter()
            .any(|(_, handle)| matches!(handle, HandleType::Case(label) if label == wanted))
    };
    // An exact label wins over the handle-form reading of the same string
    let route = match route.strip_prefix(CASE_PREFIX) {
        Some(label) if !has_case(route) => label,
        _ => route,
    };
    let case_matched = has_case(route);

    let decisions: Vec<(usize, EdgeState)> = data_edges
        .into_iter()
        .map(|(index, handle)| {
            let taken = match handle {
                HandleType::Case(label) => label == route,
                HandleType::Default => !case_matched,
                _ => false,
            };
            let state = if taken {
                EdgeState::Taken
            } else {
                EdgeState::NotSelected
            };
            (index, state)
        })
        .collect();

    tracing::debug!(
        node_id = node.id.as_str(),
        route,
        case_matched,
        taken = decisions.iter().filter(|(_, s)| *s == EdgeState::Taken).count(),
        "switch route selected"
    );

    decisions
}
