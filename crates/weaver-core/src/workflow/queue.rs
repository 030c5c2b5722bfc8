//! Queue state machine: per-node status, readiness, branch pruning, and
//! error-policy application.
//!
//! `QueueState` partitions every node of a plan scope into exactly one of
//! pending, ready, executing, completed, failed, or skipped. Readiness is
//! driven by per-edge state rather than dependency counts: an edge is pending
//! until its source resolves, then taken, not-selected (pruned by a switch or an
//! unused recovery link), or dead (its source failed or was skipped).
//!
//! A node becomes ready when every inbound edge is resolved and at least one
//! data edge was taken, or immediately when a recovery (goto) edge into it is
//! taken. A node whose inbound edges all resolve without any being taken is
//! skipped, and its own out-edges inherit the cause.
//!
//! The state machine never invokes node bodies and never reads the clock.
//! Every applied transition is journaled, so [`QueueState::replay`] rebuilds an
//! identical state from the plan and the journal alone.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use weaver_types::execution::{NodeError, NodeStatus, SkipReason};
use weaver_types::workflow::{ErrorPolicy, NodeType};

use super::compiler::{CompiledPlan, PlanNode};
use super::switch;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by the queue state machine.
///
/// `InvariantViolation` indicates an engine or compiler bug, never a node
/// failure, and must abort the execution.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduling invariant violated: {0}")]
    InvariantViolation(String),

    #[error("node '{0}' is not part of this plan")]
    UnknownNode(String),

    #[error("node '{node_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        node_id: String,
        from: String,
        to: String,
    },

    #[error("switch node '{node_id}' produced an invalid route: {reason}")]
    InvalidSwitchOutput { node_id: String, reason: String },
}

// ---------------------------------------------------------------------------
// State types
// ---------------------------------------------------------------------------

/// Resolution state of one plan edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    Pending,
    Taken,
    /// Pruned by a switch, or a recovery link that was never needed.
    NotSelected,
    /// Source failed or was skipped.
    Dead,
}

impl EdgeState {
    fn for_skip(reason: SkipReason) -> Self {
        match reason {
            SkipReason::BranchNotTaken => EdgeState::NotSelected,
            _ => EdgeState::Dead,
        }
    }
}

/// Ordering key of a ready node: ascending depth, then readiness order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyEntry {
    pub depth: usize,
    pub seq: u64,
}

/// One applied transition, in application order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Dispatched { node_ids: Vec<String> },
    Completed { node_id: String, output: Value },
    Failed { node_id: String, error: NodeError },
    Cancelled,
}

/// Nodes whose status changed as a side effect of a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Propagation {
    pub ready: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
}

/// How the node's error policy resolved a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// `continue`: the node counts as completed with this output.
    Continued { output: Value, propagation: Propagation },
    /// `goto`: the named target was forced ready.
    Redirected { target: String, propagation: Propagation },
    /// No policy (or an unusable goto): the execution is failing.
    Unrecovered { propagation: Propagation },
    /// The failure arrived after cancellation and was only recorded.
    Ignored,
}

// ---------------------------------------------------------------------------
// QueueState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub pending: BTreeSet<String>,
    pub ready: BTreeMap<String, ReadyEntry>,
    pub executing: BTreeSet<String>,
    pub completed: BTreeMap<String, Value>,
    pub failed: BTreeMap<String, NodeError>,
    pub skipped: BTreeMap<String, SkipReason>,
    /// Indexed like [`CompiledPlan::edges`].
    edges: Vec<EdgeState>,
    next_seq: u64,
    /// Every node ever handed out for execution.
    dispatched: BTreeSet<String>,
    /// Failures absorbed by a `continue` policy.
    recovered: BTreeMap<String, NodeError>,
    /// First failure with no recovery. Once set, nothing new is dispatched.
    unrecovered: Option<String>,
    cancelled: bool,
    journal: Vec<Transition>,
}

impl QueueState {
    /// Initial state for a plan scope.
    ///
    /// Unreachable nodes are skipped immediately. Nodes with no inbound edges
    /// are ready; everything else is pending.
    pub fn initialize(plan: &CompiledPlan) -> Self {
        let mut state = Self {
            pending: BTreeSet::new(),
            ready: BTreeMap::new(),
            executing: BTreeSet::new(),
            completed: BTreeMap::new(),
            failed: BTreeMap::new(),
            skipped: BTreeMap::new(),
            edges: vec![EdgeState::Pending; plan.edges.len()],
            next_seq: 0,
            dispatched: BTreeSet::new(),
            recovered: BTreeMap::new(),
            unrecovered: None,
            cancelled: false,
            journal: Vec::new(),
        };

        let mut affected = Vec::new();
        for id in plan.ordered_node_ids() {
            let Some(node) = plan.node(id) else { continue };
            if !node.reachable {
                state.skipped.insert(id.clone(), SkipReason::Unreachable);
                affected.extend(state.resolve_edges(plan, &node.outbound, EdgeState::Dead));
            } else if node.inbound.is_empty() {
                state.push_ready(node);
            } else {
                state.pending.insert(id.clone());
            }
        }
        let mut propagation = Propagation::default();
        state.settle(plan, affected, &mut propagation);

        tracing::debug!(
            plan = plan.name.as_str(),
            ready = state.ready.len(),
            pending = state.pending.len(),
            unreachable = plan.unreachable.len(),
            "queue initialized"
        );
        state
    }

    /// Rebuild a state by re-applying a journal to a fresh initialization.
    pub fn replay(plan: &CompiledPlan, journal: &[Transition]) -> Result<Self, SchedulerError> {
        let mut state = Self::initialize(plan);
        for transition in journal {
            match transition {
                Transition::Dispatched { node_ids } => state.mark_executing(node_ids)?,
                Transition::Completed { node_id, output } => {
                    state.mark_completed(plan, node_id, output.clone())?;
                }
                Transition::Failed { node_id, error } => {
                    state.mark_failed(plan, node_id, error.clone())?;
                }
                Transition::Cancelled => {
                    state.cancel();
                }
            }
        }
        Ok(state)
    }

    // -- Queries ------------------------------------------------------------

    /// Up to `max_concurrent - |executing|` ready nodes, by depth then readiness order.
    ///
    /// Empty once the execution is cancelled or failing.
    pub fn get_ready_nodes(&self, max_concurrent: usize) -> Vec<String> {
        if self.cancelled || self.unrecovered.is_some() {
            return Vec::new();
        }
        let capacity = max_concurrent.saturating_sub(self.executing.len());
        let mut ready: Vec<(&String, &ReadyEntry)> = self.ready.iter().collect();
        ready.sort_by_key(|(_, entry)| (entry.depth, entry.seq));
        ready
            .into_iter()
            .take(capacity)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_execution_complete(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty() && self.executing.is_empty()
    }

    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        if self.pending.contains(node_id) {
            Some(NodeStatus::Pending)
        } else if self.ready.contains_key(node_id) {
            Some(NodeStatus::Ready)
        } else if self.executing.contains(node_id) {
            Some(NodeStatus::Executing)
        } else if self.completed.contains_key(node_id) {
            Some(NodeStatus::Completed)
        } else if self.failed.contains_key(node_id) {
            Some(NodeStatus::Failed)
        } else if self.skipped.contains_key(node_id) {
            Some(NodeStatus::Skipped)
        } else {
            None
        }
    }

    pub fn edge_state(&self, index: usize) -> Option<EdgeState> {
        self.edges.get(index).copied()
    }

    pub fn journal(&self) -> &[Transition] {
        &self.journal
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// The first failure that no error policy absorbed.
    pub fn unrecovered_failure(&self) -> Option<(&str, &NodeError)> {
        let id = self.unrecovered.as_deref()?;
        self.failed.get(id).map(|error| (id, error))
    }

    /// Failures absorbed by a `continue` policy.
    pub fn recovered_failures(&self) -> &BTreeMap<String, NodeError> {
        &self.recovered
    }

    /// Nodes in a terminal status.
    pub fn finished_count(&self) -> usize {
        self.completed.len() + self.failed.len() + self.skipped.len()
    }

    pub fn total_count(&self) -> usize {
        self.finished_count() + self.pending.len() + self.ready.len() + self.executing.len()
    }

    // -- Transitions --------------------------------------------------------

    /// Move `node_ids` from ready to executing.
    pub fn mark_executing(&mut self, node_ids: &[String]) -> Result<(), SchedulerError> {
        for id in node_ids {
            if self.dispatched.contains(id) {
                return Err(SchedulerError::InvariantViolation(format!(
                    "node '{id}' dispatched more than once"
                )));
            }
            if !self.ready.contains_key(id) {
                return Err(self.invalid_transition(id, "executing"));
            }
        }
        for id in node_ids {
            self.ready.remove(id);
            self.executing.insert(id.clone());
            self.dispatched.insert(id.clone());
        }
        if !node_ids.is_empty() {
            self.journal.push(Transition::Dispatched {
                node_ids: node_ids.to_vec(),
            });
        }
        Ok(())
    }

    /// Take the next batch of ready nodes and mark them executing.
    pub fn dispatch(&mut self, max_concurrent: usize) -> Result<Vec<String>, SchedulerError> {
        let batch = self.get_ready_nodes(max_concurrent);
        self.mark_executing(&batch)?;
        Ok(batch)
    }

    /// Move a node from executing to completed and release its dependents.
    ///
    /// For a switch node the output must carry `selectedRoute`; edges not
    /// matching it are pruned before dependents are evaluated.
    pub fn mark_completed(
        &mut self,
        plan: &CompiledPlan,
        node_id: &str,
        output: Value,
    ) -> Result<Propagation, SchedulerError> {
        let node = self.executing_node(plan, node_id, "completed")?;
        let route = match node.node_type {
            NodeType::Switch => Some(
                switch::selected_route(&output)
                    .map_err(|e| SchedulerError::InvalidSwitchOutput {
                        node_id: node_id.to_string(),
                        reason: e.message,
                    })?
                    .to_string(),
            ),
            _ => None,
        };

        self.journal.push(Transition::Completed {
            node_id: node_id.to_string(),
            output: output.clone(),
        });
        self.executing.remove(node_id);
        self.completed.insert(node_id.to_string(), output);

        let mut propagation = Propagation::default();
        let affected = self.resolve_success_edges(plan, node, route.as_deref());
        self.settle(plan, affected, &mut propagation);
        self.halt_if_drained(plan, &mut propagation);

        tracing::debug!(
            node_id,
            ready = propagation.ready.len(),
            skipped = propagation.skipped.len(),
            "node completed"
        );
        Ok(propagation)
    }

    /// Move a node from executing to failed (or completed, under `continue`)
    /// and apply its error policy.
    pub fn mark_failed(
        &mut self,
        plan: &CompiledPlan,
        node_id: &str,
        error: NodeError,
    ) -> Result<FailureOutcome, SchedulerError> {
        let node = self.executing_node(plan, node_id, "failed")?;
        self.journal.push(Transition::Failed {
            node_id: node_id.to_string(),
            error: error.clone(),
        });
        self.executing.remove(node_id);
        let mut propagation = Propagation::default();

        if self.cancelled {
            self.failed.insert(node_id.to_string(), error);
            let affected = self.resolve_edges(plan, &node.outbound, EdgeState::Dead);
            self.settle(plan, affected, &mut propagation);
            return Ok(FailureOutcome::Ignored);
        }

        let outcome = match &node.on_error {
            Some(ErrorPolicy::Continue { fallback_value }) => {
                let output = fallback_value.clone().unwrap_or(Value::Null);
                tracing::debug!(node_id, error = %error, "node failure absorbed by continue policy");
                self.recovered.insert(node_id.to_string(), error);
                self.completed.insert(node_id.to_string(), output.clone());
                let route = (node.node_type == NodeType::Switch)
                    .then(|| switch::selected_route(&output).unwrap_or_default().to_string());
                let affected = self.resolve_success_edges(plan, node, route.as_deref());
                self.settle(plan, affected, &mut propagation);
                FailureOutcome::Continued {
                    output,
                    propagation: Propagation::default(),
                }
            }
            Some(ErrorPolicy::Goto { goto }) => {
                self.failed.insert(node_id.to_string(), error);
                let rescuable = matches!(
                    self.status(goto),
                    Some(NodeStatus::Pending | NodeStatus::Ready)
                );
                let mut affected = Vec::new();
                for &index in &node.outbound {
                    let Some(edge) = plan.edge(index) else { continue };
                    let state = if edge.handle.is_data() {
                        EdgeState::Dead
                    } else {
                        EdgeState::Taken
                    };
                    affected.extend(self.resolve_edges(plan, &[index], state));
                }
                if !rescuable {
                    tracing::warn!(node_id, target = goto.as_str(), "goto target can no longer run");
                    self.unrecovered.get_or_insert_with(|| node_id.to_string());
                }
                self.settle(plan, affected, &mut propagation);
                if rescuable {
                    tracing::debug!(node_id, target = goto.as_str(), "failure redirected");
                    FailureOutcome::Redirected {
                        target: goto.clone(),
                        propagation: Propagation::default(),
                    }
                } else {
                    FailureOutcome::Unrecovered {
                        propagation: Propagation::default(),
                    }
                }
            }
            None | Some(ErrorPolicy::Fail) => {
                self.failed.insert(node_id.to_string(), error);
                self.unrecovered.get_or_insert_with(|| node_id.to_string());
                let affected = self.resolve_edges(plan, &node.outbound, EdgeState::Dead);
                self.settle(plan, affected, &mut propagation);
                FailureOutcome::Unrecovered {
                    propagation: Propagation::default(),
                }
            }
        };

        self.halt_if_drained(plan, &mut propagation);
        Ok(outcome.with_propagation(propagation))
    }

    /// Skip every pending and ready node. Executing nodes finish on their own;
    /// their results are recorded but start nothing new.
    pub fn cancel(&mut self) -> Vec<String> {
        if self.cancelled {
            return Vec::new();
        }
        self.cancelled = true;
        self.journal.push(Transition::Cancelled);

        let mut skipped: Vec<String> = self.ready.keys().cloned().collect();
        skipped.extend(self.pending.iter().cloned());
        skipped.sort();
        for id in &skipped {
            self.skipped.insert(id.clone(), SkipReason::Cancelled);
        }
        self.ready.clear();
        self.pending.clear();
        for state in &mut self.edges {
            if *state == EdgeState::Pending {
                *state = EdgeState::Dead;
            }
        }
        skipped
    }

    /// Verify the partition invariant and that every ready node is justified.
    pub fn check_invariants(&self, plan: &CompiledPlan) -> Result<(), SchedulerError> {
        if self.edges.len() != plan.edges.len() {
            return Err(SchedulerError::InvariantViolation(format!(
                "queue tracks {} edges but the plan has {}",
                self.edges.len(),
                plan.edges.len()
            )));
        }

        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let all = self
            .pending
            .iter()
            .chain(self.ready.keys())
            .chain(self.executing.iter())
            .chain(self.completed.keys())
            .chain(self.failed.keys())
            .chain(self.skipped.keys());
        for id in all {
            if !seen.insert(id.as_str()) {
                return Err(SchedulerError::InvariantViolation(format!(
                    "node '{id}' is in more than one status set"
                )));
            }
            if plan.node(id).is_none() {
                return Err(SchedulerError::UnknownNode(id.clone()));
            }
        }
        if let Some(missing) = plan.nodes.keys().find(|id| !seen.contains(id.as_str())) {
            return Err(SchedulerError::InvariantViolation(format!(
                "node '{missing}' is in no status set"
            )));
        }

        for id in self.ready.keys() {
            let node = plan
                .node(id)
                .ok_or_else(|| SchedulerError::UnknownNode(id.clone()))?;
            if !matches!(self.readiness(plan, node), Readiness::Ready) {
                return Err(SchedulerError::InvariantViolation(format!(
                    "node '{id}' is ready with unsatisfied dependencies"
                )));
            }
        }
        Ok(())
    }

    // -- Internals ----------------------------------------------------------

    fn invalid_transition(&self, node_id: &str, to: &str) -> SchedulerError {
        let from = self
            .status(node_id)
            .map(|s| format!("{s:?}").to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        SchedulerError::InvalidTransition {
            node_id: node_id.to_string(),
            from,
            to: to.to_string(),
        }
    }

    fn executing_node<'p>(
        &self,
        plan: &'p CompiledPlan,
        node_id: &str,
        to: &str,
    ) -> Result<&'p PlanNode, SchedulerError> {
        let node = plan
            .node(node_id)
            .ok_or_else(|| SchedulerError::UnknownNode(node_id.to_string()))?;
        if !self.executing.contains(node_id) {
            return Err(self.invalid_transition(node_id, to));
        }
        Ok(node)
    }

    fn push_ready(&mut self, node: &PlanNode) {
        self.ready.insert(
            node.id.clone(),
            ReadyEntry {
                depth: node.depth,
                seq: self.next_seq,
            },
        );
        self.next_seq += 1;
    }

    /// Resolve still-pending edges to `state`; returns their targets.
    fn resolve_edges(
        &mut self,
        plan: &CompiledPlan,
        indices: &[usize],
        state: EdgeState,
    ) -> Vec<String> {
        let mut targets = Vec::new();
        for &index in indices {
            let (Some(slot), Some(edge)) = (self.edges.get_mut(index), plan.edge(index)) else {
                continue;
            };
            if *slot == EdgeState::Pending {
                *slot = state;
                targets.push(edge.target.clone());
            }
        }
        targets
    }

    /// Out-edges of a node that finished successfully. Recovery links are
    /// never needed after a success.
    fn resolve_success_edges(
        &mut self,
        plan: &CompiledPlan,
        node: &PlanNode,
        route: Option<&str>,
    ) -> Vec<String> {
        let decisions: Vec<(usize, EdgeState)> = match route {
            Some(route) => switch::route_edges(plan, node, route),
            None => node
                .outbound
                .iter()
                .filter_map(|&index| plan.edge(index).map(|e| (index, e)))
                .filter(|(_, edge)| edge.handle.is_data())
                .map(|(index, _)| (index, EdgeState::Taken))
                .collect(),
        };

        let mut affected = Vec::new();
        for (index, state) in decisions {
            affected.extend(self.resolve_edges(plan, &[index], state));
        }
        let recovery: Vec<usize> = node
            .outbound
            .iter()
            .copied()
            .filter(|&index| plan.edge(index).is_some_and(|e| !e.handle.is_data()))
            .collect();
        affected.extend(self.resolve_edges(plan, &recovery, EdgeState::NotSelected));
        affected
    }

    fn readiness(&self, plan: &CompiledPlan, node: &PlanNode) -> Readiness {
        if node.inbound.is_empty() {
            return Readiness::Ready;
        }
        let mut all_resolved = true;
        let mut data_taken = false;
        let mut pruned = false;
        for &index in &node.inbound {
            let Some(edge) = plan.edge(index) else { continue };
            match self.edges.get(index).copied().unwrap_or(EdgeState::Dead) {
                EdgeState::Pending => all_resolved = false,
                EdgeState::Taken if edge.handle.is_data() => data_taken = true,
                EdgeState::Taken => return Readiness::Ready,
                EdgeState::NotSelected => pruned = true,
                EdgeState::Dead => {}
            }
        }
        if !all_resolved {
            Readiness::Waiting
        } else if data_taken {
            Readiness::Ready
        } else if pruned {
            Readiness::Skip(SkipReason::BranchNotTaken)
        } else {
            Readiness::Skip(SkipReason::UpstreamFailed)
        }
    }

    /// Re-evaluate pending nodes touched by edge changes, cascading skips.
    fn settle(&mut self, plan: &CompiledPlan, affected: Vec<String>, propagation: &mut Propagation) {
        let mut queue: VecDeque<String> = affected.into();
        while let Some(id) = queue.pop_front() {
            if !self.pending.contains(&id) {
                continue;
            }
            let Some(node) = plan.node(&id) else { continue };
            match self.readiness(plan, node) {
                Readiness::Waiting => {}
                Readiness::Ready => {
                    self.pending.remove(&id);
                    self.push_ready(node);
                    propagation.ready.push(id);
                }
                Readiness::Skip(reason) => {
                    self.pending.remove(&id);
                    self.skipped.insert(id.clone(), reason);
                    let state = EdgeState::for_skip(reason);
                    queue.extend(self.resolve_edges(plan, &node.outbound, state));
                    tracing::debug!(node_id = id.as_str(), %reason, "node skipped");
                    propagation.skipped.push((id, reason));
                }
            }
        }
    }

    /// Once a failure is unrecovered and nothing is in flight, skip the rest.
    fn halt_if_drained(&mut self, plan: &CompiledPlan, propagation: &mut Propagation) {
        if self.unrecovered.is_none() || !self.executing.is_empty() {
            return;
        }
        let mut remaining: Vec<String> = self.ready.keys().cloned().collect();
        remaining.extend(self.pending.iter().cloned());
        remaining.sort();
        if remaining.is_empty() {
            return;
        }
        self.ready.clear();
        self.pending.clear();
        for id in remaining {
            if let Some(node) = plan.node(&id) {
                self.resolve_edges(plan, &node.outbound, EdgeState::Dead);
            }
            self.skipped.insert(id.clone(), SkipReason::Halted);
            propagation.skipped.push((id, SkipReason::Halted));
        }
        tracing::debug!(
            failed_node = self.unrecovered.as_deref().unwrap_or_default(),
            "execution halted after unrecovered failure"
        );
    }
}

impl FailureOutcome {
    fn with_propagation(self, propagation: Propagation) -> Self {
        match self {
            FailureOutcome::Continued { output, .. } => FailureOutcome::Continued {
                output,
                propagation,
            },
            FailureOutcome::Redirected { target, .. } => FailureOutcome::Redirected {
                target,
                propagation,
            },
            FailureOutcome::Unrecovered { .. } => FailureOutcome::Unrecovered { propagation },
            FailureOutcome::Ignored => FailureOutcome::Ignored,
        }
    }

    /// Status changes caused by the failure.
    pub fn propagation(&self) -> Option<&Propagation> {
        match self {
            FailureOutcome::Continued { propagation, .. }
            | FailureOutcome::Redirected { propagation, .. }
            | FailureOutcome::Unrecovered { propagation } => Some(propagation),
            FailureOutcome::Ignored => None,
        }
    }
}

enum Readiness {
    Waiting,
    Ready,
    Skip(SkipReason),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
