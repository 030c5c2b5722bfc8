//! Graph compiler: validation, cycle detection, depth assignment, and loop
//! sub-graph extraction.
//!
//! Uses `petgraph` to model data edges as a directed graph. Topological sort
//! detects cycles, and longest-path depth groups nodes into execution levels.
//! Loop bodies are carved out of the graph before the sort and compiled into
//! nested plans, so the back edge that closes a loop never reads as a cycle.
//!
//! The resulting [`CompiledPlan`] is immutable and shared read-only (behind an
//! `Arc`) by every other component for the lifetime of one execution.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::DiGraph;
use serde::{Serialize, Serializer};
use serde_json::Value;

use weaver_types::config::EngineConfig;
use weaver_types::workflow::{
    EdgeDefinition, ErrorPolicy, NodeType, RetryConfig, WorkflowDefinition,
};

use super::context::is_reserved_root;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Source handle marking an edge from a loop node into its body.
pub const LOOP_BODY_HANDLE: &str = "loop-body";

/// Target handle marking a back edge from a loop body into its loop node.
pub const LOOP_RETURN_HANDLE: &str = "loop-return";

/// Fallback handle out of a switch node.
pub const DEFAULT_HANDLE: &str = "default";

/// Prefix of conditional switch handles (`case-<value>`).
pub const CASE_PREFIX: &str = "case-";

const DEFAULT_MAX_ITERATIONS: usize = 100;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal compilation errors. An execution never starts from an invalid graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("workflow has no nodes")]
    EmptyWorkflow,

    #[error("cycle detected between nodes: {}", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },

    #[error("edge '{edge_id}' references undeclared node '{node_id}'")]
    DanglingEdge { edge_id: String, node_id: String },

    #[error("node '{node_id}' has unknown type '{node_type}'")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("entry point '{0}' is not a declared node")]
    UnknownEntryPoint(String),

    #[error("entry point '{entry}' is invalid: {reason}")]
    InvalidEntryPoint { entry: String, reason: String },

    #[error("node '{node_id}' has invalid goto target '{target}': {reason}")]
    InvalidGotoTarget {
        node_id: String,
        target: String,
        reason: String,
    },

    #[error("edge '{edge_id}' crosses the boundary of loop '{loop_id}'")]
    LoopBoundaryViolation { loop_id: String, edge_id: String },

    #[error("loop '{loop_id}' is misconfigured: {reason}")]
    InvalidLoopConfig { loop_id: String, reason: String },

    #[error("duplicate edge id '{0}'")]
    DuplicateEdgeId(String),

    #[error("node id '{0}' is reserved in template references")]
    ReservedNodeId(String),
}

impl CompileError {
    /// Stable machine code for callers and telemetry.
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::EmptyWorkflow => "EMPTY_WORKFLOW",
            CompileError::CycleDetected { .. } => "CYCLE_DETECTED",
            CompileError::DanglingEdge { .. } => "DANGLING_EDGE",
            CompileError::UnknownNodeType { .. } => "UNKNOWN_NODE_TYPE",
            CompileError::UnknownEntryPoint(_) => "UNKNOWN_ENTRY_POINT",
            CompileError::InvalidEntryPoint { .. } => "INVALID_ENTRY_POINT",
            CompileError::InvalidGotoTarget { .. } => "INVALID_GOTO_TARGET",
            CompileError::LoopBoundaryViolation { .. } => "LOOP_BOUNDARY_VIOLATION",
            CompileError::InvalidLoopConfig { .. } => "INVALID_LOOP_CONFIG",
            CompileError::DuplicateEdgeId(_) => "DUPLICATE_EDGE_ID",
            CompileError::ReservedNodeId(_) => "RESERVED_NODE_ID",
        }
    }
}

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// Edge annotation describing how flow along the edge is decided.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandleType {
    /// Unconditional data flow, or the fallback branch out of a switch.
    Default,
    /// Conditional flow out of a switch, taken when the route matches.
    Case(String),
    /// Loop node into a body entry.
    LoopBody,
    /// Body node back into its loop node.
    LoopReturn,
    /// Recovery link synthesized from `onError.goto`.
    Goto,
}

impl HandleType {
    /// Classify a switch node's source handle.
    pub fn for_switch(source_handle: Option<&str>) -> Self {
        match source_handle.map(str::trim) {
            None | Some("") | Some(DEFAULT_HANDLE) => HandleType::Default,
            Some(handle) => {
                let label = handle.strip_prefix(CASE_PREFIX).unwrap_or(handle);
                HandleType::Case(label.to_string())
            }
        }
    }

    /// Whether the edge carries data (everything except recovery links).
    pub fn is_data(&self) -> bool {
        !matches!(self, HandleType::Goto)
    }
}

impl fmt::Display for HandleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleType::Default => f.write_str(DEFAULT_HANDLE),
            HandleType::Case(label) => write!(f, "{CASE_PREFIX}{label}"),
            HandleType::LoopBody => f.write_str(LOOP_BODY_HANDLE),
            HandleType::LoopReturn => f.write_str(LOOP_RETURN_HANDLE),
            HandleType::Goto => f.write_str("goto"),
        }
    }
}

impl Serialize for HandleType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An edge inside one plan scope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub handle: HandleType,
}

/// A node with its resolved graph relationships.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanNode {
    pub id: String,
    pub name: String,
    pub node_type: NodeType,
    pub config: Value,
    pub on_error: Option<ErrorPolicy>,
    pub retry: Option<RetryConfig>,
    pub timeout_ms: Option<u64>,
    /// Direct upstream nodes via data edges.
    pub dependencies: Vec<String>,
    /// Direct downstream nodes via data edges.
    pub dependents: Vec<String>,
    /// Longest-path distance from the scope's roots. Scheduling hint only.
    pub depth: usize,
    /// False when the node cannot be reached from the scope's entry points.
    pub reachable: bool,
    /// Indices into [`CompiledPlan::edges`] of every inbound edge (data and goto).
    pub inbound: Vec<usize>,
    /// Indices into [`CompiledPlan::edges`] of every outbound edge (data and goto).
    pub outbound: Vec<usize>,
    /// Node ids whose outputs this node may reference in templates.
    pub visible: BTreeSet<String>,
}

/// What to do when the iteration source yields more items than `max_iterations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitPolicy {
    /// Run `max_iterations` iterations, then fail the loop node.
    Fail,
    /// Run `max_iterations` iterations and complete normally.
    Truncate,
}

/// Compiled loop: its body sub-plan and iteration settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopContext {
    pub loop_node_id: String,
    /// Every node inside the loop body, including nested loop bodies.
    pub body_node_ids: Vec<String>,
    /// Body compiled as its own plan scope.
    pub body: Box<CompiledPlan>,
    /// Literal array, or a template resolving to an array.
    pub iterate_over: Value,
    pub max_iterations: usize,
    pub allow_parallel: bool,
    pub enable_replanning: bool,
    pub on_limit_exceeded: LimitPolicy,
}

/// The immutable executable plan for one scope (the workflow or a loop body).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledPlan {
    pub name: String,
    /// Nodes that start the scope (the workflow entry point, or a loop's body entries).
    pub entry_points: Vec<String>,
    pub nodes: BTreeMap<String, PlanNode>,
    pub edges: Vec<PlanEdge>,
    /// Node ids grouped by depth, each level sorted by id.
    pub execution_levels: Vec<Vec<String>>,
    /// Nodes whose outputs form the scope's result.
    pub output_node_ids: Vec<String>,
    pub loop_contexts: BTreeMap<String, LoopContext>,
    /// Nodes retained in the plan but never scheduled.
    pub unreachable: Vec<String>,
}

impl CompiledPlan {
    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.get(id)
    }

    pub fn edge(&self, index: usize) -> Option<&PlanEdge> {
        self.edges.get(index)
    }

    pub fn loop_context(&self, id: &str) -> Option<&LoopContext> {
        self.loop_contexts.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in scheduling-hint order (depth, then id).
    pub fn ordered_node_ids(&self) -> impl Iterator<Item = &String> {
        self.execution_levels.iter().flatten()
    }
}

/// Compilation settings taken from the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Loop cap used when a loop node omits `maxIterations`.
    pub default_max_iterations: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl From<&EngineConfig> for CompileOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            default_max_iterations: config.default_max_iterations,
        }
    }
}

// ---------------------------------------------------------------------------
// Compilation entry points
// ---------------------------------------------------------------------------

/// Compile a workflow definition with default options.
pub fn compile(definition: &WorkflowDefinition) -> Result<CompiledPlan, CompileError> {
    compile_with(definition, &CompileOptions::default())
}

/// Compile a workflow definition into an executable plan.
///
/// 1. Reject node ids that templates could not address, then resolve every
///    node's type string into a [`NodeType`].
/// 2. Validate edge ids and endpoints, the entry point, and goto targets.
/// 3. Extract loop bodies (nodes reachable from a `loop-body` edge that path
///    back into the loop) and check that no edge crosses a body boundary.
/// 4. Compile the top-level scope; each loop's body compiles recursively.
pub fn compile_with(
    definition: &WorkflowDefinition,
    options: &CompileOptions,
) -> Result<CompiledPlan, CompileError> {
    if definition.nodes.is_empty() {
        return Err(CompileError::EmptyWorkflow);
    }

    if let Some(id) = definition.nodes.keys().find(|id| is_reserved_root(id)) {
        return Err(CompileError::ReservedNodeId(id.clone()));
    }
    let types = resolve_node_types(definition)?;
    validate_edges(definition)?;

    if !definition.nodes.contains_key(&definition.entry_point) {
        return Err(CompileError::UnknownEntryPoint(
            definition.entry_point.clone(),
        ));
    }

    validate_goto_targets(definition)?;

    let bodies = extract_loop_bodies(definition, &types)?;
    if let Some(loop_id) = bodies
        .iter()
        .find(|(_, body)| body.contains(&definition.entry_point))
        .map(|(id, _)| id)
    {
        return Err(CompileError::InvalidEntryPoint {
            entry: definition.entry_point.clone(),
            reason: format!("entry point is inside the body of loop '{loop_id}'"),
        });
    }

    let compiler = ScopeCompiler {
        definition,
        types: &types,
        bodies: &bodies,
        options,
    };

    let plan = compiler.compile_scope(Scope {
        name: definition.name.clone(),
        members: definition.nodes.keys().cloned().collect(),
        entries: vec![definition.entry_point.clone()],
        return_sources: None,
        inherited_visible: BTreeSet::new(),
    })?;

    if let Some(entry) = plan.node(&definition.entry_point) {
        if !entry.dependencies.is_empty() {
            return Err(CompileError::InvalidEntryPoint {
                entry: entry.id.clone(),
                reason: format!(
                    "entry point has incoming data dependencies: {}",
                    entry.dependencies.join(", ")
                ),
            });
        }
    }

    tracing::debug!(
        workflow = definition.name.as_str(),
        nodes = plan.len(),
        levels = plan.execution_levels.len(),
        loops = plan.loop_contexts.len(),
        unreachable = plan.unreachable.len(),
        "compiled workflow plan"
    );

    Ok(plan)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn resolve_node_types(
    definition: &WorkflowDefinition,
) -> Result<BTreeMap<String, NodeType>, CompileError> {
    definition
        .nodes
        .iter()
        .map(|(id, node)| {
            node.node_type
                .parse::<NodeType>()
                .map(|ty| (id.clone(), ty))
                .map_err(|_| CompileError::UnknownNodeType {
                    node_id: id.clone(),
                    node_type: node.node_type.clone(),
                })
        })
        .collect()
}

fn validate_edges(definition: &WorkflowDefinition) -> Result<(), CompileError> {
    let mut seen = BTreeSet::new();
    for edge in &definition.edges {
        if !seen.insert(edge.id.as_str()) {
            return Err(CompileError::DuplicateEdgeId(edge.id.clone()));
        }
        for endpoint in [&edge.source, &edge.target] {
            if !definition.nodes.contains_key(endpoint) {
                return Err(CompileError::DanglingEdge {
                    edge_id: edge.id.clone(),
                    node_id: endpoint.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_goto_targets(definition: &WorkflowDefinition) -> Result<(), CompileError> {
    for (id, node) in &definition.nodes {
        let Some(target) = node.on_error.as_ref().and_then(ErrorPolicy::goto_target) else {
            continue;
        };
        let reason = if target == id.as_str() {
            "a node cannot recover into itself"
        } else if !definition.nodes.contains_key(target) {
            "target is not a declared node"
        } else {
            continue;
        };
        return Err(CompileError::InvalidGotoTarget {
            node_id: id.clone(),
            target: target.to_string(),
            reason: reason.to_string(),
        });
    }
    Ok(())
}

fn is_body_edge(edge: &EdgeDefinition) -> bool {
    edge.source_handle.as_deref() == Some(LOOP_BODY_HANDLE)
}

// ---------------------------------------------------------------------------
// Loop extraction
// ---------------------------------------------------------------------------

/// Collect each loop's body: nodes reachable from its `loop-body` edges that
/// path back into the loop node, plus the body entries themselves.
fn extract_loop_bodies(
    definition: &WorkflowDefinition,
    types: &BTreeMap<String, NodeType>,
) -> Result<BTreeMap<String, BTreeSet<String>>, CompileError> {
    let mut bodies = BTreeMap::new();

    for loop_id in types
        .iter()
        .filter(|(_, ty)| **ty == NodeType::Loop)
        .map(|(id, _)| id)
    {
        let entries: Vec<&str> = definition
            .edges
            .iter()
            .filter(|e| &e.source == loop_id && is_body_edge(e))
            .map(|e| e.target.as_str())
            .collect();

        if entries.iter().any(|entry| *entry == loop_id.as_str()) {
            return Err(CompileError::InvalidLoopConfig {
                loop_id: loop_id.clone(),
                reason: "loop-body edge points back at the loop itself".to_string(),
            });
        }

        // Everything reachable from the body entries without passing through the loop.
        let mut forward: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = entries.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if id == loop_id.as_str() || !forward.insert(id) {
                continue;
            }
            for edge in definition.edges.iter().filter(|e| e.source == id) {
                queue.push_back(edge.target.as_str());
            }
        }

        // Of those, everything that paths back into the loop node.
        let mut returning: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = definition
            .edges
            .iter()
            .filter(|e| &e.target == loop_id && forward.contains(e.source.as_str()))
            .map(|e| e.source.as_str())
            .collect();
        while let Some(id) = queue.pop_front() {
            if !forward.contains(id) || !returning.insert(id) {
                continue;
            }
            for edge in definition.edges.iter().filter(|e| e.target == id) {
                queue.push_back(edge.source.as_str());
            }
        }

        let body: BTreeSet<String> = entries
            .iter()
            .chain(returning.iter())
            .map(|id| id.to_string())
            .collect();

        for edge in &definition.edges {
            let from_body = body.contains(&edge.source);
            let into_body = body.contains(&edge.target);
            let allowed = match (from_body, into_body) {
                (true, true) => true,
                (true, false) => &edge.target == loop_id,
                (false, true) => &edge.source == loop_id && is_body_edge(edge),
                (false, false) => true,
            };
            if !allowed {
                return Err(CompileError::LoopBoundaryViolation {
                    loop_id: loop_id.clone(),
                    edge_id: edge.id.clone(),
                });
            }
        }

        bodies.insert(loop_id.clone(), body);
    }

    Ok(bodies)
}

// ---------------------------------------------------------------------------
// Scope compilation
// ---------------------------------------------------------------------------

struct Scope {
    name: String,
    /// All nodes in the scope, including those nested in inner loop bodies.
    members: BTreeSet<String>,
    entries: Vec<String>,
    /// Sources of back edges into the owning loop (loop bodies only).
    return_sources: Option<BTreeSet<String>>,
    /// Outputs visible to every node in the scope (the owning loop's view).
    inherited_visible: BTreeSet<String>,
}

struct ScopeCompiler<'a> {
    definition: &'a WorkflowDefinition,
    types: &'a BTreeMap<String, NodeType>,
    bodies: &'a BTreeMap<String, BTreeSet<String>>,
    options: &'a CompileOptions,
}

impl ScopeCompiler<'_> {
    fn compile_scope(&self, scope: Scope) -> Result<CompiledPlan, CompileError> {
        // Nodes owned by a loop that is itself a member belong to that loop's scope.
        let hidden: BTreeSet<&String> = scope
            .members
            .iter()
            .filter_map(|id| self.bodies.get(id))
            .flatten()
            .collect();
        let direct: BTreeSet<String> = scope
            .members
            .iter()
            .filter(|id| !hidden.contains(id))
            .cloned()
            .collect();

        let edges = self.scope_edges(&direct)?;

        // Cycle detection and ordering over data edges only.
        let mut graph = DiGraph::<&str, ()>::new();
        let indices: BTreeMap<&str, _> = direct
            .iter()
            .map(|id| (id.as_str(), graph.add_node(id.as_str())))
            .collect();
        for edge in edges.iter().filter(|e| e.handle.is_data()) {
            graph.add_edge(
                indices[edge.source.as_str()],
                indices[edge.target.as_str()],
                (),
            );
        }

        let sorted = toposort(&graph, None).map_err(|_| {
            let mut nodes: Vec<String> = tarjan_scc(&graph)
                .into_iter()
                .filter(|component| {
                    component.len() > 1 || graph.contains_edge(component[0], component[0])
                })
                .flatten()
                .map(|idx| graph[idx].to_string())
                .collect();
            nodes.sort();
            CompileError::CycleDetected { nodes }
        })?;

        let mut dependencies: BTreeMap<&str, BTreeSet<&str>> =
            direct.iter().map(|id| (id.as_str(), BTreeSet::new())).collect();
        let mut dependents: BTreeMap<&str, BTreeSet<&str>> =
            direct.iter().map(|id| (id.as_str(), BTreeSet::new())).collect();
        let mut inbound: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        let mut outbound: BTreeMap<&str, Vec<usize>> = BTreeMap::new();

        for (index, edge) in edges.iter().enumerate() {
            inbound.entry(edge.target.as_str()).or_default().push(index);
            outbound.entry(edge.source.as_str()).or_default().push(index);
            if edge.handle.is_data() {
                if let Some(deps) = dependencies.get_mut(edge.target.as_str()) {
                    deps.insert(edge.source.as_str());
                }
                if let Some(downs) = dependents.get_mut(edge.source.as_str()) {
                    downs.insert(edge.target.as_str());
                }
            }
        }

        // Depth (longest path) and transitive visibility, in topological order.
        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
        let mut visible: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for idx in &sorted {
            let id = graph[*idx];
            let deps = &dependencies[id];
            let d = deps.iter().map(|dep| depth[dep] + 1).max().unwrap_or(0);
            depth.insert(id, d);

            let mut view = scope.inherited_visible.clone();
            for dep in deps {
                view.insert(dep.to_string());
                view.extend(visible[dep].iter().cloned());
            }
            visible.insert(id, view);
        }

        let reachable = reachable_from(&scope.entries, &direct, &edges);

        let max_depth = depth.values().copied().max().unwrap_or(0);
        let mut execution_levels: Vec<Vec<String>> = vec![Vec::new(); max_depth + 1];
        for id in &direct {
            execution_levels[depth[id.as_str()]].push(id.clone());
        }
        execution_levels.retain(|level| !level.is_empty());

        let output_node_ids = self.output_nodes(&scope, &direct, &dependents, &reachable);

        let mut loop_contexts = BTreeMap::new();
        for loop_id in direct.iter().filter(|id| self.bodies.contains_key(*id)) {
            let view = visible.get(loop_id.as_str()).cloned().unwrap_or_default();
            let context = self.compile_loop(&scope.name, loop_id, view)?;
            loop_contexts.insert(loop_id.clone(), context);
        }

        let mut nodes = BTreeMap::new();
        for id in &direct {
            let def = &self.definition.nodes[id];
            let key = id.as_str();
            nodes.insert(
                id.clone(),
                PlanNode {
                    id: id.clone(),
                    name: def.name.clone(),
                    node_type: self.types[id],
                    config: def.config.clone(),
                    on_error: def.on_error.clone(),
                    retry: def.retry.clone(),
                    timeout_ms: def.timeout_ms,
                    dependencies: dependencies[key].iter().map(|s| s.to_string()).collect(),
                    dependents: dependents[key].iter().map(|s| s.to_string()).collect(),
                    depth: depth[key],
                    reachable: reachable.contains(id),
                    inbound: inbound.remove(key).unwrap_or_default(),
                    outbound: outbound.remove(key).unwrap_or_default(),
                    visible: visible.remove(key).unwrap_or_default(),
                },
            );
        }

        let unreachable = direct
            .iter()
            .filter(|id| !reachable.contains(*id))
            .cloned()
            .collect();

        Ok(CompiledPlan {
            name: scope.name,
            entry_points: scope.entries,
            nodes,
            edges,
            execution_levels,
            output_node_ids,
            loop_contexts,
            unreachable,
        })
    }

    /// Data edges with both ends in the scope, followed by goto recovery links.
    fn scope_edges(&self, direct: &BTreeSet<String>) -> Result<Vec<PlanEdge>, CompileError> {
        let mut edges: Vec<PlanEdge> = self
            .definition
            .edges
            .iter()
            .filter(|e| direct.contains(&e.source) && direct.contains(&e.target))
            .map(|e| {
                let handle = match self.types[&e.source] {
                    NodeType::Switch => HandleType::for_switch(e.source_handle.as_deref()),
                    _ => HandleType::Default,
                };
                PlanEdge {
                    id: e.id.clone(),
                    source: e.source.clone(),
                    target: e.target.clone(),
                    handle,
                }
            })
            .collect();

        for id in direct {
            let policy = self.definition.nodes[id].on_error.as_ref();
            let Some(target) = policy.and_then(ErrorPolicy::goto_target) else {
                continue;
            };
            if !direct.contains(target) {
                return Err(CompileError::InvalidGotoTarget {
                    node_id: id.clone(),
                    target: target.to_string(),
                    reason: "target is outside the node's loop scope".to_string(),
                });
            }
            edges.push(PlanEdge {
                id: format!("goto:{id}->{target}"),
                source: id.clone(),
                target: target.to_string(),
                handle: HandleType::Goto,
            });
        }

        Ok(edges)
    }

    /// Output nodes: `output`-typed nodes at the top level, return-edge sources
    /// in loop bodies; reachable sinks when neither exists.
    fn output_nodes(
        &self,
        scope: &Scope,
        direct: &BTreeSet<String>,
        dependents: &BTreeMap<&str, BTreeSet<&str>>,
        reachable: &BTreeSet<String>,
    ) -> Vec<String> {
        let declared: Vec<String> = match &scope.return_sources {
            Some(returns) => returns.intersection(direct).cloned().collect(),
            None => direct
                .iter()
                .filter(|id| self.types[*id] == NodeType::Output)
                .cloned()
                .collect(),
        };
        if !declared.is_empty() {
            return declared;
        }
        direct
            .iter()
            .filter(|id| reachable.contains(*id) && dependents[id.as_str()].is_empty())
            .cloned()
            .collect()
    }

    fn compile_loop(
        &self,
        parent: &str,
        loop_id: &str,
        inherited_visible: BTreeSet<String>,
    ) -> Result<LoopContext, CompileError> {
        let members = self.bodies[loop_id].clone();

        let mut entries: Vec<String> = Vec::new();
        for edge in self
            .definition
            .edges
            .iter()
            .filter(|e| e.source == loop_id && is_body_edge(e))
        {
            if !entries.contains(&edge.target) {
                entries.push(edge.target.clone());
            }
        }

        let return_sources: BTreeSet<String> = self
            .definition
            .edges
            .iter()
            .filter(|e| e.target == loop_id && members.contains(&e.source))
            .map(|e| e.source.clone())
            .collect();

        let body = self.compile_scope(Scope {
            name: format!("{parent}/{loop_id}"),
            members: members.clone(),
            entries,
            return_sources: Some(return_sources),
            inherited_visible,
        })?;

        let config = &self.definition.nodes[loop_id].config;
        let invalid = |reason: &str| CompileError::InvalidLoopConfig {
            loop_id: loop_id.to_string(),
            reason: reason.to_string(),
        };

        let iterate_over = match config.get("iterateOver") {
            Some(source @ (Value::Array(_) | Value::String(_))) => source.clone(),
            Some(_) => return Err(invalid("iterateOver must be an array or a template string")),
            None => return Err(invalid("missing iterateOver")),
        };

        let max_iterations = match config.get("maxIterations") {
            None | Some(Value::Null) => self.options.default_max_iterations,
            Some(value) => match value.as_u64() {
                Some(0) | None => return Err(invalid("maxIterations must be a positive integer")),
                Some(n) => usize::try_from(n)
                    .map_err(|_| invalid("maxIterations is out of range"))?,
            },
        };

        let on_limit_exceeded = match config.get("onLimitExceeded").and_then(Value::as_str) {
            None | Some("fail") => LimitPolicy::Fail,
            Some("truncate") => LimitPolicy::Truncate,
            Some(_) => return Err(invalid("onLimitExceeded must be 'fail' or 'truncate'")),
        };

        let flag = |key: &str| config.get(key).and_then(Value::as_bool).unwrap_or(false);

        Ok(LoopContext {
            loop_node_id: loop_id.to_string(),
            body_node_ids: members.into_iter().collect(),
            body: Box::new(body),
            iterate_over,
            max_iterations,
            allow_parallel: flag("allowParallel"),
            enable_replanning: flag("enableReplanning"),
            on_limit_exceeded,
        })
    }
}

/// Breadth-first reachability over data and goto edges.
fn reachable_from(
    entries: &[String],
    direct: &BTreeSet<String>,
    edges: &[PlanEdge],
) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<&str> = entries
        .iter()
        .filter(|id| direct.contains(*id))
        .map(String::as_str)
        .collect();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.to_string()) {
            continue;
        }
        for edge in edges.iter().filter(|e| e.source == id) {
            queue.push_back(edge.target.as_str());
        }
    }
    seen
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weaver_types::workflow::{NodeDefinition, Position};

    fn node(node_type: &str, config: Value) -> NodeDefinition {
        NodeDefinition {
            node_type: node_type.to_string(),
            name: node_type.to_string(),
            config,
            position: Position::default(),
            on_error: None,
            retry: None,
            timeout_ms: None,
        }
    }

    fn edge(id: &str, source: &str, target: &str) -> EdgeDefinition {
        EdgeDefinition {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            source_handle: None,
            target_handle: None,
        }
    }

    fn handle_edge(id: &str, source: &str, target: &str, handle: &str) -> EdgeDefinition {
        EdgeDefinition {
            source_handle: Some(handle.to_string()),
            ..edge(id, source, target)
        }
    }

    fn definition(
        nodes: Vec<(&str, NodeDefinition)>,
        edges: Vec<EdgeDefinition>,
        entry: &str,
    ) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "test".to_string(),
            description: None,
            nodes: nodes
                .into_iter()
                .map(|(id, n)| (id.to_string(), n))
                .collect(),
            edges,
            entry_point: entry.to_string(),
        }
    }

    // -- Levels and depth ---------------------------------------------------

    #[test]
    fn linear_chain_levels() {
        let def = definition(
            vec![
                ("a", node("input", json!({}))),
                ("b", node("llm", json!({}))),
                ("c", node("output", json!({}))),
            ],
            vec![edge("e1", "a", "b"), edge("e2", "b", "c")],
            "a",
        );
        let plan = compile(&def).unwrap();
        assert_eq!(
            plan.execution_levels,
            vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
        assert_eq!(plan.nodes["b"].dependencies, vec!["a"]);
        assert_eq!(plan.nodes["b"].dependents, vec!["c"]);
        assert_eq!(plan.output_node_ids, vec!["c"]);
        assert!(plan.unreachable.is_empty());
    }

    #[test]
    fn diamond_uses_longest_path_depth() {
        let def = definition(
            vec![
                ("a", node("input", json!({}))),
                ("b", node("llm", json!({}))),
                ("c", node("transform", json!({}))),
                ("d", node("transform", json!({}))),
                ("e", node("output", json!({}))),
            ],
            vec![
                edge("e1", "a", "b"),
                edge("e2", "a", "c"),
                edge("e3", "c", "d"),
                edge("e4", "b", "e"),
                edge("e5", "d", "e"),
            ],
            "a",
        );
        let plan = compile(&def).unwrap();
        assert_eq!(plan.nodes["b"].depth, 1);
        assert_eq!(plan.nodes["d"].depth, 2);
        assert_eq!(plan.nodes["e"].depth, 3);
        assert_eq!(plan.execution_levels[1], vec!["b", "c"]);

        let visible = &plan.nodes["e"].visible;
        for id in ["a", "b", "c", "d"] {
            assert!(visible.contains(id), "{id} should be visible to e");
        }
        assert!(!plan.nodes["b"].visible.contains("c"));
    }

    // -- Errors -------------------------------------------------------------

    #[test]
    fn cycle_names_offending_nodes() {
        let def = definition(
            vec![
                ("a", node("input", json!({}))),
                ("b", node("llm", json!({}))),
                ("c", node("llm", json!({}))),
            ],
            vec![
                edge("e1", "a", "b"),
                edge("e2", "b", "c"),
                edge("e3", "c", "b"),
            ],
            "a",
        );
        let err = compile(&def).unwrap_err();
        assert_eq!(err.code(), "CYCLE_DETECTED");
        assert_eq!(
            err,
            CompileError::CycleDetected {
                nodes: vec!["b".to_string(), "c".to_string()]
            }
        );
    }

    #[test]
    fn reserved_node_ids_rejected() {
        for reserved in ["inputs", "loop", "true", "42"] {
            let def = definition(
                vec![
                    ("a", node("input", json!({}))),
                    (reserved, node("transform", json!({}))),
                    ("use", node("transform", json!({ "v": format!("{{{{{reserved}.value}}}}") }))),
                ],
                vec![edge("e1", "a", reserved), edge("e2", reserved, "use")],
                "a",
            );
            let err = compile(&def).unwrap_err();
            assert_eq!(err, CompileError::ReservedNodeId(reserved.to_string()));
            assert_eq!(err.code(), "RESERVED_NODE_ID");
        }

        // names that merely contain a reserved word are fine
        let def = definition(
            vec![("inputs_parser", node("input", json!({}))), ("loop2", node("output", json!({})))],
            vec![edge("e1", "inputs_parser", "loop2")],
            "inputs_parser",
        );
        assert!(compile(&def).is_ok());
    }

    #[test]
    fn dangling_edge_rejected() {
        let def = definition(
            vec![("a", node("input", json!({})))],
            vec![edge("e1", "a", "ghost")],
            "a",
        );
        let err = compile(&def).unwrap_err();
        assert_eq!(err.code(), "DANGLING_EDGE");
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn unknown_node_type_rejected() {
        let def = definition(vec![("a", node("teleport", json!({})))], vec![], "a");
        let err = compile(&def).unwrap_err();
        assert_eq!(
            err,
            CompileError::UnknownNodeType {
                node_id: "a".to_string(),
                node_type: "teleport".to_string()
            }
        );
    }

    #[test]
    fn unknown_entry_point_and_duplicate_edges() {
        let def = definition(vec![("a", node("input", json!({})))], vec![], "missing");
        assert_eq!(compile(&def).unwrap_err().code(), "UNKNOWN_ENTRY_POINT");

        let def = definition(
            vec![("a", node("input", json!({}))), ("b", node("output", json!({})))],
            vec![edge("e1", "a", "b"), edge("e1", "a", "b")],
            "a",
        );
        assert_eq!(
            compile(&def).unwrap_err(),
            CompileError::DuplicateEdgeId("e1".to_string())
        );
    }

    #[test]
    fn entry_point_with_dependencies_rejected() {
        let def = definition(
            vec![("a", node("input", json!({}))), ("b", node("llm", json!({})))],
            vec![edge("e1", "b", "a")],
            "a",
        );
        assert_eq!(compile(&def).unwrap_err().code(), "INVALID_ENTRY_POINT");
    }

    #[test]
    fn goto_target_must_exist() {
        let mut primary = node("llm", json!({}));
        primary.on_error = Some(ErrorPolicy::Goto {
            goto: "nowhere".to_string(),
        });
        let def = definition(
            vec![("a", node("input", json!({}))), ("p", primary)],
            vec![edge("e1", "a", "p")],
            "a",
        );
        assert_eq!(compile(&def).unwrap_err().code(), "INVALID_GOTO_TARGET");
    }

    // -- Reachability and handles --------------------------------------------

    #[test]
    fn unreachable_nodes_are_flagged_not_rejected() {
        let def = definition(
            vec![
                ("a", node("input", json!({}))),
                ("b", node("output", json!({}))),
                ("orphan", node("llm", json!({}))),
            ],
            vec![edge("e1", "a", "b")],
            "a",
        );
        let plan = compile(&def).unwrap();
        assert_eq!(plan.unreachable, vec!["orphan"]);
        assert!(!plan.nodes["orphan"].reachable);
        assert!(plan.nodes["b"].reachable);
    }

    #[test]
    fn goto_targets_count_as_reachable() {
        let mut primary = node("llm", json!({}));
        primary.on_error = Some(ErrorPolicy::Goto {
            goto: "replan".to_string(),
        });
        let def = definition(
            vec![
                ("a", node("input", json!({}))),
                ("primary", primary),
                ("replan", node("llm", json!({}))),
            ],
            vec![edge("e1", "a", "primary")],
            "a",
        );
        let plan = compile(&def).unwrap();
        assert!(plan.nodes["replan"].reachable);
        let goto = plan.edge(plan.nodes["replan"].inbound[0]).unwrap();
        assert_eq!(goto.handle, HandleType::Goto);
        assert!(plan.nodes["replan"].dependencies.is_empty());
    }

    #[test]
    fn switch_edges_are_annotated() {
        let def = definition(
            vec![
                ("a", node("input", json!({}))),
                ("route", node("switch", json!({}))),
                ("x", node("llm", json!({}))),
                ("y", node("llm", json!({}))),
                ("z", node("llm", json!({}))),
            ],
            vec![
                edge("e1", "a", "route"),
                handle_edge("e2", "route", "x", "case-A"),
                handle_edge("e3", "route", "y", "B"),
                handle_edge("e4", "route", "z", "default"),
            ],
            "a",
        );
        let plan = compile(&def).unwrap();
        let handles: Vec<String> = plan.edges.iter().map(|e| e.handle.to_string()).collect();
        assert_eq!(handles, vec!["default", "case-A", "case-B", "default"]);
        assert_eq!(
            serde_json::to_value(&plan.edges[1]).unwrap()["handle"],
            json!("case-A")
        );
    }

    // -- Loops --------------------------------------------------------------

    fn nested_loop_definition() -> WorkflowDefinition {
        definition(
            vec![
                ("input", node("input", json!({}))),
                (
                    "groups",
                    node(
                        "loop",
                        json!({ "iterateOver": "{{input.groups}}", "maxIterations": 5 }),
                    ),
                ),
                (
                    "run_group",
                    node(
                        "loop",
                        json!({ "iterateOver": "{{loop.item}}", "allowParallel": true }),
                    ),
                ),
                ("task", node("llm", json!({ "subtask": "{{loop.item}}" }))),
                ("aggregate", node("transform", json!({}))),
                ("output", node("output", json!({}))),
            ],
            vec![
                edge("e1", "input", "groups"),
                handle_edge("e2", "groups", "run_group", LOOP_BODY_HANDLE),
                handle_edge("e3", "run_group", "task", LOOP_BODY_HANDLE),
                edge("e4", "task", "run_group"),
                edge("e5", "run_group", "groups"),
                edge("e6", "groups", "aggregate"),
                edge("e7", "aggregate", "output"),
            ],
            "input",
        )
    }

    #[test]
    fn loop_bodies_are_extracted_and_nested() {
        let plan = compile(&nested_loop_definition()).unwrap();

        let top: Vec<&String> = plan.nodes.keys().collect();
        assert_eq!(top, vec!["aggregate", "groups", "input", "output"]);
        assert_eq!(plan.nodes["aggregate"].dependencies, vec!["groups"]);

        let outer = plan.loop_context("groups").unwrap();
        assert_eq!(outer.body_node_ids, vec!["run_group", "task"]);
        assert_eq!(outer.max_iterations, 5);
        assert!(!outer.allow_parallel);
        assert_eq!(outer.body.entry_points, vec!["run_group"]);
        assert_eq!(outer.body.output_node_ids, vec!["run_group"]);
        assert!(outer.body.nodes["run_group"].visible.contains("input"));

        let inner = outer.body.loop_context("run_group").unwrap();
        assert!(inner.allow_parallel);
        assert_eq!(inner.max_iterations, 100);
        assert_eq!(inner.body.output_node_ids, vec!["task"]);
        assert!(inner.body.nodes["task"].visible.contains("input"));
    }

    #[test]
    fn edge_leaving_loop_body_rejected() {
        let mut def = nested_loop_definition();
        def.edges.push(edge("leak", "task", "aggregate"));
        let err = compile(&def).unwrap_err();
        assert_eq!(err.code(), "LOOP_BOUNDARY_VIOLATION");
    }

    #[test]
    fn loop_requires_iteration_source() {
        let def = definition(
            vec![
                ("a", node("input", json!({}))),
                ("l", node("loop", json!({ "maxIterations": 3 }))),
            ],
            vec![edge("e1", "a", "l")],
            "a",
        );
        assert_eq!(
            compile(&def).unwrap_err(),
            CompileError::InvalidLoopConfig {
                loop_id: "l".to_string(),
                reason: "missing iterateOver".to_string()
            }
        );

        let def = definition(
            vec![
                ("a", node("input", json!({}))),
                ("l", node("loop", json!({ "iterateOver": [1], "maxIterations": 0 }))),
            ],
            vec![edge("e1", "a", "l")],
            "a",
        );
        assert_eq!(compile(&def).unwrap_err().code(), "INVALID_LOOP_CONFIG");
    }

    #[test]
    fn compile_options_apply_default_cap() {
        let def = definition(
            vec![
                ("a", node("input", json!({}))),
                (
                    "l",
                    node("loop", json!({ "iterateOver": [1, 2], "onLimitExceeded": "truncate" })),
                ),
            ],
            vec![edge("e1", "a", "l")],
            "a",
        );
        let plan = compile_with(
            &def,
            &CompileOptions {
                default_max_iterations: 7,
            },
        )
        .unwrap();
        let ctx = plan.loop_context("l").unwrap();
        assert_eq!(ctx.max_iterations, 7);
        assert_eq!(ctx.on_limit_exceeded, LimitPolicy::Truncate);
        assert!(ctx.body.is_empty());
    }
}
