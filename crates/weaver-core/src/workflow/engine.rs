//! Workflow engine: admission, the per-execution scheduling actor, and
//! result assembly.
//!
//! # Execution flow
//!
//! 1. Compile the definition (cached by content hash).
//! 2. Estimate the run's credits and reserve them; a denied reservation
//!    rejects the execution before anything runs.
//! 3. Drive the root scope: dispatch ready nodes up to `max_concurrent_nodes`,
//!    apply each result to the queue as it arrives, checkpoint, repeat.
//!    Loop nodes run their body plan once per item through the same actor.
//! 4. Assemble final outputs, then finalize (success) or release (failure,
//!    cancellation) the credit reservation.
//!
//! The queue state is only ever touched by the actor loop. Node invocations
//! run concurrently and hand back owned outcomes.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;
use weaver_types::config::EngineConfig;
use weaver_types::execution::{ActivityResult, ExecutionStatus, NodeError, NodeErrorKind, SkipReason};
use weaver_types::workflow::{NodeType, RetryConfig, WorkflowDefinition};

use super::cache::PlanCache;
use super::checkpoint::{BoxExecutionStore, CheckpointError, ExecutionSnapshot};
use super::compiler::{CompileError, CompileOptions, CompiledPlan, LoopContext, PlanNode};
use super::context::{ContextError, ExecutionContext, FinalOutputs};
use super::loop_handler::{self, LoopState};
use super::queue::{FailureOutcome, Propagation, QueueState, SchedulerError};
use super::replan::{ReplanPolicy, SkipFailedIteration};
use super::retry::RetryHandler;
use super::switch;
use crate::activity::box_activity::BoxNodeActivity;
use crate::activity::ExecutionMeta;
use crate::credit::coordinator::{CreditCoordinator, CreditSummary};
use crate::credit::CreditError;
use crate::telemetry::{SpanStatus, Telemetry};

/// Account charged when a request does not name one.
pub const DEFAULT_ACCOUNT: &str = "default";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Engine-level faults. Node failures are not errors at this level: they end
/// up in an `Ok(ExecutionResult)` with status `failed`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("execution {execution_id} denied: account '{account}' cannot cover an estimated {estimate} credits")]
    AdmissionDenied {
        execution_id: Uuid,
        account: String,
        estimate: u64,
    },

    #[error("credit error: {0}")]
    Credit(#[from] CreditError),

    #[error("scheduler invariant violated: {source}")]
    InvariantViolation {
        source: SchedulerError,
        /// Queue state at the moment of the violation.
        state: Box<QueueState>,
    },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("context error: {0}")]
    Context(#[from] ContextError),

    #[error("execution {0} is not running")]
    RunNotFound(Uuid),

    #[error("execution {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("execution {execution_id} is {status} and cannot be resumed")]
    NotResumable {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Compile(e) => e.code(),
            EngineError::AdmissionDenied { .. } => "ADMISSION_DENIED",
            EngineError::Credit(_) => "CREDIT_ERROR",
            EngineError::InvariantViolation { .. } => "SCHEDULING_INVARIANT_VIOLATION",
            EngineError::Checkpoint(_) => "CHECKPOINT_ERROR",
            EngineError::Context(_) => "CONTEXT_ERROR",
            EngineError::RunNotFound(_) => "RUN_NOT_FOUND",
            EngineError::AlreadyRunning(_) => "ALREADY_RUNNING",
            EngineError::NotResumable { .. } => "NOT_RESUMABLE",
        }
    }
}

fn violation(source: SchedulerError, queue: &QueueState) -> EngineError {
    tracing::error!(error = %source, "scheduler invariant violated, aborting execution");
    EngineError::InvariantViolation {
        source,
        state: Box::new(queue.clone()),
    }
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub execution_id: Uuid,
    pub definition: WorkflowDefinition,
    pub inputs: Value,
    /// Credit account charged for the run.
    pub account: String,
}

impl ExecutionRequest {
    pub fn new(definition: WorkflowDefinition, inputs: Value) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            definition,
            inputs,
            account: DEFAULT_ACCOUNT.to_string(),
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = account.into();
        self
    }

    pub fn with_execution_id(mut self, execution_id: Uuid) -> Self {
        self.execution_id = execution_id;
        self
    }
}

/// Outcome of an execution that ran (completed, failed, cancelled, or paused).
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub final_outputs: FinalOutputs,
    /// Node whose unrecovered failure failed the execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
    pub context: ExecutionContext,
    pub queue: QueueState,
    /// Closed ledger; `None` while paused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits: Option<CreditSummary>,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Per-execution runtime state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RunControls {
    cancel: CancellationToken,
    pause: CancellationToken,
}

struct RunCtx {
    execution_id: Uuid,
    cancel: CancellationToken,
    pause: CancellationToken,
    /// Bounds activity invocations across every scope of the execution.
    permits: Semaphore,
    deadline: tokio::time::Instant,
    timed_out: AtomicBool,
}

impl RunCtx {
    fn new(execution_id: Uuid, config: &EngineConfig) -> Self {
        Self {
            execution_id,
            cancel: CancellationToken::new(),
            pause: CancellationToken::new(),
            permits: Semaphore::new(config.max_concurrent_nodes.max(1)),
            deadline: deadline_after(config.execution_timeout_ms),
            timed_out: AtomicBool::new(false),
        }
    }

    fn controls(&self) -> RunControls {
        RunControls {
            cancel: self.cancel.clone(),
            pause: self.pause.clone(),
        }
    }

    fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }
}

/// Far enough away that an oversized timeout never fires.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

fn deadline_after(timeout_ms: u64) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(Duration::from_millis(timeout_ms))
        .unwrap_or(now + FAR_FUTURE)
}

enum Scope<'a> {
    Root {
        definition: &'a WorkflowDefinition,
        /// Nodes that were executing when the run was checkpointed.
        resumed: Vec<String>,
    },
    Iteration(usize),
}

impl Scope<'_> {
    fn iteration(&self) -> Option<usize> {
        match self {
            Scope::Root { .. } => None,
            Scope::Iteration(index) => Some(*index),
        }
    }

    fn is_root(&self) -> bool {
        matches!(self, Scope::Root { .. })
    }
}

#[derive(Debug)]
enum ScopeOutcome {
    Completed,
    Failed { node_id: String, error: NodeError },
    Cancelled,
    Paused,
}

/// What a finished node invocation hands back to the actor.
#[derive(Debug)]
struct NodeOutcome {
    node_id: String,
    result: Result<Value, NodeError>,
    credits: u64,
    duration_ms: u64,
}

impl NodeOutcome {
    fn failed(node: &PlanNode, error: NodeError) -> Self {
        Self {
            node_id: node.id.clone(),
            result: Err(error),
            credits: 0,
            duration_ms: 0,
        }
    }
}

type InFlight<'a> = Pin<Box<dyn Future<Output = Result<NodeOutcome, EngineError>> + Send + 'a>>;

enum Wake {
    Cancel,
    Pause,
    Deadline,
    Finished(Result<NodeOutcome, EngineError>),
    Idle,
}

fn span_status(result: &Result<Value, NodeError>) -> SpanStatus {
    match result {
        Ok(_) => SpanStatus::Ok,
        Err(e) => SpanStatus::Error {
            code: e.kind.code().to_string(),
            message: e.message.clone(),
        },
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Executes compiled workflows against an injected node activity.
pub struct WorkflowEngine {
    activity: BoxNodeActivity,
    credits: Arc<CreditCoordinator>,
    telemetry: Telemetry,
    store: Option<BoxExecutionStore>,
    replan: Arc<dyn ReplanPolicy>,
    config: EngineConfig,
    plans: PlanCache,
    running: DashMap<Uuid, RunControls>,
}

impl WorkflowEngine {
    pub fn new(
        activity: BoxNodeActivity,
        credits: Arc<CreditCoordinator>,
        telemetry: Telemetry,
        config: EngineConfig,
    ) -> Self {
        Self {
            activity,
            credits,
            telemetry,
            store: None,
            replan: Arc::new(SkipFailedIteration),
            config,
            plans: PlanCache::new(),
            running: DashMap::new(),
        }
    }

    /// Checkpoint executions to `store`.
    pub fn with_store(mut self, store: BoxExecutionStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_replan_policy(mut self, policy: Arc<dyn ReplanPolicy>) -> Self {
        self.replan = policy;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn credits(&self) -> &CreditCoordinator {
        &self.credits
    }

    pub fn compile(&self, definition: &WorkflowDefinition) -> Result<Arc<CompiledPlan>, CompileError> {
        self.plans
            .get_or_compile(definition, CompileOptions::from(&self.config))
    }

    pub fn is_running(&self, execution_id: Uuid) -> bool {
        self.running.contains_key(&execution_id)
    }

    /// Run a workflow from the start.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, EngineError> {
        let ExecutionRequest {
            execution_id,
            definition,
            inputs,
            account,
        } = request;

        if self.is_running(execution_id) {
            return Err(EngineError::AlreadyRunning(execution_id));
        }
        let plan = self.compile(&definition)?;

        let estimate = self.credits.estimate_workflow_credits(&plan, &inputs);
        if !self.credits.should_allow_execution(&account, estimate).await?
            || !self.credits.reserve_credits(execution_id, &account, estimate).await?
        {
            tracing::info!(%execution_id, account = account.as_str(), estimate, "execution rejected by admission control");
            return Err(EngineError::AdmissionDenied {
                execution_id,
                account,
                estimate,
            });
        }

        let queue = QueueState::initialize(&plan);
        let context = ExecutionContext::with_limit(inputs, self.config.max_output_bytes);
        tracing::info!(
            %execution_id,
            workflow = plan.name.as_str(),
            nodes = plan.len(),
            loops = plan.loop_contexts.len(),
            estimate,
            "starting execution"
        );
        self.telemetry
            .emit_execution_started(execution_id, &plan.name, plan.len())
            .await;

        self.drive(execution_id, &definition, &plan, queue, context, Vec::new())
            .await
    }

    /// Continue an execution from a snapshot.
    ///
    /// The queue is rebuilt by replaying the snapshot's journal and must match
    /// the saved state exactly. Nodes that were executing when the snapshot
    /// was taken are invoked again.
    pub async fn resume(&self, snapshot: ExecutionSnapshot) -> Result<ExecutionResult, EngineError> {
        let ExecutionSnapshot {
            execution_id,
            status,
            definition,
            queue: saved,
            context,
            credits,
            ..
        } = snapshot;

        if status.is_terminal() {
            return Err(EngineError::NotResumable { execution_id, status });
        }
        if self.is_running(execution_id) {
            return Err(EngineError::AlreadyRunning(execution_id));
        }
        let plan = self.compile(&definition)?;

        let queue = QueueState::replay(&plan, saved.journal()).map_err(|e| violation(e, &saved))?;
        if queue != saved {
            return Err(violation(
                SchedulerError::InvariantViolation(
                    "journal replay does not reproduce the saved queue state".to_string(),
                ),
                &saved,
            ));
        }

        if self.credits.ledger(execution_id).is_none() {
            let ledger = credits.ok_or(CreditError::LedgerNotFound(execution_id))?;
            self.credits.restore_ledger(execution_id, ledger)?;
        }

        let resumed: Vec<String> = queue.executing.iter().cloned().collect();
        tracing::info!(
            %execution_id,
            workflow = plan.name.as_str(),
            finished = queue.finished_count(),
            resumed = resumed.len(),
            "resuming execution"
        );
        self.drive(execution_id, &definition, &plan, queue, context, resumed)
            .await
    }

    /// Resume from the latest snapshot in the configured store.
    pub async fn resume_from_store(&self, execution_id: Uuid) -> Result<ExecutionResult, EngineError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| CheckpointError::Store("no execution store configured".to_string()))?;
        let snapshot = store
            .load_snapshot(execution_id)
            .await?
            .ok_or(EngineError::RunNotFound(execution_id))?;
        self.resume(snapshot).await
    }

    /// Cancel a running execution. Executing nodes see the cancellation
    /// through their meta; nothing new is dispatched.
    pub fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let controls = self
            .running
            .get(&execution_id)
            .ok_or(EngineError::RunNotFound(execution_id))?;
        tracing::info!(%execution_id, "cancellation requested");
        controls.cancel.cancel();
        Ok(())
    }

    /// Pause a running execution once its in-flight nodes finish.
    ///
    /// The credit reservation stays open; resume with [`Self::resume`] or
    /// [`Self::resume_from_store`].
    pub fn pause(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let controls = self
            .running
            .get(&execution_id)
            .ok_or(EngineError::RunNotFound(execution_id))?;
        tracing::info!(%execution_id, "pause requested");
        controls.pause.cancel();
        Ok(())
    }

    // -- Root driver --------------------------------------------------------

    async fn drive(
        &self,
        execution_id: Uuid,
        definition: &WorkflowDefinition,
        plan: &CompiledPlan,
        mut queue: QueueState,
        mut context: ExecutionContext,
        resumed: Vec<String>,
    ) -> Result<ExecutionResult, EngineError> {
        let run = RunCtx::new(execution_id, &self.config);
        match self.running.entry(execution_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(EngineError::AlreadyRunning(execution_id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(run.controls());
            }
        }

        let started = Instant::now();
        let scope = Scope::Root {
            definition,
            resumed,
        };
        let outcome = self
            .run_scope(&run, plan, &mut queue, &mut context, scope)
            .await;
        self.running.remove(&execution_id);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(err) = self.credits.release_credits(execution_id).await {
                    tracing::warn!(%execution_id, error = %err, "failed to release credits after engine error");
                }
                self.telemetry
                    .emit_execution_failed(execution_id, &e.to_string(), None)
                    .await;
                return Err(e);
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let final_outputs = context.build_final_outputs(&plan.output_node_ids);
        let (status, failed_node, error) = match outcome {
            ScopeOutcome::Completed => (ExecutionStatus::Completed, None, None),
            ScopeOutcome::Failed { node_id, error } => (ExecutionStatus::Failed, Some(node_id), Some(error)),
            ScopeOutcome::Cancelled if run.is_timed_out() => (
                ExecutionStatus::Failed,
                None,
                Some(NodeError::new(
                    NodeErrorKind::Timeout,
                    format!("execution exceeded {}ms", self.config.execution_timeout_ms),
                )),
            ),
            ScopeOutcome::Cancelled => (ExecutionStatus::Cancelled, None, None),
            ScopeOutcome::Paused => (ExecutionStatus::Paused, None, None),
        };

        self.checkpoint(&run, definition, &queue, &context, status).await;

        let credits = match status {
            ExecutionStatus::Completed => Some(self.credits.finalize_credits(execution_id).await?),
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                Some(self.credits.release_credits(execution_id).await?)
            }
            ExecutionStatus::Paused | ExecutionStatus::Running => None,
        };

        match status {
            ExecutionStatus::Completed => {
                self.telemetry
                    .emit_execution_completed(
                        execution_id,
                        duration_ms,
                        Value::Object(final_outputs.outputs.clone()),
                    )
                    .await;
            }
            ExecutionStatus::Failed => {
                let message = error.as_ref().map(ToString::to_string).unwrap_or_default();
                self.telemetry
                    .emit_execution_failed(execution_id, &message, failed_node.as_deref())
                    .await;
            }
            ExecutionStatus::Cancelled => {
                self.telemetry
                    .emit_execution_cancelled(execution_id, "cancelled by request")
                    .await;
            }
            ExecutionStatus::Paused => {
                self.telemetry
                    .emit_execution_paused(execution_id, "paused by request")
                    .await;
            }
            ExecutionStatus::Running => {}
        }

        tracing::info!(
            %execution_id,
            %status,
            duration_ms,
            completed = queue.completed.len(),
            failed = queue.failed.len(),
            skipped = queue.skipped.len(),
            "execution finished"
        );

        Ok(ExecutionResult {
            execution_id,
            workflow_name: plan.name.clone(),
            status,
            final_outputs,
            failed_node,
            error,
            context,
            queue,
            credits,
            duration_ms,
        })
    }

    // -- Scheduling actor ---------------------------------------------------

    /// Run one plan scope to completion: the workflow itself or one loop
    /// iteration's body.
    async fn run_scope(
        &self,
        run: &RunCtx,
        plan: &CompiledPlan,
        queue: &mut QueueState,
        context: &mut ExecutionContext,
        scope: Scope<'_>,
    ) -> Result<ScopeOutcome, EngineError> {
        let iteration = scope.iteration();
        let root = scope.is_root();
        let max_concurrent = self.config.max_concurrent_nodes.max(1);
        let mut in_flight: FuturesUnordered<InFlight<'_>> = FuturesUnordered::new();
        let mut pausing = false;

        if queue.journal().is_empty() {
            for (node_id, reason) in &queue.skipped {
                self.telemetry
                    .emit_node_skipped(run.execution_id, node_id, *reason)
                    .await;
            }
        }
        if let Scope::Root { resumed, .. } = &scope {
            for id in resumed {
                let node = plan
                    .node(id)
                    .ok_or_else(|| violation(SchedulerError::UnknownNode(id.clone()), queue))?;
                in_flight.push(self.start_node(run, plan, node, context, iteration));
            }
        }
        queue.check_invariants(plan).map_err(|e| violation(e, queue))?;

        loop {
            if run.cancel.is_cancelled() && !queue.is_cancelled() {
                self.apply_cancel(run, queue).await;
            }

            if !pausing {
                let batch = queue
                    .dispatch(max_concurrent)
                    .map_err(|e| violation(e, queue))?;
                queue.check_invariants(plan).map_err(|e| violation(e, queue))?;
                if !batch.is_empty() {
                    tracing::debug!(
                        execution_id = %run.execution_id,
                        scope = plan.name.as_str(),
                        nodes = ?batch,
                        "dispatching nodes"
                    );
                    self.checkpoint_scope(run, &scope, queue, context).await;
                }
                for id in &batch {
                    let node = plan
                        .node(id)
                        .ok_or_else(|| violation(SchedulerError::UnknownNode(id.clone()), queue))?;
                    in_flight.push(self.start_node(run, plan, node, context, iteration));
                }
            }

            if in_flight.is_empty() {
                if queue.is_execution_complete() || pausing {
                    break;
                }
                return Err(violation(
                    SchedulerError::InvariantViolation(format!(
                        "scope '{}' has unfinished nodes but nothing is ready or executing",
                        plan.name
                    )),
                    queue,
                ));
            }

            let wake = tokio::select! {
                biased;
                _ = run.cancel.cancelled(), if !queue.is_cancelled() => Wake::Cancel,
                _ = run.pause.cancelled(), if root && !pausing => Wake::Pause,
                _ = tokio::time::sleep_until(run.deadline), if root && !run.is_timed_out() => Wake::Deadline,
                Some(finished) = in_flight.next() => Wake::Finished(finished),
                else => Wake::Idle,
            };

            match wake {
                Wake::Cancel => self.apply_cancel(run, queue).await,
                Wake::Pause => {
                    pausing = true;
                    tracing::info!(
                        execution_id = %run.execution_id,
                        in_flight = in_flight.len(),
                        "pausing, waiting for in-flight nodes"
                    );
                }
                Wake::Deadline => {
                    tracing::warn!(
                        execution_id = %run.execution_id,
                        timeout_ms = self.config.execution_timeout_ms,
                        "execution timed out"
                    );
                    run.timed_out.store(true, Ordering::SeqCst);
                    run.cancel.cancel();
                }
                Wake::Idle => {}
                Wake::Finished(finished) => {
                    let outcome = finished?;
                    self.apply_outcome(run, plan, queue, context, outcome, iteration)
                        .await?;
                    queue.check_invariants(plan).map_err(|e| violation(e, queue))?;
                    if root {
                        self.telemetry
                            .emit_execution_progress(
                                run.execution_id,
                                queue.finished_count(),
                                queue.total_count(),
                            )
                            .await;
                        self.checkpoint_scope(run, &scope, queue, context).await;
                    }
                }
            }
        }

        let outcome = if queue.is_cancelled() {
            ScopeOutcome::Cancelled
        } else if let Some((node_id, error)) = queue.unrecovered_failure() {
            ScopeOutcome::Failed {
                node_id: node_id.to_string(),
                error: error.clone(),
            }
        } else if !queue.is_execution_complete() {
            ScopeOutcome::Paused
        } else {
            ScopeOutcome::Completed
        };
        Ok(outcome)
    }

    async fn apply_cancel(&self, run: &RunCtx, queue: &mut QueueState) {
        let skipped = queue.cancel();
        tracing::debug!(execution_id = %run.execution_id, skipped = skipped.len(), "scope cancelled");
        for node_id in &skipped {
            self.telemetry
                .emit_node_skipped(run.execution_id, node_id, SkipReason::Cancelled)
                .await;
        }
    }

    /// Apply one finished invocation: validate, charge, record, transition.
    async fn apply_outcome(
        &self,
        run: &RunCtx,
        plan: &CompiledPlan,
        queue: &mut QueueState,
        context: &mut ExecutionContext,
        outcome: NodeOutcome,
        iteration: Option<usize>,
    ) -> Result<(), EngineError> {
        let NodeOutcome {
            node_id,
            result,
            credits,
            duration_ms,
        } = outcome;
        let node = plan
            .node(&node_id)
            .ok_or_else(|| violation(SchedulerError::UnknownNode(node_id.clone()), queue))?;

        let result = result.and_then(|output| {
            if node.node_type == NodeType::Switch {
                switch::selected_route(&output)?;
            }
            Ok(output)
        });
        let result = match result {
            Ok(output) => match self.credits.deduct(run.execution_id, &node_id, credits) {
                Ok(_) => Ok(output),
                Err(CreditError::Exhausted {
                    requested, remaining, ..
                }) => Err(NodeError::new(
                    NodeErrorKind::CreditExhausted,
                    format!("node needs {requested} credits but only {remaining} remain reserved"),
                )),
                Err(e) => return Err(e.into()),
            },
            Err(error) => Err(error),
        };

        match result {
            Ok(output) => {
                context.record_output(&node_id, output.clone())?;
                let propagation = queue
                    .mark_completed(plan, &node_id, output)
                    .map_err(|e| violation(e, queue))?;
                self.telemetry
                    .emit_node_completed(run.execution_id, &node_id, duration_ms, credits, iteration)
                    .await;
                self.emit_propagation(run, &propagation).await;
            }
            Err(error) => {
                self.telemetry
                    .emit_node_failed(run.execution_id, &node_id, &error, false, iteration)
                    .await;
                let outcome = queue
                    .mark_failed(plan, &node_id, error)
                    .map_err(|e| violation(e, queue))?;
                if let FailureOutcome::Continued { output, .. } = &outcome {
                    context.record_output(&node_id, output.clone())?;
                }
                if let Some(propagation) = outcome.propagation() {
                    self.emit_propagation(run, propagation).await;
                }
            }
        }
        Ok(())
    }

    async fn emit_propagation(&self, run: &RunCtx, propagation: &Propagation) {
        for (node_id, reason) in &propagation.skipped {
            self.telemetry
                .emit_node_skipped(run.execution_id, node_id, *reason)
                .await;
        }
    }

    // -- Node invocation ----------------------------------------------------

    /// Build the future for one dispatched node. Everything it needs from the
    /// context is copied out up front.
    fn start_node<'a>(
        &'a self,
        run: &'a RunCtx,
        plan: &'a CompiledPlan,
        node: &'a PlanNode,
        context: &ExecutionContext,
        iteration: Option<usize>,
    ) -> InFlight<'a> {
        if let Some(loop_ctx) = plan.loop_context(&node.id) {
            return self.run_loop(run, node, loop_ctx, context.clone(), iteration);
        }
        let prepared = context
            .resolve(&node.config, &node.visible)
            .map(|config| (config, context.visible_view(&node.visible)));
        Box::pin(async move {
            match prepared {
                Ok((config, view)) => Ok(self.invoke_node(run, node, config, view, iteration).await),
                Err(e) => {
                    tracing::debug!(node_id = node.id.as_str(), error = %e, "node config did not resolve");
                    Ok(NodeOutcome::failed(node, e.into()))
                }
            }
        })
    }

    /// Invoke an activity node with retries, per-attempt timeout, and a span.
    async fn invoke_node(
        &self,
        run: &RunCtx,
        node: &PlanNode,
        config: Value,
        view: Value,
        iteration: Option<usize>,
    ) -> NodeOutcome {
        let execution_id = run.execution_id;
        let span = tracing::info_span!(
            "node",
            execution_id = %execution_id,
            node_id = node.id.as_str(),
            node_type = %node.node_type,
            iteration
        );

        async move {
            let telemetry_span = self.telemetry.create_span(execution_id, node, iteration).await;
            self.telemetry
                .emit_node_started(execution_id, node, iteration)
                .await;

            let retry = node.retry.clone().unwrap_or(RetryConfig {
                max_attempts: 1,
                backoff_ms: 0,
            });
            let timeout_ms = node.timeout_ms.unwrap_or(self.config.default_node_timeout_ms);

            let mut attempt = 1;
            let (result, metrics) = loop {
                let activity_result = self
                    .attempt(run, node, &config, &view, attempt, iteration, timeout_ms)
                    .await;
                let metrics = activity_result.metrics.clone();
                match activity_result.into_outcome() {
                    Ok(output) => break (Ok(output), metrics),
                    Err(error)
                        if !run.cancel.is_cancelled()
                            && RetryHandler::should_retry(&retry, attempt, &error) =>
                    {
                        let delay = RetryHandler::backoff_delay(&retry, attempt);
                        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying node");
                        self.telemetry
                            .emit_node_failed(execution_id, &node.id, &error, true, iteration)
                            .await;
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = run.cancel.cancelled() => break (Err(error), metrics),
                        }
                        attempt += 1;
                    }
                    Err(error) => break (Err(error), metrics),
                }
            };

            let credits = match &result {
                Ok(_) => self
                    .credits
                    .calculate_node_credits(node.node_type, metrics.as_ref()),
                Err(_) => 0,
            };
            let duration_ms = self
                .telemetry
                .end_span(&telemetry_span, span_status(&result))
                .await;

            NodeOutcome {
                node_id: node.id.clone(),
                result,
                credits,
                duration_ms,
            }
        }
        .instrument(span)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        run: &RunCtx,
        node: &PlanNode,
        config: &Value,
        view: &Value,
        attempt: u32,
        iteration: Option<usize>,
        timeout_ms: u64,
    ) -> ActivityResult {
        let Ok(_permit) = run.permits.acquire().await else {
            return ActivityResult::failure(NodeError::new(
                NodeErrorKind::Cancelled,
                "execution is shutting down",
            ));
        };
        let meta = ExecutionMeta {
            execution_id: run.execution_id,
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            attempt,
            iteration,
            cancel: run.cancel.clone(),
        };
        let call = self
            .activity
            .execute_node(node.node_type, config, view, &meta);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(node_id = node.id.as_str(), timeout_ms, attempt, "node timed out");
                ActivityResult::failure(NodeError::timeout(timeout_ms))
            }
        }
    }

    // -- Loops --------------------------------------------------------------

    /// Drive a loop node. Boxed because iterations recurse into `run_scope`.
    fn run_loop<'a>(
        &'a self,
        run: &'a RunCtx,
        node: &'a PlanNode,
        loop_ctx: &'a LoopContext,
        base: ExecutionContext,
        iteration: Option<usize>,
    ) -> InFlight<'a> {
        Box::pin(async move {
            let span = self.telemetry.create_span(run.execution_id, node, iteration).await;
            self.telemetry
                .emit_node_started(run.execution_id, node, iteration)
                .await;

            let result = match loop_handler::resolve_items(&loop_ctx.iterate_over, &base, &node.visible) {
                Ok(items) => self.iterate(run, loop_ctx, &base, items).await?,
                Err(error) => Err(error),
            };

            let duration_ms = self.telemetry.end_span(&span, span_status(&result)).await;
            let credits = match &result {
                Ok(_) => self.credits.fixed_node_cost(NodeType::Loop),
                Err(_) => 0,
            };
            Ok(NodeOutcome {
                node_id: node.id.clone(),
                result,
                credits,
                duration_ms,
            })
        })
    }

    async fn iterate(
        &self,
        run: &RunCtx,
        loop_ctx: &LoopContext,
        base: &ExecutionContext,
        items: Vec<Value>,
    ) -> Result<Result<Value, NodeError>, EngineError> {
        let width = if loop_ctx.allow_parallel {
            self.config.max_concurrent_nodes.max(1)
        } else {
            1
        };
        tracing::debug!(
            loop_node_id = loop_ctx.loop_node_id.as_str(),
            items = items.len(),
            width,
            max_iterations = loop_ctx.max_iterations,
            "loop started"
        );

        let mut state = LoopState::new(loop_ctx, items);
        let mut running = FuturesUnordered::new();
        loop {
            if run.cancel.is_cancelled() {
                state.cancel();
            }
            while running.len() < width {
                let Some((index, item)) = state.next_iteration() else {
                    break;
                };
                let child = base.child_scope(state.binding(index, &item));
                running.push(self.run_iteration(run, loop_ctx, child, index, item));
            }
            let Some(finished) = running.next().await else {
                break;
            };
            let (index, result) = finished?;
            match result {
                Ok(value) => state.record_success(index, value),
                Err(error) => state.record_failure(index, error, self.replan.as_ref()),
            }
        }
        Ok(state.finish())
    }

    async fn run_iteration(
        &self,
        run: &RunCtx,
        loop_ctx: &LoopContext,
        mut child: ExecutionContext,
        index: usize,
        item: Value,
    ) -> Result<(usize, Result<Value, NodeError>), EngineError> {
        let mut queue = QueueState::initialize(&loop_ctx.body);
        let outcome = self
            .run_scope(run, &loop_ctx.body, &mut queue, &mut child, Scope::Iteration(index))
            .await?;
        let result = match outcome {
            ScopeOutcome::Completed | ScopeOutcome::Paused => {
                Ok(loop_handler::iteration_result(&loop_ctx.body, &child, &item))
            }
            ScopeOutcome::Failed { error, .. } => Err(error),
            ScopeOutcome::Cancelled => Err(NodeError::new(
                NodeErrorKind::Cancelled,
                "iteration cancelled",
            )),
        };
        Ok((index, result))
    }

    // -- Checkpoints --------------------------------------------------------

    async fn checkpoint_scope(
        &self,
        run: &RunCtx,
        scope: &Scope<'_>,
        queue: &QueueState,
        context: &ExecutionContext,
    ) {
        if let Scope::Root { definition, .. } = scope {
            self.checkpoint(run, definition, queue, context, ExecutionStatus::Running)
                .await;
        }
    }

    /// Save a snapshot when a store is configured. Store failures are logged;
    /// the execution carries on without durability.
    async fn checkpoint(
        &self,
        run: &RunCtx,
        definition: &WorkflowDefinition,
        queue: &QueueState,
        context: &ExecutionContext,
        status: ExecutionStatus,
    ) {
        let Some(store) = &self.store else { return };
        let snapshot = ExecutionSnapshot {
            execution_id: run.execution_id,
            status,
            definition: definition.clone(),
            queue: queue.clone(),
            context: context.clone(),
            credits: self.credits.ledger(run.execution_id),
            saved_at: Utc::now(),
        };
        if let Err(e) = store.save_snapshot(&snapshot).await {
            tracing::warn!(execution_id = %run.execution_id, error = %e, "failed to save checkpoint");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use serde_json::json;
    use weaver_types::config::CreditConfig;
    use weaver_types::event::ExecutionEvent;

    use crate::activity::NodeActivity;
    use crate::credit::store::{BoxCreditStore, InMemoryCreditStore};
    use crate::event::bus::EventBus;
    use crate::workflow::checkpoint::{ExecutionStore, InMemoryExecutionStore};
    use crate::workflow::queue::ReadyEntry;

    #[derive(Debug, Clone)]
    struct Call {
        node_id: String,
        iteration: Option<usize>,
        attempt: u32,
        config: Value,
    }

    /// Test activity. Input nodes return the inputs, scripted nodes return
    /// their scripted output, everything else echoes its config.
    ///
    /// Config keys `delayMs` (sleep, honoring cancellation) and `fail: true`
    /// shape individual invocations; `failures` fails a node's first n attempts.
    #[derive(Default)]
    struct ScriptedActivity {
        outputs: HashMap<String, Value>,
        failures: HashMap<String, u32>,
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl ScriptedActivity {
        fn new() -> Self {
            Self::default()
        }

        fn output(mut self, node_id: &str, output: Value) -> Self {
            self.outputs.insert(node_id.to_string(), output);
            self
        }

        fn fail_attempts(mut self, node_id: &str, attempts: u32) -> Self {
            self.failures.insert(node_id.to_string(), attempts);
            self
        }

        fn calls(&self) -> Arc<Mutex<Vec<Call>>> {
            Arc::clone(&self.calls)
        }
    }

    impl NodeActivity for ScriptedActivity {
        async fn execute_node(
            &self,
            node_type: NodeType,
            config: &Value,
            context: &Value,
            meta: &ExecutionMeta,
        ) -> ActivityResult {
            self.calls.lock().unwrap().push(Call {
                node_id: meta.node_id.clone(),
                iteration: meta.iteration,
                attempt: meta.attempt,
                config: config.clone(),
            });

            if let Some(ms) = config.get("delayMs").and_then(Value::as_u64) {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    _ = meta.cancel.cancelled() => {
                        return ActivityResult::failure(NodeError::new(NodeErrorKind::Cancelled, "cancelled"));
                    }
                }
            }
            let scripted_failures = self.failures.get(&meta.node_id).copied().unwrap_or(0);
            if meta.attempt <= scripted_failures || config.get("fail") == Some(&json!(true)) {
                return ActivityResult::failure(NodeError::activity(format!("{} failed", meta.node_id)));
            }

            let output = match self.outputs.get(&meta.node_id) {
                Some(output) => output.clone(),
                None if node_type == NodeType::Input => context["inputs"].clone(),
                None => config.clone(),
            };
            ActivityResult::ok(output)
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            credits: CreditConfig {
                enabled: false,
                ..CreditConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    fn metered_config() -> EngineConfig {
        EngineConfig::default()
    }

    fn engine_with(activity: ScriptedActivity, config: EngineConfig, credits: InMemoryCreditStore) -> WorkflowEngine {
        let coordinator = CreditCoordinator::new(BoxCreditStore::new(credits), config.credits.clone());
        let telemetry = Telemetry::new(EventBus::new(config.event_buffer));
        WorkflowEngine::new(BoxNodeActivity::new(activity), Arc::new(coordinator), telemetry, config)
    }

    fn engine(activity: ScriptedActivity) -> WorkflowEngine {
        engine_with(activity, config(), InMemoryCreditStore::new())
    }

    fn definition(value: Value) -> WorkflowDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn invoked(calls: &Arc<Mutex<Vec<Call>>>, node_id: &str) -> Vec<Call> {
        calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.node_id == node_id)
            .cloned()
            .collect()
    }

    fn linear(b_config: Value) -> WorkflowDefinition {
        definition(json!({
            "name": "linear",
            "entryPoint": "a",
            "nodes": {
                "a": { "type": "input", "name": "A" },
                "b": { "type": "transform", "name": "B", "config": b_config },
                "c": { "type": "output", "name": "C", "config": { "done": true } }
            },
            "edges": [
                { "id": "e1", "source": "a", "target": "b" },
                { "id": "e2", "source": "b", "target": "c" }
            ]
        }))
    }

    // -- Scheduling ---------------------------------------------------------

    #[tokio::test]
    async fn corrupted_queue_aborts_before_dispatch() {
        let activity = ScriptedActivity::new();
        let calls = activity.calls();
        let engine = engine(activity);
        let def = linear(json!({}));
        let plan = engine.compile(&def).unwrap();

        // c is marked ready while its dependency b has not run
        let mut queue = QueueState::initialize(&plan);
        assert!(queue.pending.remove("c"));
        queue.ready.insert("c".to_string(), ReadyEntry { depth: 2, seq: 99 });

        let execution_id = Uuid::now_v7();
        let err = engine
            .drive(execution_id, &def, &plan, queue, ExecutionContext::new(json!({})), Vec::new())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "SCHEDULING_INVARIANT_VIOLATION");
        let EngineError::InvariantViolation { source, state } = err else {
            panic!("expected an invariant violation");
        };
        assert!(source.to_string().contains("'c'"));
        assert!(state.ready.contains_key("c"));
        assert!(calls.lock().unwrap().is_empty());
        assert!(!engine.is_running(execution_id));
    }

    fn decompose_and_execute() -> WorkflowDefinition {
        definition(json!({
            "name": "decompose-and-execute",
            "entryPoint": "input",
            "nodes": {
                "input": { "type": "input", "name": "Input" },
                "decompose": { "type": "llm", "name": "Decompose", "config": { "task": "{{inputs.task}}" } },
                "analyze_dependencies": {
                    "type": "transform",
                    "name": "Analyze dependencies",
                    "config": { "task": "{{decompose.task}}" }
                },
                "execute_subtasks": {
                    "type": "loop",
                    "name": "Execute groups",
                    "config": { "iterateOver": "{{analyze_dependencies.groups}}" }
                },
                "run_group": {
                    "type": "loop",
                    "name": "Run group",
                    "config": { "iterateOver": "{{loop.item}}", "allowParallel": true }
                },
                "subtask": {
                    "type": "llm",
                    "name": "Subtask",
                    "config": { "task": "{{loop.item}}", "delayMs": 10 }
                },
                "aggregate": {
                    "type": "transform",
                    "name": "Aggregate",
                    "config": { "result": "{{execute_subtasks.results}}" }
                },
                "output": { "type": "output", "name": "Output", "config": { "result": "{{aggregate.result}}" } }
            },
            "edges": [
                { "id": "e1", "source": "input", "target": "decompose" },
                { "id": "e2", "source": "decompose", "target": "analyze_dependencies" },
                { "id": "e3", "source": "analyze_dependencies", "target": "execute_subtasks" },
                { "id": "e4", "source": "execute_subtasks", "target": "run_group", "sourceHandle": "loop-body" },
                { "id": "e5", "source": "run_group", "target": "subtask", "sourceHandle": "loop-body" },
                { "id": "e6", "source": "subtask", "target": "run_group", "targetHandle": "loop-return" },
                { "id": "e7", "source": "run_group", "target": "execute_subtasks", "targetHandle": "loop-return" },
                { "id": "e8", "source": "execute_subtasks", "target": "aggregate" },
                { "id": "e9", "source": "aggregate", "target": "output" }
            ]
        }))
    }

    #[tokio::test]
    async fn nested_loops_run_dependency_groups_in_order() {
        let activity = ScriptedActivity::new()
            .output("analyze_dependencies", json!({ "groups": [["a"], ["b", "c"], ["d"]] }));
        let calls = activity.calls();
        let engine = engine(activity);

        let request = ExecutionRequest::new(decompose_and_execute(), json!({ "task": "ship it" }));
        let result = engine.execute(request).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(
            result.final_outputs.outputs["result"],
            json!([
                { "results": [{ "task": "a", "delayMs": 10 }], "iterations": 1 },
                { "results": [{ "task": "b", "delayMs": 10 }, { "task": "c", "delayMs": 10 }], "iterations": 2 },
                { "results": [{ "task": "d", "delayMs": 10 }], "iterations": 1 }
            ])
        );

        let order: Vec<String> = invoked(&calls, "subtask")
            .iter()
            .map(|c| c.config["task"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "a");
        let mut middle = order[1..3].to_vec();
        middle.sort();
        assert_eq!(middle, vec!["b", "c"]);
        assert_eq!(order[3], "d");
        assert!(!engine.is_running(result.execution_id));
    }

    #[tokio::test]
    async fn identical_runs_produce_identical_journals() {
        let def = definition(json!({
            "name": "fan",
            "entryPoint": "root",
            "nodes": {
                "root": { "type": "input", "name": "Root" },
                "x": { "type": "llm", "name": "X", "config": { "v": "{{root.n}}" } },
                "y": { "type": "llm", "name": "Y", "config": { "v": 2 } },
                "join": { "type": "output", "name": "Join", "config": { "x": "{{x.v}}", "y": "{{y.v}}" } }
            },
            "edges": [
                { "id": "e1", "source": "root", "target": "x" },
                { "id": "e2", "source": "root", "target": "y" },
                { "id": "e3", "source": "x", "target": "join" },
                { "id": "e4", "source": "y", "target": "join" }
            ]
        }));
        let config = EngineConfig {
            max_concurrent_nodes: 1,
            ..config()
        };
        let engine = engine_with(ScriptedActivity::new(), config, InMemoryCreditStore::new());

        let first = engine
            .execute(ExecutionRequest::new(def.clone(), json!({ "n": 1 })))
            .await
            .unwrap();
        let second = engine
            .execute(ExecutionRequest::new(def, json!({ "n": 1 })))
            .await
            .unwrap();

        assert_eq!(first.queue.journal(), second.queue.journal());
        assert_eq!(first.final_outputs, second.final_outputs);
        assert_eq!(first.final_outputs.outputs["x"], json!(1));
    }

    #[tokio::test]
    async fn goto_recovery_feeds_aggregator() {
        let def = definition(json!({
            "name": "recovery",
            "entryPoint": "input",
            "nodes": {
                "input": { "type": "input", "name": "Input" },
                "execute_primary": {
                    "type": "http",
                    "name": "Primary",
                    "onError": { "strategy": "goto", "goto": "replan" }
                },
                "replan": { "type": "llm", "name": "Replan" },
                "aggregate": {
                    "type": "transform",
                    "name": "Aggregate",
                    "config": { "result": "{{execute_primary.result ?? replan.result}}" }
                },
                "output": { "type": "output", "name": "Output", "config": { "answer": "{{aggregate.result}}" } }
            },
            "edges": [
                { "id": "e1", "source": "input", "target": "execute_primary" },
                { "id": "e2", "source": "execute_primary", "target": "aggregate" },
                { "id": "e3", "source": "replan", "target": "aggregate" },
                { "id": "e4", "source": "aggregate", "target": "output" }
            ]
        }));
        let activity = ScriptedActivity::new()
            .fail_attempts("execute_primary", 1)
            .output("replan", json!({ "result": "plan b" }));
        let engine = engine(activity);

        let result = engine.execute(ExecutionRequest::new(def, json!({}))).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.final_outputs.outputs["answer"], json!("plan b"));
        assert!(result.queue.failed.contains_key("execute_primary"));
        assert!(result.failed_node.is_none());
    }

    fn branching() -> WorkflowDefinition {
        definition(json!({
            "name": "branching",
            "entryPoint": "start",
            "nodes": {
                "start": { "type": "input", "name": "Start" },
                "route": { "type": "switch", "name": "Route" },
                "a": { "type": "llm", "name": "A" },
                "b": { "type": "llm", "name": "B", "config": { "branch": "b" } },
                "fallback": { "type": "transform", "name": "Fallback" },
                "merge": { "type": "output", "name": "Merge", "config": { "branch": "{{a.branch ?? b.branch ?? fallback.branch}}" } }
            },
            "edges": [
                { "id": "e0", "source": "start", "target": "route" },
                { "id": "e1", "source": "route", "target": "a", "sourceHandle": "case-A" },
                { "id": "e2", "source": "route", "target": "b", "sourceHandle": "case-B" },
                { "id": "e3", "source": "route", "target": "fallback", "sourceHandle": "default" },
                { "id": "e4", "source": "a", "target": "merge" },
                { "id": "e5", "source": "b", "target": "merge" },
                { "id": "e6", "source": "fallback", "target": "merge" }
            ]
        }))
    }

    #[tokio::test]
    async fn switch_runs_only_selected_branch() {
        let activity = ScriptedActivity::new().output("route", json!({ "selectedRoute": "B" }));
        let calls = activity.calls();
        let engine = engine(activity);

        let result = engine.execute(ExecutionRequest::new(branching(), json!({}))).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.final_outputs.outputs["branch"], json!("b"));
        assert!(invoked(&calls, "a").is_empty());
        assert!(invoked(&calls, "fallback").is_empty());
        assert_eq!(result.queue.skipped.get("a"), Some(&SkipReason::BranchNotTaken));
        assert_eq!(result.queue.skipped.get("fallback"), Some(&SkipReason::BranchNotTaken));
    }

    #[tokio::test]
    async fn switch_without_route_fails_the_node() {
        let activity = ScriptedActivity::new().output("route", json!({ "label": "?" }));
        let engine = engine(activity);

        let result = engine.execute(ExecutionRequest::new(branching(), json!({}))).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failed_node.as_deref(), Some("route"));
        assert_eq!(result.queue.skipped.get("merge"), Some(&SkipReason::UpstreamFailed));
    }

    #[tokio::test]
    async fn unresolved_reference_fails_without_invoking() {
        let activity = ScriptedActivity::new();
        let calls = activity.calls();
        let engine = engine(activity);

        let result = engine
            .execute(ExecutionRequest::new(linear(json!({ "x": "{{inputs.missing}}" })), json!({})))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failed_node.as_deref(), Some("b"));
        assert_eq!(result.error.unwrap().kind, NodeErrorKind::UnresolvedReference);
        assert!(invoked(&calls, "b").is_empty());
        assert!(result.final_outputs.missing.contains(&"c".to_string()));
    }

    // -- Loops --------------------------------------------------------------

    fn each(loop_config: Value) -> WorkflowDefinition {
        definition(json!({
            "name": "each",
            "entryPoint": "input",
            "nodes": {
                "input": { "type": "input", "name": "Input" },
                "each": { "type": "loop", "name": "Each", "config": loop_config },
                "work": {
                    "type": "transform",
                    "name": "Work",
                    "config": {
                        "n": "{{loop.item.n}}",
                        "delayMs": "{{loop.item.delay ?? 0}}",
                        "fail": "{{loop.item.fail ?? false}}"
                    }
                },
                "output": { "type": "output", "name": "Output", "config": { "results": "{{each.results}}" } }
            },
            "edges": [
                { "id": "e1", "source": "input", "target": "each" },
                { "id": "e2", "source": "each", "target": "work", "sourceHandle": "loop-body" },
                { "id": "e3", "source": "work", "target": "each", "targetHandle": "loop-return" },
                { "id": "e4", "source": "each", "target": "output" }
            ]
        }))
    }

    fn work(n: u64) -> Value {
        json!({ "n": n, "delayMs": 0, "fail": false })
    }

    #[tokio::test]
    async fn loop_limit_fails_or_truncates() {
        let inputs = json!({ "items": [{ "n": 1 }, { "n": 2 }, { "n": 3 }] });

        let activity = ScriptedActivity::new();
        let calls = activity.calls();
        let engine = engine(activity);
        let failing = each(json!({ "iterateOver": "{{inputs.items}}", "maxIterations": 2 }));
        let result = engine
            .execute(ExecutionRequest::new(failing, inputs.clone()))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failed_node.as_deref(), Some("each"));
        let error = result.error.unwrap();
        assert_eq!(error.kind, NodeErrorKind::LoopLimitExceeded);
        assert_eq!(error.details.unwrap()["iterations"], json!(2));
        assert_eq!(invoked(&calls, "work").len(), 2);

        let truncating = each(json!({
            "iterateOver": "{{inputs.items}}",
            "maxIterations": 2,
            "onLimitExceeded": "truncate"
        }));
        let result = engine.execute(ExecutionRequest::new(truncating, inputs)).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.final_outputs.outputs["results"], json!([work(1), work(2)]));
    }

    #[tokio::test]
    async fn parallel_loop_keeps_item_order() {
        let activity = ScriptedActivity::new();
        let calls = activity.calls();
        let engine = engine(activity);
        let def = each(json!({ "iterateOver": "{{inputs.items}}", "allowParallel": true }));
        let inputs = json!({ "items": [
            { "n": 1, "delay": 40 },
            { "n": 2, "delay": 5 },
            { "n": 3, "delay": 20 },
            { "n": 4, "delay": 1 }
        ] });

        let result = engine.execute(ExecutionRequest::new(def, inputs)).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        let ns: Vec<u64> = result.final_outputs.outputs["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["n"].as_u64().unwrap())
            .collect();
        assert_eq!(ns, vec![1, 2, 3, 4]);
        let mut iterations: Vec<usize> = invoked(&calls, "work").iter().filter_map(|c| c.iteration).collect();
        iterations.sort();
        assert_eq!(iterations, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn replanning_skips_failed_iteration() {
        let inputs = json!({ "items": [{ "n": 1 }, { "n": 2, "fail": true }, { "n": 3 }] });
        let engine = engine(ScriptedActivity::new());

        let replanning = each(json!({ "iterateOver": "{{inputs.items}}", "enableReplanning": true }));
        let result = engine
            .execute(ExecutionRequest::new(replanning, inputs.clone()))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.final_outputs.outputs["results"], json!([work(1), null, work(3)]));

        let strict = each(json!({ "iterateOver": "{{inputs.items}}" }));
        let result = engine.execute(ExecutionRequest::new(strict, inputs)).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failed_node.as_deref(), Some("each"));
    }

    // -- Credits ------------------------------------------------------------

    #[tokio::test]
    async fn failure_releases_unspent_credits() {
        let def = definition(json!({
            "name": "metered",
            "entryPoint": "a",
            "nodes": {
                "a": { "type": "input", "name": "A" },
                "b": { "type": "transform", "name": "B" },
                "c": { "type": "transform", "name": "C", "config": { "fail": true } },
                "d": { "type": "output", "name": "D" }
            },
            "edges": [
                { "id": "e1", "source": "a", "target": "b" },
                { "id": "e2", "source": "b", "target": "c" },
                { "id": "e3", "source": "c", "target": "d" }
            ]
        }));
        let credits = InMemoryCreditStore::with_balance(DEFAULT_ACCOUNT, 100);
        let engine = engine_with(ScriptedActivity::new(), metered_config(), credits.clone());

        let result = engine.execute(ExecutionRequest::new(def, json!({}))).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        let summary = result.credits.unwrap();
        assert_eq!(summary.estimated_total, 2);
        assert_eq!(summary.reserved, 3);
        assert_eq!(summary.spent, 1);
        assert_eq!(summary.spent + summary.released, summary.reserved);
        assert_eq!(credits.held(DEFAULT_ACCOUNT), 0);
        assert_eq!(credits.total_balance(DEFAULT_ACCOUNT), 99);
    }

    #[tokio::test]
    async fn admission_denied_when_balance_is_short() {
        let activity = ScriptedActivity::new();
        let calls = activity.calls();
        let credits = InMemoryCreditStore::with_balance("team", 1);
        let engine = engine_with(activity, metered_config(), credits.clone());

        let request = ExecutionRequest::new(linear(json!({})), json!({})).with_account("team");
        let err = engine.execute(request).await.unwrap_err();

        assert_eq!(err.code(), "ADMISSION_DENIED");
        assert!(matches!(err, EngineError::AdmissionDenied { estimate: 1, .. }));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(credits.held("team"), 0);
    }

    // -- Control ------------------------------------------------------------

    async fn wait_for_start(events: &mut tokio::sync::broadcast::Receiver<ExecutionEvent>, node: &str) {
        loop {
            match events.recv().await {
                Ok(ExecutionEvent::NodeStarted { node_id, .. }) if node_id == node => return,
                Ok(_) => {}
                Err(e) => panic!("event stream ended before {node} started: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn pause_checkpoints_and_resumes_in_fresh_engine() {
        let store = InMemoryExecutionStore::new();
        let credits = InMemoryCreditStore::with_balance(DEFAULT_ACCOUNT, 100);
        let engine = engine_with(ScriptedActivity::new(), metered_config(), credits.clone())
            .with_store(BoxExecutionStore::new(store.clone()));

        let request = ExecutionRequest::new(linear(json!({ "delayMs": 50 })), json!({ "q": 1 }));
        let id = request.execution_id;
        let mut events = engine.telemetry().bus().subscribe();
        let pauser = async {
            wait_for_start(&mut events, "b").await;
            engine.pause(id).unwrap();
        };
        let (paused, ()) = tokio::join!(engine.execute(request), pauser);
        let paused = paused.unwrap();

        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert!(paused.credits.is_none());
        assert!(paused.queue.completed.contains_key("b"));
        assert!(!paused.queue.completed.contains_key("c"));
        assert_eq!(credits.held(DEFAULT_ACCOUNT), 2);

        let snapshot = store.load_snapshot(id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Paused);
        let snapshot = ExecutionSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();

        let activity = ScriptedActivity::new();
        let calls = activity.calls();
        let fresh = engine_with(activity, metered_config(), credits.clone())
            .with_store(BoxExecutionStore::new(store.clone()));
        let resumed = fresh.resume(snapshot).await.unwrap();

        assert_eq!(resumed.status, ExecutionStatus::Completed);
        assert_eq!(resumed.final_outputs.outputs["done"], json!(true));
        let invoked_ids: Vec<String> = calls.lock().unwrap().iter().map(|c| c.node_id.clone()).collect();
        assert_eq!(invoked_ids, vec!["c"]);
        assert_eq!(resumed.credits.unwrap().spent, 1);
        assert_eq!(credits.held(DEFAULT_ACCOUNT), 0);
        assert_eq!(credits.total_balance(DEFAULT_ACCOUNT), 99);

        let err = fresh.resume_from_store(id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotResumable { status: ExecutionStatus::Completed, .. }));
    }

    #[tokio::test]
    async fn cancel_skips_remaining_nodes() {
        let engine = engine(ScriptedActivity::new());
        let request = ExecutionRequest::new(linear(json!({ "delayMs": 10_000 })), json!({}));
        let id = request.execution_id;
        assert!(matches!(engine.cancel(id), Err(EngineError::RunNotFound(_))));

        let mut events = engine.telemetry().bus().subscribe();
        let canceller = async {
            wait_for_start(&mut events, "b").await;
            engine.cancel(id).unwrap();
        };
        let (result, ()) = tokio::join!(engine.execute(request), canceller);
        let result = result.unwrap();

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(result.queue.skipped.get("c"), Some(&SkipReason::Cancelled));
        assert!(result.queue.failed.contains_key("b"));
        assert!(!engine.is_running(id));
    }

    #[tokio::test]
    async fn node_timeout_fails_the_node() {
        let def = definition(json!({
            "name": "slow",
            "entryPoint": "a",
            "nodes": {
                "a": { "type": "input", "name": "A" },
                "b": { "type": "http", "name": "B", "timeoutMs": 20, "config": { "delayMs": 5_000 } }
            },
            "edges": [{ "id": "e1", "source": "a", "target": "b" }]
        }));
        let engine = engine(ScriptedActivity::new());

        let result = engine.execute(ExecutionRequest::new(def, json!({}))).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failed_node.as_deref(), Some("b"));
        assert_eq!(result.error.unwrap().kind, NodeErrorKind::Timeout);
    }

    #[tokio::test]
    async fn execution_timeout_fails_the_run() {
        let config = EngineConfig {
            execution_timeout_ms: 30,
            ..config()
        };
        let engine = engine_with(ScriptedActivity::new(), config, InMemoryCreditStore::new());

        let result = engine
            .execute(ExecutionRequest::new(linear(json!({ "delayMs": 5_000 })), json!({})))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.failed_node.is_none());
        let error = result.error.unwrap();
        assert_eq!(error.kind, NodeErrorKind::Timeout);
        assert!(error.message.contains("execution exceeded 30ms"));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let def = definition(json!({
            "name": "flaky",
            "entryPoint": "a",
            "nodes": {
                "a": { "type": "input", "name": "A" },
                "b": { "type": "http", "name": "B", "retry": { "maxAttempts": 3, "backoffMs": 1 } }
            },
            "edges": [{ "id": "e1", "source": "a", "target": "b" }]
        }));
        let activity = ScriptedActivity::new().fail_attempts("b", 2);
        let calls = activity.calls();
        let engine = engine(activity);
        let mut events = engine.telemetry().bus().subscribe();

        let result = engine.execute(ExecutionRequest::new(def, json!({}))).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        let attempts: Vec<u32> = invoked(&calls, "b").iter().map(|c| c.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);

        let mut retried = 0;
        while let Ok(event) = events.try_recv() {
            if let ExecutionEvent::NodeFailed { will_retry: true, .. } = event {
                retried += 1;
            }
        }
        assert_eq!(retried, 2);
    }
}
