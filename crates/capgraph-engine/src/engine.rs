//! Capability graph executor.
//!
//! Drives a validated [`CapabilityGraph`] from its start node to an end node:
//!
//! 1. **Validate** the graph (invalid graphs never start).
//! 2. **Dispatch** each node by type: control nodes steer, skill nodes call the
//!    [`SkillRepository`], interaction nodes wait on the [`Presenter`].
//! 3. **Recover** from skill failures through retries, ranked alternative
//!    implementations, fallback edges and finally the graph fallback strategy.
//! 4. **Select** the successor (first true conditional edge, else the first
//!    unconditional one).
//! 5. **Finalize** the trace into an [`ExecutionResult`].
//!
//! The executor only holds immutable collaborators. Everything a run mutates
//! (context, trace, cancellation token, visit budget) travels through the
//! traversal, so one executor can run any number of graphs at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use capgraph_types::{CapgraphError, ExecutionContext, Result, StepStatus};
use futures::future::{join_all, BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::condition::{is_truthy, try_evaluate};
use crate::events::{EventEmitter, ExecutionEvent};
use crate::graph::{CapabilityGraph, EdgeType, FallbackStrategy, GraphNode, Implementation, NodeType};
use crate::presenter::{AutoApprovePresenter, InteractionKind, InteractionRequest, Presenter};
use crate::retry::{execute_with_retry, BackoffPolicy, Retried, RetryError};
use crate::skills::{SimulatedSkillRepository, SkillInvocation, SkillRepository};
use crate::trace::{
    ConditionFailure, ExecutionResult, ExecutionStatus, NodeFailure, StepHandle, StepOutcome,
    TraceRecorder,
};
use crate::validation::validate_or_raise;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Delay policy between skill retries. A graph `retry_delay` overrides it.
    pub backoff: BackoffPolicy,
    /// Bound for skill attempts on nodes without their own `timeout`.
    pub default_node_timeout: Option<Duration>,
    /// Node dispatches allowed per run before it fails.
    pub max_node_visits: usize,
    /// Variable receiving the zero-based loop pass index.
    pub iteration_variable: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            default_node_timeout: None,
            max_node_visits: 1000,
            iteration_variable: "iteration".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-run traversal state
// ---------------------------------------------------------------------------

struct Run<'a> {
    graph: &'a CapabilityGraph,
    cancel: CancellationToken,
    visits: &'a AtomicUsize,
}

/// Variables and trace of one traversal scope. Parallel branches get their own.
struct Scope {
    context: ExecutionContext,
    trace: TraceRecorder,
}

impl Scope {
    fn fork(&self) -> Scope {
        Scope {
            context: self.context.fork(),
            trace: TraceRecorder::new(),
        }
    }
}

/// Why a traversal segment stopped without error.
enum Flow {
    /// An end node was completed.
    Ended,
    /// Traversal arrived at one of the caller's boundary nodes.
    Boundary(String),
    /// A node had no eligible successor.
    DeadEnd,
}

enum Next {
    Node(String),
    Stop(Flow),
}

fn advance(successor: Option<String>) -> Next {
    match successor {
        Some(id) => Next::Node(id),
        None => Next::Stop(Flow::DeadEnd),
    }
}

/// Why a traversal segment stopped the whole run.
enum Halt {
    Cancelled,
    Failed { node_id: String, error: CapgraphError },
}

type Traversal<T> = std::result::Result<T, Halt>;

struct SkillSuccess {
    value: Value,
    retries: usize,
    /// Alternative implementation that produced the value.
    implementation: Option<String>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    config: ExecutorConfig,
    skills: Arc<dyn SkillRepository>,
    presenter: Arc<dyn Presenter>,
    events: Option<EventEmitter>,
}

impl Executor {
    pub fn new(skills: Arc<dyn SkillRepository>, presenter: Arc<dyn Presenter>) -> Self {
        Self {
            config: ExecutorConfig::default(),
            skills,
            presenter,
            events: None,
        }
    }

    /// Simulated skills and auto-approved interactions.
    pub fn simulated() -> Self {
        Self::new(
            Arc::new(SimulatedSkillRepository::new()),
            Arc::new(AutoApprovePresenter),
        )
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn execute(
        &self,
        graph: &CapabilityGraph,
        context: ExecutionContext,
    ) -> Result<ExecutionResult> {
        self.execute_with_cancellation(graph, context, CancellationToken::new())
            .await
    }

    /// Run `graph` to completion, failure or cancellation.
    ///
    /// Returns `Err` only when the graph does not validate. Every other
    /// outcome, including failed and cancelled runs, is an [`ExecutionResult`].
    pub async fn execute_with_cancellation(
        &self,
        graph: &CapabilityGraph,
        context: ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        validate_or_raise(graph)?;

        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let start = graph
            .start_node()
            .map(|n| n.id.clone())
            .ok_or_else(|| CapgraphError::Other("graph has no start node".into()))?;

        tracing::info!(
            run_id = %run_id,
            graph = %graph.id,
            nodes = graph.nodes().len(),
            "Executing capability graph"
        );
        self.emit(ExecutionEvent::ExecutionStarted {
            run_id: run_id.to_string(),
            graph_id: graph.id.clone(),
            node_count: graph.nodes().len(),
        });

        // The caller's token is never cancelled by the time budget.
        let cancel = cancel.child_token();
        let deadline = context.available_time.map(|budget| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                tracing::warn!(budget_ms = budget.as_millis() as u64, "Available time exhausted, cancelling run");
                token.cancel();
            })
        });

        let visits = AtomicUsize::new(0);
        let run = Run {
            graph,
            cancel,
            visits: &visits,
        };
        let mut scope = Scope {
            context,
            trace: TraceRecorder::new(),
        };

        let outcome = self.run_segment(&run, &mut scope, start, &[]).await;
        if let Some(timer) = deadline {
            timer.abort();
        }
        let (status, failure) = match outcome {
            Ok(Flow::Ended) => (ExecutionStatus::Completed, None),
            Ok(Flow::DeadEnd) | Ok(Flow::Boundary(_)) => {
                tracing::warn!(graph = %graph.id, "Traversal stopped without reaching an end node");
                (ExecutionStatus::Completed, None)
            }
            Err(Halt::Cancelled) => {
                tracing::info!(graph = %graph.id, "Execution cancelled");
                (ExecutionStatus::Cancelled, None)
            }
            Err(Halt::Failed { node_id, error }) => {
                tracing::error!(graph = %graph.id, node = %node_id, error = %error, "Execution failed");
                (
                    ExecutionStatus::Failed,
                    Some(NodeFailure {
                        node_id,
                        error: error.to_string(),
                    }),
                )
            }
        };

        let Scope { context, trace } = scope;
        let result = trace.finalize(run_id, &graph.id, context, status, failure, started.elapsed());

        tracing::info!(
            run_id = %run_id,
            status = ?result.status,
            steps = result.steps.len(),
            duration_ms = result.metrics.total_duration_ms,
            "Execution finished"
        );
        self.emit(ExecutionEvent::ExecutionFinished {
            run_id: run_id.to_string(),
            status,
            duration_ms: result.metrics.total_duration_ms,
        });
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    /// Walk from `start` until an end node, a dead end, or one of `boundaries`.
    /// Boundary nodes are reported, not executed.
    fn run_segment<'a>(
        &'a self,
        run: &'a Run<'a>,
        scope: &'a mut Scope,
        start: String,
        boundaries: &'a [String],
    ) -> BoxFuture<'a, Traversal<Flow>> {
        async move {
            let mut current = start;
            loop {
                if boundaries.contains(&current) {
                    return Ok(Flow::Boundary(current));
                }
                if run.cancel.is_cancelled() {
                    tracing::info!(node = %current, "Cancellation requested before dispatch");
                    return Err(Halt::Cancelled);
                }
                let visits = run.visits.fetch_add(1, Ordering::SeqCst) + 1;
                if visits > self.config.max_node_visits {
                    return Err(Halt::Failed {
                        node_id: current,
                        error: CapgraphError::StepLimitExceeded {
                            limit: self.config.max_node_visits,
                        },
                    });
                }
                let Some(node) = run.graph.node(&current) else {
                    return Err(Halt::Failed {
                        error: CapgraphError::NodeExecution {
                            node: current.clone(),
                            message: "node does not exist".into(),
                        },
                        node_id: current,
                    });
                };

                let next = match node.node_type {
                    NodeType::End => {
                        self.pass_through(scope, node, None);
                        Next::Stop(Flow::Ended)
                    }
                    NodeType::Start
                    | NodeType::Merge
                    | NodeType::LoopEnd
                    | NodeType::ParallelJoin => {
                        self.pass_through(scope, node, None);
                        advance(self.select_successor(run, scope, &node.id))
                    }
                    NodeType::Branch => self.execute_branch(scope, node)?,
                    NodeType::LoopStart => self.execute_loop(run, scope, node).await?,
                    NodeType::ParallelSplit => self.execute_parallel(run, scope, node).await?,
                    NodeType::Skill => self.execute_skill(run, scope, node).await?,
                    NodeType::Confirm | NodeType::Select | NodeType::Input => {
                        self.execute_interaction(run, scope, node).await?
                    }
                };

                match next {
                    Next::Node(id) => current = id,
                    Next::Stop(flow) => return Ok(flow),
                }
            }
        }
        .boxed()
    }

    /// First flow edge whose condition holds, else the first unconditional one.
    fn select_successor(&self, run: &Run<'_>, scope: &mut Scope, node_id: &str) -> Option<String> {
        let mut unconditional = None;
        for edge in run.graph.outgoing_edges(node_id).filter(|e| e.is_flow()) {
            match edge.condition.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
                Some(condition) => {
                    if self.check(&mut scope.trace, node_id, condition, scope.context.variables()) {
                        return Some(edge.to.clone());
                    }
                }
                None => {
                    if unconditional.is_none() {
                        unconditional = Some(edge.to.clone());
                    }
                }
            }
        }
        unconditional
    }

    /// Evaluate a condition, recording evaluation problems and treating them as false.
    fn check(
        &self,
        trace: &mut TraceRecorder,
        node_id: &str,
        expression: &str,
        vars: &HashMap<String, Value>,
    ) -> bool {
        match try_evaluate(expression, vars) {
            Ok(result) => result,
            Err(e) => {
                let message = match e {
                    CapgraphError::ConditionEvaluation { message, .. } => message,
                    other => other.to_string(),
                };
                tracing::warn!(
                    node = %node_id,
                    expression = %expression,
                    error = %message,
                    "Condition could not be evaluated, treating as false"
                );
                self.emit(ExecutionEvent::ConditionFailed {
                    node_id: node_id.to_string(),
                    expression: expression.to_string(),
                    message: message.clone(),
                });
                trace.record_condition_failure(ConditionFailure {
                    node_id: node_id.to_string(),
                    expression: expression.to_string(),
                    message,
                });
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Step bookkeeping
    // -----------------------------------------------------------------------

    fn emit(&self, event: ExecutionEvent) {
        if let Some(events) = &self.events {
            events.emit(event);
        }
    }

    fn start_step(&self, scope: &mut Scope, node: &GraphNode) -> StepHandle {
        tracing::debug!(node = %node.id, node_type = %node.node_type, "Node started");
        self.presenter.on_node_start(&node.id, node.node_type);
        self.emit(ExecutionEvent::NodeStarted {
            node_id: node.id.clone(),
            node_type: node.node_type.to_string(),
        });
        scope.trace.begin(&mut scope.context, &node.id)
    }

    fn finish_step(
        &self,
        scope: &mut Scope,
        node: &GraphNode,
        handle: StepHandle,
        status: StepStatus,
        outcome: StepOutcome,
    ) {
        let duration_ms = handle.elapsed().as_millis() as u64;
        scope.trace.finish(&mut scope.context, handle, status, outcome);
        tracing::debug!(node = %node.id, status = status.as_str(), duration_ms, "Node finished");
        self.presenter.on_node_complete(&node.id, status);
        self.emit(ExecutionEvent::NodeCompleted {
            node_id: node.id.clone(),
            status: status.as_str().to_string(),
            duration_ms,
        });
    }

    fn cancel_step(&self, scope: &mut Scope, node: &GraphNode, handle: StepHandle) {
        let duration_ms = handle.elapsed().as_millis() as u64;
        scope.trace.cancel(&mut scope.context, handle);
        self.presenter.on_node_complete(&node.id, StepStatus::Skipped);
        self.emit(ExecutionEvent::NodeCompleted {
            node_id: node.id.clone(),
            status: StepStatus::Skipped.as_str().to_string(),
            duration_ms,
        });
    }

    fn pass_through(&self, scope: &mut Scope, node: &GraphNode, result: Option<Value>) {
        let handle = self.start_step(scope, node);
        let outcome = StepOutcome {
            result,
            ..StepOutcome::default()
        };
        self.finish_step(scope, node, handle, StepStatus::Completed, outcome);
    }

    fn fail_step(
        &self,
        scope: &mut Scope,
        node: &GraphNode,
        handle: StepHandle,
        error: CapgraphError,
    ) -> Halt {
        self.finish_step(
            scope,
            node,
            handle,
            StepStatus::Failed,
            StepOutcome::with_error(error.to_string()),
        );
        Halt::Failed {
            node_id: node.id.clone(),
            error,
        }
    }

    // -----------------------------------------------------------------------
    // Control nodes
    // -----------------------------------------------------------------------

    fn execute_branch(&self, scope: &mut Scope, node: &GraphNode) -> Traversal<Next> {
        let handle = self.start_step(scope, node);
        let Some(first) = node.conditions.first() else {
            let error = CapgraphError::NodeExecution {
                node: node.id.clone(),
                message: "branch node has no conditions".into(),
            };
            return Err(self.fail_step(scope, node, handle, error));
        };

        let matched = node.conditions.iter().find(|c| {
            self.check(&mut scope.trace, &node.id, &c.expression, scope.context.variables())
        });
        let (chosen, defaulted) = match matched {
            Some(condition) => (condition, false),
            None => {
                tracing::info!(
                    node = %node.id,
                    target = %first.target,
                    "No branch condition held, defaulting to the first"
                );
                (first, true)
            }
        };

        let result = json!({
            "condition": chosen.name,
            "target": chosen.target,
            "defaulted": defaulted,
        });
        self.finish_step(scope, node, handle, StepStatus::Completed, StepOutcome::with_result(result));
        Ok(Next::Node(chosen.target.clone()))
    }

    async fn execute_loop(&self, run: &Run<'_>, scope: &mut Scope, node: &GraphNode) -> Traversal<Next> {
        let handle = self.start_step(scope, node);
        let Some(loop_end) = run.graph.loop_end_for(&node.id).map(str::to_string) else {
            let error = CapgraphError::NodeExecution {
                node: node.id.clone(),
                message: "loop start has no paired loop end".into(),
            };
            return Err(self.fail_step(scope, node, handle, error));
        };
        let iteration_edge = run.graph.iteration_edge_for(&node.id);
        let bound = match iteration_edge.and_then(|e| e.max_count) {
            Some(cap) => cap.min(node.max_iterations()),
            None => node.max_iterations(),
        };
        let result = json!({ "max_iterations": bound, "loop_end": loop_end });
        self.finish_step(scope, node, handle, StepStatus::Completed, StepOutcome::with_result(result));

        let boundaries = [loop_end.clone(), node.id.clone()];
        let pass_variable = format!("{}_iteration", node.id);
        let mut passes = 0;

        for i in 0..bound {
            if run.cancel.is_cancelled() {
                tracing::info!(node = %node.id, iteration = i, "Cancellation requested before loop pass");
                return Err(Halt::Cancelled);
            }
            scope.context.set(self.config.iteration_variable.clone(), json!(i));
            scope.context.set(pass_variable.clone(), json!(i));
            scope.trace.record_iteration();
            passes += 1;
            tracing::debug!(node = %node.id, iteration = i, "Loop pass");

            let Some(body) = self.select_successor(run, scope, &node.id) else {
                break;
            };
            match self.run_segment(run, scope, body, &boundaries).await? {
                Flow::Boundary(reached) if reached == loop_end => {
                    if run.cancel.is_cancelled() {
                        return Err(Halt::Cancelled);
                    }
                    if let Some(end_node) = run.graph.node(&loop_end) {
                        self.pass_through(scope, end_node, None);
                    }
                    let exit = match iteration_edge.and_then(|e| e.exit_condition.as_deref()) {
                        Some(expression) => self.check(
                            &mut scope.trace,
                            &loop_end,
                            expression,
                            scope.context.variables(),
                        ),
                        None => true,
                    };
                    if exit {
                        break;
                    }
                }
                Flow::Boundary(_) | Flow::DeadEnd => {}
                Flow::Ended => return Ok(Next::Stop(Flow::Ended)),
            }
        }

        tracing::info!(node = %node.id, passes, bound, "Loop finished");
        Ok(advance(self.select_successor(run, scope, &loop_end)))
    }

    async fn execute_parallel(
        &self,
        run: &Run<'_>,
        scope: &mut Scope,
        node: &GraphNode,
    ) -> Traversal<Next> {
        let handle = self.start_step(scope, node);
        let join = run.graph.join_for(&node.id).map(str::to_string);

        let mut starts = Vec::new();
        for edge in run.graph.outgoing_edges(&node.id).filter(|e| e.is_flow()) {
            let eligible = match edge.condition.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
                Some(condition) => {
                    self.check(&mut scope.trace, &node.id, condition, scope.context.variables())
                }
                None => true,
            };
            if eligible {
                starts.push(edge.to.clone());
            }
        }
        let result = json!({ "branches": starts, "join": join });
        self.finish_step(scope, node, handle, StepStatus::Completed, StepOutcome::with_result(result));

        let first_success = run.graph.fallback_strategy == FallbackStrategy::FirstSuccess;
        tracing::info!(
            node = %node.id,
            branches = starts.len(),
            join = ?join,
            first_success,
            "Parallel fan-out"
        );

        let boundaries: Vec<String> = join.iter().cloned().collect();
        let group = Run {
            graph: run.graph,
            cancel: run.cancel.child_token(),
            visits: run.visits,
        };

        let (outcomes, winner) = if first_success {
            self.join_first_success(&group, scope, starts, &boundaries).await
        } else {
            let branches = starts
                .into_iter()
                .map(|start| self.run_branch(&group, scope.fork(), start, &boundaries));
            (join_all(branches).await, None)
        };

        let mut cancelled = false;
        let mut failure = None;
        let mut ended = false;
        for (i, (branch, outcome)) in outcomes.into_iter().enumerate() {
            let Scope { context, trace } = branch;
            scope.trace.absorb(trace);
            let merge = !first_success || winner == Some(i);
            if merge {
                scope.context.merge_branch(context);
            } else {
                scope.context.absorb_history(context);
            }
            if first_success && winner.is_some() {
                if winner == Some(i) {
                    ended |= matches!(outcome, Ok(Flow::Ended));
                }
                continue;
            }
            match outcome {
                Ok(flow) => ended |= matches!(flow, Flow::Ended),
                Err(Halt::Cancelled) => cancelled = true,
                Err(halt @ Halt::Failed { .. }) => {
                    if failure.is_none() {
                        failure = Some(halt);
                    }
                }
            }
        }

        if cancelled || run.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        if let Some(halt) = failure {
            return Err(halt);
        }

        match join {
            Some(join_id) => {
                if let Some(join_node) = run.graph.node(&join_id) {
                    self.pass_through(scope, join_node, None);
                }
                Ok(advance(self.select_successor(run, scope, &join_id)))
            }
            None if ended => Ok(Next::Stop(Flow::Ended)),
            None => Ok(Next::Stop(Flow::DeadEnd)),
        }
    }

    async fn run_branch(
        &self,
        run: &Run<'_>,
        mut scope: Scope,
        start: String,
        boundaries: &[String],
    ) -> (Scope, Traversal<Flow>) {
        let outcome = self.run_segment(run, &mut scope, start, boundaries).await;
        (scope, outcome)
    }

    /// Poll branches together; the first to finish without error wins and the
    /// rest are cancelled. Outcomes come back in declaration order.
    async fn join_first_success(
        &self,
        group: &Run<'_>,
        scope: &Scope,
        starts: Vec<String>,
        boundaries: &[String],
    ) -> (Vec<(Scope, Traversal<Flow>)>, Option<usize>) {
        let count = starts.len();
        let mut pending: FuturesUnordered<_> = starts
            .into_iter()
            .enumerate()
            .map(|(i, start)| {
                let branch = self.run_branch(group, scope.fork(), start, boundaries);
                async move { (i, branch.await) }
            })
            .collect();

        let mut slots: Vec<Option<(Scope, Traversal<Flow>)>> = (0..count).map(|_| None).collect();
        let mut winner = None;
        while let Some((i, outcome)) = pending.next().await {
            if winner.is_none() && outcome.1.is_ok() {
                tracing::info!(branch = i, "First successful branch, cancelling the rest");
                winner = Some(i);
                group.cancel.cancel();
            }
            slots[i] = Some(outcome);
        }
        (slots.into_iter().flatten().collect(), winner)
    }

    // -----------------------------------------------------------------------
    // Skill nodes
    // -----------------------------------------------------------------------

    async fn execute_skill(&self, run: &Run<'_>, scope: &mut Scope, node: &GraphNode) -> Traversal<Next> {
        let handle = self.start_step(scope, node);
        let Some(skill_id) = node.skill_id.clone() else {
            let error = CapgraphError::NodeExecution {
                node: node.id.clone(),
                message: "skill node has no skillId".into(),
            };
            return Err(self.fail_step(scope, node, handle, error));
        };

        match self.invoke_with_recovery(run, scope, node, &skill_id).await {
            Ok(success) => {
                self.bind_outputs(scope, node, &success.value);
                if let Some(implementation) = &success.implementation {
                    tracing::info!(
                        node = %node.id,
                        implementation = %implementation,
                        "Alternative implementation succeeded"
                    );
                }
                let outcome = StepOutcome {
                    result: Some(success.value),
                    error: None,
                    fallback_used: success.implementation.is_some(),
                    retry_count: success.retries,
                };
                self.finish_step(scope, node, handle, StepStatus::Completed, outcome);
                Ok(advance(self.select_successor(run, scope, &node.id)))
            }
            Err(RetryError {
                error: CapgraphError::Cancelled,
                ..
            }) => {
                self.cancel_step(scope, node, handle);
                Err(Halt::Cancelled)
            }
            Err(RetryError { error, retries }) => {
                self.handle_failure(run, scope, node, handle, error, retries)
                    .await
            }
        }
    }

    /// Primary skill with retries, then applicable alternatives in priority order.
    async fn invoke_with_recovery(
        &self,
        run: &Run<'_>,
        scope: &mut Scope,
        node: &GraphNode,
        skill_id: &str,
    ) -> std::result::Result<SkillSuccess, RetryError> {
        let mut retries = 0;
        let mut last_error = match self.attempt(run, scope, node, skill_id, None).await {
            Ok(done) => {
                return Ok(SkillSuccess {
                    value: done.value,
                    retries: done.retries,
                    implementation: None,
                })
            }
            Err(failed) => {
                retries += failed.retries;
                failed.error
            }
        };
        if last_error.is_terminal() {
            return Err(RetryError {
                error: last_error,
                retries,
            });
        }

        let mut attempted = HashSet::from([skill_id.to_string()]);
        let mut queue: VecDeque<&Implementation> = self.rank_alternatives(scope, node).into();
        while let Some(implementation) = queue.pop_front() {
            if !attempted.insert(implementation.skill_id.clone()) {
                continue;
            }
            tracing::warn!(
                node = %node.id,
                implementation = %implementation.id,
                skill = %implementation.skill_id,
                error = %last_error,
                "Trying alternative implementation"
            );
            self.emit(ExecutionEvent::FallbackUsed {
                node_id: node.id.clone(),
                target: implementation.id.clone(),
            });

            match self
                .attempt(run, scope, node, &implementation.skill_id, Some(&implementation.id))
                .await
            {
                Ok(done) => {
                    return Ok(SkillSuccess {
                        value: done.value,
                        retries: retries + done.retries,
                        implementation: Some(implementation.id.clone()),
                    })
                }
                Err(failed) => {
                    retries += failed.retries;
                    if failed.error.is_terminal() {
                        return Err(RetryError {
                            error: failed.error,
                            retries,
                        });
                    }
                    last_error = failed.error;
                    for fallback in implementation.fallbacks.iter().rev() {
                        if let Some(next) = node.implementations.iter().find(|i| &i.id == fallback) {
                            queue.push_front(next);
                        }
                    }
                }
            }
        }

        Err(RetryError {
            error: last_error,
            retries,
        })
    }

    /// Implementations whose conditions all hold, lowest priority value first.
    /// A condition spelled `default` always holds.
    fn rank_alternatives<'n>(&self, scope: &mut Scope, node: &'n GraphNode) -> Vec<&'n Implementation> {
        let mut ranked: Vec<&Implementation> = node
            .implementations
            .iter()
            .filter(|implementation| {
                implementation.conditions.iter().all(|condition| {
                    condition.trim() == "default"
                        || self.check(
                            &mut scope.trace,
                            &node.id,
                            condition,
                            scope.context.variables(),
                        )
                })
            })
            .collect();
        ranked.sort_by_key(|implementation| implementation.priority);
        ranked
    }

    /// One skill with retries. Every attempt is raced against the node timeout
    /// and the run's cancellation token.
    async fn attempt(
        &self,
        run: &Run<'_>,
        scope: &Scope,
        node: &GraphNode,
        skill_id: &str,
        implementation_id: Option<&str>,
    ) -> std::result::Result<Retried<Value>, RetryError> {
        let timeout = node.timeout().or(self.config.default_node_timeout);
        let backoff = run
            .graph
            .retry_delay
            .map(BackoffPolicy::Fixed)
            .unwrap_or_else(|| self.config.backoff.clone());
        let template = SkillInvocation {
            node_id: node.id.clone(),
            skill_id: skill_id.to_string(),
            implementation_id: implementation_id.map(str::to_string),
            attempt: 0,
            variables: scope.context.snapshot(),
            user_intent: scope.context.user_intent.clone(),
            preferred_depth: scope.context.preferred_depth,
        };
        let skills = &self.skills;
        let cancel = &run.cancel;

        execute_with_retry(
            |attempt| {
                let request = SkillInvocation {
                    attempt,
                    ..template.clone()
                };
                async move {
                    let call = skills.invoke(&request);
                    let bounded = async {
                        match timeout {
                            Some(limit) => tokio::time::timeout(limit, call)
                                .await
                                .unwrap_or_else(|_| {
                                    Err(CapgraphError::Timeout {
                                        node: request.node_id.clone(),
                                        timeout_ms: limit.as_millis() as u64,
                                    })
                                }),
                            None => call.await,
                        }
                    };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(CapgraphError::Cancelled),
                        result = bounded => result,
                    }
                }
            },
            run.graph.max_retries,
            &backoff,
            &node.id,
            cancel,
            |attempt, delay| {
                self.emit(ExecutionEvent::NodeRetrying {
                    node_id: node.id.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                })
            },
        )
        .await
    }

    /// `<id>_result` gets the whole value; each declared output gets the
    /// matching object field, or the whole value when there is none.
    fn bind_outputs(&self, scope: &mut Scope, node: &GraphNode, value: &Value) {
        scope
            .context
            .set(format!("{}_result", node.id), value.clone());
        for name in &node.outputs {
            let bound = match value {
                Value::Object(fields) => fields.get(name).cloned().unwrap_or_else(|| value.clone()),
                _ => value.clone(),
            };
            scope.context.set(name.clone(), bound);
        }
    }

    /// Recovery once retries and alternatives are spent: fallback edge first,
    /// then the graph fallback strategy.
    async fn handle_failure(
        &self,
        run: &Run<'_>,
        scope: &mut Scope,
        node: &GraphNode,
        handle: StepHandle,
        error: CapgraphError,
        retries: usize,
    ) -> Traversal<Next> {
        tracing::warn!(node = %node.id, error = %error, retries, "Node failed");

        let mut vars = scope.context.snapshot();
        vars.insert("error".into(), json!(error.to_string()));
        vars.insert("error_kind".into(), json!(error.kind()));
        vars.insert("failed_node".into(), json!(node.id));
        let reroute = run
            .graph
            .outgoing_edges(&node.id)
            .filter(|e| e.edge_type == EdgeType::Fallback)
            .find(|e| match e.trigger.as_deref() {
                Some(trigger) => self.check(&mut scope.trace, &node.id, trigger, &vars),
                None => true,
            })
            .map(|e| e.to.clone());

        let outcome = StepOutcome {
            error: Some(error.to_string()),
            retry_count: retries,
            ..StepOutcome::default()
        };

        if let Some(target) = reroute {
            tracing::info!(node = %node.id, target = %target, "Routing failure through fallback edge");
            self.emit(ExecutionEvent::FallbackUsed {
                node_id: node.id.clone(),
                target: target.clone(),
            });
            let outcome = StepOutcome {
                fallback_used: true,
                ..outcome
            };
            self.finish_step(scope, node, handle, StepStatus::Failed, outcome);
            return Ok(Next::Node(target));
        }

        let skip = match run.graph.fallback_strategy {
            FallbackStrategy::Skip => true,
            FallbackStrategy::Abort | FallbackStrategy::FirstSuccess => false,
            FallbackStrategy::RetryThenAsk => {
                scope.trace.wait(&mut scope.context, &handle);
                let request = InteractionRequest {
                    node_id: node.id.clone(),
                    kind: InteractionKind::Confirm,
                    prompt: format!("Node '{}' failed: {error}. Skip it and continue?", node.id),
                    options: Vec::new(),
                    default: None,
                };
                self.emit(ExecutionEvent::InteractionRequested {
                    node_id: node.id.clone(),
                    prompt: request.prompt.clone(),
                });
                let answer = tokio::select! {
                    biased;
                    _ = run.cancel.cancelled() => Err(CapgraphError::Cancelled),
                    answer = self.presenter.on_interaction(&request) => answer,
                };
                match answer {
                    Ok(value) => is_truthy(&value),
                    Err(CapgraphError::Cancelled) => {
                        self.cancel_step(scope, node, handle);
                        return Err(Halt::Cancelled);
                    }
                    Err(e) => {
                        tracing::warn!(node = %node.id, error = %e, "Skip confirmation failed");
                        false
                    }
                }
            }
        };

        if skip {
            tracing::info!(node = %node.id, "Skipping failed node");
            self.finish_step(scope, node, handle, StepStatus::Skipped, outcome);
            Ok(advance(self.select_successor(run, scope, &node.id)))
        } else {
            self.finish_step(scope, node, handle, StepStatus::Failed, outcome);
            Err(Halt::Failed {
                node_id: node.id.clone(),
                error,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Interaction nodes
    // -----------------------------------------------------------------------

    async fn execute_interaction(
        &self,
        run: &Run<'_>,
        scope: &mut Scope,
        node: &GraphNode,
    ) -> Traversal<Next> {
        let handle = self.start_step(scope, node);
        let Some(kind) = InteractionKind::for_node(node.node_type) else {
            let error = CapgraphError::Interaction {
                node: node.id.clone(),
                message: format!("{} is not an interaction node", node.node_type),
            };
            return Err(self.fail_step(scope, node, handle, error));
        };
        scope.trace.wait(&mut scope.context, &handle);

        let request = InteractionRequest {
            node_id: node.id.clone(),
            kind,
            prompt: node
                .prompt
                .clone()
                .unwrap_or_else(|| format!("Input required for {}", node.id)),
            options: interaction_options(&scope.context, node),
            default: node.default.clone(),
        };
        tracing::info!(node = %node.id, kind = ?kind, "Waiting for interaction");
        self.emit(ExecutionEvent::InteractionRequested {
            node_id: node.id.clone(),
            prompt: request.prompt.clone(),
        });

        let response = {
            let answer = self.presenter.on_interaction(&request);
            let bounded = async {
                match node.timeout() {
                    Some(limit) => tokio::time::timeout(limit, answer)
                        .await
                        .unwrap_or_else(|_| {
                            Err(CapgraphError::Timeout {
                                node: node.id.clone(),
                                timeout_ms: limit.as_millis() as u64,
                            })
                        }),
                    None => answer.await,
                }
            };
            tokio::select! {
                biased;
                _ = run.cancel.cancelled() => Err(CapgraphError::Cancelled),
                response = bounded => response,
            }
        };

        match response {
            Ok(value) => {
                scope
                    .context
                    .set(format!("{}_result", node.id), value.clone());
                self.finish_step(scope, node, handle, StepStatus::Completed, StepOutcome::with_result(value));
                Ok(advance(self.select_successor(run, scope, &node.id)))
            }
            Err(CapgraphError::Cancelled) => {
                self.cancel_step(scope, node, handle);
                Err(Halt::Cancelled)
            }
            Err(error) => self.handle_failure(run, scope, node, handle, error, 0).await,
        }
    }
}

/// Static `options`, else the array held by the `optionsFrom` variable.
fn interaction_options(context: &ExecutionContext, node: &GraphNode) -> Vec<String> {
    if !node.options.is_empty() {
        return node.options.clone();
    }
    match node.options_from.as_deref().and_then(|key| context.get(key)) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
