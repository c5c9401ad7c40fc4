//! Execution trace recording.
//!
//! A [`TraceRecorder`] belongs to one traversal scope. Steps go into the
//! scope's [`ExecutionContext`] history; the recorder keeps the visited path,
//! the aggregate counters and any condition failures. Parallel branches get
//! their own recorder, absorbed back at the join in branch order.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use capgraph_types::{ExecutionContext, ExecutionStep, StepStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub nodes_executed: usize,
    pub nodes_failed: usize,
    pub nodes_skipped: usize,
    pub retries: usize,
    pub iterations: usize,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: String,
    pub error: String,
}

/// A condition that could not be evaluated and was treated as false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionFailure {
    pub node_id: String,
    pub expression: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub graph_id: String,
    pub status: ExecutionStatus,
    pub success: bool,
    pub path: Vec<String>,
    pub steps: Vec<ExecutionStep>,
    pub outputs: HashMap<String, Value>,
    pub metrics: ExecutionMetrics,
    pub failure: Option<NodeFailure>,
    pub condition_failures: Vec<ConditionFailure>,
}

/// Optional details attached to a finished step.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub result: Option<Value>,
    pub error: Option<String>,
    pub fallback_used: bool,
    pub retry_count: usize,
}

impl StepOutcome {
    pub fn with_result(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// An open step returned by [`TraceRecorder::begin`].
#[derive(Debug)]
pub struct StepHandle {
    index: usize,
    node_id: String,
    started: Instant,
}

impl StepHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Default)]
pub struct TraceRecorder {
    path: Vec<String>,
    metrics: ExecutionMetrics,
    condition_failures: Vec<ConditionFailure>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a running step for `node_id`.
    pub fn begin(&mut self, context: &mut ExecutionContext, node_id: &str) -> StepHandle {
        let mut step = ExecutionStep::new(node_id);
        step.status = StepStatus::Running;
        let index = context.push_step(step);
        StepHandle {
            index,
            node_id: node_id.to_string(),
            started: Instant::now(),
        }
    }

    /// Mark an open step as waiting on an external response.
    pub fn wait(&mut self, context: &mut ExecutionContext, handle: &StepHandle) {
        if let Some(step) = context.step_mut(handle.index) {
            step.status = StepStatus::Waiting;
        }
    }

    /// Close a step with a terminal status and append the node to the path.
    pub fn finish(
        &mut self,
        context: &mut ExecutionContext,
        handle: StepHandle,
        status: StepStatus,
        outcome: StepOutcome,
    ) {
        match status {
            StepStatus::Completed => self.metrics.nodes_executed += 1,
            StepStatus::Failed => self.metrics.nodes_failed += 1,
            StepStatus::Skipped => self.metrics.nodes_skipped += 1,
            _ => {}
        }
        self.metrics.retries += outcome.retry_count;
        self.close(context, &handle, status, outcome);
        self.path.push(handle.node_id);
    }

    /// Close an in-flight step interrupted by cancellation. The node is not
    /// added to the path.
    pub fn cancel(&mut self, context: &mut ExecutionContext, handle: StepHandle) {
        self.metrics.nodes_skipped += 1;
        self.close(
            context,
            &handle,
            StepStatus::Skipped,
            StepOutcome::with_error("cancelled"),
        );
    }

    fn close(
        &mut self,
        context: &mut ExecutionContext,
        handle: &StepHandle,
        status: StepStatus,
        outcome: StepOutcome,
    ) {
        if let Some(step) = context.step_mut(handle.index) {
            step.status = status;
            step.result = outcome.result;
            step.error = outcome.error;
            step.fallback_used = outcome.fallback_used;
            step.retry_count = outcome.retry_count;
            step.duration_ms = handle.started.elapsed().as_millis() as u64;
        }
    }

    pub fn record_iteration(&mut self) {
        self.metrics.iterations += 1;
    }

    pub fn record_condition_failure(&mut self, failure: ConditionFailure) {
        self.condition_failures.push(failure);
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Fold a finished branch recorder into this one.
    pub fn absorb(&mut self, branch: TraceRecorder) {
        self.path.extend(branch.path);
        self.metrics.nodes_executed += branch.metrics.nodes_executed;
        self.metrics.nodes_failed += branch.metrics.nodes_failed;
        self.metrics.nodes_skipped += branch.metrics.nodes_skipped;
        self.metrics.retries += branch.metrics.retries;
        self.metrics.iterations += branch.metrics.iterations;
        self.condition_failures.extend(branch.condition_failures);
    }

    pub fn finalize(
        self,
        run_id: Uuid,
        graph_id: &str,
        context: ExecutionContext,
        status: ExecutionStatus,
        failure: Option<NodeFailure>,
        elapsed: Duration,
    ) -> ExecutionResult {
        let (outputs, steps) = context.into_parts();
        let mut metrics = self.metrics;
        metrics.total_duration_ms = elapsed.as_millis() as u64;
        ExecutionResult {
            run_id,
            graph_id: graph_id.to_string(),
            status,
            success: status == ExecutionStatus::Completed,
            path: self.path,
            steps,
            outputs,
            metrics,
            failure,
            condition_failures: self.condition_failures,
        }
    }
}
