//! Shared types, errors, and execution context for the capability graph engine.
//!
//! This crate provides the foundational types used across the other capgraph crates:
//! - `CapgraphError`: unified error taxonomy
//! - `ExecutionContext`: per-run variable environment and step history
//! - `ExecutionStep` / `StepStatus`: one entry of the execution history

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unified error type for all capgraph subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CapgraphError {
    // === Graph Errors ===
    #[error("Graph validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    // === Node Errors ===
    #[error("Node '{node}' failed: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Skill '{skill}' referenced by node '{node}' was not found")]
    SkillNotFound { node: String, skill: String },

    #[error("Node '{node}' timed out after {timeout_ms}ms")]
    Timeout { node: String, timeout_ms: u64 },

    #[error("Interaction on node '{node}' failed: {message}")]
    Interaction { node: String, message: String },

    // === Condition Errors ===
    #[error("Cannot evaluate condition '{expression}': {message}")]
    ConditionEvaluation { expression: String, message: String },

    // === Run Control ===
    #[error("Execution cancelled")]
    Cancelled,

    #[error("Step limit of {limit} node visits exceeded")]
    StepLimitExceeded { limit: usize },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CapgraphError {
    /// Returns `true` if the failure is transient and the node may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CapgraphError::NodeExecution { .. } | CapgraphError::Timeout { .. }
        )
    }

    /// Returns `true` if no node-level recovery (retry, alternative, fallback edge)
    /// should be attempted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CapgraphError::Validation { .. }
                | CapgraphError::Cancelled
                | CapgraphError::StepLimitExceeded { .. }
        )
    }

    /// The node this error is attributed to, when it has one.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            CapgraphError::NodeExecution { node, .. }
            | CapgraphError::SkillNotFound { node, .. }
            | CapgraphError::Timeout { node, .. }
            | CapgraphError::Interaction { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Short machine-readable kind, exposed to fallback edge triggers as `error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            CapgraphError::Validation { .. } => "validation",
            CapgraphError::NodeExecution { .. } => "node_execution",
            CapgraphError::SkillNotFound { .. } => "skill_not_found",
            CapgraphError::Timeout { .. } => "timeout",
            CapgraphError::Interaction { .. } => "interaction",
            CapgraphError::ConditionEvaluation { .. } => "condition_evaluation",
            CapgraphError::Cancelled => "cancelled",
            CapgraphError::StepLimitExceeded { .. } => "step_limit_exceeded",
            CapgraphError::Io(_) => "io",
            CapgraphError::Json(_) => "json",
            CapgraphError::Other(_) => "other",
        }
    }
}

/// A convenience alias for `Result<T, CapgraphError>`.
pub type Result<T> = std::result::Result<T, CapgraphError>;

// ---------------------------------------------------------------------------
// StepStatus / ExecutionStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Waiting,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Waiting => "waiting",
        }
    }

    /// `true` once the step can no longer change status.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// One entry of the execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub node_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub fallback_used: bool,
    pub retry_count: usize,
    pub duration_ms: u64,
}

impl ExecutionStep {
    /// A pending step for `node_id`, stamped with the current time.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp: chrono::Utc::now(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            fallback_used: false,
            retry_count: 0,
            duration_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext: per-invocation variable environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredDepth {
    Quick,
    #[default]
    Balanced,
    Thorough,
}

/// Variable environment and step history owned by exactly one execution.
///
/// Unlike a shared handle, cloning an `ExecutionContext` copies it. Parallel
/// branches get their own scope through [`fork`](ExecutionContext::fork) and are
/// folded back with [`merge_branch`](ExecutionContext::merge_branch).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub user_intent: String,
    #[serde(default)]
    pub available_time: Option<Duration>,
    #[serde(default)]
    pub preferred_depth: PreferredDepth,
    #[serde(default)]
    variables: HashMap<String, Value>,
    #[serde(default)]
    history: Vec<ExecutionStep>,
    /// Keys written since this scope was created or forked.
    #[serde(skip)]
    written: BTreeSet<String>,
}

impl ExecutionContext {
    /// Create an empty context for the given user intent.
    pub fn new(user_intent: impl Into<String>) -> Self {
        Self {
            user_intent: user_intent.into(),
            ..Self::default()
        }
    }

    /// Seed initial variables. Seeded values do not count as writes.
    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn with_preferred_depth(mut self, depth: PreferredDepth) -> Self {
        self.preferred_depth = depth;
        self
    }

    pub fn with_available_time(mut self, available: Duration) -> Self {
        self.available_time = Some(available);
        self
    }

    /// Insert or overwrite a variable.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.written.insert(key.clone());
        self.variables.insert(key, value);
    }

    /// Read a variable by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Copy of the current variables.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.variables.clone()
    }

    /// Merge `updates` into the environment. Keys not present in `updates`
    /// are preserved.
    pub fn apply_updates(&mut self, updates: HashMap<String, Value>) {
        for (key, value) in updates {
            self.set(key, value);
        }
    }

    pub fn history(&self) -> &[ExecutionStep] {
        &self.history
    }

    /// Append a step and return its index in the history.
    pub fn push_step(&mut self, step: ExecutionStep) -> usize {
        self.history.push(step);
        self.history.len() - 1
    }

    pub fn step_mut(&mut self, index: usize) -> Option<&mut ExecutionStep> {
        self.history.get_mut(index)
    }

    /// Copy-on-fork scope for a parallel branch: same variables, empty history,
    /// no recorded writes.
    pub fn fork(&self) -> ExecutionContext {
        ExecutionContext {
            user_intent: self.user_intent.clone(),
            available_time: self.available_time,
            preferred_depth: self.preferred_depth,
            variables: self.variables.clone(),
            history: Vec::new(),
            written: BTreeSet::new(),
        }
    }

    /// Fold a finished branch back in: every key the branch wrote overwrites the
    /// current value, and the branch history is appended.
    ///
    /// Merging branches one after another in traversal order yields
    /// last-writer-wins semantics per variable name.
    pub fn merge_branch(&mut self, branch: ExecutionContext) {
        let ExecutionContext {
            mut variables,
            history,
            written,
            ..
        } = branch;
        for key in written {
            if let Some(value) = variables.remove(&key) {
                self.set(key, value);
            }
        }
        self.history.extend(history);
    }

    /// Append another scope's history without touching variables. Used for
    /// branches whose writes are discarded.
    pub fn absorb_history(&mut self, branch: ExecutionContext) {
        self.history.extend(branch.history);
    }

    /// Consume the context, returning the variables and history.
    pub fn into_parts(self) -> (HashMap<String, Value>, Vec<ExecutionStep>) {
        (self.variables, self.history)
    }
}
