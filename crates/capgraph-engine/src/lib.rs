//! Capability graph engine: graph model, validation, metrics, condition
//! evaluation, execution and trace recording.
//!
//! A capability is a directed graph of typed nodes (skills, control flow,
//! interaction points). [`Executor`] runs it against a [`SkillRepository`] and
//! a [`Presenter`], producing an [`ExecutionResult`] with the full trace.

pub mod condition;
pub mod diagram;
pub mod engine;
pub mod events;
pub mod graph;
pub mod metrics;
pub mod presenter;
pub mod retry;
pub mod skills;
pub mod trace;
pub mod validation;

pub use condition::{evaluate, parse_condition, try_evaluate, Expr};
pub use diagram::to_mermaid;
pub use engine::{Executor, ExecutorConfig};
pub use events::{EventEmitter, ExecutionEvent};
pub use graph::{
    BranchCondition, CapabilityGraph, EdgeType, ExecutionMode, FallbackStrategy, GraphDocument,
    GraphEdge, GraphMetadata, GraphNode, Implementation, NodeType,
};
pub use metrics::{calculate_metrics, ComplexityLevel, GraphMetrics};
pub use presenter::{
    AutoApprovePresenter, ConsolePresenter, InteractionKind, InteractionRequest, Presenter,
    RecordingPresenter,
};
pub use retry::{execute_with_retry, BackoffPolicy};
pub use skills::{
    IoType, SimulatedSkillRepository, SkillInfo, SkillInvocation, SkillRepository,
    StaticSkillRepository,
};
pub use trace::{
    ConditionFailure, ExecutionMetrics, ExecutionResult, ExecutionStatus, NodeFailure,
    TraceRecorder,
};
pub use validation::{
    validate, validate_or_raise, validate_skills, Diagnostic, LintRule, Severity,
    ValidationReport,
};
