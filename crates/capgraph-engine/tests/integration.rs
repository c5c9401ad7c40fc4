//! End-to-end tests for the capability graph engine.
//!
//! Each test goes through the public surface: JSON document -> graph ->
//! validate / measure / execute -> inspect the result.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capgraph_engine::{
    calculate_metrics, to_mermaid, validate, AutoApprovePresenter, CapabilityGraph,
    ComplexityLevel, ExecutionStatus, Executor, ExecutorConfig, BackoffPolicy,
    InteractionRequest, Presenter, RecordingPresenter, SkillInfo, SkillInvocation,
    SkillRepository,
};
use capgraph_types::{CapgraphError, ExecutionContext, Result, StepStatus};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn build_graph(json: Value) -> CapabilityGraph {
    CapabilityGraph::from_json(&json.to_string()).expect("graph document should parse")
}

fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Answers every invocation through `respond`, after an optional per-skill delay.
struct FnSkills<F> {
    respond: F,
    delays: HashMap<String, Duration>,
}

impl<F> FnSkills<F>
where
    F: Fn(&SkillInvocation) -> Result<Value> + Send + Sync,
{
    fn new(respond: F) -> Self {
        Self {
            respond,
            delays: HashMap::new(),
        }
    }

    fn delay(mut self, skill: &str, delay: Duration) -> Self {
        self.delays.insert(skill.to_string(), delay);
        self
    }
}

#[async_trait]
impl<F> SkillRepository for FnSkills<F>
where
    F: Fn(&SkillInvocation) -> Result<Value> + Send + Sync,
{
    async fn get_skill(&self, id: &str) -> Option<SkillInfo> {
        Some(SkillInfo::new(id))
    }

    async fn invoke(&self, request: &SkillInvocation) -> Result<Value> {
        if let Some(delay) = self.delays.get(&request.skill_id) {
            tokio::time::sleep(*delay).await;
        }
        (self.respond)(request)
    }
}

fn executor<F>(skills: FnSkills<F>) -> Executor
where
    F: Fn(&SkillInvocation) -> Result<Value> + Send + Sync + 'static,
{
    Executor::new(Arc::new(skills), Arc::new(AutoApprovePresenter)).with_config(ExecutorConfig {
        backoff: BackoffPolicy::None,
        ..ExecutorConfig::default()
    })
}

fn echo_skill(request: &SkillInvocation) -> Result<Value> {
    Ok(json!(format!("{}_done", request.skill_id)))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn missing_start_node_is_reported() {
    let graph = build_graph(json!({
        "id": "no_start",
        "nodes": [
            {"id": "work", "type": "skill", "skillId": "summarize"},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [{"from": "work", "to": "end"}]
    }));

    let report = validate(&graph);
    assert!(!report.valid);
    assert!(report
        .errors
        .iter()
        .any(|e| e == "Graph must have a start node"));
}

#[test]
fn duplicate_start_nodes_are_reported() {
    let graph = build_graph(json!({
        "id": "two_starts",
        "nodes": [
            {"id": "s1", "type": "control.start"},
            {"id": "s2", "type": "control.start"},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [{"from": "s1", "to": "end"}, {"from": "s2", "to": "end"}]
    }));

    let report = validate(&graph);
    assert!(!report.valid);
    let message = report
        .errors
        .iter()
        .find(|e| e.contains("exactly one start node"))
        .expect("duplicate start error");
    assert!(message.contains("s1") && message.contains("s2"));
}

#[tokio::test]
async fn execution_rejects_invalid_graph() {
    let graph = build_graph(json!({
        "id": "broken",
        "nodes": [
            {"id": "start", "type": "control.start"},
            {"id": "work", "type": "skill"},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [{"from": "start", "to": "work"}, {"from": "work", "to": "ghost"}]
    }));

    let err = Executor::simulated()
        .execute(&graph, ExecutionContext::default())
        .await
        .unwrap_err();
    match err {
        CapgraphError::Validation { errors } => {
            assert!(errors.iter().any(|e| e.contains("skillId")));
            assert!(errors.iter().any(|e| e.contains("ghost")));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Metrics and projections
// ---------------------------------------------------------------------------

#[test]
fn pure_sequence_has_unit_cyclomatic_complexity() {
    let graph = build_graph(json!({
        "id": "chain",
        "nodes": [
            {"id": "start", "type": "control.start"},
            {"id": "a", "type": "skill", "skillId": "a"},
            {"id": "b", "type": "skill", "skillId": "b"},
            {"id": "c", "type": "skill", "skillId": "c"},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [
            {"from": "start", "to": "a"},
            {"from": "a", "to": "b"},
            {"from": "b", "to": "c"},
            {"from": "c", "to": "end"}
        ]
    }));

    let metrics = calculate_metrics(&graph);
    assert_eq!(metrics.node_count, 5);
    assert_eq!(metrics.edge_count, 4);
    assert_eq!(metrics.cyclomatic_complexity, 1);
    assert_eq!(metrics.max_depth, 4);
    assert_eq!(graph.all_paths(), vec![vec!["start", "a", "b", "c", "end"]]);
}

#[test]
fn complexity_level_boundaries() {
    assert_eq!(ComplexityLevel::from_score(40), ComplexityLevel::Simple);
    assert_eq!(ComplexityLevel::from_score(41), ComplexityLevel::Moderate);
}

#[test]
fn graph_loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "{}",
        json!({
            "id": "from_disk",
            "name": "From disk",
            "nodes": [
                {"id": "start", "type": "control.start"},
                {"id": "end", "type": "control.end"}
            ],
            "edges": [{"from": "start", "to": "end"}]
        })
    )
    .unwrap();

    let graph = CapabilityGraph::load(file.path()).unwrap();
    assert_eq!(graph.id, "from_disk");
    assert_eq!(graph.version, "1.0");
    assert!(validate(&graph).valid);
    assert_eq!(
        to_mermaid(&graph),
        "graph TD\n    n0((\"start\"))\n    n1((\"end\"))\n    n0 --> n1"
    );
}

// ---------------------------------------------------------------------------
// Branching
// ---------------------------------------------------------------------------

fn branch_graph() -> CapabilityGraph {
    build_graph(json!({
        "id": "branching",
        "nodes": [
            {"id": "start", "type": "control.start"},
            {"id": "decide", "type": "control.branch", "conditions": [
                {"name": "positive", "expression": "x > 0", "target": "A"},
                {"name": "otherwise", "expression": "true", "target": "B"}
            ]},
            {"id": "A", "type": "skill", "skillId": "handle_a"},
            {"id": "B", "type": "skill", "skillId": "handle_b"},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [
            {"from": "start", "to": "decide"},
            {"from": "A", "to": "end"},
            {"from": "B", "to": "end"}
        ]
    }))
}

#[tokio::test]
async fn branch_follows_first_true_condition() {
    let graph = branch_graph();
    let executor = executor(FnSkills::new(echo_skill));

    let positive = executor
        .execute(&graph, ExecutionContext::default().with_variables(vars(&[("x", json!(5))])))
        .await
        .unwrap();
    assert_eq!(positive.path, ["start", "decide", "A", "end"]);

    let negative = executor
        .execute(&graph, ExecutionContext::default().with_variables(vars(&[("x", json!(-1))])))
        .await
        .unwrap();
    assert_eq!(negative.path, ["start", "decide", "B", "end"]);
    assert_eq!(negative.steps[1].result.as_ref().unwrap()["defaulted"], json!(false));
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

fn loop_graph(max_iterations: usize) -> CapabilityGraph {
    build_graph(json!({
        "id": "looping",
        "nodes": [
            {"id": "start", "type": "control.start"},
            {"id": "refine", "type": "control.loop_start", "maxIterations": max_iterations},
            {"id": "draft", "type": "skill", "skillId": "draft"},
            {"id": "refine_end", "type": "control.loop_end"},
            {"id": "publish", "type": "skill", "skillId": "publish"},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [
            {"from": "start", "to": "refine"},
            {"from": "refine", "to": "draft"},
            {"from": "draft", "to": "refine_end", "type": "conditional", "condition": "iteration > 100"},
            {"from": "draft", "to": "refine"},
            {"from": "refine_end", "to": "refine", "type": "iteration"},
            {"from": "refine_end", "to": "publish"},
            {"from": "publish", "to": "end"}
        ]
    }))
}

#[tokio::test]
async fn loop_runs_bounded_passes_then_continues() {
    let graph = loop_graph(5);
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let record = seen.clone();
    let executor = executor(FnSkills::new(move |request: &SkillInvocation| {
        if request.skill_id == "draft" {
            record.lock().unwrap().push(request.variables["iteration"].clone());
        }
        echo_skill(request)
    }));

    let result = executor.execute(&graph, ExecutionContext::default()).await.unwrap();

    assert!(result.success);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![json!(0), json!(1), json!(2), json!(3), json!(4)]
    );
    assert_eq!(result.metrics.iterations, 5);
    assert_eq!(result.outputs["iteration"], json!(4));
    assert_eq!(result.outputs["refine_iteration"], json!(4));
    assert_eq!(
        result.path,
        ["start", "refine", "draft", "draft", "draft", "draft", "draft", "publish", "end"]
    );
}

#[tokio::test]
async fn loop_exits_when_loop_end_is_reached() {
    let graph = build_graph(json!({
        "id": "until_done",
        "nodes": [
            {"id": "start", "type": "control.start"},
            {"id": "poll", "type": "control.loop_start", "maxIterations": 10},
            {"id": "check", "type": "skill", "skillId": "check", "outputs": ["ready"]},
            {"id": "poll_end", "type": "control.loop_end"},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [
            {"from": "start", "to": "poll"},
            {"from": "poll", "to": "check"},
            {"from": "check", "to": "poll_end", "type": "conditional", "condition": "ready"},
            {"from": "check", "to": "poll"},
            {"from": "poll_end", "to": "poll", "type": "iteration"},
            {"from": "poll_end", "to": "end"}
        ]
    }));
    let executor = executor(FnSkills::new(|request: &SkillInvocation| {
        let pass = request.variables["iteration"].as_u64().unwrap_or(0);
        Ok(json!({ "ready": pass >= 2 }))
    }));

    let result = executor.execute(&graph, ExecutionContext::default()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.metrics.iterations, 3);
    assert_eq!(result.path, ["start", "poll", "check", "check", "check", "poll_end", "end"]);
}

#[tokio::test]
async fn cancelling_mid_loop_stops_at_last_completed_node() {
    struct CancelOnCall {
        token: CancellationToken,
        calls: AtomicUsize,
        at: usize,
    }

    #[async_trait]
    impl SkillRepository for CancelOnCall {
        async fn get_skill(&self, id: &str) -> Option<SkillInfo> {
            Some(SkillInfo::new(id))
        }

        async fn invoke(&self, _request: &SkillInvocation) -> Result<Value> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.at {
                self.token.cancel();
                std::future::pending::<()>().await;
            }
            Ok(json!("drafted"))
        }
    }

    let token = CancellationToken::new();
    let skills = Arc::new(CancelOnCall {
        token: token.clone(),
        calls: AtomicUsize::new(0),
        at: 3,
    });
    let executor = Executor::new(skills, Arc::new(AutoApprovePresenter));

    let result = executor
        .execute_with_cancellation(&loop_graph(5), ExecutionContext::default(), token)
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(!result.success);
    assert!(result.failure.is_none());
    assert_eq!(result.path, ["start", "refine", "draft", "draft"]);
    let last = result.steps.last().unwrap();
    assert_eq!(last.node_id, "draft");
    assert_eq!(last.status, StepStatus::Skipped);
    assert_eq!(last.error.as_deref(), Some("cancelled"));
    assert!(result.steps.iter().all(|s| s.status.is_finished()));
}

#[tokio::test]
async fn cancelled_before_start_runs_nothing() {
    let token = CancellationToken::new();
    token.cancel();
    let result = Executor::simulated()
        .execute_with_cancellation(&loop_graph(3), ExecutionContext::default(), token)
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(result.path.is_empty());
}

#[tokio::test]
async fn cancellation_between_passes_stops_the_loop() {
    let token = CancellationToken::new();
    let trigger = token.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    // The second pass finishes normally, then asks for cancellation.
    let executor = executor(FnSkills::new(move |request: &SkillInvocation| {
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            trigger.cancel();
        }
        echo_skill(request)
    }));

    let result = executor
        .execute_with_cancellation(&loop_graph(5), ExecutionContext::default(), token)
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(result.failure.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.metrics.iterations, 2);
    assert_eq!(result.outputs["iteration"], json!(1));
    assert_eq!(result.path, ["start", "refine", "draft", "draft"]);
    assert_eq!(result.steps.len(), 4);
    assert!(result.steps.iter().all(|s| s.status == StepStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn available_time_bounds_the_run() {
    let graph = build_graph(json!({
        "id": "budgeted",
        "nodes": [
            {"id": "start", "type": "control.start"},
            {"id": "a", "type": "skill", "skillId": "a"},
            {"id": "b", "type": "skill", "skillId": "b"},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [
            {"from": "start", "to": "a"},
            {"from": "a", "to": "b"},
            {"from": "b", "to": "end"}
        ]
    }));
    let executor = executor(
        FnSkills::new(echo_skill)
            .delay("a", Duration::from_secs(3))
            .delay("b", Duration::from_secs(3)),
    );
    let caller = CancellationToken::new();

    let result = executor
        .execute_with_cancellation(
            &graph,
            ExecutionContext::new("quick look").with_available_time(Duration::from_secs(5)),
            caller.clone(),
        )
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert_eq!(result.path, ["start", "a"]);
    assert!(!caller.is_cancelled());
}

// ---------------------------------------------------------------------------
// Isolation and parallelism
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_runs_do_not_share_variables() {
    let graph = build_graph(json!({
        "id": "echo",
        "nodes": [
            {"id": "start", "type": "control.start"},
            {"id": "echo", "type": "skill", "skillId": "echo", "outputs": ["echoed"]},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [{"from": "start", "to": "echo"}, {"from": "echo", "to": "end"}]
    }));
    let executor = executor(
        FnSkills::new(|request: &SkillInvocation| Ok(request.variables["who"].clone()))
            .delay("echo", Duration::from_millis(5)),
    );

    let run_a = executor.execute(
        &graph,
        ExecutionContext::new("a").with_variables(vars(&[("who", json!("a")), ("only_a", json!(1))])),
    );
    let run_b = executor.execute(
        &graph,
        ExecutionContext::new("b").with_variables(vars(&[("who", json!("b")), ("only_b", json!(2))])),
    );
    let (a, b) = tokio::join!(run_a, run_b);
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.outputs["echoed"], json!("a"));
    assert_eq!(b.outputs["echoed"], json!("b"));
    assert!(!a.outputs.contains_key("only_b"));
    assert!(!b.outputs.contains_key("only_a"));
    assert_ne!(a.run_id, b.run_id);
}

fn fan_out_graph(strategy: &str) -> CapabilityGraph {
    build_graph(json!({
        "id": "fan_out",
        "fallback_strategy": strategy,
        "nodes": [
            {"id": "start", "type": "control.start"},
            {"id": "split", "type": "control.parallel_split"},
            {"id": "left", "type": "skill", "skillId": "left", "outputs": ["shared", "left_only"]},
            {"id": "right", "type": "skill", "skillId": "right", "outputs": ["shared", "right_only"]},
            {"id": "join", "type": "control.parallel_join"},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [
            {"from": "start", "to": "split"},
            {"from": "split", "to": "left", "type": "parallel"},
            {"from": "split", "to": "right", "type": "parallel"},
            {"from": "left", "to": "join"},
            {"from": "right", "to": "join"},
            {"from": "join", "to": "end"}
        ]
    }))
}

#[tokio::test(start_paused = true)]
async fn parallel_merge_is_last_writer_in_declaration_order() {
    let graph = fan_out_graph("abort");
    // The right branch finishes first; declaration order still decides the merge.
    let executor = executor(
        FnSkills::new(|request: &SkillInvocation| Ok(json!(request.skill_id.clone())))
            .delay("left", Duration::from_secs(2))
            .delay("right", Duration::from_secs(1)),
    );

    for _ in 0..5 {
        let result = executor.execute(&graph, ExecutionContext::default()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.outputs["shared"], json!("right"));
        assert_eq!(result.outputs["left_only"], json!("left"));
        assert_eq!(result.outputs["right_only"], json!("right"));
        assert_eq!(result.path, ["start", "split", "left", "right", "join", "end"]);
    }
}

#[tokio::test(start_paused = true)]
async fn first_success_keeps_only_the_winner() {
    let graph = fan_out_graph("first_success");
    let executor = executor(
        FnSkills::new(|request: &SkillInvocation| Ok(json!(request.skill_id.clone())))
            .delay("left", Duration::from_secs(10))
            .delay("right", Duration::from_secs(1)),
    );

    let result = executor.execute(&graph, ExecutionContext::default()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.outputs["shared"], json!("right"));
    assert!(!result.outputs.contains_key("left_only"));
    assert_eq!(result.path, ["start", "split", "right", "join", "end"]);
    let left = result.steps.iter().find(|s| s.node_id == "left").unwrap();
    assert_eq!(left.status, StepStatus::Skipped);
}

#[tokio::test]
async fn failing_branch_fails_the_barrier() {
    let graph = fan_out_graph("abort");
    let executor = executor(FnSkills::new(|request: &SkillInvocation| {
        if request.skill_id == "left" {
            Err(CapgraphError::NodeExecution {
                node: request.node_id.clone(),
                message: "left broke".into(),
            })
        } else {
            echo_skill(request)
        }
    }));

    let result = executor.execute(&graph, ExecutionContext::default()).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.failure.unwrap().node_id, "left");
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn slow_skill_times_out_and_is_skipped() {
    let graph = build_graph(json!({
        "id": "slow",
        "fallback_strategy": "skip",
        "max_retries": 1,
        "retry_delay": 0.5,
        "nodes": [
            {"id": "start", "type": "control.start"},
            {"id": "crawl", "type": "skill", "skillId": "crawl", "timeout": 2.0},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [{"from": "start", "to": "crawl"}, {"from": "crawl", "to": "end"}]
    }));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let executor = executor(
        FnSkills::new(move |request: &SkillInvocation| {
            counter.fetch_add(1, Ordering::SeqCst);
            echo_skill(request)
        })
        .delay("crawl", Duration::from_secs(60)),
    );

    let result = executor.execute(&graph, ExecutionContext::default()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.path, ["start", "crawl", "end"]);
    let crawl = &result.steps[1];
    assert_eq!(crawl.status, StepStatus::Skipped);
    assert_eq!(crawl.retry_count, 1);
    assert!(crawl.error.as_deref().unwrap().contains("timed out"));
    // The sleep never finishes, so the response closure is never reached.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn declined_skip_aborts_with_failure_details() {
    let graph = build_graph(json!({
        "id": "ask_first",
        "nodes": [
            {"id": "start", "type": "control.start"},
            {"id": "fetch", "type": "skill", "skillId": "fetch"},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [{"from": "start", "to": "fetch"}, {"from": "fetch", "to": "end"}]
    }));
    let presenter = Arc::new(RecordingPresenter::new(vec![json!(false)]));
    let skills = FnSkills::new(|request: &SkillInvocation| {
        Err(CapgraphError::SkillNotFound {
            node: request.node_id.clone(),
            skill: request.skill_id.clone(),
        })
    });
    let executor = Executor::new(Arc::new(skills), presenter.clone());

    let result = executor.execute(&graph, ExecutionContext::default()).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    let failure = result.failure.unwrap();
    assert_eq!(failure.node_id, "fetch");
    assert!(failure.error.contains("not found"));
    assert_eq!(presenter.requests().len(), 1);
    assert_eq!(result.steps[1].retry_count, 0);
}

#[tokio::test]
async fn interaction_answer_steers_the_next_branch() {
    let graph = build_graph(json!({
        "id": "confirmed",
        "nodes": [
            {"id": "start", "type": "control.start"},
            {"id": "approve", "type": "interaction.confirm", "prompt": "Publish?"},
            {"id": "publish", "type": "skill", "skillId": "publish"},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [
            {"from": "start", "to": "approve"},
            {"from": "approve", "to": "publish", "type": "conditional", "condition": "approve_result == true"},
            {"from": "approve", "to": "end", "type": "conditional", "condition": "not approve_result"},
            {"from": "publish", "to": "end"}
        ]
    }));

    for (answer, expected) in [
        (true, vec!["start", "approve", "publish", "end"]),
        (false, vec!["start", "approve", "end"]),
    ] {
        let presenter = Arc::new(RecordingPresenter::new(vec![json!(answer)]));
        let executor = Executor::new(Arc::new(FnSkills::new(echo_skill)), presenter.clone());
        let result = executor.execute(&graph, ExecutionContext::default()).await.unwrap();
        assert_eq!(result.path, expected);
        assert_eq!(presenter.requests()[0].prompt, "Publish?");
    }
}

/// Never answers; counts how often it was asked.
#[derive(Default)]
struct Silent {
    asked: AtomicUsize,
}

#[async_trait]
impl Presenter for Silent {
    async fn on_interaction(&self, _request: &InteractionRequest) -> Result<Value> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

fn review_graph(strategy: &str, timeout: Option<f64>) -> CapabilityGraph {
    let mut review = json!({"id": "review", "type": "interaction.input", "prompt": "Notes?"});
    if let Some(secs) = timeout {
        review["timeout"] = json!(secs);
    }
    build_graph(json!({
        "id": "reviewed",
        "fallback_strategy": strategy,
        "nodes": [
            {"id": "start", "type": "control.start"},
            review,
            {"id": "publish", "type": "skill", "skillId": "publish"},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [
            {"from": "start", "to": "review"},
            {"from": "review", "to": "publish"},
            {"from": "publish", "to": "end"}
        ]
    }))
}

#[tokio::test(start_paused = true)]
async fn cancellation_while_waiting_for_input() {
    let presenter = Arc::new(Silent::default());
    let executor = Executor::new(Arc::new(FnSkills::new(echo_skill)), presenter.clone());
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        trigger.cancel();
    });

    let result = executor
        .execute_with_cancellation(&review_graph("abort", None), ExecutionContext::default(), token)
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(result.failure.is_none());
    assert_eq!(presenter.asked.load(Ordering::SeqCst), 1);
    assert_eq!(result.path, ["start"]);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.steps[0].status, StepStatus::Completed);
    let review = &result.steps[1];
    assert_eq!(review.node_id, "review");
    assert_eq!(review.status, StepStatus::Skipped);
    assert_eq!(review.error.as_deref(), Some("cancelled"));
    assert!(!result.outputs.contains_key("review_result"));
}

#[tokio::test(start_paused = true)]
async fn unanswered_input_times_out_into_the_failure_strategy() {
    let executor = Executor::new(
        Arc::new(FnSkills::new(echo_skill)),
        Arc::new(Silent::default()),
    );

    let result = executor
        .execute(&review_graph("skip", Some(2.0)), ExecutionContext::default())
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.path, ["start", "review", "publish", "end"]);
    let review = &result.steps[1];
    assert_eq!(review.status, StepStatus::Skipped);
    assert_eq!(review.retry_count, 0);
    assert!(review.error.as_deref().unwrap().contains("timed out after 2000ms"));
    assert!(!result.outputs.contains_key("review_result"));

    let aborted = Executor::new(
        Arc::new(FnSkills::new(echo_skill)),
        Arc::new(Silent::default()),
    )
    .execute(&review_graph("abort", Some(2.0)), ExecutionContext::default())
    .await
    .unwrap();
    assert_eq!(aborted.status, ExecutionStatus::Failed);
    assert_eq!(aborted.failure.unwrap().node_id, "review");
    assert_eq!(aborted.steps[1].status, StepStatus::Failed);
}

#[tokio::test]
async fn input_default_is_offered_to_the_presenter() {
    let graph = build_graph(json!({
        "id": "defaults",
        "nodes": [
            {"id": "start", "type": "control.start"},
            {"id": "title", "type": "interaction.input", "default": "Untitled draft"},
            {"id": "end", "type": "control.end"}
        ],
        "edges": [{"from": "start", "to": "title"}, {"from": "title", "to": "end"}]
    }));

    let result = Executor::simulated()
        .execute(&graph, ExecutionContext::default())
        .await
        .unwrap();
    assert_eq!(result.outputs["title_result"], json!("Untitled draft"));

    let presenter = Arc::new(RecordingPresenter::new(vec![json!("Final")]));
    let executor = Executor::new(Arc::new(FnSkills::new(echo_skill)), presenter.clone());
    let result = executor.execute(&graph, ExecutionContext::default()).await.unwrap();
    assert_eq!(result.outputs["title_result"], json!("Final"));
    assert_eq!(presenter.requests()[0].default.as_deref(), Some("Untitled draft"));
}
