//! Graph validation: lint rules and diagnostics.
//!
//! Each structural check is a [`LintRule`]. [`validate`] runs every rule in a
//! fixed order and accumulates all violations; `Error` diagnostics make the
//! graph invalid, `Warning` diagnostics never do. [`validate_or_raise`] turns
//! an invalid report into [`CapgraphError::Validation`].

use std::collections::{HashMap, HashSet, VecDeque};

use capgraph_types::{CapgraphError, Result};

use crate::condition::parse_condition;
use crate::graph::{CapabilityGraph, EdgeType, NodeType};
use crate::skills::{IoType, SkillRepository};

/// Loops configured above this bound get a warning.
const MAX_REASONABLE_ITERATIONS: usize = 100;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl Diagnostic {
    fn error(rule: &str, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message: message.into(),
            node_id: None,
            edge: None,
            fix: None,
        }
    }

    fn warning(rule: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule, message)
        }
    }

    fn on_node(mut self, id: &str) -> Self {
        self.node_id = Some(id.to_string());
        self
    }

    fn on_edge(mut self, from: &str, to: &str) -> Self {
        self.edge = Some((from.to_string(), to.to_string()));
        self
    }

    fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

/// Outcome of validating a graph.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationReport {
    pub fn from_diagnostics(diagnostics: Vec<Diagnostic>) -> Self {
        let (errors, warnings): (Vec<_>, Vec<_>) = diagnostics
            .iter()
            .partition(|d| d.severity == Severity::Error);
        Self {
            valid: errors.is_empty(),
            errors: errors.into_iter().map(|d| d.message.clone()).collect(),
            warnings: warnings.into_iter().map(|d| d.message.clone()).collect(),
            diagnostics,
        }
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Error rules
// ---------------------------------------------------------------------------

struct StartNodeRule;
impl LintRule for StartNodeRule {
    fn name(&self) -> &str { "start_node" }
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic> {
        let starts: Vec<_> = graph
            .nodes()
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .map(|n| n.id.as_str())
            .collect();
        match starts.len() {
            0 => vec![Diagnostic::error(self.name(), "Graph must have a start node")
                .with_fix("Add a node with type \"control.start\"")],
            1 => vec![],
            _ => vec![Diagnostic::error(
                self.name(),
                format!(
                    "Graph must have exactly one start node: {}",
                    starts.join(", ")
                ),
            )
            .with_fix("Remove extra start nodes so only one remains")],
        }
    }
}

struct EndNodeRule;
impl LintRule for EndNodeRule {
    fn name(&self) -> &str { "end_node" }
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic> {
        if graph.end_nodes().next().is_none() {
            vec![Diagnostic::error(self.name(), "Graph must have at least one end node")
                .with_fix("Add a node with type \"control.end\"")]
        } else {
            vec![]
        }
    }
}

struct EdgeEndpointsRule;
impl LintRule for EdgeEndpointsRule {
    fn name(&self) -> &str { "edge_endpoints" }
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for edge in graph.edges() {
            for endpoint in [&edge.from, &edge.to] {
                if graph.node(endpoint).is_none() {
                    diags.push(
                        Diagnostic::error(
                            self.name(),
                            format!("Edge references non-existent node: {endpoint}"),
                        )
                        .on_edge(&edge.from, &edge.to)
                        .with_fix(format!("Add node '{endpoint}' or fix the edge")),
                    );
                }
            }
        }
        diags
    }
}

struct BranchConditionsRule;
impl LintRule for BranchConditionsRule {
    fn name(&self) -> &str { "branch_conditions" }
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .iter()
            .filter(|n| n.node_type == NodeType::Branch && n.conditions.is_empty())
            .map(|n| {
                Diagnostic::error(self.name(), format!("Branch node {} must have conditions", n.id))
                    .on_node(&n.id)
            })
            .collect()
    }
}

struct SkillIdRule;
impl LintRule for SkillIdRule {
    fn name(&self) -> &str { "skill_id" }
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .iter()
            .filter(|n| {
                n.node_type == NodeType::Skill
                    && n.skill_id.as_deref().map_or(true, |s| s.trim().is_empty())
            })
            .map(|n| {
                Diagnostic::error(self.name(), format!("Skill node {} must have skillId", n.id))
                    .on_node(&n.id)
            })
            .collect()
    }
}

struct DuplicateIdRule;
impl LintRule for DuplicateIdRule {
    fn name(&self) -> &str { "duplicate_id" }
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut order = Vec::new();
        for node in graph.nodes() {
            let count = counts.entry(node.id.as_str()).or_insert(0);
            *count += 1;
            if *count == 2 {
                order.push(node.id.as_str());
            }
        }
        order
            .into_iter()
            .map(|id| {
                Diagnostic::error(self.name(), format!("Duplicate node id: {id}")).on_node(id)
            })
            .collect()
    }
}

struct BranchTargetRule;
impl LintRule for BranchTargetRule {
    fn name(&self) -> &str { "branch_target" }
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in graph.nodes().iter().filter(|n| n.node_type == NodeType::Branch) {
            for cond in node.conditions.iter().filter(|c| graph.node(&c.target).is_none()) {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        format!(
                            "Branch node {} condition '{}' targets non-existent node: {}",
                            node.id, cond.name, cond.target
                        ),
                    )
                    .on_node(&node.id),
                );
            }
        }
        diags
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic> {
        let Some(start) = graph.start_node() else {
            return vec![]; // StartNodeRule reports this
        };

        let mut visited = HashSet::from([start.id.as_str()]);
        let mut queue = VecDeque::from([start.id.as_str()]);
        while let Some(current) = queue.pop_front() {
            let branch_targets = graph
                .node(current)
                .map(|n| n.conditions.iter().map(|c| c.target.as_str()).collect::<Vec<_>>())
                .unwrap_or_default();
            let targets = graph
                .outgoing_edges(current)
                .map(|e| e.to.as_str())
                .chain(branch_targets);
            for target in targets {
                if graph.node(target).is_some() && visited.insert(target) {
                    queue.push_back(target);
                }
            }
        }

        let mut reported = HashSet::new();
        graph
            .nodes()
            .iter()
            .filter(|n| !visited.contains(n.id.as_str()) && reported.insert(n.id.as_str()))
            .map(|n| {
                Diagnostic::error(
                    self.name(),
                    format!("Node '{}' is not reachable from the start node", n.id),
                )
                .on_node(&n.id)
                .with_fix(format!("Add an edge leading to '{}' or remove it", n.id))
            })
            .collect()
    }
}

struct LoopPairingRule;
impl LintRule for LoopPairingRule {
    fn name(&self) -> &str { "loop_pairing" }
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .iter()
            .filter(|n| n.node_type == NodeType::LoopStart)
            .filter(|n| graph.loop_end_for(&n.id).is_none())
            .map(|n| {
                Diagnostic::error(
                    self.name(),
                    format!(
                        "Loop node {} has no reachable loop_end with an iteration edge back to it",
                        n.id
                    ),
                )
                .on_node(&n.id)
                .with_fix(format!(
                    "Add a control.loop_end after '{}' and an iteration edge from it back to '{}'",
                    n.id, n.id
                ))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Warning rules
// ---------------------------------------------------------------------------

struct ConditionSyntaxRule;
impl ConditionSyntaxRule {
    fn check(&self, expr: &str, diags: &mut Vec<Diagnostic>, make: impl FnOnce(Diagnostic) -> Diagnostic) {
        if let Err(err) = parse_condition(expr) {
            diags.push(make(Diagnostic::warning(self.name(), err.to_string())));
        }
    }
}
impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str { "condition_syntax" }
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in graph.nodes() {
            for cond in &node.conditions {
                self.check(&cond.expression, &mut diags, |d| d.on_node(&node.id));
            }
            for implementation in &node.implementations {
                for cond in implementation.conditions.iter().filter(|c| c.trim() != "default") {
                    self.check(cond, &mut diags, |d| d.on_node(&node.id));
                }
            }
        }
        for edge in graph.edges() {
            let exprs = [&edge.condition, &edge.exit_condition, &edge.trigger];
            for expr in exprs.into_iter().flatten() {
                self.check(expr, &mut diags, |d| d.on_edge(&edge.from, &edge.to));
            }
        }
        diags
    }
}

struct ParallelJoinRule;
impl LintRule for ParallelJoinRule {
    fn name(&self) -> &str { "parallel_join" }
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .iter()
            .filter(|n| n.node_type == NodeType::ParallelSplit)
            .filter(|n| graph.join_for(&n.id).is_none())
            .map(|n| {
                Diagnostic::warning(
                    self.name(),
                    format!(
                        "Parallel split {} has no matching parallel_join; branches will not be merged",
                        n.id
                    ),
                )
                .on_node(&n.id)
            })
            .collect()
    }
}

struct LoopBoundRule;
impl LintRule for LoopBoundRule {
    fn name(&self) -> &str { "loop_bound" }
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in graph.nodes().iter().filter(|n| n.node_type == NodeType::LoopStart) {
            match node.max_iterations {
                None => diags.push(
                    Diagnostic::warning(
                        self.name(),
                        format!(
                            "Loop node {} has no maxIterations; defaulting to {}",
                            node.id,
                            node.max_iterations()
                        ),
                    )
                    .on_node(&node.id),
                ),
                Some(n) if n > MAX_REASONABLE_ITERATIONS => diags.push(
                    Diagnostic::warning(
                        self.name(),
                        format!(
                            "Loop node {} allows {n} iterations; more than {MAX_REASONABLE_ITERATIONS} may run for a long time",
                            node.id
                        ),
                    )
                    .on_node(&node.id),
                ),
                Some(_) => {}
            }
        }
        diags
    }
}

struct SelectOptionsRule;
impl LintRule for SelectOptionsRule {
    fn name(&self) -> &str { "select_options" }
    fn apply(&self, graph: &CapabilityGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .iter()
            .filter(|n| n.node_type == NodeType::Select)
            .filter(|n| n.options.is_empty() && n.options_from.is_none())
            .map(|n| {
                Diagnostic::warning(
                    self.name(),
                    format!("Select node {} has neither options nor optionsFrom", n.id),
                )
                .on_node(&n.id)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

fn rules() -> Vec<Box<dyn LintRule>> {
    vec![
        Box::new(StartNodeRule),
        Box::new(EndNodeRule),
        Box::new(EdgeEndpointsRule),
        Box::new(BranchConditionsRule),
        Box::new(SkillIdRule),
        Box::new(DuplicateIdRule),
        Box::new(BranchTargetRule),
        Box::new(ReachabilityRule),
        Box::new(LoopPairingRule),
        Box::new(ConditionSyntaxRule),
        Box::new(ParallelJoinRule),
        Box::new(LoopBoundRule),
        Box::new(SelectOptionsRule),
    ]
}

/// Run all built-in lint rules.
pub fn validate(graph: &CapabilityGraph) -> ValidationReport {
    let mut diagnostics = Vec::new();
    for rule in rules() {
        diagnostics.extend(rule.apply(graph));
    }
    ValidationReport::from_diagnostics(diagnostics)
}

/// Run all lint rules; return `Err` if the graph is invalid.
pub fn validate_or_raise(graph: &CapabilityGraph) -> Result<ValidationReport> {
    let report = validate(graph);
    if !report.valid {
        return Err(CapgraphError::Validation {
            errors: report.errors,
        });
    }
    Ok(report)
}

/// Resolve every skill reference against `repo` and check IO compatibility
/// across sequence edges between skill nodes.
pub async fn validate_skills(
    graph: &CapabilityGraph,
    repo: &dyn SkillRepository,
) -> ValidationReport {
    let mut diagnostics = Vec::new();
    let mut io: HashMap<&str, (Option<IoType>, Option<IoType>)> = HashMap::new();

    for node in graph.nodes().iter().filter(|n| n.node_type == NodeType::Skill) {
        let skill_ids = node
            .skill_id
            .iter()
            .chain(node.implementations.iter().map(|i| &i.skill_id));
        for (i, skill_id) in skill_ids.enumerate() {
            match repo.get_skill(skill_id).await {
                Some(info) if i == 0 => {
                    io.insert(node.id.as_str(), (info.input_type, info.output_type));
                }
                Some(_) => {}
                None => diagnostics.push(
                    Diagnostic::error(
                        "skill_exists",
                        format!("Skill '{skill_id}' referenced by node '{}' was not found", node.id),
                    )
                    .on_node(&node.id),
                ),
            }
        }
    }

    for edge in graph
        .edges()
        .iter()
        .filter(|e| e.edge_type == EdgeType::Sequence)
    {
        let (Some((_, Some(output))), Some((Some(input), _))) =
            (io.get(edge.from.as_str()), io.get(edge.to.as_str()))
        else {
            continue;
        };
        if !IoType::is_compatible(*output, *input) {
            diagnostics.push(
                Diagnostic::warning(
                    "io_compatibility",
                    format!(
                        "Output type {output:?} of '{}' is not compatible with input type {input:?} of '{}'",
                        edge.from, edge.to
                    ),
                )
                .on_edge(&edge.from, &edge.to),
            );
        }
    }

    ValidationReport::from_diagnostics(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
