//! Capability graph model and JSON loader.
//!
//! A [`CapabilityGraph`] is built once from a [`GraphDocument`] and is immutable
//! afterwards. Loading precomputes the lookups the executor and validator need:
//! an id index, adjacency lists in edge declaration order, the loop_start to
//! loop_end pairing and the parallel_split to parallel_join pairing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use capgraph_types::Result;
use serde::{Deserialize, Serialize};

/// Iteration bound used for loops that do not declare `maxIterations`.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

// ---------------------------------------------------------------------------
// Node / edge types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "skill")]
    Skill,
    #[serde(rename = "control.start")]
    Start,
    #[serde(rename = "control.end")]
    End,
    #[serde(rename = "control.branch")]
    Branch,
    #[serde(rename = "control.merge")]
    Merge,
    #[serde(rename = "control.loop_start")]
    LoopStart,
    #[serde(rename = "control.loop_end")]
    LoopEnd,
    #[serde(rename = "control.parallel_split")]
    ParallelSplit,
    #[serde(rename = "control.parallel_join")]
    ParallelJoin,
    #[serde(rename = "interaction.confirm")]
    Confirm,
    #[serde(rename = "interaction.select")]
    Select,
    #[serde(rename = "interaction.input")]
    Input,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Skill => "skill",
            NodeType::Start => "control.start",
            NodeType::End => "control.end",
            NodeType::Branch => "control.branch",
            NodeType::Merge => "control.merge",
            NodeType::LoopStart => "control.loop_start",
            NodeType::LoopEnd => "control.loop_end",
            NodeType::ParallelSplit => "control.parallel_split",
            NodeType::ParallelJoin => "control.parallel_join",
            NodeType::Confirm => "interaction.confirm",
            NodeType::Select => "interaction.select",
            NodeType::Input => "interaction.input",
        }
    }

    pub fn is_control(self) -> bool {
        self.as_str().starts_with("control.")
    }

    pub fn is_interaction(self) -> bool {
        matches!(self, NodeType::Confirm | NodeType::Select | NodeType::Input)
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Single,
    Iterative,
    Parallel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    #[default]
    Sequence,
    Conditional,
    Iteration,
    Parallel,
    Fallback,
}

/// What the executor does with a node whose retries and alternatives are exhausted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    #[default]
    RetryThenAsk,
    Skip,
    Abort,
    FirstSuccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchCondition {
    #[serde(default)]
    pub name: String,
    pub expression: String,
    pub target: String,
}

/// A ranked alternative way of satisfying a skill node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    pub id: String,
    #[serde(alias = "skill_id")]
    pub skill_id: String,
    #[serde(default)]
    pub priority: i64,
    /// Applicability expressions; all must hold for the implementation to be tried.
    #[serde(default)]
    pub conditions: Vec<String>,
    /// Ids of other implementations to try when this one fails.
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, alias = "skill_id", skip_serializing_if = "Option::is_none")]
    pub skill_id: Option<String>,
    #[serde(default, alias = "execution_mode")]
    pub execution_mode: ExecutionMode,
    #[serde(default, alias = "max_iterations", skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
    /// Seconds, fractional allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<BranchCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, alias = "options_from", skip_serializing_if = "Option::is_none")]
    pub options_from: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Suggested answer offered for `interaction.input`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub implementations: Vec<Implementation>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            skill_id: None,
            execution_mode: ExecutionMode::default(),
            max_iterations: None,
            timeout: None,
            conditions: Vec::new(),
            prompt: None,
            options_from: None,
            options: Vec::new(),
            default: None,
            outputs: Vec::new(),
            implementations: Vec::new(),
        }
    }

    /// Convenience constructor for a skill node.
    pub fn skill(id: impl Into<String>, skill_id: impl Into<String>) -> Self {
        let mut node = Self::new(id, NodeType::Skill);
        node.skill_id = Some(skill_id.into());
        node
    }

    /// Configured loop bound, or [`DEFAULT_MAX_ITERATIONS`].
    pub fn max_iterations(&self) -> usize {
        self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS)
    }

    /// Node timeout. Negative, NaN or overflowing values are treated as unset.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type", default)]
    pub edge_type: EdgeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, alias = "max_count", skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,
    #[serde(default, alias = "exit_condition", skip_serializing_if = "Option::is_none")]
    pub exit_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

impl GraphEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::typed(from, to, EdgeType::Sequence)
    }

    pub fn typed(from: impl Into<String>, to: impl Into<String>, edge_type: EdgeType) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            edge_type,
            weight: None,
            condition: None,
            max_count: None,
            exit_condition: None,
            trigger: None,
        }
    }

    /// Edges followed by ordinary successor selection.
    pub fn is_flow(&self) -> bool {
        !matches!(self.edge_type, EdgeType::Iteration | EdgeType::Fallback)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetadata {
    #[serde(default, alias = "estimated_complexity", skip_serializing_if = "Option::is_none")]
    pub estimated_complexity: Option<String>,
    #[serde(default, alias = "typical_iterations", skip_serializing_if = "Option::is_none")]
    pub typical_iterations: Option<usize>,
    #[serde(default, alias = "human_interactions", skip_serializing_if = "Option::is_none")]
    pub human_interactions: Option<usize>,
    #[serde(default, alias = "parallel_branches", skip_serializing_if = "Option::is_none")]
    pub parallel_branches: Option<usize>,
}

// ---------------------------------------------------------------------------
// GraphDocument: serialized form
// ---------------------------------------------------------------------------

fn default_version() -> String {
    "1.0".to_string()
}

fn default_max_retries() -> usize {
    3
}

/// Serialized form of a capability graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDocument {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<GraphMetadata>,
    #[serde(default, alias = "fallbackStrategy")]
    pub fallback_strategy: FallbackStrategy,
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: usize,
    /// Fixed delay between retries, in seconds.
    #[serde(default, alias = "retryDelay", skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<f64>,
}

impl Default for GraphDocument {
    fn default() -> Self {
        Self {
            id: String::new(),
            version: default_version(),
            name: String::new(),
            description: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            metadata: None,
            fallback_strategy: FallbackStrategy::default(),
            max_retries: default_max_retries(),
            retry_delay: None,
        }
    }
}

// ---------------------------------------------------------------------------
// CapabilityGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct LoopPair {
    end: String,
    /// Index into `edges` of the iteration edge pointing back at the loop start.
    iteration_edge: usize,
}

#[derive(Debug, Clone)]
pub struct CapabilityGraph {
    pub id: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub metadata: Option<GraphMetadata>,
    pub fallback_strategy: FallbackStrategy,
    pub max_retries: usize,
    pub retry_delay: Option<Duration>,
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    /// First occurrence of each id.
    index: HashMap<String, usize>,
    /// Outgoing edge indices per node, in declaration order.
    adjacency: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
    loops: HashMap<String, LoopPair>,
    joins: HashMap<String, String>,
}

impl CapabilityGraph {
    pub fn from_document(doc: GraphDocument) -> Self {
        let mut index = HashMap::new();
        for (i, node) in doc.nodes.iter().enumerate() {
            index.entry(node.id.clone()).or_insert(i);
        }

        let mut adjacency: HashMap<String, Vec<usize>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in doc.edges.iter().enumerate() {
            adjacency.entry(edge.from.clone()).or_default().push(i);
            incoming.entry(edge.to.clone()).or_default().push(i);
        }

        let mut graph = CapabilityGraph {
            id: doc.id,
            version: doc.version,
            name: doc.name,
            description: doc.description,
            metadata: doc.metadata,
            fallback_strategy: doc.fallback_strategy,
            max_retries: doc.max_retries,
            retry_delay: doc
                .retry_delay
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
            nodes: doc.nodes,
            edges: doc.edges,
            index,
            adjacency,
            incoming,
            loops: HashMap::new(),
            joins: HashMap::new(),
        };
        graph.loops = graph.pair_loops();
        graph.joins = graph.pair_joins();
        graph
    }

    pub fn to_document(&self) -> GraphDocument {
        GraphDocument {
            id: self.id.clone(),
            version: self.version.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
            metadata: self.metadata.clone(),
            fallback_strategy: self.fallback_strategy,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay.map(|d| d.as_secs_f64()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let doc: GraphDocument = serde_json::from_str(json)?;
        Ok(Self::from_document(doc))
    }

    /// Load a graph document from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// All nodes in declaration order, duplicates included.
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Outgoing edges of `node_id` in declaration order.
    pub fn outgoing_edges(&self, node_id: &str) -> impl Iterator<Item = &GraphEdge> + '_ {
        self.adjacency
            .get(node_id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    pub fn successors(&self, node_id: &str) -> Vec<&str> {
        self.outgoing_edges(node_id).map(|e| e.to.as_str()).collect()
    }

    pub fn predecessors(&self, node_id: &str) -> Vec<&str> {
        self.incoming
            .get(node_id)
            .into_iter()
            .flatten()
            .map(|&i| self.edges[i].from.as_str())
            .collect()
    }

    pub fn start_node(&self) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.node_type == NodeType::Start)
    }

    pub fn end_nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter().filter(|n| n.node_type == NodeType::End)
    }

    /// Paired loop_end of a loop_start.
    pub fn loop_end_for(&self, loop_start: &str) -> Option<&str> {
        self.loops.get(loop_start).map(|p| p.end.as_str())
    }

    /// The iteration edge closing the loop opened by `loop_start`.
    pub fn iteration_edge_for(&self, loop_start: &str) -> Option<&GraphEdge> {
        self.loops
            .get(loop_start)
            .map(|p| &self.edges[p.iteration_edge])
    }

    /// Paired parallel_join of a parallel_split.
    pub fn join_for(&self, split: &str) -> Option<&str> {
        self.joins.get(split).map(String::as_str)
    }

    /// Every simple path from the start node to an end node.
    pub fn all_paths(&self) -> Vec<Vec<String>> {
        let Some(start) = self.start_node() else {
            return Vec::new();
        };

        let mut paths = Vec::new();
        // Each frame holds a node on the current path and its next outgoing edge.
        let mut stack: Vec<(&str, usize)> = vec![(start.id.as_str(), 0)];
        let mut on_path: HashSet<&str> = HashSet::from([start.id.as_str()]);

        while let Some(&(current, next)) = stack.last() {
            let is_end = self
                .node(current)
                .is_some_and(|n| n.node_type == NodeType::End);
            if is_end {
                paths.push(stack.iter().map(|(id, _)| id.to_string()).collect());
            }

            let outgoing = self.adjacency.get(current).map(Vec::as_slice).unwrap_or(&[]);
            if is_end || next >= outgoing.len() {
                on_path.remove(current);
                stack.pop();
                continue;
            }

            let target = self.edges[outgoing[next]].to.as_str();
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            if self.node(target).is_some() && on_path.insert(target) {
                stack.push((target, 0));
            }
        }
        paths
    }

    /// Node ids reachable from `from` over edges accepted by `follow`.
    pub(crate) fn reachable_from(
        &self,
        from: &str,
        follow: impl Fn(&GraphEdge) -> bool,
    ) -> HashSet<String> {
        let mut seen = HashSet::from([from.to_string()]);
        let mut queue = VecDeque::from([from.to_string()]);
        while let Some(current) = queue.pop_front() {
            for edge in self.outgoing_edges(&current).filter(|e| follow(e)) {
                if seen.insert(edge.to.clone()) {
                    queue.push_back(edge.to.clone());
                }
            }
        }
        seen
    }

    // --- Precomputed pairings ---

    fn pair_loops(&self) -> HashMap<String, LoopPair> {
        let mut loops = HashMap::new();
        for start in self.nodes.iter().filter(|n| n.node_type == NodeType::LoopStart) {
            if loops.contains_key(&start.id) {
                continue;
            }
            let reachable = self.reachable_from(&start.id, |e| e.edge_type != EdgeType::Iteration);
            let back_edge = self
                .incoming
                .get(&start.id)
                .into_iter()
                .flatten()
                .copied()
                .find(|&i| {
                    let edge = &self.edges[i];
                    edge.edge_type == EdgeType::Iteration
                        && reachable.contains(&edge.from)
                        && self
                            .node(&edge.from)
                            .is_some_and(|n| n.node_type == NodeType::LoopEnd)
                });
            if let Some(i) = back_edge {
                loops.insert(
                    start.id.clone(),
                    LoopPair {
                        end: self.edges[i].from.clone(),
                        iteration_edge: i,
                    },
                );
            }
        }
        loops
    }

    fn pair_joins(&self) -> HashMap<String, String> {
        let mut joins = HashMap::new();
        for split in self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::ParallelSplit)
        {
            if let Some(join) = self.find_join(&split.id) {
                joins.insert(split.id.clone(), join);
            }
        }
        joins
    }

    /// Breadth-first search for the first parallel_join at the split's own
    /// nesting depth. Nesting deeper than the node count can never unwind,
    /// so those paths are dropped.
    fn find_join(&self, split: &str) -> Option<String> {
        let max_depth = self.nodes.len();
        let mut seen: HashSet<(String, usize)> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        for edge in self.outgoing_edges(split).filter(|e| e.is_flow()) {
            queue.push_back((edge.to.clone(), 0));
        }

        while let Some((id, depth)) = queue.pop_front() {
            if !seen.insert((id.clone(), depth)) {
                continue;
            }
            let Some(node) = self.node(&id) else {
                continue;
            };
            let next_depth = match node.node_type {
                NodeType::ParallelJoin if depth == 0 => return Some(id),
                NodeType::ParallelJoin => depth - 1,
                NodeType::ParallelSplit if depth < max_depth => depth + 1,
                NodeType::ParallelSplit => continue,
                _ => depth,
            };
            for edge in self.outgoing_edges(&id).filter(|e| e.is_flow()) {
                queue.push_back((edge.to.clone(), next_depth));
            }
        }
        None
    }
}
