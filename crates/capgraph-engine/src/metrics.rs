//! Static complexity metrics for a capability graph.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::graph::{CapabilityGraph, NodeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Trivial,
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

impl ComplexityLevel {
    /// Bucket a complexity score. Boundaries belong to the lower bucket.
    pub fn from_score(score: i64) -> Self {
        match score {
            i64::MIN..=20 => ComplexityLevel::Trivial,
            21..=40 => ComplexityLevel::Simple,
            41..=60 => ComplexityLevel::Moderate,
            61..=80 => ComplexityLevel::Complex,
            _ => ComplexityLevel::VeryComplex,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetrics {
    pub node_count: usize,
    pub edge_count: usize,
    pub cyclomatic_complexity: i64,
    pub max_depth: usize,
    pub branch_factor: f64,
    pub max_iterations: usize,
    pub interaction_count: usize,
    pub parallel_branches: usize,
    pub complexity_score: i64,
    pub complexity_level: ComplexityLevel,
}

pub fn calculate_metrics(graph: &CapabilityGraph) -> GraphMetrics {
    let nodes = graph.nodes();
    let node_count = nodes.len();
    let edge_count = graph.edges().len();
    // One connected component for any graph that passes reachability validation.
    let cyclomatic_complexity = edge_count as i64 - node_count as i64 + 2;

    let max_iterations = nodes
        .iter()
        .filter(|n| n.node_type == NodeType::LoopStart)
        .map(|n| n.max_iterations())
        .max()
        .unwrap_or(0);
    let interaction_count = nodes
        .iter()
        .filter(|n| n.node_type.is_interaction())
        .count();
    let parallel_branches = nodes
        .iter()
        .filter(|n| n.node_type == NodeType::ParallelSplit)
        .count();

    let branches: Vec<_> = nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Branch)
        .collect();
    let branch_factor = if branches.is_empty() {
        0.0
    } else {
        branches.iter().map(|n| n.conditions.len()).sum::<usize>() as f64 / branches.len() as f64
    };

    let max_depth = max_depth(graph);

    let complexity_score = 10 * cyclomatic_complexity
        + 15 * max_iterations as i64
        + 20 * interaction_count as i64
        + 5 * parallel_branches as i64
        + 3 * max_depth as i64;

    GraphMetrics {
        node_count,
        edge_count,
        cyclomatic_complexity,
        max_depth,
        branch_factor,
        max_iterations,
        interaction_count,
        parallel_branches,
        complexity_score,
        complexity_level: ComplexityLevel::from_score(complexity_score),
    }
}

/// Length in edges of the longest simple path from the start node.
///
/// Walks every path with an explicit stack. A node may appear on many paths
/// but never twice on the same one, so cycles terminate.
pub fn max_depth(graph: &CapabilityGraph) -> usize {
    let Some(start) = graph.start_node() else {
        return 0;
    };

    let mut deepest = 0;
    // (node, index of the next successor to explore)
    let mut stack: Vec<(&str, usize)> = vec![(start.id.as_str(), 0)];
    let mut on_path: HashSet<&str> = HashSet::from([start.id.as_str()]);

    while let Some(&(current, next)) = stack.last() {
        deepest = deepest.max(stack.len() - 1);
        let successor = graph.outgoing_edges(current).nth(next).map(|e| e.to.as_str());
        match successor {
            Some(target) => {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                if on_path.insert(target) {
                    stack.push((target, 0));
                }
            }
            None => {
                on_path.remove(current);
                stack.pop();
            }
        }
    }
    deepest
}
