//! Mermaid projection of a capability graph.

use std::collections::HashMap;

use crate::graph::{CapabilityGraph, EdgeType, NodeType};

fn node_shape(node_type: NodeType) -> (&'static str, &'static str) {
    match node_type {
        NodeType::Start | NodeType::End => ("((", "))"),
        NodeType::Branch => ("{", "}"),
        NodeType::Merge | NodeType::ParallelJoin => ("[[", "]]"),
        NodeType::Confirm | NodeType::Select | NodeType::Input => ("[/", "/]"),
        _ => ("[", "]"),
    }
}

fn edge_arrow(edge_type: EdgeType) -> &'static str {
    match edge_type {
        EdgeType::Sequence | EdgeType::Parallel => "-->",
        EdgeType::Conditional => "-.->",
        EdgeType::Iteration => "==>",
        EdgeType::Fallback => "-. fallback .->",
    }
}

/// Mermaid treats `|` and `"` as syntax inside labels.
fn escape_label(text: &str) -> String {
    text.replace('"', "#quot;").replace('|', "#124;")
}

/// Mermaid keys are positional (`n0`, `n1`, ...) so ids such as `end` or
/// `a-b` never collide with flowchart syntax. Edges to undeclared nodes get a
/// sanitized key of their own.
fn node_keys(graph: &CapabilityGraph) -> HashMap<&str, String> {
    graph
        .nodes()
        .iter()
        .enumerate()
        .map(|(i, node)| (node.id.as_str(), format!("n{i}")))
        .collect()
}

fn key_for(keys: &HashMap<&str, String>, id: &str) -> String {
    match keys.get(id) {
        Some(key) => key.clone(),
        None => {
            let cleaned: String = id
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            format!("missing_{cleaned}")
        }
    }
}

/// Render the graph as a Mermaid `graph TD` diagram: one line per node, then
/// one line per edge. Branch conditions without a matching edge are drawn as
/// conditional arrows labelled with their expression.
pub fn to_mermaid(graph: &CapabilityGraph) -> String {
    let keys = node_keys(graph);
    let mut lines = vec!["graph TD".to_string()];

    for node in graph.nodes() {
        let (open, close) = node_shape(node.node_type);
        let label = match &node.skill_id {
            Some(skill) => format!("{}: {skill}", node.id),
            None => node.id.clone(),
        };
        lines.push(format!(
            "    {}{open}\"{}\"{close}",
            key_for(&keys, &node.id),
            escape_label(&label)
        ));
    }

    for edge in graph.edges() {
        let arrow = edge_arrow(edge.edge_type);
        let label = match (&edge.condition, edge.edge_type) {
            (Some(cond), t) if t != EdgeType::Fallback => format!("|{}|", escape_label(cond)),
            _ => String::new(),
        };
        lines.push(format!(
            "    {} {arrow}{label} {}",
            key_for(&keys, &edge.from),
            key_for(&keys, &edge.to)
        ));
    }

    for node in graph.nodes().iter().filter(|n| n.node_type == NodeType::Branch) {
        for cond in &node.conditions {
            let has_edge = graph.outgoing_edges(&node.id).any(|e| e.to == cond.target);
            if !has_edge {
                lines.push(format!(
                    "    {} -.->|{}| {}",
                    key_for(&keys, &node.id),
                    escape_label(&cond.expression),
                    key_for(&keys, &cond.target)
                ));
            }
        }
    }

    lines.join("\n")
}
