use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::graph::GraphSpec;
use crate::node::NodeKind;

/// A structural problem found in a graph specification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphIssue {
    #[error("graph has no nodes")]
    EmptyGraph,

    #[error("edge {from} -> {to} references missing node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("entry node '{0}' does not exist")]
    MissingEntryNode(String),

    #[error("{context} references missing node '{node}'")]
    MissingReference { context: String, node: String },

    #[error("cycle detected through node '{0}'")]
    Cycle(String),

    #[error("node '{0}' is unreachable from any entry")]
    Unreachable(String),
}

/// Validate a graph specification structurally.
///
/// Checks run in order: edge endpoints exist, the entry node and every
/// named reference (entry points, terminal/pause sets, parallel branch
/// entries) exist, depth-first cycle detection reporting the first
/// offending node, and breadth-first reachability from the entry set.
///
/// Returns an empty vec for a valid graph. A spec that fails validation
/// must never be handed to an executor.
pub fn validate(spec: &GraphSpec) -> Vec<GraphIssue> {
    let mut issues = Vec::new();

    if spec.nodes.is_empty() {
        issues.push(GraphIssue::EmptyGraph);
        return issues;
    }

    let node_ids: HashSet<&str> = spec.nodes.iter().map(|n| n.id.as_str()).collect();

    // Edge endpoints
    for edge in &spec.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !node_ids.contains(endpoint.as_str()) {
                issues.push(GraphIssue::DanglingEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
    }

    // Entry node
    if !node_ids.contains(spec.entry_node.as_str()) {
        issues.push(GraphIssue::MissingEntryNode(spec.entry_node.clone()));
    }

    // Named references: entry points, terminal nodes, pause nodes, branches
    for (name, target) in &spec.entry_points {
        if !node_ids.contains(target.as_str()) {
            issues.push(GraphIssue::MissingReference {
                context: format!("entry point '{}'", name),
                node: target.clone(),
            });
        }
    }
    for terminal in &spec.terminal_nodes {
        if !node_ids.contains(terminal.as_str()) {
            issues.push(GraphIssue::MissingReference {
                context: "terminal set".into(),
                node: terminal.clone(),
            });
        }
    }
    for pause in &spec.pause_nodes {
        if !node_ids.contains(pause.as_str()) {
            issues.push(GraphIssue::MissingReference {
                context: "pause set".into(),
                node: pause.clone(),
            });
        }
    }
    for node in &spec.nodes {
        if let NodeKind::Parallel { branches } = &node.kind {
            for branch in branches {
                if !node_ids.contains(branch.entry.as_str()) {
                    issues.push(GraphIssue::MissingReference {
                        context: format!("branch '{}' of node '{}'", branch.id, node.id),
                        node: branch.entry.clone(),
                    });
                }
            }
        }
    }

    // Dangling references make the remaining graph checks meaningless.
    if !issues.is_empty() {
        return issues;
    }

    let adjacency = build_adjacency(spec);

    if let Some(offender) = find_cycle(&adjacency) {
        issues.push(GraphIssue::Cycle(offender));
    }

    for unreachable in find_unreachable(spec, &adjacency) {
        issues.push(GraphIssue::Unreachable(unreachable));
    }

    issues
}

fn build_adjacency(spec: &GraphSpec) -> HashMap<&str, Vec<&str>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &spec.nodes {
        adjacency.entry(node.id.as_str()).or_default();
    }
    for edge in &spec.edges {
        adjacency
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }
    adjacency
}

/// Depth-first cycle detection; returns the first node found on a cycle.
fn find_cycle(adjacency: &HashMap<&str, Vec<&str>>) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Gray,
        Black,
    }

    let mut marks: HashMap<&str, Mark> = adjacency.keys().map(|&n| (n, Mark::White)).collect();
    // Deterministic iteration so the "first offending node" is stable.
    let mut start_nodes: Vec<&str> = adjacency.keys().copied().collect();
    start_nodes.sort_unstable();

    for start in start_nodes {
        if marks[start] != Mark::White {
            continue;
        }
        // Iterative DFS: (node, next child index)
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        marks.insert(start, Mark::Gray);

        while let Some(&(node, child_idx)) = stack.last() {
            let children = &adjacency[node];
            if child_idx >= children.len() {
                marks.insert(node, Mark::Black);
                stack.pop();
                continue;
            }
            if let Some(entry) = stack.last_mut() {
                entry.1 += 1;
            }

            let child = children[child_idx];
            match marks[child] {
                Mark::Gray => return Some(child.to_string()),
                Mark::White => {
                    marks.insert(child, Mark::Gray);
                    stack.push((child, 0));
                }
                Mark::Black => {}
            }
        }
    }
    None
}

/// Breadth-first reachability from the entry node, every named entry point,
/// and every parallel branch entry (branches jump, they do not follow edges).
fn find_unreachable<'a>(spec: &GraphSpec, adjacency: &HashMap<&'a str, Vec<&'a str>>) -> Vec<String> {
    let mut queue: VecDeque<&'a str> = VecDeque::new();
    let mut seen: HashSet<&'a str> = HashSet::new();

    let push_seed = |id: &str, queue: &mut VecDeque<&'a str>, seen: &mut HashSet<&'a str>| {
        // Seeds referencing missing nodes were already reported.
        if let Some((&key, _)) = adjacency.get_key_value(id) {
            if seen.insert(key) {
                queue.push_back(key);
            }
        }
    };

    push_seed(&spec.entry_node, &mut queue, &mut seen);
    for target in spec.entry_points.values() {
        push_seed(target, &mut queue, &mut seen);
    }
    for node in &spec.nodes {
        if let NodeKind::Parallel { branches } = &node.kind {
            for branch in branches {
                push_seed(&branch.entry, &mut queue, &mut seen);
            }
        }
    }

    while let Some(node) = queue.pop_front() {
        for &next in &adjacency[node] {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }

    let mut unreachable: Vec<String> = spec
        .nodes
        .iter()
        .filter(|n| !seen.contains(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect();
    unreachable.sort_unstable();
    unreachable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::node::{BranchSpec, Node};

    fn linear_spec() -> GraphSpec {
        GraphSpec::new("g1", "test goal")
            .with_nodes(vec![
                Node::task("a", "A", "noop"),
                Node::task("b", "B", "noop"),
                Node::task("c", "C", "noop"),
            ])
            .with_edges(vec![Edge::on_success("a", "b"), Edge::on_success("b", "c")])
            .with_entry("a")
            .with_terminals(vec!["c".into()])
    }

    #[test]
    fn test_valid_graph_has_no_issues() {
        assert!(validate(&linear_spec()).is_empty());
    }

    #[test]
    fn test_empty_graph() {
        let spec = GraphSpec::new("g", "goal").with_entry("a");
        assert_eq!(validate(&spec), vec![GraphIssue::EmptyGraph]);
    }

    #[test]
    fn test_dangling_edge() {
        let mut spec = linear_spec();
        spec.edges.push(Edge::on_success("c", "ghost"));
        let issues = validate(&spec);
        assert_eq!(issues.len(), 1);
        assert!(matches!(
            &issues[0],
            GraphIssue::DanglingEdge { missing, .. } if missing == "ghost"
        ));
    }

    #[test]
    fn test_missing_entry_node() {
        let mut spec = linear_spec();
        spec.entry_node = "ghost".into();
        let issues = validate(&spec);
        assert!(issues.contains(&GraphIssue::MissingEntryNode("ghost".into())));
    }

    #[test]
    fn test_cycle_detected() {
        let mut spec = linear_spec();
        spec.edges.push(Edge::on_success("c", "a"));
        let issues = validate(&spec);
        assert_eq!(issues.len(), 1);
        assert!(matches!(&issues[0], GraphIssue::Cycle(_)));
    }

    #[test]
    fn test_unreachable_node() {
        let mut spec = linear_spec();
        spec.nodes.push(Node::task("island", "Island", "noop"));
        let issues = validate(&spec);
        assert_eq!(issues, vec![GraphIssue::Unreachable("island".into())]);
    }

    #[test]
    fn test_branch_entry_counts_as_reachable() {
        let mut spec = linear_spec();
        spec.nodes.push(Node::parallel(
            "fan",
            "Fan",
            vec![BranchSpec::new("b1", "side")],
        ));
        spec.nodes.push(Node::task("side", "Side", "noop"));
        spec.edges.push(Edge::on_success("c", "fan"));
        assert!(validate(&spec).is_empty());
    }

    #[test]
    fn test_branch_missing_entry() {
        let mut spec = linear_spec();
        spec.nodes.push(Node::parallel(
            "fan",
            "Fan",
            vec![BranchSpec::new("b1", "ghost")],
        ));
        spec.edges.push(Edge::on_success("c", "fan"));
        let issues = validate(&spec);
        assert!(matches!(
            &issues[0],
            GraphIssue::MissingReference { node, .. } if node == "ghost"
        ));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let mut spec = linear_spec();
        spec.edges.push(Edge::on_failure("b", "b"));
        let issues = validate(&spec);
        assert_eq!(issues, vec![GraphIssue::Cycle("b".into())]);
    }
}
