use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use trellis_core::error::{Result, TrellisError};

use crate::edge::Edge;
use crate::node::Node;
use crate::validate::{validate, GraphIssue};

/// Serializable graph payload, as authored or loaded from storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSpec {
    /// Unique graph identifier.
    pub id: String,
    /// The goal this graph works toward.
    pub goal: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Default entry node id.
    pub entry_node: String,
    /// Named entry points -> entry node id.
    #[serde(default)]
    pub entry_points: HashMap<String, String>,
    /// Nodes that end the traversal successfully.
    #[serde(default)]
    pub terminal_nodes: Vec<String>,
    /// Nodes that suspend the traversal for outside action.
    #[serde(default)]
    pub pause_nodes: Vec<String>,
}

impl GraphSpec {
    pub fn new(id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            goal: goal.into(),
            ..Default::default()
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<Node>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_edges(mut self, edges: Vec<Edge>) -> Self {
        self.edges = edges;
        self
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry_node = entry.into();
        self
    }

    pub fn with_entry_point(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.entry_points.insert(name.into(), target.into());
        self
    }

    pub fn with_terminals(mut self, terminals: Vec<String>) -> Self {
        self.terminal_nodes = terminals;
        self
    }

    pub fn with_pauses(mut self, pauses: Vec<String>) -> Self {
        self.pause_nodes = pauses;
        self
    }
}

/// Immutable, validated graph with a compiled adjacency structure.
///
/// Built once from a `GraphSpec`; construction fails if the spec has any
/// structural issue, so an executor never sees an invalid graph. Outgoing
/// edges are pre-sorted by priority per source node.
pub struct Graph {
    id: String,
    goal: String,
    nodes: HashMap<String, Node>,
    adjacency: HashMap<String, Vec<Edge>>,
    entry_node: String,
    entry_points: HashMap<String, String>,
    terminal_nodes: HashSet<String>,
    pause_nodes: HashSet<String>,
}

impl Graph {
    /// Validate and compile a graph specification.
    pub fn from_spec(spec: GraphSpec) -> Result<Self> {
        let issues = validate(&spec);
        if !issues.is_empty() {
            let joined = issues
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(TrellisError::Graph(joined));
        }

        let mut adjacency: HashMap<String, Vec<Edge>> = HashMap::new();
        for node in &spec.nodes {
            adjacency.entry(node.id.clone()).or_default();
        }
        for edge in spec.edges {
            adjacency.entry(edge.from.clone()).or_default().push(edge);
        }
        for outgoing in adjacency.values_mut() {
            outgoing.sort_by_key(|e| e.priority);
        }

        let nodes: HashMap<String, Node> =
            spec.nodes.into_iter().map(|n| (n.id.clone(), n)).collect();

        debug!(
            graph_id = %spec.id,
            nodes = nodes.len(),
            "Graph compiled"
        );

        Ok(Self {
            id: spec.id,
            goal: spec.goal,
            nodes,
            adjacency,
            entry_node: spec.entry_node,
            entry_points: spec.entry_points,
            terminal_nodes: spec.terminal_nodes.into_iter().collect(),
            pause_nodes: spec.pause_nodes.into_iter().collect(),
        })
    }

    /// Validate a spec without building (ok | list of structural errors).
    pub fn check(spec: &GraphSpec) -> Vec<GraphIssue> {
        validate(spec)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Human-readable name for a node id, falling back to the raw id when
    /// the node cannot be looked up. Never fails on an unknown id.
    pub fn node_name(&self, id: &str) -> String {
        self.nodes
            .get(id)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Outgoing edges from a node, sorted by priority.
    pub fn outgoing(&self, id: &str) -> &[Edge] {
        self.adjacency.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn entry_node(&self) -> &str {
        &self.entry_node
    }

    /// Resolve a named entry point to its entry node.
    pub fn entry_for(&self, entry_point: &str) -> Option<&str> {
        self.entry_points.get(entry_point).map(|s| s.as_str())
    }

    pub fn entry_points(&self) -> &HashMap<String, String> {
        &self.entry_points
    }

    pub fn is_terminal(&self, id: &str) -> bool {
        self.terminal_nodes.contains(id)
    }

    pub fn is_pause(&self, id: &str) -> bool {
        self.pause_nodes.contains(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Edge;
    use crate::node::Node;

    fn spec() -> GraphSpec {
        GraphSpec::new("g1", "review pipeline")
            .with_nodes(vec![
                Node::task("draft", "Draft", "llm"),
                Node::task("review", "Review", "llm"),
                Node::task("publish", "Publish", "shell"),
            ])
            .with_edges(vec![
                Edge::on_success("draft", "review"),
                Edge::on_success("review", "publish").with_priority(1),
                Edge::on_failure("review", "draft2").with_priority(0),
            ])
            .with_entry("draft")
            .with_terminals(vec!["publish".into()])
    }

    #[test]
    fn test_invalid_spec_rejected() {
        let graph = Graph::from_spec(spec());
        // The on_failure edge targets a missing node.
        assert!(graph.is_err());
    }

    #[test]
    fn test_compiled_adjacency_sorted_by_priority() {
        let mut s = spec();
        s.nodes.push(Node::task("draft2", "Redraft", "llm"));
        s.edges.push(Edge::on_success("draft2", "publish"));
        let graph = Graph::from_spec(s).unwrap();

        let outgoing = graph.outgoing("review");
        assert_eq!(outgoing.len(), 2);
        // priority 0 edge (on_failure -> draft2) comes first
        assert_eq!(outgoing[0].to, "draft2");
        assert_eq!(outgoing[1].to, "publish");
    }

    #[test]
    fn test_node_name_fallback() {
        let mut s = spec();
        s.edges.pop();
        let graph = Graph::from_spec(s).unwrap();
        assert_eq!(graph.node_name("draft"), "Draft");
        assert_eq!(graph.node_name("nope"), "nope");
    }

    #[test]
    fn test_entry_points() {
        let mut s = spec();
        s.edges.pop();
        let s = s.with_entry_point("reviews", "review");
        let graph = Graph::from_spec(s).unwrap();
        assert_eq!(graph.entry_for("reviews"), Some("review"));
        assert_eq!(graph.entry_for("missing"), None);
        assert_eq!(graph.entry_node(), "draft");
    }

    #[test]
    fn test_terminal_and_pause_lookup() {
        let mut s = spec();
        s.edges.pop();
        let graph = Graph::from_spec(s).unwrap();
        assert!(graph.is_terminal("publish"));
        assert!(!graph.is_terminal("draft"));
        assert!(!graph.is_pause("draft"));
    }

    #[test]
    fn test_spec_json_roundtrip() {
        let mut s = spec();
        s.edges.pop();
        let json = serde_json::to_string(&s).unwrap();
        let parsed: GraphSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "g1");
        assert_eq!(parsed.nodes.len(), 3);
        assert!(Graph::from_spec(parsed).is_ok());
    }
}
