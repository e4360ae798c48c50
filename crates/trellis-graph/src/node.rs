use serde::{Deserialize, Serialize};

/// A node in the execution graph.
///
/// Input/output keys define what data flows in and out of this node via
/// the shared run memory. The kind is a closed set: new node kinds are
/// explicit, exhaustively handled additions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// What this node does when entered.
    #[serde(default)]
    pub kind: NodeKind,
    /// Keys that must be present in run memory before this node executes.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Keys this node's output is merged into run memory under.
    #[serde(default)]
    pub output_keys: Vec<String>,
}

/// Closed set of node kinds with a uniform execute contract per variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Dispatch to a registered `NodeHandler` by name.
    Task { handler: String },
    /// Fan out into concurrent sub-traversals, one per branch.
    Parallel { branches: Vec<BranchSpec> },
    /// Stop the traversal and wait for outside action.
    Pause,
}

impl Default for NodeKind {
    fn default() -> Self {
        Self::Task {
            handler: "default".into(),
        }
    }
}

/// One branch of a parallel fan-out node.
///
/// Each branch is an independent sub-traversal starting at `entry` and
/// running until it has no eligible outgoing edge or reaches a terminal
/// node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchSpec {
    /// Branch identifier, unique within the fan-out node.
    pub id: String,
    /// Node id the branch traversal starts at.
    pub entry: String,
}

impl Node {
    /// Create a task node dispatching to the given handler.
    pub fn task(id: impl Into<String>, name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::Task {
                handler: handler.into(),
            },
            input_keys: vec![],
            output_keys: vec![],
        }
    }

    /// Create a parallel fan-out node.
    pub fn parallel(
        id: impl Into<String>,
        name: impl Into<String>,
        branches: Vec<BranchSpec>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::Parallel { branches },
            input_keys: vec![],
            output_keys: vec![],
        }
    }

    /// Create a human-pause node.
    pub fn pause(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::Pause,
            input_keys: vec![],
            output_keys: vec![],
        }
    }

    /// Set the input keys.
    pub fn with_inputs(mut self, keys: Vec<String>) -> Self {
        self.input_keys = keys;
        self
    }

    /// Set the output keys.
    pub fn with_outputs(mut self, keys: Vec<String>) -> Self {
        self.output_keys = keys;
        self
    }
}

impl BranchSpec {
    pub fn new(id: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entry: entry.into(),
        }
    }
}
