//! Immutable declarative description of an agent workflow.
//!
//! A workflow is a directed graph of `Node`s connected by `Edge`s. Nodes
//! carry declared input/output keys and a closed set of kinds (task,
//! parallel fan-out, human pause). Edges carry a condition, a priority
//! for tie-breaking, and (for delegate conditions) an explicit failure
//! policy.
//!
//! A `Graph` is built once from a serializable `GraphSpec`, validated
//! structurally at construction (dangling references, missing entry,
//! cycles, unreachable nodes), and read-only afterward. Outgoing edges
//! are compiled into a per-node adjacency list sorted by priority so the
//! executor never re-scans the edge set.

pub mod edge;
pub mod graph;
pub mod node;
pub mod validate;

pub use edge::{evaluate_predicate, DelegatePolicy, Edge, EdgeCondition};
pub use graph::{Graph, GraphSpec};
pub use node::{BranchSpec, Node, NodeKind};
pub use validate::{validate, GraphIssue};
