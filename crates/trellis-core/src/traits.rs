use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{NodeContext, NodeOutcome, RunId, RunRecord, RunStatus, RunSummary};

/// Node handler: the body of a task node.
///
/// The executor depends only on this contract, never on a specific
/// provider. Handlers are registered by name and dispatched per node.
pub trait NodeHandler: Send + Sync + 'static {
    /// Handler name (referenced by a node's `kind`).
    fn name(&self) -> &str;

    /// Execute the node with the given context.
    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>>;
}

/// Decision engine that resolves delegate edge conditions.
///
/// May be absent at execution time, in which case the edge's configured
/// failure policy governs behavior.
pub trait DecisionEngine: Send + Sync + 'static {
    /// Decide whether to traverse an edge, given the source node's output
    /// and the accumulated run memory.
    fn decide(
        &self,
        prompt: &str,
        source_output: &serde_json::Value,
        memory: &HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<bool>>;
}

/// Durable persistence backend for run records.
///
/// Implementations may buffer writes, but `immediate = true` must be
/// durable before the returned future resolves, and `stop()` must flush
/// anything still buffered.
pub trait RunStore: Send + Sync + 'static {
    /// Start background machinery (flush tasks).
    fn start(&self) -> BoxFuture<'_, Result<()>>;

    /// Flush and stop background machinery.
    fn stop(&self) -> BoxFuture<'_, Result<()>>;

    /// Persist a run record. `immediate` bypasses any write buffer.
    fn save_run(&self, record: &RunRecord, immediate: bool) -> BoxFuture<'_, Result<()>>;

    fn load_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>>;

    fn load_summary(&self, id: &RunId) -> BoxFuture<'_, Result<Option<RunSummary>>>;

    /// Returns true if a record was deleted.
    fn delete_run(&self, id: &RunId) -> BoxFuture<'_, Result<bool>>;

    fn runs_by_goal(&self, goal: &str) -> BoxFuture<'_, Result<Vec<RunSummary>>>;

    fn runs_by_status(&self, status: RunStatus) -> BoxFuture<'_, Result<Vec<RunSummary>>>;

    /// Runs whose execution path visited the given node.
    fn runs_by_node(&self, node_id: &str) -> BoxFuture<'_, Result<Vec<RunSummary>>>;

    fn list_all_runs(&self) -> BoxFuture<'_, Result<Vec<RunSummary>>>;
}
