//! Trellis: an agent graph execution core.
//!
//! A workflow is a directed graph of nodes (task, parallel fan-out,
//! pause) joined by conditional edges. The engine walks it with a
//! run-wide retry budget, checkpoints every committed node so runs
//! survive a crash, and persists run records through a pluggable store.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use trellis::{AgentRuntime, Edge, Graph, GraphSpec, HandlerRegistry, Node};
//!
//! # async fn demo(registry: HandlerRegistry) -> trellis::Result<()> {
//! let spec = GraphSpec::new("review", "draft and publish")
//!     .with_nodes(vec![
//!         Node::task("draft", "Draft", "writer"),
//!         Node::task("publish", "Publish", "publisher"),
//!     ])
//!     .with_edges(vec![Edge::on_success("draft", "publish")])
//!     .with_entry("draft")
//!     .with_terminals(vec!["publish".into()]);
//!
//! let runtime = AgentRuntime::new(Arc::new(Graph::from_spec(spec)?), registry);
//! runtime.start().await?;
//! let result = runtime
//!     .trigger_and_wait("main", HashMap::new(), None, Duration::from_secs(60))
//!     .await?;
//! runtime.stop().await?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

pub use trellis_core::config::{
    CheckpointConfig, EngineConfig, RetentionPolicy, RetryConfig, RuntimeConfig, StoreConfig,
};
pub use trellis_core::error::{ErrorClass, Result, TrellisError};
pub use trellis_core::event::EventBus;
pub use trellis_core::traits::{DecisionEngine, NodeHandler, RunStore};
pub use trellis_core::types::{
    ExecEvent, ExecEventKind, NodeContext, NodeOutcome, RunId, RunRecord, RunResult, RunStatus,
    RunSummary,
};

pub use trellis_graph::{
    evaluate_predicate, BranchSpec, DelegatePolicy, Edge, EdgeCondition, Graph, GraphIssue,
    GraphSpec, Node, NodeKind,
};

pub use trellis_engine::{
    AgentRuntime, Checkpoint, CheckpointStore, EntryPointSpec, ExecutionStream, GraphExecutor,
    HandlerRegistry, ResumeState, RetryController, RunMemory,
};

pub use trellis_store::{MemoryRunStore, SqliteRunStore};
