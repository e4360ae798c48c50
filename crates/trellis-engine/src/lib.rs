//! Execution engine: graph traversal, run-wide retry budget, durable
//! checkpoints, execution streams, and the top-level runtime.

pub mod checkpoint;
pub mod executor;
pub mod handlers;
pub mod memory;
pub mod retry;
pub mod runtime;
pub mod stream;

pub use checkpoint::{Checkpoint, CheckpointStore, ResumeState};
pub use executor::GraphExecutor;
pub use handlers::HandlerRegistry;
pub use memory::RunMemory;
pub use retry::{RetryController, RetryDecision};
pub use runtime::{AgentRuntime, EntryPointSpec};
pub use stream::ExecutionStream;
