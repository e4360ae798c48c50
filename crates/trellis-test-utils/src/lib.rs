//! Test doubles for the execution engine: handlers that succeed, fail a
//! scripted number of times, or sleep, and decision engines with fixed
//! answers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::{DecisionEngine, NodeHandler};
use trellis_core::types::{NodeContext, NodeOutcome};

/// Returns a fixed JSON value (or the node id as text when none is given).
pub struct EchoHandler {
    name: String,
    output: Option<serde_json::Value>,
}

impl EchoHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }
}

impl NodeHandler for EchoHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        let output = self
            .output
            .clone()
            .unwrap_or(serde_json::Value::String(ctx.node_id));
        Box::pin(async move { Ok(NodeOutcome::json(output)) })
    }
}

/// Fails with a retriable timeout the first `fail_times` invocations, then
/// succeeds. Counts invocations across all nodes it serves.
pub struct FlakyHandler {
    name: String,
    fail_times: u32,
    calls: AtomicU32,
}

impl FlakyHandler {
    pub fn new(name: impl Into<String>, fail_times: u32) -> Self {
        Self {
            name: name.into(),
            fail_times,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NodeHandler for FlakyHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = attempt < self.fail_times;
        Box::pin(async move {
            if fail {
                Err(TrellisError::NodeTimeout {
                    node: ctx.node_id,
                    timeout_secs: 1,
                })
            } else {
                Ok(NodeOutcome::text("recovered"))
            }
        })
    }
}

/// Always fails, with a fatal (non-transient) error.
pub struct FatalHandler {
    name: String,
}

impl FatalHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl NodeHandler for FatalHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move {
            Err(TrellisError::NodeExecution {
                node: ctx.node_id,
                message: "unrecoverable handler failure".into(),
            })
        })
    }
}

/// Completes with a soft failure (`success = false`), which routes the
/// traversal to on-failure edges rather than the retry budget.
pub struct SoftFailHandler {
    name: String,
}

impl SoftFailHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl NodeHandler for SoftFailHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        Box::pin(async move { Ok(NodeOutcome::failure("quality gate rejected the output")) })
    }
}

/// Sleeps before succeeding; useful for concurrency-ceiling and
/// cancellation tests.
pub struct SlowHandler {
    name: String,
    delay: Duration,
}

impl SlowHandler {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }
}

impl NodeHandler for SlowHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(NodeOutcome::text(ctx.node_id))
        })
    }
}

/// Records every invocation and returns its node id; lets tests assert
/// dispatch order and counts.
pub struct RecordingHandler {
    name: String,
    invocations: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }
}

impl NodeHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<NodeOutcome>> {
        self.invocations.lock().unwrap().push(ctx.node_id.clone());
        Box::pin(async move { Ok(NodeOutcome::text(ctx.node_id)) })
    }
}

/// Decision engine with a fixed answer for every prompt.
pub struct FixedDecisionEngine {
    answer: bool,
}

impl FixedDecisionEngine {
    pub fn new(answer: bool) -> Self {
        Self { answer }
    }
}

impl DecisionEngine for FixedDecisionEngine {
    fn decide(
        &self,
        _prompt: &str,
        _source_output: &serde_json::Value,
        _memory: &HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<bool>> {
        let answer = self.answer;
        Box::pin(async move { Ok(answer) })
    }
}

/// Decision engine that always errors, exercising delegate failure policies.
pub struct BrokenDecisionEngine;

impl DecisionEngine for BrokenDecisionEngine {
    fn decide(
        &self,
        _prompt: &str,
        _source_output: &serde_json::Value,
        _memory: &HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            Err(TrellisError::NodeExecution {
                node: "decision".into(),
                message: "decision backend unavailable".into(),
            })
        })
    }
}
