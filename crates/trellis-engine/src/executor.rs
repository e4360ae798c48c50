use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use trellis_core::config::{CheckpointConfig, RetryConfig};
use trellis_core::error::{ErrorClass, Result, TrellisError};
use trellis_core::event::EventBus;
use trellis_core::traits::DecisionEngine;
use trellis_core::types::{
    ExecEvent, ExecEventKind, NodeContext, NodeOutcome, RunId, RunResult, RunStatus,
};
use trellis_graph::{evaluate_predicate, DelegatePolicy, EdgeCondition, Graph, Node, NodeKind};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::handlers::HandlerRegistry;
use crate::memory::RunMemory;
use crate::retry::RetryController;

/// Mutable state of one traversal (root run or parallel branch).
struct ExecState {
    run_id: RunId,
    memory: RunMemory,
    path: Vec<String>,
    step: u64,
    total_tokens: u64,
    total_latency_ms: u64,
}

impl ExecState {
    fn new(run_id: RunId, memory: RunMemory) -> Self {
        Self {
            run_id,
            memory,
            path: Vec::new(),
            step: 0,
            total_tokens: 0,
            total_latency_ms: 0,
        }
    }
}

/// How a traversal ended.
struct Terminal {
    status: RunStatus,
    error: Option<String>,
}

impl Terminal {
    fn ok(status: RunStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(error.into()),
        }
    }

    fn cancelled() -> Self {
        Self {
            status: RunStatus::Cancelled,
            error: Some("execution cancelled".into()),
        }
    }
}

/// Walks a validated `Graph` for one execution.
///
/// The executor validates declared inputs on node entry, dispatches the
/// node by kind, merges declared outputs into run memory, writes a
/// checkpoint, and follows the first satisfied outgoing edge in priority
/// order. Node errors are classified (retriable / fatal / validation /
/// dependency); retriable ones draw from the run-wide retry budget.
pub struct GraphExecutor {
    graph: Arc<Graph>,
    handlers: Arc<HandlerRegistry>,
    decision: Option<Arc<dyn DecisionEngine>>,
    checkpoints: Option<Arc<CheckpointStore>>,
    events: Arc<EventBus>,
    retry_config: RetryConfig,
    checkpoint_config: CheckpointConfig,
    cancel: CancellationToken,
}

impl GraphExecutor {
    pub fn new(graph: Arc<Graph>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            graph,
            handlers,
            decision: None,
            checkpoints: None,
            events: Arc::new(EventBus::default()),
            retry_config: RetryConfig::default(),
            checkpoint_config: CheckpointConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_decision_engine(mut self, engine: Arc<dyn DecisionEngine>) -> Self {
        self.decision = Some(engine);
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn with_checkpoint_config(mut self, config: CheckpointConfig) -> Self {
        self.checkpoint_config = config;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Execute the graph from `start_node` with the given trigger input.
    ///
    /// Traversal failures are reported in the returned `RunResult`
    /// (`success = false`, error string, path walked so far), never as Err.
    pub async fn execute(
        &self,
        run_id: RunId,
        start_node: &str,
        input: HashMap<String, serde_json::Value>,
    ) -> RunResult {
        let started = Instant::now();
        let retry = RetryController::new(self.retry_config.clone());
        let mut state = ExecState::new(run_id, RunMemory::from_map(input));

        let terminal = self
            .drive(&mut state, &retry, start_node.to_string(), true)
            .await;

        self.finish(state, &retry, terminal, started)
    }

    /// Resume a run from its latest checkpoint.
    ///
    /// Reconstructs the execution exactly at the node after the
    /// checkpointed one; nothing already committed is replayed.
    pub async fn resume(&self, run_id: RunId) -> Result<RunResult> {
        let store = self.checkpoints.as_ref().ok_or_else(|| {
            TrellisError::Checkpoint("no checkpoint store configured".into())
        })?;
        let cp = store.load_latest(&run_id.0)?.ok_or_else(|| {
            TrellisError::Checkpoint(format!("no checkpoint for run {}", run_id))
        })?;
        let resume = CheckpointStore::to_resume_state(&cp)?;

        info!(
            run_id = %run_id,
            step = resume.step,
            resume_from = resume.resume_from.as_deref().unwrap_or("<complete>"),
            "Resuming from checkpoint"
        );

        let started = Instant::now();
        let retry = RetryController::with_consumed(self.retry_config.clone(), resume.total_retries);
        let mut state = ExecState::new(run_id, resume.memory);
        state.path = resume.path;
        state.step = resume.step;
        state.total_tokens = resume.total_tokens;

        let terminal = match resume.resume_from {
            Some(node) => self.drive(&mut state, &retry, node, true).await,
            // Checkpoint was written at a completed traversal boundary.
            None => Terminal::ok(RunStatus::Succeeded),
        };

        Ok(self.finish(state, &retry, terminal, started))
    }

    fn finish(
        &self,
        state: ExecState,
        retry: &RetryController,
        terminal: Terminal,
        started: Instant,
    ) -> RunResult {
        RunResult {
            run_id: state.run_id,
            success: terminal.status == RunStatus::Succeeded,
            status: terminal.status,
            path: state.path,
            memory: state.memory.into_map(),
            error: terminal.error,
            total_retries: retry.total_retries(),
            total_tokens: state.total_tokens,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// The traversal loop. `root` traversals honor pause nodes and write
    /// checkpoints; branch traversals do neither (their work becomes
    /// durable when the fan-out node commits).
    fn drive<'a>(
        &'a self,
        state: &'a mut ExecState,
        retry: &'a RetryController,
        start_node: String,
        root: bool,
    ) -> BoxFuture<'a, Terminal> {
        Box::pin(async move {
            let mut current = start_node;

            loop {
                if self.cancel.is_cancelled() {
                    return Terminal::cancelled();
                }

                let node = match self.graph.node(&current) {
                    Some(n) => n,
                    None => {
                        return Terminal::failed(
                            TrellisError::NodeNotFound(current.clone()).to_string(),
                        )
                    }
                };

                // Pause nodes suspend the traversal; the successor is
                // selected now so the checkpoint knows where to resume.
                if matches!(node.kind, NodeKind::Pause) || self.graph.is_pause(&current) {
                    state.path.push(current.clone());
                    if !root {
                        // A branch cannot suspend the whole run; it simply ends.
                        return Terminal::ok(RunStatus::Succeeded);
                    }
                    let next = match self
                        .select_edge(state, node, true, &serde_json::Value::Null)
                        .await
                    {
                        Ok(next) => next,
                        Err(e) => return Terminal::failed(e.to_string()),
                    };
                    state.step += 1;
                    if let Err(e) =
                        self.write_checkpoint(state, retry, &current, next.as_deref(), true)
                    {
                        return Terminal::failed(e.to_string());
                    }
                    info!(run_id = %state.run_id, node_id = %current, "Run paused");
                    self.events.publish(ExecEvent::now(
                        state.run_id.clone(),
                        ExecEventKind::RunPaused {
                            node_id: current.clone(),
                        },
                    ));
                    return Terminal::ok(RunStatus::Paused);
                }

                // Declared inputs must be present before dispatch.
                let missing = state.memory.missing_inputs(&node.input_keys);
                if !missing.is_empty() {
                    let err = TrellisError::InputValidation {
                        node: current.clone(),
                        keys: missing,
                    };
                    error!(run_id = %state.run_id, node_id = %current, error = %err, "Input validation failed");
                    self.events.publish(ExecEvent::now(
                        state.run_id.clone(),
                        ExecEventKind::NodeError {
                            node_id: current.clone(),
                            error: err.to_string(),
                        },
                    ));
                    return Terminal::failed(err.to_string());
                }

                info!(run_id = %state.run_id, node_id = %node.id, node_name = %node.name, "Executing node");
                self.events.publish(ExecEvent::now(
                    state.run_id.clone(),
                    ExecEventKind::NodeStarted {
                        node_id: current.clone(),
                    },
                ));

                // Attempt loop: re-enters the same node while the retry
                // budget grants it. Each attempt is recorded in the path.
                let (outcome, elapsed_ms) = loop {
                    state.path.push(current.clone());
                    let attempt_start = Instant::now();
                    let result = self.invoke(state, retry, node).await;
                    let elapsed_ms = attempt_start.elapsed().as_millis() as u64;

                    match result {
                        Ok(outcome) => break (outcome, elapsed_ms),
                        Err(TrellisError::Cancelled) => return Terminal::cancelled(),
                        Err(e) => {
                            self.events.publish(ExecEvent::now(
                                state.run_id.clone(),
                                ExecEventKind::NodeError {
                                    node_id: current.clone(),
                                    error: e.to_string(),
                                },
                            ));

                            match ErrorClass::of(&e) {
                                ErrorClass::Retriable => {
                                    let decision = retry.request_retry(&current, &e);
                                    if decision.allowed {
                                        warn!(
                                            run_id = %state.run_id,
                                            node_id = %current,
                                            retry_index = decision.retry_index,
                                            delay_ms = decision.delay.as_millis() as u64,
                                            error = %e,
                                            "Retrying node"
                                        );
                                        self.events.publish(ExecEvent::now(
                                            state.run_id.clone(),
                                            ExecEventKind::RetryScheduled {
                                                node_id: current.clone(),
                                                retry_index: decision.retry_index,
                                                delay_ms: decision.delay.as_millis() as u64,
                                            },
                                        ));
                                        tokio::select! {
                                            _ = self.cancel.cancelled() => return Terminal::cancelled(),
                                            _ = tokio::time::sleep(decision.delay) => {}
                                        }
                                        continue;
                                    }

                                    let err = TrellisError::RetryBudgetExhausted {
                                        node: current.clone(),
                                        consumed: retry.total_retries(),
                                        ceiling: self.retry_config.max_total_retries,
                                    };
                                    error!(run_id = %state.run_id, node_id = %current, error = %err, "Retry budget exhausted");
                                    return Terminal::failed(err.to_string());
                                }
                                class => {
                                    error!(
                                        run_id = %state.run_id,
                                        node_id = %current,
                                        class = ?class,
                                        error = %e,
                                        "Node failed"
                                    );
                                    return Terminal::failed(e.to_string());
                                }
                            }
                        }
                    }
                };

                state.total_tokens += outcome.tokens_used;
                state.total_latency_ms += elapsed_ms;

                // Commit outputs and a status key for conditional edges.
                state.memory.ingest_output(&node.output_keys, &outcome.output);
                state.memory.set_str(
                    format!("{}_status", current),
                    if outcome.success { "success" } else { "failure" },
                );
                if let Some(ref err) = outcome.error {
                    state.memory.set_str(format!("{}_error", current), err.clone());
                }

                debug!(
                    run_id = %state.run_id,
                    node_id = %current,
                    succeeded = outcome.success,
                    elapsed_ms,
                    "Node execution complete"
                );
                if outcome.success {
                    self.events.publish(ExecEvent::now(
                        state.run_id.clone(),
                        ExecEventKind::NodeCompleted {
                            node_id: current.clone(),
                            latency_ms: elapsed_ms,
                        },
                    ));
                } else {
                    self.events.publish(ExecEvent::now(
                        state.run_id.clone(),
                        ExecEventKind::NodeError {
                            node_id: current.clone(),
                            error: outcome
                                .error
                                .clone()
                                .unwrap_or_else(|| "node reported failure".into()),
                        },
                    ));
                }

                state.step += 1;
                let is_terminal = self.graph.is_terminal(&current);

                let next = if is_terminal {
                    None
                } else {
                    match self
                        .select_edge(state, node, outcome.success, &outcome.output)
                        .await
                    {
                        Ok(next) => next,
                        Err(e) => {
                            error!(run_id = %state.run_id, node_id = %current, error = %e, "Edge escalation");
                            return Terminal::failed(e.to_string());
                        }
                    }
                };

                // The node transition is durable only once checkpointed.
                if root {
                    if let Err(e) =
                        self.write_checkpoint(state, retry, &current, next.as_deref(), next.is_none())
                    {
                        return Terminal::failed(e.to_string());
                    }
                }

                match next {
                    Some(n) => current = n,
                    None => {
                        debug!(run_id = %state.run_id, node_id = %current, "Traversal complete");
                        return if outcome.success {
                            Terminal::ok(RunStatus::Succeeded)
                        } else {
                            Terminal::failed(outcome.error.unwrap_or_else(|| {
                                format!("node '{}' failed with no failure route", current)
                            }))
                        };
                    }
                }
            }
        })
    }

    /// Dispatch one node by kind.
    async fn invoke(
        &self,
        state: &mut ExecState,
        retry: &RetryController,
        node: &Node,
    ) -> Result<NodeOutcome> {
        match &node.kind {
            NodeKind::Task { handler } => {
                let handler_impl =
                    self.handlers
                        .get(handler)
                        .ok_or_else(|| TrellisError::HandlerNotFound {
                            node: node.id.clone(),
                            handler: handler.clone(),
                        })?;

                let ctx = NodeContext {
                    run_id: state.run_id.clone(),
                    node_id: node.id.clone(),
                    input_keys: node.input_keys.clone(),
                    output_keys: node.output_keys.clone(),
                    memory: state.memory.data().clone(),
                };

                tokio::select! {
                    _ = self.cancel.cancelled() => Err(TrellisError::Cancelled),
                    result = handler_impl.execute(ctx) => result,
                }
            }
            NodeKind::Parallel { branches } => self.fan_out(state, retry, node, branches).await,
            // Pause is intercepted in the traversal loop before dispatch.
            NodeKind::Pause => Ok(NodeOutcome::json(serde_json::Value::Null)),
        }
    }

    /// Run all branches concurrently; every branch must complete, and any
    /// branch failure fails the fan-out node.
    async fn fan_out(
        &self,
        state: &mut ExecState,
        retry: &RetryController,
        node: &Node,
        branches: &[trellis_graph::BranchSpec],
    ) -> Result<NodeOutcome> {
        info!(
            run_id = %state.run_id,
            node_id = %node.id,
            branches = branches.len(),
            "Fanning out parallel branches"
        );

        let futs: Vec<_> = branches
            .iter()
            .map(|branch| {
                let mut branch_state =
                    ExecState::new(state.run_id.clone(), state.memory.clone());
                async move {
                    let terminal = self
                        .drive(&mut branch_state, retry, branch.entry.clone(), false)
                        .await;
                    (branch, branch_state, terminal)
                }
            })
            .collect();

        let results = futures::future::join_all(futs).await;

        let mut failures: Vec<String> = Vec::new();
        let mut merged: Vec<(RunMemory, Vec<String>, u64, &str)> = Vec::new();

        for (branch, branch_state, terminal) in results {
            match terminal.status {
                RunStatus::Succeeded | RunStatus::Paused => {
                    merged.push((
                        branch_state.memory,
                        branch_state.path,
                        branch_state.total_tokens,
                        branch.id.as_str(),
                    ));
                }
                _ => {
                    // Report the branch by display name when the entry node
                    // resolves, falling back to the raw branch id.
                    let display_name = if self.graph.node(&branch.entry).is_some() {
                        self.graph.node_name(&branch.entry)
                    } else {
                        branch.id.clone()
                    };
                    let detail = terminal
                        .error
                        .unwrap_or_else(|| "branch failed without detail".into());
                    warn!(
                        run_id = %state.run_id,
                        node_id = %node.id,
                        branch = %display_name,
                        error = %detail,
                        "Parallel branch failed"
                    );
                    failures.push(format!("branch '{}': {}", display_name, detail));
                }
            }
        }

        if !failures.is_empty() {
            return Err(TrellisError::NodeExecution {
                node: node.id.clone(),
                message: format!("parallel branch failure: {}", failures.join("; ")),
            });
        }

        let mut output = serde_json::Map::new();
        for (memory, path, tokens, branch_id) in merged {
            state.memory.merge(&memory);
            state.path.extend(path);
            state.total_tokens += tokens;
            output.insert(branch_id.to_string(), serde_json::json!("success"));
        }

        Ok(NodeOutcome::json(serde_json::Value::Object(output)))
    }

    /// Evaluate outgoing edges in priority order; the first satisfied edge
    /// wins. Delegate conditions without a working decision engine follow
    /// the edge's explicit failure policy.
    async fn select_edge(
        &self,
        state: &ExecState,
        node: &Node,
        succeeded: bool,
        output: &serde_json::Value,
    ) -> Result<Option<String>> {
        for edge in self.graph.outgoing(&node.id) {
            let matches = match &edge.condition {
                EdgeCondition::OnSuccess => succeeded,
                EdgeCondition::OnFailure => !succeeded,
                EdgeCondition::Predicate { expr } => {
                    evaluate_predicate(expr, state.memory.data())
                }
                EdgeCondition::Delegate { prompt, on_failure } => {
                    let taken = self
                        .delegate_decision(state, edge, prompt, *on_failure, output)
                        .await?;
                    self.events.publish(ExecEvent::now(
                        state.run_id.clone(),
                        ExecEventKind::DecisionMade {
                            from: edge.from.clone(),
                            to: edge.to.clone(),
                            taken,
                        },
                    ));
                    taken
                }
            };

            if matches {
                return Ok(Some(edge.to.clone()));
            }
        }
        Ok(None)
    }

    async fn delegate_decision(
        &self,
        state: &ExecState,
        edge: &trellis_graph::Edge,
        prompt: &str,
        on_failure: DelegatePolicy,
        output: &serde_json::Value,
    ) -> Result<bool> {
        let engine = match &self.decision {
            Some(engine) => engine,
            None => {
                return match on_failure {
                    DelegatePolicy::Proceed => {
                        warn!(
                            from = %edge.from,
                            to = %edge.to,
                            "No decision engine; policy proceed, taking edge"
                        );
                        Ok(true)
                    }
                    DelegatePolicy::Skip => {
                        warn!(
                            from = %edge.from,
                            to = %edge.to,
                            "No decision engine; policy skip, not taking edge"
                        );
                        Ok(false)
                    }
                    DelegatePolicy::Escalate => Err(TrellisError::DecisionUnavailable {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                    }),
                }
            }
        };

        match engine.decide(prompt, output, state.memory.data()).await {
            Ok(answer) => Ok(answer),
            Err(e) => match on_failure {
                DelegatePolicy::Proceed => {
                    warn!(from = %edge.from, to = %edge.to, error = %e, "Decision failed; policy proceed");
                    Ok(true)
                }
                DelegatePolicy::Skip => {
                    warn!(from = %edge.from, to = %edge.to, error = %e, "Decision failed; policy skip");
                    Ok(false)
                }
                DelegatePolicy::Escalate => Err(TrellisError::DecisionEscalated {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    message: e.to_string(),
                }),
            },
        }
    }

    /// Write a checkpoint for the just-committed node. `always` bypasses
    /// the every-N-steps cadence (terminal and pause boundaries).
    fn write_checkpoint(
        &self,
        state: &ExecState,
        retry: &RetryController,
        node_id: &str,
        resume_node: Option<&str>,
        always: bool,
    ) -> Result<()> {
        let store = match &self.checkpoints {
            Some(store) if self.checkpoint_config.enabled => store,
            _ => return Ok(()),
        };

        let every = self.checkpoint_config.every_n_steps.max(1);
        if !always && state.step % every != 0 {
            return Ok(());
        }

        let cp = Checkpoint {
            run_id: state.run_id.0.clone(),
            step: state.step,
            node_id: node_id.to_string(),
            resume_node: resume_node.map(String::from),
            memory_json: serde_json::to_string(&state.memory)?,
            path_json: serde_json::to_string(&state.path)?,
            total_retries: retry.total_retries(),
            total_tokens: state.total_tokens,
            total_latency_ms: state.total_latency_ms,
            timestamp: Utc::now(),
        };
        store.save(&cp)?;

        self.events.publish(ExecEvent::now(
            state.run_id.clone(),
            ExecEventKind::CheckpointSaved {
                step: state.step,
                node_id: node_id.to_string(),
            },
        ));
        Ok(())
    }
}
