use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use trellis_core::config::EngineConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::EventBus;
use trellis_core::traits::{DecisionEngine, RunStore};
use trellis_core::types::{ExecEvent, RunId, RunResult};
use trellis_graph::Graph;

use crate::checkpoint::CheckpointStore;
use crate::executor::GraphExecutor;
use crate::handlers::HandlerRegistry;
use crate::stream::ExecutionStream;

/// A named way into the graph.
#[derive(Debug, Clone)]
pub struct EntryPointSpec {
    pub name: String,
    /// Node id the triggered run starts at.
    pub node: String,
}

/// Top-level runtime owning the graph, its streams, and the stores.
///
/// Lifecycle: register entry points, `start()`, `trigger()` runs,
/// `stop()`. Each entry point gets its own execution stream so one noisy
/// entry point saturating its concurrency ceiling does not starve the
/// others. Triggers carrying a `correlation_id` are idempotent while the
/// original run is still active or its result still cached.
pub struct AgentRuntime {
    graph: Arc<Graph>,
    handlers: Arc<HandlerRegistry>,
    decision: Option<Arc<dyn DecisionEngine>>,
    store: Option<Arc<dyn RunStore>>,
    checkpoints: Option<Arc<CheckpointStore>>,
    config: EngineConfig,
    events: Arc<EventBus>,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
    entry_points: Mutex<Vec<EntryPointSpec>>,
    streams: Mutex<HashMap<String, Arc<ExecutionStream>>>,
    correlations: Mutex<HashMap<String, RunId>>,
}

impl AgentRuntime {
    pub fn new(graph: Arc<Graph>, handlers: HandlerRegistry) -> Self {
        Self {
            graph,
            handlers: Arc::new(handlers),
            decision: None,
            store: None,
            checkpoints: None,
            config: EngineConfig::default(),
            events: Arc::new(EventBus::default()),
            cancel: Mutex::new(CancellationToken::new()),
            running: AtomicBool::new(false),
            entry_points: Mutex::new(Vec::new()),
            streams: Mutex::new(HashMap::new()),
            correlations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_decision_engine(mut self, engine: Arc<dyn DecisionEngine>) -> Self {
        self.decision = Some(engine);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to lifecycle events for all runs.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecEvent> {
        self.events.subscribe()
    }

    /// Register a named entry point. Only valid before `start()`.
    pub fn register_entry_point(
        &self,
        name: impl Into<String>,
        node: impl Into<String>,
    ) -> Result<()> {
        if self.is_running() {
            return Err(TrellisError::AlreadyRunning);
        }
        let node = node.into();
        if self.graph.node(&node).is_none() {
            return Err(TrellisError::NodeNotFound(node));
        }
        let name = name.into();
        let mut eps = self.entry_points.lock().unwrap_or_else(|e| e.into_inner());
        eps.retain(|ep| ep.name != name);
        eps.push(EntryPointSpec { name, node });
        Ok(())
    }

    /// Start the runtime: store machinery, one stream per entry point.
    ///
    /// Entry points come from three sources, later ones overriding
    /// earlier: the graph's default entry node as "main", the graph's
    /// named entry points, and explicit registrations.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TrellisError::AlreadyRunning);
        }

        if let Some(store) = &self.store {
            store.start().await?;
        }

        // A stop() leaves the token cancelled; a restart needs a live one.
        let cancel = {
            let mut cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
            cancel.child_token()
        };

        let mut executor = GraphExecutor::new(Arc::clone(&self.graph), Arc::clone(&self.handlers))
            .with_retry_config(self.config.retry.clone())
            .with_checkpoint_config(self.config.checkpoint.clone())
            .with_events(Arc::clone(&self.events))
            .with_cancellation(cancel);
        if let Some(engine) = &self.decision {
            executor = executor.with_decision_engine(Arc::clone(engine));
        }
        if let Some(checkpoints) = &self.checkpoints {
            executor = executor.with_checkpoints(Arc::clone(checkpoints));
        }
        let executor = Arc::new(executor);

        let mut resolved: Vec<EntryPointSpec> = vec![EntryPointSpec {
            name: "main".into(),
            node: self.graph.entry_node().to_string(),
        }];
        for (name, node) in self.graph.entry_points() {
            resolved.retain(|ep| &ep.name != name);
            resolved.push(EntryPointSpec {
                name: name.clone(),
                node: node.clone(),
            });
        }
        for ep in self.entry_points.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            resolved.retain(|existing| existing.name != ep.name);
            resolved.push(ep.clone());
        }

        let mut built = HashMap::new();
        for ep in &resolved {
            let mut stream = ExecutionStream::new(ep.name.clone(), Arc::clone(&executor))
                .with_events(Arc::clone(&self.events))
                .with_config(self.config.runtime.clone());
            if let Some(store) = &self.store {
                stream = stream.with_store(Arc::clone(store));
            }
            built.insert(ep.name.clone(), Arc::new(stream));
        }

        let count = built.len();
        *self.entry_points.lock().unwrap_or_else(|e| e.into_inner()) = resolved;
        *self.streams.lock().unwrap_or_else(|e| e.into_inner()) = built;

        info!(
            graph_id = %self.graph.id(),
            entry_points = count,
            "Runtime started"
        );
        Ok(())
    }

    /// Stop the runtime: cancel in-flight runs and flush the store.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).cancel();
        if let Some(store) = &self.store {
            store.stop().await?;
        }

        info!(graph_id = %self.graph.id(), "Runtime stopped");
        Ok(())
    }

    /// Trigger a run through a named entry point.
    ///
    /// With a `correlation_id`, a duplicate trigger returns the original
    /// run's id instead of starting a second run, as long as that run is
    /// still active or its result is still cached.
    pub fn trigger(
        &self,
        entry_point: &str,
        input: HashMap<String, serde_json::Value>,
        correlation_id: Option<String>,
    ) -> Result<RunId> {
        if !self.is_running() {
            return Err(TrellisError::Config("runtime is not started".into()));
        }

        let (stream, node) = self.resolve(entry_point)?;

        if let Some(corr) = &correlation_id {
            let mut correlations = self.correlations.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = correlations.get(corr) {
                if stream.is_active(existing) || stream.has_result(existing) {
                    info!(
                        correlation_id = %corr,
                        run_id = %existing,
                        "Duplicate trigger resolved to existing run"
                    );
                    return Ok(existing.clone());
                }
                // The original run's result was evicted; treat as new work.
                warn!(correlation_id = %corr, "Stale correlation mapping dropped");
                correlations.remove(corr);
            }

            // Evicted runs leave dead mappings behind; shed them here so the
            // map stays bounded by live and cached runs.
            {
                let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
                correlations.retain(|_, id| {
                    streams
                        .values()
                        .any(|s| s.is_active(id) || s.has_result(id))
                });
            }

            let run_id = stream.execute(entry_point, &node, input, correlation_id.clone())?;
            correlations.insert(corr.clone(), run_id.clone());
            return Ok(run_id);
        }

        stream.execute(entry_point, &node, input, None)
    }

    /// Trigger and block until the run completes or `timeout` elapses.
    pub async fn trigger_and_wait(
        &self,
        entry_point: &str,
        input: HashMap<String, serde_json::Value>,
        correlation_id: Option<String>,
        timeout: Duration,
    ) -> Result<Option<RunResult>> {
        let run_id = self.trigger(entry_point, input, correlation_id)?;
        let (stream, _) = self.resolve(entry_point)?;
        Ok(stream.wait_for_completion(&run_id, timeout).await)
    }

    /// Resume a paused run through the entry point's stream.
    pub fn resume(&self, entry_point: &str, run_id: RunId) -> Result<()> {
        if !self.is_running() {
            return Err(TrellisError::Config("runtime is not started".into()));
        }
        let (stream, _) = self.resolve(entry_point)?;
        stream.resume(run_id)
    }

    /// Block until a previously triggered or resumed run completes.
    pub async fn wait_for(
        &self,
        entry_point: &str,
        run_id: &RunId,
        timeout: Duration,
    ) -> Result<Option<RunResult>> {
        let (stream, _) = self.resolve(entry_point)?;
        Ok(stream.wait_for_completion(run_id, timeout).await)
    }

    /// Completed result for a run, searching every stream's cache.
    pub fn get_result(&self, run_id: &RunId) -> Option<RunResult> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.values().find_map(|s| s.get_result(run_id))
    }

    fn resolve(&self, entry_point: &str) -> Result<(Arc<ExecutionStream>, String)> {
        let node = self
            .entry_points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|ep| ep.name == entry_point)
            .map(|ep| ep.node.clone())
            .ok_or_else(|| TrellisError::EntryPointNotFound(entry_point.to_string()))?;
        let stream = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(entry_point)
            .cloned()
            .ok_or_else(|| TrellisError::EntryPointNotFound(entry_point.to_string()))?;
        Ok((stream, node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_graph::{Edge, GraphSpec, Node};
    use trellis_test_utils::{EchoHandler, SlowHandler};

    fn graph() -> Arc<Graph> {
        let spec = GraphSpec::new("g", "runtime test")
            .with_nodes(vec![
                Node::task("a", "Start", "echo"),
                Node::task("b", "Finish", "echo"),
                Node::task("alt", "Alternate start", "echo"),
            ])
            .with_edges(vec![
                Edge::on_success("a", "b"),
                Edge::on_success("alt", "b"),
            ])
            .with_entry("a")
            .with_entry_point("side", "alt")
            .with_terminals(vec!["b".into()])
            ;
        Arc::new(Graph::from_spec(spec).unwrap())
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register(EchoHandler::new("echo"));
        registry
    }

    #[tokio::test]
    async fn test_trigger_through_main_and_named_entry() {
        let runtime = AgentRuntime::new(graph(), registry());
        runtime.start().await.unwrap();

        let result = runtime
            .trigger_and_wait("main", HashMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.path, vec!["a", "b"]);

        let result = runtime
            .trigger_and_wait("side", HashMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.path, vec!["alt", "b"]);

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_entry_point() {
        let runtime = AgentRuntime::new(graph(), registry());
        runtime.start().await.unwrap();

        let err = runtime.trigger("nope", HashMap::new(), None).unwrap_err();
        assert!(matches!(err, TrellisError::EntryPointNotFound(_)));
    }

    #[tokio::test]
    async fn test_trigger_before_start_rejected() {
        let runtime = AgentRuntime::new(graph(), registry());
        assert!(runtime.trigger("main", HashMap::new(), None).is_err());
    }

    #[tokio::test]
    async fn test_register_after_start_rejected() {
        let runtime = AgentRuntime::new(graph(), registry());
        runtime.register_entry_point("pre", "alt").unwrap();
        runtime.start().await.unwrap();

        let err = runtime.register_entry_point("post", "alt").unwrap_err();
        assert!(matches!(err, TrellisError::AlreadyRunning));
    }

    #[tokio::test]
    async fn test_register_unknown_node_rejected() {
        let runtime = AgentRuntime::new(graph(), registry());
        let err = runtime.register_entry_point("bad", "ghost").unwrap_err();
        assert!(matches!(err, TrellisError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let runtime = AgentRuntime::new(graph(), registry());
        runtime.start().await.unwrap();
        assert!(matches!(
            runtime.start().await.unwrap_err(),
            TrellisError::AlreadyRunning
        ));
    }

    #[tokio::test]
    async fn test_restart_after_stop_runs_fresh_work() {
        let runtime = AgentRuntime::new(graph(), registry());
        runtime.start().await.unwrap();
        runtime.stop().await.unwrap();
        runtime.start().await.unwrap();

        // Runs after a restart must execute, not report Cancelled from the
        // previous lifecycle's token.
        let result = runtime
            .trigger_and_wait("main", HashMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, trellis_core::types::RunStatus::Succeeded);
        assert_eq!(result.path, vec!["a", "b"]);

        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_correlation_id_is_idempotent() {
        let runtime = AgentRuntime::new(graph(), registry());
        runtime.start().await.unwrap();

        let first = runtime
            .trigger("main", HashMap::new(), Some("corr-1".into()))
            .unwrap();
        let second = runtime
            .trigger("main", HashMap::new(), Some("corr-1".into()))
            .unwrap();
        assert_eq!(first, second);

        // A different correlation id starts a fresh run.
        let third = runtime
            .trigger("main", HashMap::new(), Some("corr-2".into()))
            .unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn test_correlation_survives_completion() {
        let runtime = AgentRuntime::new(graph(), registry());
        runtime.start().await.unwrap();

        let first = runtime
            .trigger("main", HashMap::new(), Some("corr-1".into()))
            .unwrap();
        let (stream, _) = runtime.resolve("main").unwrap();
        stream
            .wait_for_completion(&first, Duration::from_secs(5))
            .await
            .unwrap();

        // Result is cached, so the duplicate still maps to the same run.
        let second = runtime
            .trigger("main", HashMap::new(), Some("corr-1".into()))
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_stale_correlations_are_pruned() {
        use trellis_core::config::RuntimeConfig;

        let runtime = AgentRuntime::new(graph(), registry()).with_config(EngineConfig {
            runtime: RuntimeConfig {
                max_concurrent_executions: 8,
                result_cache_size: 2,
            },
            ..EngineConfig::default()
        });
        runtime.start().await.unwrap();

        for i in 0..6 {
            let id = runtime
                .trigger("main", HashMap::new(), Some(format!("corr-{}", i)))
                .unwrap();
            runtime
                .wait_for("main", &id, Duration::from_secs(5))
                .await
                .unwrap()
                .unwrap();
        }

        // Mappings for evicted runs are shed on the next correlated
        // trigger, so the map stays within live plus cached runs.
        let len = runtime
            .correlations
            .lock()
            .unwrap()
            .len();
        assert!(len <= 3, "correlation map grew to {}", len);
    }

    #[tokio::test]
    async fn test_final_record_reaches_store() {
        use trellis_core::traits::RunStore;

        let store = Arc::new(trellis_store::MemoryRunStore::new());
        let runtime =
            AgentRuntime::new(graph(), registry()).with_store(store.clone() as Arc<dyn RunStore>);
        runtime.start().await.unwrap();

        let result = runtime
            .trigger_and_wait("main", HashMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        runtime.stop().await.unwrap();

        let record = store.load_run(&result.run_id).await.unwrap().unwrap();
        assert_eq!(record.status, trellis_core::types::RunStatus::Succeeded);
        assert_eq!(record.path, vec!["a", "b"]);
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_runs() {
        let mut registry = HandlerRegistry::new();
        registry.register(SlowHandler::new("echo", Duration::from_secs(10)));
        let runtime = AgentRuntime::new(graph(), registry);
        runtime.start().await.unwrap();

        let run_id = runtime.trigger("main", HashMap::new(), None).unwrap();
        runtime.stop().await.unwrap();

        let (stream, _) = {
            let streams = runtime.streams.lock().unwrap();
            (streams.get("main").cloned().unwrap(), ())
        };
        let result = stream
            .wait_for_completion(&run_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.status, trellis_core::types::RunStatus::Cancelled);
    }
}
