use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use trellis_core::config::RuntimeConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::EventBus;
use trellis_core::traits::RunStore;
use trellis_core::types::{
    ExecEvent, ExecEventKind, RunId, RunRecord, RunResult, RunStatus,
};

use crate::executor::GraphExecutor;

struct ActiveRun {
    notify: Arc<Notify>,
}

struct StreamInner {
    active: HashMap<RunId, ActiveRun>,
    /// Completed results, bounded; oldest evicted first.
    results: HashMap<RunId, RunResult>,
    order: VecDeque<RunId>,
}

/// One named lane of executions over a single graph.
///
/// Admits up to `max_concurrent_executions` in-flight runs, executes each
/// on its own task, keeps a bounded cache of completed results, and wakes
/// waiters on completion. Run records are persisted through the store:
/// a running record at admission, a durable final record at completion.
pub struct ExecutionStream {
    name: String,
    executor: Arc<GraphExecutor>,
    store: Option<Arc<dyn RunStore>>,
    events: Arc<EventBus>,
    config: RuntimeConfig,
    inner: Arc<Mutex<StreamInner>>,
}

impl ExecutionStream {
    pub fn new(name: impl Into<String>, executor: Arc<GraphExecutor>) -> Self {
        Self {
            name: name.into(),
            executor,
            store: None,
            events: Arc::new(EventBus::default()),
            config: RuntimeConfig::default(),
            inner: Arc::new(Mutex::new(StreamInner {
                active: HashMap::new(),
                results: HashMap::new(),
                order: VecDeque::new(),
            })),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).active.len()
    }

    /// Admit and start a new run from `entry_node`.
    ///
    /// Returns the run id immediately; the traversal proceeds on its own
    /// task. Fails with `ConcurrencyLimit` when the stream is saturated.
    pub fn execute(
        &self,
        entry_point: &str,
        entry_node: &str,
        input: HashMap<String, serde_json::Value>,
        correlation_id: Option<String>,
    ) -> Result<RunId> {
        let run_id = RunId::new();
        let notify = Arc::new(Notify::new());

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // Admission and registration are one critical section, so two
            // concurrent triggers cannot both slip past the ceiling.
            if inner.active.len() >= self.config.max_concurrent_executions {
                warn!(
                    stream = %self.name,
                    active = inner.active.len(),
                    "Stream saturated, rejecting trigger"
                );
                return Err(TrellisError::ConcurrencyLimit(
                    self.config.max_concurrent_executions,
                ));
            }
            inner.active.insert(
                run_id.clone(),
                ActiveRun {
                    notify: Arc::clone(&notify),
                },
            );
        }

        info!(
            stream = %self.name,
            run_id = %run_id,
            entry_point = %entry_point,
            "Run admitted"
        );
        self.events.publish(ExecEvent::now(
            run_id.clone(),
            ExecEventKind::RunStarted {
                entry_point: entry_point.to_string(),
            },
        ));

        let executor = Arc::clone(&self.executor);
        let store = self.store.clone();
        let events = Arc::clone(&self.events);
        let inner = Arc::clone(&self.inner);
        let cache_size = self.config.result_cache_size;
        let entry_point = entry_point.to_string();
        let entry_node = entry_node.to_string();
        let id = run_id.clone();

        tokio::spawn(async move {
            if let Some(store) = &store {
                let record = running_record(&executor, &id, &entry_point, &input, &correlation_id);
                if let Err(e) = store.save_run(&record, false).await {
                    warn!(run_id = %id, error = %e, "Failed to persist running record");
                }
            }

            let result = executor.execute(id.clone(), &entry_node, input).await;

            if let Some(store) = &store {
                let record =
                    final_record(&executor, &result, &entry_point, correlation_id.clone());
                // Terminal records must survive a crash right after completion.
                if let Err(e) = store.save_run(&record, true).await {
                    error!(run_id = %id, error = %e, "Failed to persist final record");
                }
            }

            events.publish(ExecEvent::now(
                id.clone(),
                ExecEventKind::RunCompleted {
                    success: result.success,
                    total_retries: result.total_retries,
                },
            ));

            complete(&inner, cache_size, id, result, notify);
        });

        Ok(run_id)
    }

    /// Resume a previously paused run from its checkpoint.
    pub fn resume(&self, run_id: RunId) -> Result<()> {
        let notify = Arc::new(Notify::new());
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.active.contains_key(&run_id) {
                return Err(TrellisError::AlreadyRunning);
            }
            if inner.active.len() >= self.config.max_concurrent_executions {
                return Err(TrellisError::ConcurrencyLimit(
                    self.config.max_concurrent_executions,
                ));
            }
            // A resumed run overwrites its paused result on completion.
            inner.results.remove(&run_id);
            inner.active.insert(
                run_id.clone(),
                ActiveRun {
                    notify: Arc::clone(&notify),
                },
            );
        }

        info!(stream = %self.name, run_id = %run_id, "Resuming run");

        let executor = Arc::clone(&self.executor);
        let store = self.store.clone();
        let events = Arc::clone(&self.events);
        let inner = Arc::clone(&self.inner);
        let cache_size = self.config.result_cache_size;

        tokio::spawn(async move {
            let result = match executor.resume(run_id.clone()).await {
                Ok(result) => result,
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Resume failed");
                    RunResult {
                        run_id: run_id.clone(),
                        success: false,
                        status: RunStatus::Failed,
                        path: vec![],
                        memory: HashMap::new(),
                        error: Some(e.to_string()),
                        total_retries: 0,
                        total_tokens: 0,
                        elapsed_ms: 0,
                    }
                }
            };

            if let Some(store) = &store {
                let record = final_record(&executor, &result, "resume", None);
                if let Err(e) = store.save_run(&record, true).await {
                    error!(run_id = %run_id, error = %e, "Failed to persist final record");
                }
            }

            events.publish(ExecEvent::now(
                run_id.clone(),
                ExecEventKind::RunCompleted {
                    success: result.success,
                    total_retries: result.total_retries,
                },
            ));

            complete(&inner, cache_size, run_id, result, notify);
        });

        Ok(())
    }

    /// Completed result for a run, if still cached.
    pub fn get_result(&self, run_id: &RunId) -> Option<RunResult> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .results
            .get(run_id)
            .cloned()
    }

    /// Whether a completed result is still cached for the run.
    pub fn has_result(&self, run_id: &RunId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .results
            .contains_key(run_id)
    }

    /// Whether the run is currently in flight on this stream.
    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .contains_key(run_id)
    }

    /// Block until the run completes or `timeout` elapses.
    ///
    /// `None` means the timeout elapsed, or the run is neither active nor
    /// cached (unknown id, or its result was evicted).
    pub async fn wait_for_completion(
        &self,
        run_id: &RunId,
        timeout: Duration,
    ) -> Option<RunResult> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(result) = inner.results.get(run_id) {
                return Some(result.clone());
            }
            let notify = match inner.active.get(run_id) {
                Some(active) => Arc::clone(&active.notify),
                None => return None,
            };
            // The notified future must exist before the lock is released;
            // otherwise a completion landing in between fires notify_waiters
            // with no waiter registered and the wait sleeps to the deadline.
            let notified = notify.notified();
            drop(inner);

            // Re-check after every wakeup; the notify covers exactly one run.
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // The deadline and the completion can land together.
                return self
                    .inner
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .results
                    .get(run_id)
                    .cloned();
            }
        }
    }
}

/// Move a run from active to the bounded result cache and wake waiters.
fn complete(
    inner: &Arc<Mutex<StreamInner>>,
    cache_size: usize,
    run_id: RunId,
    result: RunResult,
    notify: Arc<Notify>,
) {
    let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
    inner.active.remove(&run_id);
    inner.order.push_back(run_id.clone());
    inner.results.insert(run_id, result);
    while inner.results.len() > cache_size.max(1) {
        if let Some(oldest) = inner.order.pop_front() {
            inner.results.remove(&oldest);
        } else {
            break;
        }
    }
    drop(inner);
    notify.notify_waiters();
}

fn running_record(
    executor: &GraphExecutor,
    run_id: &RunId,
    entry_point: &str,
    input: &HashMap<String, serde_json::Value>,
    correlation_id: &Option<String>,
) -> RunRecord {
    let graph = executor.graph();
    RunRecord {
        id: run_id.clone(),
        graph_id: graph.id().to_string(),
        goal: graph.goal().to_string(),
        entry_point: entry_point.to_string(),
        status: RunStatus::Running,
        current_node: String::new(),
        path: vec![],
        memory: input.clone(),
        total_retries: 0,
        total_tokens: 0,
        error: None,
        correlation_id: correlation_id.clone(),
        created_at: Utc::now(),
        finished_at: None,
    }
}

fn final_record(
    executor: &GraphExecutor,
    result: &RunResult,
    entry_point: &str,
    correlation_id: Option<String>,
) -> RunRecord {
    let graph = executor.graph();
    RunRecord {
        id: result.run_id.clone(),
        graph_id: graph.id().to_string(),
        goal: graph.goal().to_string(),
        entry_point: entry_point.to_string(),
        status: result.status,
        current_node: result.path.last().cloned().unwrap_or_default(),
        path: result.path.clone(),
        memory: result.memory.clone(),
        total_retries: result.total_retries,
        total_tokens: result.total_tokens,
        error: result.error.clone(),
        correlation_id,
        created_at: Utc::now(),
        finished_at: result.status.is_terminal().then(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::config::RetryConfig;
    use trellis_graph::{Edge, Graph, GraphSpec, Node};
    use trellis_test_utils::{EchoHandler, SlowHandler};

    use crate::handlers::HandlerRegistry;

    fn graph() -> Arc<Graph> {
        let spec = GraphSpec::new("g", "stream test")
            .with_nodes(vec![
                Node::task("a", "Start", "echo"),
                Node::task("b", "Finish", "echo"),
            ])
            .with_edges(vec![Edge::on_success("a", "b")])
            .with_entry("a")
            .with_terminals(vec!["b".into()]);
        Arc::new(Graph::from_spec(spec).unwrap())
    }

    fn slow_graph() -> Arc<Graph> {
        let spec = GraphSpec::new("g", "slow test")
            .with_nodes(vec![Node::task("a", "Slow", "slow")])
            .with_entry("a")
            .with_terminals(vec!["a".into()]);
        Arc::new(Graph::from_spec(spec).unwrap())
    }

    fn stream(graph: Arc<Graph>, registry: HandlerRegistry, max: usize) -> ExecutionStream {
        let executor = Arc::new(
            GraphExecutor::new(graph, Arc::new(registry)).with_retry_config(RetryConfig {
                max_total_retries: 0,
                base_delay_ms: 1,
                multiplier: 1.0,
                max_delay_ms: 1,
                jitter: 0.0,
            }),
        );
        ExecutionStream::new("main", executor).with_config(RuntimeConfig {
            max_concurrent_executions: max,
            result_cache_size: 4,
        })
    }

    #[tokio::test]
    async fn test_execute_and_wait() {
        let mut registry = HandlerRegistry::new();
        registry.register(EchoHandler::new("echo"));
        let stream = stream(graph(), registry, 4);

        let run_id = stream
            .execute("main", "a", HashMap::new(), None)
            .unwrap();
        let result = stream
            .wait_for_completion(&run_id, Duration::from_secs(5))
            .await
            .expect("run should complete");

        assert!(result.success);
        assert_eq!(result.path, vec!["a", "b"]);
        assert_eq!(stream.get_result(&run_id).unwrap().run_id, run_id);
        assert_eq!(stream.active_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let mut registry = HandlerRegistry::new();
        registry.register(SlowHandler::new("slow", Duration::from_millis(200)));
        let stream = stream(slow_graph(), registry, 2);

        let r1 = stream.execute("main", "a", HashMap::new(), None).unwrap();
        let r2 = stream.execute("main", "a", HashMap::new(), None).unwrap();
        let rejected = stream.execute("main", "a", HashMap::new(), None);
        assert!(matches!(rejected, Err(TrellisError::ConcurrencyLimit(2))));

        // Capacity frees up once a run completes.
        stream
            .wait_for_completion(&r1, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(stream.execute("main", "a", HashMap::new(), None).is_ok());

        stream
            .wait_for_completion(&r2, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let mut registry = HandlerRegistry::new();
        registry.register(SlowHandler::new("slow", Duration::from_secs(10)));
        let stream = stream(slow_graph(), registry, 1);

        let run_id = stream.execute("main", "a", HashMap::new(), None).unwrap();
        let waited = stream
            .wait_for_completion(&run_id, Duration::from_millis(20))
            .await;
        assert!(waited.is_none());
        assert!(stream.is_active(&run_id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_sees_runs_that_finish_during_admission() {
        let mut registry = HandlerRegistry::new();
        registry.register(EchoHandler::new("echo"));
        let stream = stream(graph(), registry, 8);

        // Runs finish almost immediately, so completion regularly lands
        // between the wait's cache check and its sleep. Every wait must
        // still observe the result well inside the deadline.
        for _ in 0..50 {
            let run_id = stream.execute("main", "a", HashMap::new(), None).unwrap();
            let result = stream
                .wait_for_completion(&run_id, Duration::from_secs(5))
                .await;
            assert!(result.is_some());
        }
    }

    #[tokio::test]
    async fn test_unknown_run_returns_none() {
        let mut registry = HandlerRegistry::new();
        registry.register(EchoHandler::new("echo"));
        let stream = stream(graph(), registry, 1);

        let ghost = RunId::from_str("ghost");
        assert!(stream.get_result(&ghost).is_none());
        assert!(stream
            .wait_for_completion(&ghost, Duration::from_millis(10))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_result_cache_evicts_oldest() {
        let mut registry = HandlerRegistry::new();
        registry.register(EchoHandler::new("echo"));
        let executor = Arc::new(GraphExecutor::new(graph(), Arc::new(registry)));
        let stream = ExecutionStream::new("main", executor).with_config(RuntimeConfig {
            max_concurrent_executions: 8,
            result_cache_size: 2,
        });

        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = stream.execute("main", "a", HashMap::new(), None).unwrap();
            stream
                .wait_for_completion(&id, Duration::from_secs(5))
                .await
                .unwrap();
            ids.push(id);
        }

        assert!(stream.get_result(&ids[0]).is_none());
        assert!(stream.get_result(&ids[1]).is_none());
        assert!(stream.get_result(&ids[2]).is_some());
        assert!(stream.get_result(&ids[3]).is_some());
    }
}
