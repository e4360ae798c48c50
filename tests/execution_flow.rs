//! End-to-end traversal scenarios through the public API: retry budget
//! behavior, delegate routing, parallel fan-out, pause and resume.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use trellis::{
    AgentRuntime, BranchSpec, CheckpointStore, DelegatePolicy, Edge, EngineConfig, Graph,
    GraphSpec, HandlerRegistry, Node, RetentionPolicy, RetryConfig, RunStatus,
};
use trellis_test_utils::{EchoHandler, FlakyHandler, SoftFailHandler};

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config(retry_budget: u32) -> EngineConfig {
    EngineConfig {
        retry: RetryConfig {
            max_total_retries: retry_budget,
            base_delay_ms: 1,
            multiplier: 1.0,
            max_delay_ms: 5,
            jitter: 0.0,
        },
        ..EngineConfig::default()
    }
}

fn pipeline(middle_handler: &str) -> Arc<Graph> {
    let spec = GraphSpec::new("pipeline", "three step pipeline")
        .with_nodes(vec![
            Node::task("a", "Gather", "echo"),
            Node::task("b", "Transform", middle_handler),
            Node::task("c", "Deliver", "echo"),
        ])
        .with_edges(vec![Edge::on_success("a", "b"), Edge::on_success("b", "c")])
        .with_entry("a")
        .with_terminals(vec!["c".into()]);
    Arc::new(Graph::from_spec(spec).unwrap())
}

fn base_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(EchoHandler::new("echo"));
    registry
}

#[tokio::test]
async fn flaky_middle_node_recovers_within_budget() {
    init_logs();
    let mut registry = base_registry();
    registry.register(FlakyHandler::new("flaky", 2));

    let runtime = AgentRuntime::new(pipeline("flaky"), registry).with_config(fast_config(5));
    runtime.start().await.unwrap();

    let result = runtime
        .trigger_and_wait("main", HashMap::new(), None, Duration::from_secs(10))
        .await
        .unwrap()
        .expect("run should complete");

    assert!(result.success);
    assert_eq!(result.total_retries, 2);
    assert_eq!(result.path, vec!["a", "b", "b", "b", "c"]);

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn flaky_middle_node_exhausts_small_budget() {
    init_logs();
    let mut registry = base_registry();
    registry.register(FlakyHandler::new("flaky", 2));

    let runtime = AgentRuntime::new(pipeline("flaky"), registry).with_config(fast_config(1));
    runtime.start().await.unwrap();

    let result = runtime
        .trigger_and_wait("main", HashMap::new(), None, Duration::from_secs(10))
        .await
        .unwrap()
        .expect("run should complete");

    assert!(!result.success);
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.path, vec!["a", "b", "b"]);
    assert!(result.error.unwrap().contains("Retry budget exhausted"));

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn soft_failure_takes_on_failure_route() {
    init_logs();
    let spec = GraphSpec::new("gated", "gate with rework route")
        .with_nodes(vec![
            Node::task("gate", "Quality gate", "softfail"),
            Node::task("ship", "Ship", "echo"),
            Node::task("rework", "Rework", "echo"),
        ])
        .with_edges(vec![
            Edge::on_success("gate", "ship"),
            Edge::on_failure("gate", "rework"),
        ])
        .with_entry("gate")
        .with_terminals(vec!["ship".into(), "rework".into()]);
    let graph = Arc::new(Graph::from_spec(spec).unwrap());

    let mut registry = base_registry();
    registry.register(SoftFailHandler::new("softfail"));

    let runtime = AgentRuntime::new(graph, registry).with_config(fast_config(0));
    runtime.start().await.unwrap();

    let result = runtime
        .trigger_and_wait("main", HashMap::new(), None, Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();

    // Routed, not retried: a soft failure consumes no retry budget.
    assert!(result.success);
    assert_eq!(result.path, vec!["gate", "rework"]);
    assert_eq!(result.total_retries, 0);

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn delegate_skip_without_engine_ends_cleanly() {
    init_logs();
    let spec = GraphSpec::new("delegated", "optional continuation")
        .with_nodes(vec![
            Node::task("a", "Start", "echo"),
            Node::task("b", "Optional", "echo"),
        ])
        .with_edges(vec![Edge::delegate(
            "a",
            "b",
            "continue?",
            DelegatePolicy::Skip,
        )])
        .with_entry("a")
        .with_terminals(vec!["b".into()]);
    let graph = Arc::new(Graph::from_spec(spec).unwrap());

    let runtime = AgentRuntime::new(graph, base_registry()).with_config(fast_config(0));
    runtime.start().await.unwrap();

    let result = runtime
        .trigger_and_wait("main", HashMap::new(), None, Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();

    assert!(result.success);
    assert_eq!(result.path, vec!["a"]);

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn parallel_branches_merge_into_shared_memory() {
    init_logs();
    let spec = GraphSpec::new("fanout", "gather from two sources")
        .with_nodes(vec![
            Node::parallel(
                "gather",
                "Gather all",
                vec![BranchSpec::new("news", "news"), BranchSpec::new("docs", "docs")],
            ),
            Node::task("news", "Fetch news", "news").with_outputs(vec!["news_out".into()]),
            Node::task("docs", "Fetch docs", "docs").with_outputs(vec!["docs_out".into()]),
            Node::task("combine", "Combine", "echo")
                .with_inputs(vec!["news_out".into(), "docs_out".into()]),
        ])
        .with_edges(vec![Edge::on_success("gather", "combine")])
        .with_entry("gather")
        .with_terminals(vec!["combine".into()]);
    let graph = Arc::new(Graph::from_spec(spec).unwrap());

    let mut registry = base_registry();
    registry.register(EchoHandler::new("news").with_output(serde_json::json!("headlines")));
    registry.register(EchoHandler::new("docs").with_output(serde_json::json!("manuals")));

    let runtime = AgentRuntime::new(graph, registry).with_config(fast_config(0));
    runtime.start().await.unwrap();

    let result = runtime
        .trigger_and_wait("main", HashMap::new(), None, Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();

    // Both branch outputs satisfied combine's declared inputs.
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.memory.get("news_out"), Some(&serde_json::json!("headlines")));
    assert_eq!(result.memory.get("docs_out"), Some(&serde_json::json!("manuals")));

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn pause_then_resume_completes_the_run() {
    init_logs();
    let spec = GraphSpec::new("approval", "human approval flow")
        .with_nodes(vec![
            Node::task("draft", "Draft", "echo"),
            Node::pause("approve", "Await approval"),
            Node::task("publish", "Publish", "echo"),
        ])
        .with_edges(vec![
            Edge::on_success("draft", "approve"),
            Edge::on_success("approve", "publish"),
        ])
        .with_entry("draft")
        .with_terminals(vec!["publish".into()]);
    let graph = Arc::new(Graph::from_spec(spec).unwrap());

    let checkpoints =
        Arc::new(CheckpointStore::in_memory(RetentionPolicy::LatestOnly).unwrap());
    let runtime = AgentRuntime::new(graph, base_registry())
        .with_config(fast_config(0))
        .with_checkpoints(Arc::clone(&checkpoints));
    runtime.start().await.unwrap();

    let paused = runtime
        .trigger_and_wait("main", HashMap::new(), None, Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    assert_eq!(paused.path, vec!["draft", "approve"]);

    runtime.resume("main", paused.run_id.clone()).unwrap();
    let resumed = runtime
        .wait_for("main", &paused.run_id, Duration::from_secs(10))
        .await
        .unwrap()
        .expect("resumed run should complete");

    assert!(resumed.success, "error: {:?}", resumed.error);
    assert_eq!(resumed.path, vec!["draft", "approve", "publish"]);

    runtime.stop().await.unwrap();
}
