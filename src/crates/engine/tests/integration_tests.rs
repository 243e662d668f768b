//! End-to-end tests driving [`GraphEngine`] over small graphs built from
//! the crate's own deterministic test nodes, exercising the scenarios
//! and invariants this crate is expected to hold.

use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use workflow_engine::condition::{ConditionManager, EqualsHandler};
use workflow_engine::engine::GraphEngine;
use workflow_engine::event::GraphEngineEvent;
use workflow_engine::graph::{Edge, ErrorStrategy, Graph, GraphConfig, NodeConfig, NodeType, ParallelRegion, RetryConfig, RunCondition};
use workflow_engine::limits::ExecutionLimits;
use workflow_engine::node::fixtures::{CountingRetryNode, EchoNode, FailingNode};
use workflow_engine::node::NodeRegistry;
use workflow_engine::variable_pool::VariablePool;

fn node(id: &str, ty: NodeType) -> NodeConfig {
    NodeConfig {
        node_id: id.to_string(),
        node_type: ty,
        version: "1".to_string(),
        error_strategy: ErrorStrategy::None,
        continue_on_error: false,
        retry: RetryConfig::default(),
        default_value: None,
        data: Value::Null,
    }
}

fn edge(source: &str, target: &str) -> Edge {
    Edge { source: source.to_string(), target: target.to_string(), run_condition: None }
}

async fn run_all(engine: Arc<GraphEngine>) -> Vec<GraphEngineEvent> {
    let mut events = engine.run(VariablePool::new(), CancellationToken::new());
    let mut collected = Vec::new();
    while let Some(event) = events.next().await {
        collected.push(event);
    }
    collected
}

/// S1: a straight-line graph with no branching reaches `GraphRunSucceeded`
/// and every node is reported started then succeeded, in order.
#[tokio::test]
async fn linear_workflow_succeeds_in_order() {
    let config = GraphConfig {
        nodes: vec![node("start", NodeType::Start), node("llm", NodeType::Llm), node("end", NodeType::End)],
        edges: vec![edge("start", "llm"), edge("llm", "end")],
        parallel_regions: vec![],
    };
    let graph = Arc::new(Graph::try_from_config(&config).unwrap());

    let mut registry = NodeRegistry::new();
    registry.register(NodeType::Start, "1", |cfg| Arc::new(EchoNode::new(json!(null), cfg.clone())));
    registry.register(NodeType::Llm, "1", |cfg| Arc::new(EchoNode::new(json!("hello"), cfg.clone())));
    registry.register(NodeType::End, "1", |cfg| Arc::new(EchoNode::new(json!("final"), cfg.clone())));

    let engine = Arc::new(GraphEngine::new(
        graph,
        Arc::new(registry),
        Arc::new(ConditionManager::new()),
        ExecutionLimits::default(),
    ));

    let events = run_all(engine).await;
    assert!(matches!(events.first(), Some(GraphEngineEvent::GraphRunStarted { .. })));
    assert!(matches!(events.last(), Some(GraphEngineEvent::GraphRunSucceeded { .. })));

    let started: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            GraphEngineEvent::NodeRunStarted { node_id, .. } => Some(node_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["start", "llm", "end"]);
}

/// S2: a conditional edge routes around a branch that would otherwise
/// fail — only the matching branch's node is ever dispatched.
#[tokio::test]
async fn conditional_edge_chooses_branch() {
    // `classify`'s echo output lands at `classify.echo.score` (a node's
    // outputs merge under its own namespace, one level in), so the
    // conditions below select on that path.
    let config = GraphConfig {
        nodes: vec![
            node("start", NodeType::Start),
            node("classify", NodeType::Code),
            node("high", NodeType::Code),
            node("low", NodeType::Code),
        ],
        edges: vec![
            edge("start", "classify"),
            Edge {
                source: "classify".into(),
                target: "high".into(),
                run_condition: Some(RunCondition {
                    kind: json!({"type": "equals", "selector": ["classify", "echo", "score"], "value": 1}),
                    hash: "h1".into(),
                }),
            },
            Edge {
                source: "classify".into(),
                target: "low".into(),
                run_condition: Some(RunCondition {
                    kind: json!({"type": "equals", "selector": ["classify", "echo", "score"], "value": 0}),
                    hash: "h0".into(),
                }),
            },
        ],
        parallel_regions: vec![],
    };
    let graph = Arc::new(Graph::try_from_config(&config).unwrap());

    let mut registry = NodeRegistry::new();
    registry.register(NodeType::Start, "1", |cfg| Arc::new(EchoNode::new(json!(null), cfg.clone())));
    registry.register(NodeType::Code, "1", |cfg| Arc::new(EchoNode::new(json!({"score": 1}), cfg.clone())));

    let mut conditions = ConditionManager::new();
    conditions.register("equals", Arc::new(EqualsHandler));

    let engine = Arc::new(GraphEngine::new(
        graph,
        Arc::new(registry),
        Arc::new(conditions),
        ExecutionLimits::default(),
    ));
    let events = run_all(engine).await;

    let started: HashSet<String> = events
        .iter()
        .filter_map(|e| match e {
            GraphEngineEvent::NodeRunStarted { node_id, .. } => Some(node_id.clone()),
            _ => None,
        })
        .collect();
    assert!(started.contains("high"));
    assert!(!started.contains("low"));
}

/// S3: a retryable node succeeds on its third attempt, and the driver
/// reports two `NodeRunRetry` events before the eventual success.
#[tokio::test]
async fn node_retries_then_succeeds() {
    let mut retry_node = node("flaky", NodeType::Code);
    retry_node.retry = RetryConfig { max_retries: 3, retry_interval_seconds: 0.01 };

    let config = GraphConfig {
        nodes: vec![node("start", NodeType::Start), retry_node, node("end", NodeType::End)],
        edges: vec![edge("start", "flaky"), edge("flaky", "end")],
        parallel_regions: vec![],
    };
    let graph = Arc::new(Graph::try_from_config(&config).unwrap());

    let mut registry = NodeRegistry::new();
    registry.register(NodeType::Start, "1", |cfg| Arc::new(EchoNode::new(json!(null), cfg.clone())));
    registry.register(NodeType::Code, "1", |cfg| Arc::new(CountingRetryNode::new(2, cfg.clone())));
    registry.register(NodeType::End, "1", |cfg| Arc::new(EchoNode::new(json!("done"), cfg.clone())));

    let engine = Arc::new(GraphEngine::new(
        graph,
        Arc::new(registry),
        Arc::new(ConditionManager::new()),
        ExecutionLimits::default(),
    ));
    let events = run_all(engine).await;

    let retries = events.iter().filter(|e| matches!(e, GraphEngineEvent::NodeRunRetry { .. })).count();
    assert_eq!(retries, 2);
    assert!(matches!(events.last(), Some(GraphEngineEvent::GraphRunSucceeded { .. })));
}

/// S4: a node with `ErrorStrategy::DefaultValue` is rescued and the run
/// reports `GraphRunPartialSucceeded`, not a failure.
#[tokio::test]
async fn default_value_strategy_yields_partial_success() {
    let mut default_value = Map::new();
    default_value.insert("result".to_string(), json!("fallback"));
    let mut failing = node("risky", NodeType::Code);
    failing.error_strategy = ErrorStrategy::DefaultValue;
    failing.continue_on_error = true;
    failing.default_value = Some(default_value);

    let config = GraphConfig {
        nodes: vec![node("start", NodeType::Start), failing, node("end", NodeType::End)],
        edges: vec![edge("start", "risky"), edge("risky", "end")],
        parallel_regions: vec![],
    };
    let graph = Arc::new(Graph::try_from_config(&config).unwrap());

    let mut registry = NodeRegistry::new();
    registry.register(NodeType::Start, "1", |cfg| Arc::new(EchoNode::new(json!(null), cfg.clone())));
    registry.register(NodeType::Code, "1", |cfg| {
        Arc::new(FailingNode::new("boom", false, cfg.clone()))
    });
    registry.register(NodeType::End, "1", |cfg| Arc::new(EchoNode::new(json!("done"), cfg.clone())));

    let engine = Arc::new(GraphEngine::new(
        graph,
        Arc::new(registry),
        Arc::new(ConditionManager::new()),
        ExecutionLimits::default(),
    ));
    let events = run_all(engine).await;
    assert!(matches!(events.last(), Some(GraphEngineEvent::GraphRunPartialSucceeded { exceptions_count: 1, .. })));
}

/// S5: a fan-out into a two-branch parallel region reports both branches
/// started and succeeded before the join node runs.
#[tokio::test]
async fn parallel_region_runs_both_branches() {
    let config = GraphConfig {
        nodes: vec![
            node("start", NodeType::Start),
            node("a", NodeType::Code),
            node("b", NodeType::Code),
            node("join", NodeType::VariableAggregator),
        ],
        edges: vec![edge("start", "a"), edge("start", "b"), edge("a", "join"), edge("b", "join")],
        parallel_regions: vec![ParallelRegion {
            id: "region1".to_string(),
            start_nodes: vec!["a".to_string(), "b".to_string()],
            end_node: Some("join".to_string()),
        }],
    };
    let graph = Arc::new(Graph::try_from_config(&config).unwrap());

    let mut registry = NodeRegistry::new();
    registry.register(NodeType::Start, "1", |cfg| Arc::new(EchoNode::new(json!(null), cfg.clone())));
    registry.register(NodeType::Code, "1", |cfg| Arc::new(EchoNode::new(json!("branch"), cfg.clone())));
    registry.register(NodeType::VariableAggregator, "1", |cfg| Arc::new(EchoNode::new(json!("joined"), cfg.clone())));

    let engine = Arc::new(GraphEngine::new(
        graph,
        Arc::new(registry),
        Arc::new(ConditionManager::new()),
        ExecutionLimits::default(),
    ));
    let events = run_all(engine).await;

    let branch_started = events.iter().filter(|e| matches!(e, GraphEngineEvent::ParallelBranchRunStarted { .. })).count();
    let branch_succeeded = events.iter().filter(|e| matches!(e, GraphEngineEvent::ParallelBranchRunSucceeded { .. })).count();
    assert_eq!(branch_started, 2);
    assert_eq!(branch_succeeded, 2);
    assert!(matches!(events.last(), Some(GraphEngineEvent::GraphRunSucceeded { .. })));
}

/// S6: exceeding the execution-step limit fails the run with a bounded
/// error rather than looping forever.
#[tokio::test]
async fn step_limit_aborts_runaway_loop() {
    let config = GraphConfig {
        nodes: vec![node("start", NodeType::Start), node("loop", NodeType::Loop)],
        edges: vec![edge("start", "loop"), edge("loop", "loop")],
        parallel_regions: vec![],
    };
    let graph = Arc::new(Graph::try_from_config(&config).unwrap());

    let mut registry = NodeRegistry::new();
    registry.register(NodeType::Start, "1", |cfg| Arc::new(EchoNode::new(json!(null), cfg.clone())));
    registry.register(NodeType::Loop, "1", |cfg| Arc::new(EchoNode::new(json!(null), cfg.clone())));

    let engine = Arc::new(GraphEngine::new(
        graph,
        Arc::new(registry),
        Arc::new(ConditionManager::new()),
        ExecutionLimits::new(5, Duration::from_secs(60), 4, 50),
    ));
    let events = run_all(engine).await;
    assert!(matches!(events.last(), Some(GraphEngineEvent::GraphRunFailed { .. })));
}

/// Invariant: cancelling before the run starts producing node events
/// still yields a terminal event rather than hanging the stream.
#[tokio::test]
async fn cancellation_yields_a_terminal_event() {
    let config = GraphConfig {
        nodes: vec![node("start", NodeType::Start), node("end", NodeType::End)],
        edges: vec![edge("start", "end")],
        parallel_regions: vec![],
    };
    let graph = Arc::new(Graph::try_from_config(&config).unwrap());

    let mut registry = NodeRegistry::new();
    registry.register(NodeType::Start, "1", |cfg| Arc::new(EchoNode::new(json!(null), cfg.clone())));
    registry.register(NodeType::End, "1", |cfg| Arc::new(EchoNode::new(json!(null), cfg.clone())));

    let engine = Arc::new(GraphEngine::new(
        graph,
        Arc::new(registry),
        Arc::new(ConditionManager::new()),
        ExecutionLimits::default(),
    ));
    let cancellation = CancellationToken::new();
    cancellation.cancel();
    let mut events = engine.run(VariablePool::new(), cancellation);
    let mut saw_terminal = false;
    while let Some(event) = events.next().await {
        if event.is_run_terminal() {
            saw_terminal = true;
        }
    }
    assert!(saw_terminal);
}
