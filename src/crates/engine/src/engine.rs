//! The graph engine: the driver loop that walks a [`Graph`], dispatches
//! parallel branches, runs nodes through their retry/error-strategy state
//! machine, and emits a [`GraphEngineEvent`] stream a caller consumes.

use crate::condition::ConditionManager;
use crate::error::{EngineError, Result};
use crate::event::{GraphEngineEvent, ParallelContext};
use crate::graph::{Edge, Graph, NodeConfig, NodeId, NodeType, ParallelRegion};
use crate::limits::ExecutionLimits;
use crate::node::{NodeCompletion, NodeContext, NodeError, NodeEvent, NodeRegistry, NodeRunResult};
use crate::route_state::{RouteNodeState, RouteNodeStateMap, RouteStatus};
use crate::runtime_state::RuntimeState;
use crate::variable_pool::VariablePool;
use crate::worker_pool::WorkerPool;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the channel bridging the background driver task to the
/// stream a caller consumes. Bounded so a slow consumer applies
/// backpressure to the driver rather than letting it run unbounded ahead.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Drives one [`Graph`] to completion, given node implementations and
/// condition handlers supplied by the embedding application.
pub struct GraphEngine {
    graph: Arc<Graph>,
    registry: Arc<NodeRegistry>,
    conditions: Arc<ConditionManager>,
    limits: ExecutionLimits,
}

impl GraphEngine {
    /// Build an engine for `graph`, with node behavior from `registry` and
    /// condition evaluation from `conditions`, bounded by `limits`.
    pub fn new(
        graph: Arc<Graph>,
        registry: Arc<NodeRegistry>,
        conditions: Arc<ConditionManager>,
        limits: ExecutionLimits,
    ) -> Self {
        Self { graph, registry, conditions, limits }
    }

    /// Start a run seeded with `initial_pool`, returning a stream of
    /// lifecycle events. The driver runs on a background task; dropping
    /// the returned stream does not stop it mid-flight, but `cancellation`
    /// does — it is the caller's cooperative stop signal.
    pub fn run(
        self: Arc<Self>,
        initial_pool: VariablePool,
        cancellation: CancellationToken,
    ) -> ReceiverStream<GraphEngineEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            self.drive(initial_pool, cancellation, tx).await;
        });
        ReceiverStream::new(rx)
    }

    async fn drive(
        &self,
        initial_pool: VariablePool,
        cancellation: CancellationToken,
        tx: mpsc::Sender<GraphEngineEvent>,
    ) {
        let run_id = uuid::Uuid::new_v4();
        info!(%run_id, root = %self.graph.root_node_id, "starting graph run");
        let _ = tx.send(GraphEngineEvent::GraphRunStarted { run_id }).await;

        let pool = Arc::new(Mutex::new(initial_pool));
        let mut routes = RouteNodeStateMap::new();
        let mut runtime = RuntimeState::new();
        let worker_pool = Arc::new(WorkerPool::new(self.limits.max_workers, self.limits.max_submit_count));

        let mut frontier: VecDeque<(NodeId, ParallelContext)> = VecDeque::new();
        frontier.push_back((self.graph.root_node_id.clone(), ParallelContext::root()));

        let mut terminal_outputs = Map::new();
        let mut exceptions_count: u32 = 0;

        let outcome = loop {
            if cancellation.is_cancelled() {
                break Err(EngineError::Cancelled);
            }

            let Some((node_id, context)) = frontier.pop_front() else {
                break Ok(());
            };

            let Some(config) = self.graph.node_configs.get(&node_id).cloned() else {
                break Err(EngineError::NodeConfigMissing { node_id });
            };

            // Iteration/Loop nodes are meant to be revisited across
            // passes; every other node type only ever runs once per
            // visit to its terminal status (a join reached from more
            // than one predecessor shouldn't re-execute).
            let revisitable = matches!(config.node_type, NodeType::Iteration | NodeType::Loop);
            if !revisitable && routes.is_terminal(&node_id) {
                continue;
            }

            if runtime.node_run_steps >= self.limits.max_execution_steps {
                warn!(%run_id, limit = self.limits.max_execution_steps, "max execution steps reached");
                break Err(EngineError::MaxStepsReached { limit: self.limits.max_execution_steps });
            }
            if runtime.elapsed() >= self.limits.max_execution_time {
                warn!(%run_id, limit_secs = self.limits.max_execution_time.as_secs(), "max execution time reached");
                break Err(EngineError::MaxTimeReached { limit: self.limits.max_execution_time });
            }

            if let Some(parallel_id) = self.graph.node_parallel.get(&node_id).cloned() {
                let region = match self.graph.parallel_regions.get(&parallel_id) {
                    Some(r) => r.clone(),
                    None => break Err(EngineError::ParallelRegionNotFound { parallel_id }),
                };
                if region.start_nodes.contains(&node_id) {
                    // Drop any sibling start nodes already queued; the region
                    // dispatch below runs every declared start node together.
                    frontier.retain(|(id, _)| !region.start_nodes.contains(id));
                    match self
                        .run_parallel_region(&region, &context, &pool, &mut routes, &mut runtime, &worker_pool, &cancellation, &tx)
                        .await
                    {
                        Ok(exc) => {
                            exceptions_count += exc;
                            if let Some(end_node) = &region.end_node {
                                frontier.push_back((end_node.clone(), context.clone()));
                            }
                            continue;
                        }
                        Err(e) => break Err(e),
                    }
                }
            }

            match self
                .run_node_with_retry(&node_id, &config, &pool, &context, &mut runtime, &cancellation, &tx)
                .await
            {
                Ok((result, rescued)) => {
                    if rescued {
                        exceptions_count += 1;
                        routes.entry(&node_id).status = RouteStatus::Exception;
                    } else {
                        routes.entry(&node_id).status = RouteStatus::Succeeded;
                    }
                    if matches!(config.node_type, NodeType::End | NodeType::Answer) {
                        if let Value::Object(outputs) = &result.outputs {
                            for (k, v) in outputs {
                                terminal_outputs.insert(k.clone(), v.clone());
                            }
                        }
                    }
                    let previous = routes.get(&node_id).cloned().expect("just set above");
                    let pool_snapshot = pool.lock().await.clone();
                    let runtime_view = runtime.with_pool(pool_snapshot);
                    let successors = match self.select_successors(&config, &result, &runtime_view, &previous) {
                        Ok(s) => s,
                        Err(e) => break Err(e),
                    };
                    for next in successors {
                        frontier.push_back((next, context.clone()));
                    }
                }
                Err(e) => {
                    routes.entry(&node_id).status = RouteStatus::Failed;
                    break Err(e);
                }
            }
        };

        let final_event = match outcome {
            Ok(()) if exceptions_count > 0 => {
                warn!(%run_id, exceptions_count, "graph run partially succeeded");
                GraphEngineEvent::GraphRunPartialSucceeded {
                    outputs: Value::Object(terminal_outputs),
                    exceptions_count,
                }
            }
            Ok(()) => {
                info!(%run_id, steps = runtime.node_run_steps, "graph run succeeded");
                GraphEngineEvent::GraphRunSucceeded {
                    outputs: Value::Object(terminal_outputs),
                    llm_usage: runtime.llm_usage,
                }
            }
            Err(e) => {
                error!(%run_id, error = %e, "graph run failed");
                GraphEngineEvent::GraphRunFailed { error: e.user_message() }
            }
        };
        let _ = tx.send(final_event).await;
    }

    /// Decide which outgoing edges of `config` to take, given the result
    /// the node just returned and its own resulting route state. A node
    /// that selected a specific edge (a `Condition`/`Agent` node making an
    /// explicit choice) takes exactly that one. Otherwise, outgoing edges
    /// are grouped by `run_condition.hash` (edges with no condition share
    /// one group), groups are tried in config order, and the first group
    /// whose every condition evaluates true is taken — a single edge in
    /// that group dispatches sequentially, more than one dispatches in
    /// parallel. Only one group ever fires.
    fn select_successors(
        &self,
        config: &NodeConfig,
        result: &NodeRunResult,
        runtime: &RuntimeState,
        previous: &RouteNodeState,
    ) -> Result<Vec<NodeId>> {
        let edges = self.graph.outgoing(&config.node_id);
        if let Some(selected) = &result.selected_edge {
            return Ok(edges
                .iter()
                .filter(|e| &e.target == selected || e.run_condition.as_ref().map(|c| &c.hash) == Some(selected))
                .map(|e| e.target.clone())
                .collect());
        }

        let mut order: Vec<Option<&String>> = Vec::new();
        let mut groups: HashMap<Option<&String>, Vec<&Edge>> = HashMap::new();
        for e in edges {
            let key = e.run_condition.as_ref().map(|c| &c.hash);
            if !groups.contains_key(&key) {
                order.push(key);
            }
            groups.entry(key).or_default().push(e);
        }

        for key in order {
            let group = &groups[&key];
            let mut all_true = true;
            for e in group {
                let satisfied = match &e.run_condition {
                    Some(cond) => self.conditions.evaluate(cond, runtime, previous)?,
                    None => true,
                };
                if !satisfied {
                    all_true = false;
                    break;
                }
            }
            if all_true {
                return Ok(group.iter().map(|e| e.target.clone()).collect());
            }
        }
        Ok(Vec::new())
    }

    /// Run one node through its full retry/error-strategy state machine.
    /// Returns the accepted result and whether it was accepted via a
    /// rescue (`continue_on_error`) rather than an outright success, so
    /// the caller can count it toward `GraphRunPartialSucceeded` and mark
    /// its route state `Exception` rather than `Succeeded`.
    async fn run_node_with_retry(
        &self,
        node_id: &NodeId,
        config: &NodeConfig,
        pool: &Arc<Mutex<VariablePool>>,
        context: &ParallelContext,
        runtime: &mut RuntimeState,
        cancellation: &CancellationToken,
        tx: &mpsc::Sender<GraphEngineEvent>,
    ) -> Result<(NodeRunResult, bool)> {
        debug!(node_id = %node_id, node_type = ?config.node_type, "running node");
        let _ = tx
            .send(GraphEngineEvent::NodeRunStarted { node_id: node_id.clone(), context: context.clone() })
            .await;
        runtime.record_step();

        let node = self
            .registry
            .build(config)
            .ok_or_else(|| EngineError::NodeConfigMissing { node_id: node_id.clone() })?;

        let mut attempt: u32 = 0;
        let outcome: std::result::Result<NodeRunResult, (NodeError, Value, bool)> = loop {
            let snapshot = pool.lock().await.clone();
            let ctx = NodeContext { pool: &snapshot, cancellation: cancellation.clone() };

            let mut stream = node.run(ctx);
            let mut completion = None;
            while let Some(event) = stream.next().await {
                match event {
                    NodeEvent::StreamChunk { chunk, is_final_answer } => {
                        let _ = tx
                            .send(GraphEngineEvent::NodeRunStreamChunk {
                                node_id: node_id.clone(),
                                chunk,
                                is_final_answer,
                                context: context.clone(),
                            })
                            .await;
                    }
                    NodeEvent::RetrieverResource { resource } => {
                        let _ = tx
                            .send(GraphEngineEvent::NodeRunRetrieverResource {
                                node_id: node_id.clone(),
                                resource,
                                context: context.clone(),
                            })
                            .await;
                    }
                    NodeEvent::Completed(c) => completion = Some(c),
                }
            }
            drop(stream);

            let Some(completion) = completion else {
                break Err((
                    NodeError::permanent("node event stream ended without a completion event"),
                    Value::Object(Map::new()),
                    true,
                ));
            };

            match completion {
                NodeCompletion::Succeeded(result) => break Ok(result),
                NodeCompletion::Failed { error, outputs } => {
                    let retries_exhausted_at_cap = attempt >= config.retry.max_retries;
                    let give_up = retries_exhausted_at_cap || !error.retryable;
                    if !give_up {
                        attempt += 1;
                        let retry_after = std::time::Duration::from_secs_f64(config.retry.retry_interval_seconds);
                        warn!(
                            node_id = %node_id,
                            attempt,
                            max_retries = config.retry.max_retries,
                            delay_ms = retry_after.as_millis() as u64,
                            error = %error.message,
                            "node failed, retrying after delay"
                        );
                        let _ = tx
                            .send(GraphEngineEvent::NodeRunRetry {
                                node_id: node_id.clone(),
                                attempt,
                                retry_after,
                                error: error.message.clone(),
                                context: context.clone(),
                            })
                            .await;
                        tokio::select! {
                            _ = tokio::time::sleep(retry_after) => {}
                            _ = cancellation.cancelled() => break Err((error, outputs, retries_exhausted_at_cap)),
                        }
                        continue;
                    }
                    break Err((error, outputs, retries_exhausted_at_cap));
                }
            }
        };

        match outcome {
            Ok(result) => {
                pool.lock().await.merge_outputs(node_id, &as_object(&result.outputs));
                let _ = tx
                    .send(GraphEngineEvent::NodeRunSucceeded {
                        node_id: node_id.clone(),
                        outputs: result.outputs.clone(),
                        context: context.clone(),
                    })
                    .await;
                Ok((result, false))
            }
            Err((err, outputs, retries_exhausted_at_cap)) => {
                // The originating platform coerces an HTTP request node's
                // exhausted retries into a successful result carrying
                // whatever partial output the node produced, rather than
                // failing the branch — but only when retries are actually
                // spent, the node produced something, and the node isn't
                // already headed for its own continue_on_error handling.
                let has_partial_outputs = outputs.as_object().map(|o| !o.is_empty()).unwrap_or(false);
                let coerce_http_retry_exhaustion = config.node_type == NodeType::HttpRequest
                    && retries_exhausted_at_cap
                    && has_partial_outputs
                    && !config.continue_on_error;

                if coerce_http_retry_exhaustion {
                    let result = NodeRunResult::with_outputs(outputs);
                    pool.lock().await.merge_outputs(node_id, &as_object(&result.outputs));
                    let _ = tx
                        .send(GraphEngineEvent::NodeRunSucceeded {
                            node_id: node_id.clone(),
                            outputs: result.outputs.clone(),
                            context: context.clone(),
                        })
                        .await;
                    return Ok((result, false));
                }

                if config.continue_on_error {
                    return self.handle_continue_on_error(node_id, config, &err, pool, context, tx).await;
                }

                self.fail_node(node_id, &err, context, tx).await
            }
        }
    }

    /// Fail the run at `node_id`: emit `NodeRunFailed` and propagate the
    /// error. Shared by the "no continue_on_error" path and by
    /// `handle_continue_on_error`'s own `ErrorStrategy::None` arm (reached
    /// when `continue_on_error` is set but there is no strategy to rescue
    /// with).
    async fn fail_node(
        &self,
        node_id: &NodeId,
        err: &NodeError,
        context: &ParallelContext,
        tx: &mpsc::Sender<GraphEngineEvent>,
    ) -> Result<(NodeRunResult, bool)> {
        error!(node_id = %node_id, error = %err.message, "node failed, no rescue");
        let _ = tx
            .send(GraphEngineEvent::NodeRunFailed {
                node_id: node_id.clone(),
                error: err.message.clone(),
                context: context.clone(),
            })
            .await;
        Err(EngineError::NodeExecution { node_id: node_id.clone(), error: err.message.clone() })
    }

    /// Apply `config.error_strategy` once a node's attempts are exhausted
    /// and `config.continue_on_error` has gated the node into a rescue
    /// attempt. `ErrorStrategy::None` still fails here — `continue_on_error`
    /// only means "try to rescue if a strategy is configured", not "always
    /// survive".
    async fn handle_continue_on_error(
        &self,
        node_id: &NodeId,
        config: &NodeConfig,
        err: &NodeError,
        pool: &Arc<Mutex<VariablePool>>,
        context: &ParallelContext,
        tx: &mpsc::Sender<GraphEngineEvent>,
    ) -> Result<(NodeRunResult, bool)> {
        use crate::graph::ErrorStrategy;

        match config.error_strategy {
            ErrorStrategy::None => self.fail_node(node_id, err, context, tx).await,
            ErrorStrategy::DefaultValue => {
                let outputs = config.default_value.clone().unwrap_or_default();
                let mut pool_guard = pool.lock().await;
                pool_guard.merge_outputs(node_id, &outputs);
                pool_guard.add(node_id, &["error_message".to_string()], Value::String(err.message.clone()));
                drop(pool_guard);
                let result = NodeRunResult::with_outputs(Value::Object(outputs));
                let _ = tx
                    .send(GraphEngineEvent::NodeRunException {
                        node_id: node_id.clone(),
                        outputs: result.outputs.clone(),
                        error: err.message.clone(),
                        context: context.clone(),
                    })
                    .await;
                Ok((result, true))
            }
            ErrorStrategy::FailBranch => {
                let mut pool_guard = pool.lock().await;
                pool_guard.add(node_id, &["error_message".to_string()], Value::String(err.message.clone()));
                pool_guard.add(node_id, &["error_type".to_string()], Value::String("fail_branch".to_string()));
                drop(pool_guard);
                let mut outputs = Map::new();
                outputs.insert("error_message".to_string(), Value::String(err.message.clone()));
                outputs.insert("error_type".to_string(), Value::String("fail_branch".to_string()));
                let result = NodeRunResult::with_outputs(Value::Object(outputs));
                let _ = tx
                    .send(GraphEngineEvent::NodeRunException {
                        node_id: node_id.clone(),
                        outputs: result.outputs.clone(),
                        error: err.message.clone(),
                        context: context.clone(),
                    })
                    .await;
                // No explicit edge selection: the node's route status is
                // set to `Exception` by the caller, and an
                // `edge_source_handle` condition on the node's outgoing
                // edges (see `condition.rs`) picks the failure branch as a
                // genuine condition rather than an ad-hoc edge id.
                Ok((result, true))
            }
        }
    }

    /// Dispatch every `start_nodes` entry of `region` as an independent
    /// branch on the worker pool, run each to (but not including) the
    /// region's end node, and report how many rescued failures occurred
    /// inside the branches so the caller can fold that into
    /// `exceptions_count`. A branch's unrescued failure is graph-fatal.
    async fn run_parallel_region(
        &self,
        region: &ParallelRegion,
        context: &ParallelContext,
        pool: &Arc<Mutex<VariablePool>>,
        routes: &mut RouteNodeStateMap,
        runtime: &mut RuntimeState,
        worker_pool: &Arc<WorkerPool>,
        cancellation: &CancellationToken,
        tx: &mpsc::Sender<GraphEngineEvent>,
    ) -> Result<u32> {
        debug!(parallel_id = %region.id, branches = region.start_nodes.len(), "dispatching parallel region");
        for start in &region.start_nodes {
            routes.entry(start).status = RouteStatus::Running;
            let _ = tx
                .send(GraphEngineEvent::ParallelBranchRunStarted {
                    parallel_id: region.id.clone(),
                    start_node_id: start.clone(),
                    context: context.clone(),
                })
                .await;
        }

        let mut handles = Vec::with_capacity(region.start_nodes.len());
        for start in region.start_nodes.clone() {
            let graph = Arc::clone(&self.graph);
            let registry = Arc::clone(&self.registry);
            let conditions = Arc::clone(&self.conditions);
            let pool = Arc::clone(pool);
            let cancellation = cancellation.clone();
            let tx = tx.clone();
            let context = context.enter_parallel(region.id.clone(), start.clone());
            let end_node = region.end_node.clone();
            let runner = Runner { graph, registry, conditions };

            let handle = worker_pool
                .submit(async move { runner.run_branch(start, end_node, pool, context, cancellation, tx).await })
                .await?;
            handles.push(handle);
        }

        let mut exceptions = 0u32;
        let mut first_fatal: Option<EngineError> = None;
        for handle in handles {
            let steps_and_outcome = handle
                .await
                .unwrap_or_else(|_| (0, Err(EngineError::Cancelled)));
            let (steps, outcome) = steps_and_outcome;
            runtime.node_run_steps += steps;
            match outcome {
                Ok((start_node_id, branch_exceptions)) => {
                    exceptions += branch_exceptions;
                    routes.entry(&start_node_id).status = RouteStatus::Succeeded;
                    let _ = tx
                        .send(GraphEngineEvent::ParallelBranchRunSucceeded {
                            parallel_id: region.id.clone(),
                            start_node_id,
                            context: context.clone(),
                        })
                        .await;
                }
                Err((start_node_id, e)) => {
                    routes.entry(&start_node_id).status = RouteStatus::Failed;
                    let _ = tx
                        .send(GraphEngineEvent::ParallelBranchRunFailed {
                            parallel_id: region.id.clone(),
                            start_node_id,
                            error: e.user_message(),
                            context: context.clone(),
                        })
                        .await;
                    if first_fatal.is_none() {
                        first_fatal = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_fatal {
            return Err(EngineError::ParallelBranchFailed { parallel_id: region.id.clone(), error: e.user_message() });
        }
        Ok(exceptions)
    }
}

fn as_object(value: &Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// The subset of engine state a spawned branch task needs; cloned cheaply
/// (everything inside is `Arc`) per branch dispatch.
struct Runner {
    graph: Arc<Graph>,
    registry: Arc<NodeRegistry>,
    conditions: Arc<ConditionManager>,
}

impl Runner {
    /// Walk nodes starting at `start`, stopping when `end_node` (if any)
    /// or a dead end is reached. Returns the number of steps taken and,
    /// on success, the branch's own start node id plus how many of its
    /// nodes were rescued by `continue_on_error`; on failure, the start
    /// node id paired with the fatal error.
    async fn run_branch(
        &self,
        start: NodeId,
        end_node: Option<NodeId>,
        pool: Arc<Mutex<VariablePool>>,
        context: ParallelContext,
        cancellation: CancellationToken,
        tx: mpsc::Sender<GraphEngineEvent>,
    ) -> (u64, std::result::Result<(NodeId, u32), (NodeId, EngineError)>) {
        let mut current = start.clone();
        let mut steps = 0u64;
        let mut exceptions = 0u32;
        let mut routes = RouteNodeStateMap::new();
        let engine = GraphEngine {
            graph: Arc::clone(&self.graph),
            registry: Arc::clone(&self.registry),
            conditions: Arc::clone(&self.conditions),
            limits: ExecutionLimits::default(),
        };

        loop {
            if Some(&current) == end_node.as_ref() {
                return (steps, Ok((start, exceptions)));
            }
            let Some(config) = self.graph.node_configs.get(&current).cloned() else {
                return (steps, Err((start, EngineError::NodeConfigMissing { node_id: current })));
            };

            let mut runtime = RuntimeState::new();
            let result = engine
                .run_node_with_retry(&current, &config, &pool, &context, &mut runtime, &cancellation, &tx)
                .await;
            steps += runtime.node_run_steps;

            match result {
                Ok((node_result, rescued)) => {
                    if rescued {
                        exceptions += 1;
                        routes.entry(&current).status = RouteStatus::Exception;
                    } else {
                        routes.entry(&current).status = RouteStatus::Succeeded;
                    }
                    let previous = routes.get(&current).cloned().expect("just set above");
                    let pool_snapshot = pool.lock().await.clone();
                    let runtime_view = runtime.with_pool(pool_snapshot);
                    let successors = match engine.select_successors(&config, &node_result, &runtime_view, &previous) {
                        Ok(s) => s,
                        Err(e) => return (steps, Err((start, e))),
                    };
                    match successors.into_iter().next() {
                        Some(next) => current = next,
                        None => return (steps, Ok((start, exceptions))),
                    }
                }
                Err(e) => return (steps, Err((start, e))),
            }
        }
    }
}
