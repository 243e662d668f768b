//! The node contract: what the driver asks of a node implementation, and
//! what it gets back. Concrete node behaviors (LLM calls, HTTP requests,
//! retrieval, …) live outside this crate; this module only defines the
//! seam and a small set of deterministic nodes used by the test suite.

use crate::graph::{ErrorStrategy, NodeConfig, NodeType, RetryConfig};
use crate::runtime_state::LlmUsage;
use crate::variable_pool::{KeyPath, VariablePool};
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a node needs to read from the run to do its work: a read
/// view of the variable pool built up by prior nodes. A node's own
/// configuration is read through the introspection methods of [`Node`]
/// itself, set once at construction time (see [`Node::run`]).
pub struct NodeContext<'a> {
    /// The pool of variables written by nodes that ran before this one.
    pub pool: &'a VariablePool,
    /// Cooperative cancellation signal; a long-running node should race
    /// its work against this in a `tokio::select!`.
    pub cancellation: CancellationToken,
}

/// What a node reports back to the driver once it completes.
#[derive(Debug, Clone)]
pub struct NodeRunResult {
    /// Variables this node wrote, to be merged into the pool under its
    /// own node id.
    pub outputs: Value,
    /// Token usage, if this node made an LLM call.
    pub llm_usage: Option<LlmUsage>,
    /// The edge selector this node chose, for `Condition`/`Agent` nodes
    /// that route dynamically. `None` means "take every outgoing edge
    /// whose static condition matches", the default fan-out behavior.
    pub selected_edge: Option<String>,
}

impl NodeRunResult {
    /// A result carrying no outputs and the default routing behavior —
    /// the common case for nodes that don't branch.
    pub fn empty() -> Self {
        Self {
            outputs: Value::Object(Default::default()),
            llm_usage: None,
            selected_edge: None,
        }
    }

    /// A result carrying `outputs` and default routing.
    pub fn with_outputs(outputs: Value) -> Self {
        Self {
            outputs,
            llm_usage: None,
            selected_edge: None,
        }
    }
}

/// An error a node implementation raises. Node implementations outside
/// this crate construct these from whatever failure they hit (HTTP
/// error, LLM provider error, …); the driver never inspects the variant,
/// only the message and retryability.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct NodeError {
    /// Human-readable description, surfaced in events and as a fallback
    /// output value under `error_message`.
    pub message: String,
    /// Whether the driver's retry policy should apply another attempt
    /// (if `retry_config` allows one) before falling back to the node's
    /// `error_strategy`.
    pub retryable: bool,
}

impl NodeError {
    /// A retryable failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    /// A failure the retry policy should not re-attempt.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

/// The terminal outcome of one run attempt, reported exactly once by a
/// node's event stream.
#[derive(Debug, Clone)]
pub enum NodeCompletion {
    /// The attempt succeeded.
    Succeeded(NodeRunResult),
    /// The attempt failed. `outputs` carries whatever partial result the
    /// node produced before failing (e.g. an HTTP response body received
    /// under a non-2xx status) — empty when nothing was produced. This is
    /// what lets the driver's HTTP retry-exhausted coercion surface a
    /// node's real partial output instead of fabricating one.
    Failed {
        /// The failure itself.
        error: NodeError,
        /// Partial output produced before the failure, if any.
        outputs: Value,
    },
}

/// One event produced while a node runs.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A chunk of streamed text (an LLM token, say).
    StreamChunk {
        /// The chunk's text.
        chunk: String,
        /// Whether this chunk is part of the end-user-visible answer.
        is_final_answer: bool,
    },
    /// Retrieved source documents, surfaced as they're found.
    RetrieverResource {
        /// Node-defined resource metadata.
        resource: Value,
    },
    /// The node has finished. Exactly one of these terminates the
    /// stream; the driver treats a stream that ends without one as
    /// [`crate::error::EngineError::NodeExecution`].
    Completed(NodeCompletion),
}

/// The stream a node's [`Node::run`] returns.
pub type NodeEventStream<'a> = BoxStream<'a, NodeEvent>;

/// A selector into the variable pool, e.g. `[node_id, key, ...]`.
pub type VariableSelector = KeyPath;

/// The contract every node type implements. Implementations are expected
/// to be cheap to construct from their [`NodeConfig`] and hold no
/// run-specific state beyond what [`NodeContext`] and their own event
/// stream carry.
pub trait Node: Send + Sync {
    /// This node's id, as it appears in the graph config.
    fn node_id(&self) -> &str;
    /// This node's type tag.
    fn node_type(&self) -> NodeType;
    /// The implementation version this instance was built for.
    fn version(&self) -> &str;
    /// How a failure of this node, once retries are spent, should be
    /// handled.
    fn error_strategy(&self) -> ErrorStrategy;
    /// Whether `error_strategy` should actually be applied on failure, as
    /// opposed to failing the run outright.
    fn continue_on_error(&self) -> bool;
    /// This node's retry policy.
    fn retry(&self) -> RetryConfig;
    /// The substitute output `ErrorStrategy::DefaultValue` writes on
    /// rescue, if configured.
    fn default_value(&self) -> Option<&Map<String, Value>>;

    /// Variables this node reads from the pool, keyed by the name they're
    /// bound to in its own config. Used by callers that need a node's
    /// data dependencies without running it (e.g. carving a sub-graph).
    /// Most node types don't need to report this; the default is
    /// conservatively empty.
    fn extract_variable_selector_mapping(&self) -> HashMap<String, VariableSelector> {
        HashMap::new()
    }

    /// Run this node once, as a stream of events terminated by exactly
    /// one [`NodeEvent::Completed`]. The driver handles retry/error-
    /// strategy orchestration around one full drain of this stream; an
    /// implementation just reports what happened on this one attempt.
    fn run<'a>(&'a self, ctx: NodeContext<'a>) -> NodeEventStream<'a>;
}

/// A constructor for a node implementation, keyed by `(node_type,
/// version)` in [`NodeRegistry`]. Takes the node's own [`NodeConfig`] so
/// an implementation can read its configured error/retry policy and
/// type-specific `data` payload at construction time — this is this
/// crate's `init`.
pub type NodeFactory = Arc<dyn Fn(&NodeConfig) -> Arc<dyn Node> + Send + Sync>;

/// Maps `(node_type, version)` to a constructor. Node implementations are
/// registered by the embedding application at startup; this crate ships
/// only the registry itself and, under `cfg(test)`, a handful of
/// deterministic nodes used to exercise the driver.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    factories: HashMap<(NodeType, String), NodeFactory>,
}

impl NodeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `(node_type, version)`, overwriting any
    /// previous registration for the same key.
    pub fn register(
        &mut self,
        node_type: NodeType,
        version: impl Into<String>,
        factory: impl Fn(&NodeConfig) -> Arc<dyn Node> + Send + Sync + 'static,
    ) {
        self.factories.insert((node_type, version.into()), Arc::new(factory));
    }

    /// Build a fresh node instance for `config`, or `None` if nothing is
    /// registered for its `(node_type, version)`.
    pub fn build(&self, config: &NodeConfig) -> Option<Arc<dyn Node>> {
        self.factories
            .get(&(config.node_type, config.version.clone()))
            .map(|f| f(config))
    }
}

/// Test-only node implementations used by the crate's own test suite and
/// available to downstream integration tests that need a deterministic
/// fixture.
#[cfg(any(test, feature = "test-support"))]
pub mod fixtures {
    use super::*;
    use futures::stream;
    use std::sync::atomic::{AtomicU32, Ordering};

    macro_rules! introspect_from_config {
        () => {
            fn node_id(&self) -> &str {
                &self.config.node_id
            }
            fn node_type(&self) -> NodeType {
                self.config.node_type
            }
            fn version(&self) -> &str {
                &self.config.version
            }
            fn error_strategy(&self) -> ErrorStrategy {
                self.config.error_strategy
            }
            fn continue_on_error(&self) -> bool {
                self.config.continue_on_error
            }
            fn retry(&self) -> RetryConfig {
                self.config.retry
            }
            fn default_value(&self) -> Option<&Map<String, Value>> {
                self.config.default_value.as_ref()
            }
        };
    }

    /// Always succeeds, echoing a fixed value under `outputs.echo`.
    pub struct EchoNode {
        /// The value this node writes on every run.
        pub value: Value,
        config: NodeConfig,
    }

    impl EchoNode {
        /// A node that always echoes `value`, using `config` for its
        /// introspection methods.
        pub fn new(value: Value, config: NodeConfig) -> Self {
            Self { value, config }
        }
    }

    impl Node for EchoNode {
        introspect_from_config!();

        fn run<'a>(&'a self, _ctx: NodeContext<'a>) -> NodeEventStream<'a> {
            let mut outputs = Map::new();
            outputs.insert("echo".to_string(), self.value.clone());
            let result = NodeRunResult::with_outputs(Value::Object(outputs));
            Box::pin(stream::once(async move { NodeEvent::Completed(NodeCompletion::Succeeded(result)) }))
        }
    }

    /// Always fails with a fixed message and no partial output.
    pub struct FailingNode {
        /// The message every attempt fails with.
        pub message: String,
        /// Whether the driver's retry policy should re-attempt.
        pub retryable: bool,
        config: NodeConfig,
    }

    impl FailingNode {
        /// A node that always fails with `message`.
        pub fn new(message: impl Into<String>, retryable: bool, config: NodeConfig) -> Self {
            Self { message: message.into(), retryable, config }
        }
    }

    impl Node for FailingNode {
        introspect_from_config!();

        fn run<'a>(&'a self, _ctx: NodeContext<'a>) -> NodeEventStream<'a> {
            let error = NodeError { message: self.message.clone(), retryable: self.retryable };
            Box::pin(stream::once(async move {
                NodeEvent::Completed(NodeCompletion::Failed { error, outputs: Value::Object(Map::new()) })
            }))
        }
    }

    /// Sleeps for a fixed duration before succeeding; used to exercise
    /// cancellation and wall-clock limit checks.
    pub struct SleepNode {
        /// How long to sleep.
        pub duration: std::time::Duration,
        config: NodeConfig,
    }

    impl SleepNode {
        /// A node that sleeps for `duration` before succeeding.
        pub fn new(duration: std::time::Duration, config: NodeConfig) -> Self {
            Self { duration, config }
        }
    }

    impl Node for SleepNode {
        introspect_from_config!();

        fn run<'a>(&'a self, ctx: NodeContext<'a>) -> NodeEventStream<'a> {
            Box::pin(async_stream::stream! {
                tokio::select! {
                    _ = tokio::time::sleep(self.duration) => {
                        yield NodeEvent::Completed(NodeCompletion::Succeeded(NodeRunResult::empty()));
                    }
                    _ = ctx.cancellation.cancelled() => {
                        yield NodeEvent::Completed(NodeCompletion::Failed {
                            error: NodeError::permanent("cancelled"),
                            outputs: Value::Object(Map::new()),
                        });
                    }
                }
            })
        }
    }

    /// Fails on its first `fail_times` attempts, then succeeds. Used to
    /// exercise the retry counter and `NodeRunRetry` events.
    pub struct CountingRetryNode {
        /// How many attempts must fail before one succeeds.
        pub fail_times: u32,
        attempts: AtomicU32,
        config: NodeConfig,
    }

    impl CountingRetryNode {
        /// A node that fails `fail_times` times before succeeding.
        pub fn new(fail_times: u32, config: NodeConfig) -> Self {
            Self { fail_times, attempts: AtomicU32::new(0), config }
        }
    }

    impl Node for CountingRetryNode {
        introspect_from_config!();

        fn run<'a>(&'a self, _ctx: NodeContext<'a>) -> NodeEventStream<'a> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let fail_times = self.fail_times;
            Box::pin(stream::once(async move {
                if attempt <= fail_times {
                    NodeEvent::Completed(NodeCompletion::Failed {
                        error: NodeError::retryable(format!("attempt {attempt} failed")),
                        outputs: Value::Object(Map::new()),
                    })
                } else {
                    NodeEvent::Completed(NodeCompletion::Succeeded(NodeRunResult::empty()))
                }
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::graph::{ErrorStrategy, RetryConfig};
    use futures::StreamExt;

    fn dummy_config() -> NodeConfig {
        NodeConfig {
            node_id: "n1".to_string(),
            node_type: NodeType::Code,
            version: "1".to_string(),
            error_strategy: ErrorStrategy::None,
            continue_on_error: false,
            retry: RetryConfig::default(),
            default_value: None,
            data: Value::Object(Default::default()),
        }
    }

    async fn run_to_completion(node: &dyn Node, ctx: NodeContext<'_>) -> NodeCompletion {
        let mut stream = node.run(ctx);
        let mut last = None;
        while let Some(event) = stream.next().await {
            if let NodeEvent::Completed(completion) = event {
                last = Some(completion);
            }
        }
        last.expect("fixture streams always terminate with Completed")
    }

    #[tokio::test]
    async fn registry_builds_registered_node() {
        let mut registry = NodeRegistry::new();
        registry.register(NodeType::Code, "1", |cfg| Arc::new(EchoNode::new(Value::Bool(true), cfg.clone())));
        let config = dummy_config();
        let node = registry.build(&config).expect("registered");
        let pool = VariablePool::new();
        let ctx = NodeContext { pool: &pool, cancellation: CancellationToken::new() };
        let completion = run_to_completion(node.as_ref(), ctx).await;
        let NodeCompletion::Succeeded(result) = completion else {
            panic!("expected success");
        };
        assert_eq!(result.outputs["echo"], Value::Bool(true));
    }

    #[test]
    fn registry_returns_none_for_unregistered_pair() {
        let registry = NodeRegistry::new();
        let mut config = dummy_config();
        config.node_type = NodeType::Llm;
        assert!(registry.build(&config).is_none());
    }

    #[tokio::test]
    async fn counting_retry_node_succeeds_after_threshold() {
        let config = dummy_config();
        let node = CountingRetryNode::new(2, config.clone());
        let pool = VariablePool::new();
        for expect_err in [true, true, false] {
            let ctx = NodeContext { pool: &pool, cancellation: CancellationToken::new() };
            let completion = run_to_completion(&node, ctx).await;
            assert_eq!(matches!(completion, NodeCompletion::Failed { .. }), expect_err);
        }
    }
}
