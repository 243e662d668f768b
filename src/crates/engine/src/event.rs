//! The event model the engine emits. Every state change the driver makes
//! is represented as one of these before anything else observes it —
//! the response pipeline, a UI, a log sink all subscribe to the same
//! stream rather than polling engine internals.

use crate::graph::NodeId;
use crate::runtime_state::LlmUsage;
use serde_json::Value;
use std::time::Duration;

/// Tags an event with its position in nested parallel/iteration/loop
/// scopes, so a consumer reconstructing a UI tree knows which branch and
/// which iteration index an event belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParallelContext {
    /// Id of the innermost parallel region the event occurred in, if any.
    pub parallel_id: Option<String>,
    /// Id of the start node of that region, used to correlate
    /// `ParallelBranchRunStarted`/`Succeeded`/`Failed` triples.
    pub parallel_start_node_id: Option<String>,
    /// Id of the innermost iteration/loop node the event occurred in, if
    /// any.
    pub in_iteration_id: Option<String>,
    /// Id of the innermost loop node the event occurred in, if any.
    pub in_loop_id: Option<String>,
}

impl ParallelContext {
    /// The empty, top-level context.
    pub fn root() -> Self {
        Self::default()
    }

    /// Derive a child context nested one level inside a parallel region.
    pub fn enter_parallel(&self, parallel_id: impl Into<String>, start_node_id: impl Into<String>) -> Self {
        Self {
            parallel_id: Some(parallel_id.into()),
            parallel_start_node_id: Some(start_node_id.into()),
            ..self.clone()
        }
    }

    /// Derive a child context nested one level inside an iteration node.
    pub fn enter_iteration(&self, node_id: impl Into<String>) -> Self {
        Self {
            in_iteration_id: Some(node_id.into()),
            ..self.clone()
        }
    }

    /// Derive a child context nested one level inside a loop node.
    pub fn enter_loop(&self, node_id: impl Into<String>) -> Self {
        Self {
            in_loop_id: Some(node_id.into()),
            ..self.clone()
        }
    }
}

/// One reported lifecycle event. `Clone` because the response pipeline and
/// any logging subscriber both need their own copy from the broadcast
/// channel.
#[derive(Debug, Clone)]
pub enum GraphEngineEvent {
    /// The run has begun; emitted exactly once, first.
    GraphRunStarted {
        /// Correlates every event in this run, including in logs.
        run_id: uuid::Uuid,
    },
    /// The run reached an `End`/`Answer` node with nothing left runnable
    /// and no unrescued failures.
    GraphRunSucceeded {
        /// Accumulated output variables from terminal nodes.
        outputs: Value,
        /// Total LLM token usage across the run.
        llm_usage: LlmUsage,
    },
    /// The run reached a terminal state where some branches failed but
    /// were individually rescued by `continue_on_error`, while others
    /// completed normally.
    GraphRunPartialSucceeded {
        /// Accumulated output variables from terminal nodes.
        outputs: Value,
        /// Ids of nodes that failed but were rescued.
        exceptions_count: u32,
    },
    /// The run aborted: a graph-fatal error, or a node failure with no
    /// rescue available.
    GraphRunFailed {
        /// Human-readable failure description.
        error: String,
    },

    /// A node has been dispatched and is about to run.
    NodeRunStarted {
        /// The node's id.
        node_id: NodeId,
        /// Nesting context.
        context: ParallelContext,
    },
    /// A node finished without error.
    NodeRunSucceeded {
        /// The node's id.
        node_id: NodeId,
        /// Its output variables.
        outputs: Value,
        /// Nesting context.
        context: ParallelContext,
    },
    /// A node finished with an unrescued error.
    NodeRunFailed {
        /// The node's id.
        node_id: NodeId,
        /// Human-readable error description.
        error: String,
        /// Nesting context.
        context: ParallelContext,
    },
    /// A node's attempt failed but was rescued by its `error_strategy`
    /// (`DefaultValue` or `FailBranch`) because `continue_on_error` is set.
    /// Distinct from `NodeRunFailed`/`kind: Exception`, which this variant
    /// replaces — a rescue is not an unrescued failure, so it gets its own
    /// event rather than reusing `NodeRunFailed`'s shape.
    NodeRunException {
        /// The node's id.
        node_id: NodeId,
        /// The rescue output now standing in for this node's result —
        /// the configured default value, or the node's own partial
        /// outputs for a fail-branch rescue.
        outputs: Value,
        /// The error that triggered the rescue.
        error: String,
        /// Nesting context.
        context: ParallelContext,
    },
    /// A node's attempt failed but a retry is scheduled.
    NodeRunRetry {
        /// The node's id.
        node_id: NodeId,
        /// 1-based attempt number that just failed.
        attempt: u32,
        /// How long the driver will wait before the next attempt.
        retry_after: Duration,
        /// The attempt's error description.
        error: String,
        /// Nesting context.
        context: ParallelContext,
    },
    /// A chunk of streamed text from an LLM-backed node.
    NodeRunStreamChunk {
        /// The node's id.
        node_id: NodeId,
        /// The chunk's text.
        chunk: String,
        /// Whether this chunk should be surfaced to the end user as part
        /// of the final answer (vs. being an internal/intermediate node).
        is_final_answer: bool,
        /// Nesting context.
        context: ParallelContext,
    },
    /// A retrieval node surfaced source documents.
    NodeRunRetrieverResource {
        /// The node's id.
        node_id: NodeId,
        /// Retrieved resource metadata, node-defined shape.
        resource: Value,
        /// Nesting context.
        context: ParallelContext,
    },

    /// A parallel branch has been submitted to the worker pool.
    ParallelBranchRunStarted {
        /// The region's id.
        parallel_id: String,
        /// The branch's start node id.
        start_node_id: NodeId,
        /// Nesting context (of the scope the region itself is nested in).
        context: ParallelContext,
    },
    /// A parallel branch ran to completion.
    ParallelBranchRunSucceeded {
        /// The region's id.
        parallel_id: String,
        /// The branch's start node id.
        start_node_id: NodeId,
        /// Nesting context.
        context: ParallelContext,
    },
    /// A parallel branch failed.
    ParallelBranchRunFailed {
        /// The region's id.
        parallel_id: String,
        /// The branch's start node id.
        start_node_id: NodeId,
        /// Human-readable failure description.
        error: String,
        /// Nesting context.
        context: ParallelContext,
    },

    /// An iteration node began.
    IterationRunStarted {
        /// The iteration node's id.
        node_id: NodeId,
        /// Number of items the iteration will process.
        total: usize,
    },
    /// One iteration pass finished.
    IterationRunNext {
        /// The iteration node's id.
        node_id: NodeId,
        /// 0-based index of the pass that just completed.
        index: usize,
        /// That pass's output.
        output: Value,
    },
    /// An iteration node finished all passes.
    IterationRunSucceeded {
        /// The iteration node's id.
        node_id: NodeId,
        /// Collected outputs, one per pass.
        outputs: Value,
    },
    /// An iteration node failed.
    IterationRunFailed {
        /// The iteration node's id.
        node_id: NodeId,
        /// Human-readable failure description.
        error: String,
    },

    /// A loop node began.
    LoopRunStarted {
        /// The loop node's id.
        node_id: NodeId,
    },
    /// One loop pass finished.
    LoopRunNext {
        /// The loop node's id.
        node_id: NodeId,
        /// 0-based index of the pass that just completed.
        index: usize,
    },
    /// A loop node finished, either by exhausting its break condition or
    /// hitting its pass limit.
    LoopRunSucceeded {
        /// The loop node's id.
        node_id: NodeId,
        /// The final accumulated output.
        output: Value,
    },
    /// A loop node failed.
    LoopRunFailed {
        /// The loop node's id.
        node_id: NodeId,
        /// Human-readable failure description.
        error: String,
    },

    /// A structured log line emitted by an agent-strategy node, passed
    /// through unmodified.
    AgentLog {
        /// The node's id.
        node_id: NodeId,
        /// The log payload, node-defined shape.
        payload: Value,
    },
}

impl GraphEngineEvent {
    /// Whether this event marks the run as having reached a terminal
    /// state — the driver stops emitting after one of these.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            GraphEngineEvent::GraphRunSucceeded { .. }
                | GraphEngineEvent::GraphRunPartialSucceeded { .. }
                | GraphEngineEvent::GraphRunFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_terminal_events_are_recognized() {
        assert!(GraphEngineEvent::GraphRunFailed { error: "x".into() }.is_run_terminal());
        assert!(!GraphEngineEvent::GraphRunStarted { run_id: uuid::Uuid::new_v4() }.is_run_terminal());
    }

    #[test]
    fn context_nesting_preserves_outer_fields() {
        let root = ParallelContext::root().enter_parallel("p1", "n1");
        let nested = root.enter_iteration("iter1");
        assert_eq!(nested.parallel_id.as_deref(), Some("p1"));
        assert_eq!(nested.in_iteration_id.as_deref(), Some("iter1"));
    }
}
