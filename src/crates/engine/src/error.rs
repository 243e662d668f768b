//! Error types for graph construction and execution.
//!
//! `EngineError` is the single error type returned by every fallible
//! operation in this crate. Construction-time errors (bad `graph_config`)
//! are reported through [`EngineError::Graph`]; everything else is a
//! runtime error raised while a graph is being driven (see §7 of
//! `SPEC_FULL.md` for the full taxonomy).

use crate::graph::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while validating a graph's static structure.
///
/// These can only occur during [`crate::graph::Graph::try_from_config`],
/// never once a run is underway.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphValidationError {
    /// No node has `node_type == Start`, or more than one does.
    #[error("graph must have exactly one root node, found {found}")]
    RootNodeCount {
        /// Number of candidate root nodes found.
        found: usize,
    },

    /// An edge references a node id that isn't in `nodes`.
    #[error("edge references unknown node `{node_id}`")]
    DanglingEdge {
        /// The missing node id.
        node_id: String,
    },

    /// A direct cycle was found between ordinary (non iteration/loop) nodes.
    #[error("cyclic edge between ordinary nodes detected at `{node_id}`")]
    CyclicEdge {
        /// The node at which the cycle was detected.
        node_id: String,
    },

    /// A parallel region's fan-out node has an edge leaving the region.
    #[error("parallel region `{parallel_id}` fan-out edge leaves the region via `{node_id}`")]
    ParallelRegionEscape {
        /// The region whose invariant was violated.
        parallel_id: String,
        /// The node the escaping edge targets.
        node_id: String,
    },
}

/// The crate's runtime error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// `graph_config` failed structural validation; never raised mid-run.
    #[error("graph validation failed: {0}")]
    Graph(#[from] GraphValidationError),

    /// `node_run_steps` exceeded `max_execution_steps`. Graph-fatal.
    #[error("max execution steps ({limit}) reached")]
    MaxStepsReached {
        /// The configured step limit.
        limit: u64,
    },

    /// Wall-clock run time exceeded `max_execution_time`. Graph-fatal.
    #[error("max execution time ({limit:?}) reached")]
    MaxTimeReached {
        /// The configured time limit.
        limit: Duration,
    },

    /// A visited node id has no corresponding entry in the graph config, or
    /// its `(node_type, version)` isn't registered. Graph-fatal.
    #[error("node `{node_id}` config not found or its type/version isn't registered")]
    NodeConfigMissing {
        /// The node that couldn't be resolved.
        node_id: NodeId,
    },

    /// A parallel edge group's target isn't mapped to any parallel region.
    #[error("node `{node_id}` has no parallel region, or is wired into more than one")]
    ParallelRegionMissing {
        /// The node whose region lookup failed.
        node_id: NodeId,
    },

    /// The region id resolved by a parallel dispatch has no entry in
    /// `Graph::parallel_regions`.
    #[error("parallel region `{parallel_id}` not found")]
    ParallelRegionNotFound {
        /// The region id that was looked up.
        parallel_id: String,
    },

    /// The worker pool's submit-count cap was exceeded. Graph-fatal.
    #[error("max submit count ({max_submit_count}) of workflow worker pool reached")]
    WorkerPoolFull {
        /// The configured cap.
        max_submit_count: usize,
    },

    /// A parallel branch raised a fatal error; the whole run aborts.
    #[error("parallel branch `{parallel_id}` failed: {error}")]
    ParallelBranchFailed {
        /// The failing region's id.
        parallel_id: String,
        /// The branch's error message.
        error: String,
    },

    /// A node's own execution failed without `continue_on_error`, and
    /// retries (if any) were exhausted.
    #[error("node `{node_id}` execution failed: {error}")]
    NodeExecution {
        /// The failing node.
        node_id: NodeId,
        /// The node-reported error message.
        error: String,
    },

    /// The consumer stopped reading, or a deadline tripped while a node or
    /// parallel branch was suspended.
    #[error("workflow stopped")]
    Cancelled,
}

impl EngineError {
    /// Human-readable error text suitable for a `GraphRunFailed` event —
    /// the engine never surfaces a Rust `Debug` representation or stack
    /// trace to the event stream, only this.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}
