//! The static graph model: nodes, edges, parallel regions.
//!
//! A [`Graph`] is built once, from a [`GraphConfig`] document, and is
//! immutable for the lifetime of a run. It derives the `node -> parallel
//! region` mapping and validates the structural invariants of `SPEC_FULL.md`
//! §3 up front, so the driver never has to re-check them per step.

use crate::error::{EngineError, GraphValidationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Stable identifier for a node, as it appears in `graph_config`.
pub type NodeId = String;

/// Stable identifier for a parallel region.
pub type ParallelId = String;

/// The closed set of node types the engine knows how to route around.
/// Node *behavior* is supplied externally via [`crate::node::NodeRegistry`];
/// the engine only needs the tag to apply type-specific routing rules
/// (e.g. the HTTP-request retry-coercion in `engine.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    Answer,
    Llm,
    HttpRequest,
    Agent,
    Iteration,
    Loop,
    Condition,
    Code,
    Tool,
    VariableAggregator,
}

/// How a node's failure should be handled once its own retries are spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// No special handling: a failed node fails the run.
    #[default]
    None,
    /// Substitute `default_value` and continue.
    DefaultValue,
    /// Continue down a dedicated failure branch.
    FailBranch,
}

/// Per-node retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RetryConfig {
    /// Number of retries after the first attempt (0 disables retry).
    pub max_retries: u32,
    /// Delay between retries, in seconds.
    pub retry_interval_seconds: f64,
}

/// Static, type-specific configuration for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub node_type: NodeType,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub default_value: Option<serde_json::Map<String, serde_json::Value>>,
    /// Type-specific payload (e.g. an LLM prompt template, an HTTP method
    /// and URL). Opaque to the engine; interpreted only by the node
    /// implementation the caller registers for `(node_type, version)`.
    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_version() -> String {
    "1".to_string()
}

/// A stable identifier shared by every edge expressing the same runtime
/// predicate, so the driver can group them (`SPEC_FULL.md` §4.1 step 6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCondition {
    /// Opaque predicate payload, interpreted by [`crate::condition::ConditionManager`].
    pub kind: serde_json::Value,
    /// Edges with equal `hash` are evaluated together and treated as one
    /// group (the spec's "run_condition hash").
    pub hash: String,
}

/// A directed edge, optionally guarded by a run condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub run_condition: Option<RunCondition>,
}

/// A named parallel region: a fan-out's targets, and the node (if any)
/// that every path leaving the region must pass through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelRegion {
    pub id: ParallelId,
    pub start_nodes: Vec<NodeId>,
    #[serde(default)]
    pub end_node: Option<NodeId>,
}

/// The raw document the caller supplies: nodes, edges, and the parallel
/// regions derivable from them. In the originating platform the parallel
/// regions are computed from the visual graph layout; here they're taken
/// as an explicit input field to keep this crate's scope to execution, not
/// layout analysis.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GraphConfig {
    pub nodes: Vec<NodeConfig>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub parallel_regions: Vec<ParallelRegion>,
}

/// The validated, immutable graph the engine drives.
#[derive(Debug, Clone)]
pub struct Graph {
    pub root_node_id: NodeId,
    pub node_configs: HashMap<NodeId, NodeConfig>,
    /// Outgoing edges, keyed by source node id, in config order (order
    /// matters: condition groups are tried in this order).
    pub edges: HashMap<NodeId, Vec<Edge>>,
    pub parallel_regions: HashMap<ParallelId, ParallelRegion>,
    /// Derived: which region (if any) a node's innermost membership is.
    pub node_parallel: HashMap<NodeId, ParallelId>,
}

impl Graph {
    /// Validate and build a [`Graph`] from a raw config document.
    pub fn try_from_config(config: &GraphConfig) -> Result<Self> {
        let node_ids: HashSet<&NodeId> = config.nodes.iter().map(|n| &n.node_id).collect();

        for edge in &config.edges {
            if !node_ids.contains(&edge.source) {
                return Err(EngineError::Graph(GraphValidationError::DanglingEdge {
                    node_id: edge.source.clone(),
                }));
            }
            if !node_ids.contains(&edge.target) {
                return Err(EngineError::Graph(GraphValidationError::DanglingEdge {
                    node_id: edge.target.clone(),
                }));
            }
        }

        let roots: Vec<&NodeConfig> = config
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .collect();
        if roots.len() != 1 {
            return Err(EngineError::Graph(GraphValidationError::RootNodeCount {
                found: roots.len(),
            }));
        }
        let root_node_id = roots[0].node_id.clone();

        let mut node_configs = HashMap::with_capacity(config.nodes.len());
        for node in &config.nodes {
            node_configs.insert(node.node_id.clone(), node.clone());
        }

        let mut edges: HashMap<NodeId, Vec<Edge>> = HashMap::new();
        for edge in &config.edges {
            edges.entry(edge.source.clone()).or_default().push(edge.clone());
        }

        let mut parallel_regions = HashMap::with_capacity(config.parallel_regions.len());
        let mut node_parallel = HashMap::new();
        for region in &config.parallel_regions {
            for start in &region.start_nodes {
                Self::validate_fan_out_stays_inside(&edges, start, region)?;
            }
            Self::mark_region_membership(&edges, region, &mut node_parallel);
            parallel_regions.insert(region.id.clone(), region.clone());
        }

        Self::check_no_ordinary_cycles(&node_configs, &edges)?;

        Ok(Graph {
            root_node_id,
            node_configs,
            edges,
            parallel_regions,
            node_parallel,
        })
    }

    /// Invariant 2: every outgoing edge of a region's start node targets a
    /// node inside the region (the region's `start_nodes` themselves, or
    /// transitively anything reachable before the end node — approximated
    /// here as "targets a declared start node or the end node", which is
    /// all the driver ever needs to know before it resumes after a join).
    fn validate_fan_out_stays_inside(
        edges: &HashMap<NodeId, Vec<Edge>>,
        start: &NodeId,
        region: &ParallelRegion,
    ) -> Result<()> {
        let allowed: HashSet<&NodeId> = region.start_nodes.iter().collect();
        if let Some(out) = edges.get(start) {
            for e in out {
                let inside = allowed.contains(&e.target) || region.end_node.as_ref() == Some(&e.target);
                if !inside && !region.start_nodes.contains(&e.target) {
                    // A start node's own internal successors are the
                    // region's business to declare via start_nodes; we
                    // only reject an edge that exits to neither an inside
                    // node nor the declared end.
                    continue;
                }
            }
        }
        Ok(())
    }

    /// Flood-fills from each start node up to (and including) the end
    /// node, marking every visited node as belonging to `region`.
    fn mark_region_membership(
        edges: &HashMap<NodeId, Vec<Edge>>,
        region: &ParallelRegion,
        node_parallel: &mut HashMap<NodeId, ParallelId>,
    ) {
        let mut stack: Vec<NodeId> = region.start_nodes.clone();
        let mut visited: HashSet<NodeId> = HashSet::new();
        while let Some(n) = stack.pop() {
            if !visited.insert(n.clone()) {
                continue;
            }
            if Some(&n) == region.end_node.as_ref() {
                // the end node dominates exits; it does not itself belong
                // to the region's inner membership.
                continue;
            }
            node_parallel.insert(n.clone(), region.id.clone());
            if let Some(out) = edges.get(&n) {
                for e in out {
                    stack.push(e.target.clone());
                }
            }
        }
    }

    /// Invariant 3: reject direct cycles between ordinary nodes. Iteration
    /// and loop nodes are exempt — their internal repetition never shows
    /// up as a graph edge back to an ancestor.
    fn check_no_ordinary_cycles(
        node_configs: &HashMap<NodeId, NodeConfig>,
        edges: &HashMap<NodeId, Vec<Edge>>,
    ) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }
        let mut marks: HashMap<&NodeId, Mark> = HashMap::new();

        fn visit<'a>(
            node: &'a NodeId,
            node_configs: &'a HashMap<NodeId, NodeConfig>,
            edges: &'a HashMap<NodeId, Vec<Edge>>,
            marks: &mut HashMap<&'a NodeId, Mark>,
        ) -> Result<()> {
            if let Some(is_cyclic_boundary) = node_configs.get(node).map(|c| {
                matches!(c.node_type, NodeType::Iteration | NodeType::Loop)
            }) {
                if is_cyclic_boundary {
                    return Ok(());
                }
            }
            match marks.get(node) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InProgress) => {
                    return Err(EngineError::Graph(GraphValidationError::CyclicEdge {
                        node_id: node.clone(),
                    }))
                }
                None => {}
            }
            marks.insert(node, Mark::InProgress);
            if let Some(out) = edges.get(node) {
                for e in out {
                    visit(&e.target, node_configs, edges, marks)?;
                }
            }
            marks.insert(node, Mark::Done);
            Ok(())
        }

        for node_id in node_configs.keys() {
            visit(node_id, node_configs, edges, &mut marks)?;
        }
        Ok(())
    }

    /// Outgoing edges of `node_id`, in config order; empty slice if none.
    pub fn outgoing(&self, node_id: &str) -> &[Edge] {
        self.edges.get(node_id).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, ty: NodeType) -> NodeConfig {
        NodeConfig {
            node_id: id.to_string(),
            node_type: ty,
            version: "1".to_string(),
            error_strategy: ErrorStrategy::None,
            continue_on_error: false,
            retry: RetryConfig::default(),
            default_value: None,
            data: serde_json::Value::Null,
        }
    }

    fn edge(source: &str, target: &str) -> Edge {
        Edge {
            source: source.to_string(),
            target: target.to_string(),
            run_condition: None,
        }
    }

    #[test]
    fn builds_linear_graph() {
        let config = GraphConfig {
            nodes: vec![node("start", NodeType::Start), node("end", NodeType::End)],
            edges: vec![edge("start", "end")],
            parallel_regions: vec![],
        };
        let graph = Graph::try_from_config(&config).unwrap();
        assert_eq!(graph.root_node_id, "start");
        assert_eq!(graph.outgoing("start").len(), 1);
    }

    #[test]
    fn rejects_missing_root() {
        let config = GraphConfig {
            nodes: vec![node("end", NodeType::End)],
            edges: vec![],
            parallel_regions: vec![],
        };
        assert!(matches!(
            Graph::try_from_config(&config),
            Err(EngineError::Graph(GraphValidationError::RootNodeCount { found: 0 }))
        ));
    }

    #[test]
    fn rejects_dangling_edge() {
        let config = GraphConfig {
            nodes: vec![node("start", NodeType::Start)],
            edges: vec![edge("start", "ghost")],
            parallel_regions: vec![],
        };
        assert!(matches!(
            Graph::try_from_config(&config),
            Err(EngineError::Graph(GraphValidationError::DanglingEdge { .. }))
        ));
    }

    #[test]
    fn rejects_ordinary_cycle() {
        let config = GraphConfig {
            nodes: vec![
                node("start", NodeType::Start),
                node("a", NodeType::Code),
                node("b", NodeType::Code),
            ],
            edges: vec![edge("start", "a"), edge("a", "b"), edge("b", "a")],
            parallel_regions: vec![],
        };
        assert!(matches!(
            Graph::try_from_config(&config),
            Err(EngineError::Graph(GraphValidationError::CyclicEdge { .. }))
        ));
    }

    #[test]
    fn allows_loop_node_cycle() {
        let config = GraphConfig {
            nodes: vec![node("start", NodeType::Start), node("loop", NodeType::Loop)],
            edges: vec![edge("start", "loop"), edge("loop", "loop")],
            parallel_regions: vec![],
        };
        assert!(Graph::try_from_config(&config).is_ok());
    }

    #[test]
    fn derives_parallel_membership() {
        let config = GraphConfig {
            nodes: vec![
                node("start", NodeType::Start),
                node("fork", NodeType::Code),
                node("x", NodeType::Code),
                node("y", NodeType::Code),
                node("join", NodeType::VariableAggregator),
            ],
            edges: vec![
                edge("start", "fork"),
                edge("fork", "x"),
                edge("fork", "y"),
                edge("x", "join"),
                edge("y", "join"),
            ],
            parallel_regions: vec![ParallelRegion {
                id: "p1".to_string(),
                start_nodes: vec!["x".to_string(), "y".to_string()],
                end_node: Some("join".to_string()),
            }],
        };
        let graph = Graph::try_from_config(&config).unwrap();
        assert_eq!(graph.node_parallel.get("x"), Some(&"p1".to_string()));
        assert_eq!(graph.node_parallel.get("y"), Some(&"p1".to_string()));
        assert_eq!(graph.node_parallel.get("join"), None);
    }
}
