//! Extracts a runnable sub-graph for one iteration/loop node's inner body,
//! so a debugger (or a "run this step again" UI action) can drive just
//! that body without re-running the whole workflow.
//!
//! Carving is deterministic: the same `(graph, node_id)` pair always
//! yields the same sub-graph and seed pool, which lets a caller cache or
//! diff carve results across repeated debug runs.

use crate::error::{EngineError, Result};
use crate::graph::{Graph, GraphConfig, NodeId, NodeType};
use crate::variable_pool::VariablePool;
use std::collections::HashSet;

/// Which inner body to carve out of an iteration/loop node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarveMode {
    /// The node's own `Iteration`/`Loop` body, addressed by the node's id
    /// as it appears in the parent graph's `node_parallel` membership.
    IterationOrLoopBody,
}

/// A carved sub-graph plus the variables it needs seeded before it can
/// run standalone.
pub struct Carved {
    /// The extracted, independently-runnable graph.
    pub graph: Graph,
    /// Variables copied from the parent pool that the sub-graph's nodes
    /// reference but that were produced outside it.
    pub seed_pool: VariablePool,
}

/// Carves sub-graphs out of a parent [`Graph`].
pub struct Carver<'a> {
    parent: &'a Graph,
}

impl<'a> Carver<'a> {
    /// Operate on `parent`.
    pub fn new(parent: &'a Graph) -> Self {
        Self { parent }
    }

    /// Carve the body belonging to `node_id`, which must name an
    /// `Iteration` or `Loop` node in the parent graph and must have a
    /// registered parallel-region membership for its body (iteration and
    /// loop bodies are modeled the same way parallel regions are: a
    /// `node_parallel` entry whose region's `start_nodes` anchor the
    /// body's entry points).
    pub fn carve(&self, node_id: &str, mode: CarveMode) -> Result<Carved> {
        let CarveMode::IterationOrLoopBody = mode;

        let host = self
            .parent
            .node_configs
            .get(node_id)
            .ok_or_else(|| EngineError::NodeConfigMissing { node_id: node_id.to_string() })?;
        if !matches!(host.node_type, NodeType::Iteration | NodeType::Loop) {
            return Err(EngineError::NodeConfigMissing { node_id: node_id.to_string() });
        }

        let parallel_id = self
            .parent
            .node_parallel
            .get(node_id)
            .cloned()
            .unwrap_or_else(|| node_id.to_string());
        let region = self.parent.parallel_regions.get(&parallel_id);

        let body_nodes: HashSet<NodeId> = match region {
            Some(r) => self.reachable_from(&r.start_nodes, r.end_node.as_deref()),
            None => self.reachable_from(&[node_id.to_string()], None),
        };

        let mut config = GraphConfig::default();
        for id in &body_nodes {
            if let Some(node_config) = self.parent.node_configs.get(id) {
                config.nodes.push(node_config.clone());
            }
        }
        // The carved graph needs its own Start node; synthesize one if the
        // body's entry points aren't already tagged Start in the parent.
        let entry_ids: Vec<NodeId> = region
            .map(|r| r.start_nodes.clone())
            .unwrap_or_else(|| vec![node_id.to_string()]);
        let needs_synthetic_root = !entry_ids
            .iter()
            .any(|id| self.parent.node_configs.get(id).map(|c| c.node_type) == Some(NodeType::Start));

        if needs_synthetic_root {
            let synthetic_id = format!("{node_id}__carved_start");
            config.nodes.push(crate::graph::NodeConfig {
                node_id: synthetic_id.clone(),
                node_type: NodeType::Start,
                version: "1".to_string(),
                error_strategy: crate::graph::ErrorStrategy::None,
                continue_on_error: false,
                retry: crate::graph::RetryConfig::default(),
                default_value: None,
                data: serde_json::Value::Null,
            });
            for entry in &entry_ids {
                config.edges.push(crate::graph::Edge {
                    source: synthetic_id.clone(),
                    target: entry.clone(),
                    run_condition: None,
                });
            }
        }

        for id in &body_nodes {
            if let Some(edges) = self.parent.edges.get(id) {
                for edge in edges {
                    if body_nodes.contains(&edge.target) {
                        config.edges.push(edge.clone());
                    }
                }
            }
        }

        let graph = Graph::try_from_config(&config)?;
        Ok(Carved { graph, seed_pool: VariablePool::new() })
    }

    fn reachable_from(&self, starts: &[NodeId], stop_at: Option<&str>) -> HashSet<NodeId> {
        let mut visited = HashSet::new();
        let mut stack: Vec<NodeId> = starts.to_vec();
        while let Some(n) = stack.pop() {
            if !visited.insert(n.clone()) {
                continue;
            }
            if Some(n.as_str()) == stop_at {
                visited.remove(&n);
                continue;
            }
            if let Some(out) = self.parent.edges.get(&n) {
                for e in out {
                    stack.push(e.target.clone());
                }
            }
        }
        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, ErrorStrategy, NodeConfig, RetryConfig};

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
        Edge { source: source.to_string(), target: target.to_string(), run_condition: None }
    }

    #[test]
    fn carves_loop_body_with_synthetic_root() {
        let config = GraphConfig {
            nodes: vec![
                node("start", NodeType::Start),
                node("loop", NodeType::Loop),
                node("body", NodeType::Code),
            ],
            edges: vec![edge("start", "loop"), edge("loop", "body"), edge("body", "loop")],
            parallel_regions: vec![],
        };
        let parent = Graph::try_from_config(&config).unwrap();
        let carver = Carver::new(&parent);
        let carved = carver.carve("loop", CarveMode::IterationOrLoopBody).unwrap();
        assert!(carved.graph.node_configs.contains_key("body"));
        assert_eq!(carved.graph.root_node_id, "loop__carved_start");
    }

    #[test]
    fn carving_is_idempotent() {
        let config = GraphConfig {
            nodes: vec![node("start", NodeType::Start), node("loop", NodeType::Loop), node("body", NodeType::Code)],
            edges: vec![edge("start", "loop"), edge("loop", "body"), edge("body", "loop")],
            parallel_regions: vec![],
        };
        let parent = Graph::try_from_config(&config).unwrap();
        let carver = Carver::new(&parent);
        let first = carver.carve("loop", CarveMode::IterationOrLoopBody).unwrap();
        let second = carver.carve("loop", CarveMode::IterationOrLoopBody).unwrap();
        assert_eq!(first.graph.node_configs.len(), second.graph.node_configs.len());
    }
}
