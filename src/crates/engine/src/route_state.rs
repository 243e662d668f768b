//! Per-node bookkeeping the driver loop consults when deciding whether a
//! node is ready to run and which edge to take out of it.

use crate::graph::NodeId;
use std::collections::HashMap;

/// A node's lifecycle status within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    /// Not yet reached by the driver.
    NotStarted,
    /// Currently executing (set before dispatch, cleared on completion).
    Running,
    /// Finished without error.
    Succeeded,
    /// Finished with an error and no `continue_on_error` strategy to fall
    /// back on.
    Failed,
    /// Failed but rescued by its `error_strategy` (`DefaultValue` or
    /// `FailBranch`) — distinct from `Failed` so a downstream
    /// `edge_source_handle` condition can route on "this node was rescued"
    /// rather than seeing an indistinguishable success.
    Exception,
    /// Skipped because the inbound edge's runtime condition was not met.
    Skipped,
}

/// Bookkeeping for one node id, keyed into [`RouteNodeStateMap`].
#[derive(Debug, Clone)]
pub struct RouteNodeState {
    /// The node this state belongs to.
    pub node_id: NodeId,
    /// Current lifecycle status.
    pub status: RouteStatus,
    /// Id of the edge (by target node id) the driver took out of this
    /// node, once it has one.
    pub taken_edge: Option<NodeId>,
    /// Number of times this node has actually started execution,
    /// including retries.
    pub run_count: u32,
}

impl RouteNodeState {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: RouteStatus::NotStarted,
            taken_edge: None,
            run_count: 0,
        }
    }
}

/// All route state for a single run, addressable by node id.
#[derive(Debug, Clone, Default)]
pub struct RouteNodeStateMap {
    states: HashMap<NodeId, RouteNodeState>,
}

impl RouteNodeStateMap {
    /// An empty map; entries are created lazily on first touch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or lazily create the state for `node_id`.
    pub fn entry(&mut self, node_id: &str) -> &mut RouteNodeState {
        self.states
            .entry(node_id.to_string())
            .or_insert_with(|| RouteNodeState::new(node_id.to_string()))
    }

    /// Read-only lookup; `None` means the node hasn't been touched yet.
    pub fn get(&self, node_id: &str) -> Option<&RouteNodeState> {
        self.states.get(node_id)
    }

    /// Whether `node_id` has reached a terminal status (succeeded, failed,
    /// rescued, or skipped).
    pub fn is_terminal(&self, node_id: &str) -> bool {
        matches!(
            self.states.get(node_id).map(|s| s.status),
            Some(RouteStatus::Succeeded)
                | Some(RouteStatus::Failed)
                | Some(RouteStatus::Exception)
                | Some(RouteStatus::Skipped)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unvisited_node_has_no_state() {
        let map = RouteNodeStateMap::new();
        assert!(map.get("n1").is_none());
        assert!(!map.is_terminal("n1"));
    }

    #[test]
    fn entry_is_idempotent_and_tracks_run_count() {
        let mut map = RouteNodeStateMap::new();
        map.entry("n1").run_count += 1;
        map.entry("n1").run_count += 1;
        assert_eq!(map.entry("n1").run_count, 2);
    }

    #[test]
    fn terminal_statuses_are_recognized() {
        let mut map = RouteNodeStateMap::new();
        map.entry("n1").status = RouteStatus::Succeeded;
        map.entry("n2").status = RouteStatus::Running;
        assert!(map.is_terminal("n1"));
        assert!(!map.is_terminal("n2"));
    }

    #[test]
    fn exception_status_is_terminal() {
        let mut map = RouteNodeStateMap::new();
        map.entry("n1").status = RouteStatus::Exception;
        assert!(map.is_terminal("n1"));
    }
}
