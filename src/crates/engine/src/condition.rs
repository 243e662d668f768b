//! Evaluation of `run_condition` predicates attached to edges.
//!
//! The predicate payload itself (`RunCondition::kind`) is opaque JSON
//! defined by the embedding application's condition language; this crate
//! only defines the seam a handler plugs into, a default handler for the
//! `{"type": "always"}` / `{"type": "equals"}` shapes the driver's own
//! tests rely on, and the one condition the engine itself depends on for
//! fail-branch routing (`edge_source_handle`).

use crate::error::EngineError;
use crate::graph::RunCondition;
use crate::route_state::{RouteNodeState, RouteStatus};
use crate::runtime_state::RuntimeState;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Evaluates one `run_condition` payload against the state of the run so
/// far.
pub trait ConditionHandler: Send + Sync {
    /// `true` if the edge carrying this condition should be taken.
    /// `previous` is the route state of the node the edge is leaving —
    /// the only way a handler can see whether that node succeeded,
    /// failed, or was rescued, since a rescued node's outputs alone don't
    /// distinguish it from an ordinary success.
    fn check(
        &self,
        condition: &RunCondition,
        runtime: &RuntimeState,
        previous: &RouteNodeState,
    ) -> Result<bool, EngineError>;
}

/// Resolves a `run_condition` to the handler registered for its `kind`'s
/// `"type"` discriminant, defaulting to "always true" for unrecognized or
/// malformed payloads so a misconfigured condition degrades to an
/// unconditional edge rather than wedging the run. Always carries a
/// built-in `edge_source_handle` handler (see [`EdgeSourceHandleHandler`])
/// since the driver's own fail-branch routing depends on it regardless of
/// what the embedding application registers.
#[derive(Clone)]
pub struct ConditionManager {
    handlers: HashMap<String, Arc<dyn ConditionHandler>>,
}

impl Default for ConditionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionManager {
    /// A manager with only the built-in `edge_source_handle` handler
    /// registered; every other condition evaluates via
    /// [`AlwaysTrueHandler`] until handlers are added.
    pub fn new() -> Self {
        let mut handlers: HashMap<String, Arc<dyn ConditionHandler>> = HashMap::new();
        handlers.insert("edge_source_handle".to_string(), Arc::new(EdgeSourceHandleHandler));
        Self { handlers }
    }

    /// Register a handler for conditions whose `kind.type == discriminant`,
    /// overwriting any previous registration (including a built-in one).
    pub fn register(&mut self, discriminant: impl Into<String>, handler: Arc<dyn ConditionHandler>) {
        self.handlers.insert(discriminant.into(), handler);
    }

    /// The handler that would run `condition`, resolved by its `kind`'s
    /// `"type"` discriminant.
    pub fn handler_for(&self, condition: &RunCondition) -> Arc<dyn ConditionHandler> {
        let discriminant = condition.kind.get("type").and_then(Value::as_str).unwrap_or("always");
        self.handlers
            .get(discriminant)
            .cloned()
            .unwrap_or_else(|| Arc::new(AlwaysTrueHandler))
    }

    /// Evaluate `condition` against `runtime`/`previous`, resolving its
    /// handler first.
    pub fn evaluate(
        &self,
        condition: &RunCondition,
        runtime: &RuntimeState,
        previous: &RouteNodeState,
    ) -> Result<bool, EngineError> {
        self.handler_for(condition).check(condition, runtime, previous)
    }
}

/// Evaluates every condition as satisfied — the default for unconditional
/// edges and for the `"always"` discriminant.
pub struct AlwaysTrueHandler;

impl ConditionHandler for AlwaysTrueHandler {
    fn check(&self, _condition: &RunCondition, _runtime: &RuntimeState, _previous: &RouteNodeState) -> Result<bool, EngineError> {
        Ok(true)
    }
}

/// Evaluates `{"type": "equals", "selector": [node_id, key...], "value":
/// ...}` against the runtime's variable pool snapshot. A minimal,
/// deterministic handler used by this crate's own tests to exercise
/// conditional routing without depending on an external condition
/// language.
pub struct EqualsHandler;

impl ConditionHandler for EqualsHandler {
    fn check(&self, condition: &RunCondition, runtime: &RuntimeState, _previous: &RouteNodeState) -> Result<bool, EngineError> {
        let Some(selector) = condition.kind.get("selector").and_then(Value::as_array) else {
            return Ok(false);
        };
        let Some((node_id, rest)) = selector.split_first() else {
            return Ok(false);
        };
        let Some(node_id) = node_id.as_str() else {
            return Ok(false);
        };
        let key_path: Vec<String> = rest.iter().filter_map(|v| v.as_str().map(String::from)).collect();
        let actual = runtime.variable_pool.get(node_id, &key_path);
        let expected = condition.kind.get("value");
        Ok(actual == expected)
    }
}

/// Evaluates `{"type": "edge_source_handle", "handle": "success" |
/// "fail"}`: `true` when the previous node's route status matches the
/// requested handle. This is what lets a `FailBranch`-rescued node route
/// down a dedicated failure edge as a genuine condition, rather than the
/// driver picking an edge by an ad-hoc string outside the condition
/// system.
pub struct EdgeSourceHandleHandler;

impl ConditionHandler for EdgeSourceHandleHandler {
    fn check(&self, condition: &RunCondition, _runtime: &RuntimeState, previous: &RouteNodeState) -> Result<bool, EngineError> {
        let handle = condition.kind.get("handle").and_then(Value::as_str).unwrap_or("success");
        let is_exception = previous.status == RouteStatus::Exception;
        Ok(match handle {
            "fail" => is_exception,
            _ => !is_exception,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(kind: Value) -> RunCondition {
        RunCondition { kind, hash: "h".to_string() }
    }

    fn route_state(node_id: &str, status: RouteStatus) -> RouteNodeState {
        let mut map = crate::route_state::RouteNodeStateMap::new();
        map.entry(node_id).status = status;
        map.get(node_id).cloned().expect("just inserted")
    }

    #[test]
    fn unregistered_discriminant_defaults_to_true() {
        let manager = ConditionManager::new();
        let runtime = RuntimeState::new();
        let previous = route_state("n0", RouteStatus::Succeeded);
        assert!(manager.evaluate(&cond(json!({"type": "mystery"})), &runtime, &previous).unwrap());
    }

    #[test]
    fn equals_handler_compares_pool_value() {
        let mut manager = ConditionManager::new();
        manager.register("equals", Arc::new(EqualsHandler));
        let mut runtime = RuntimeState::new();
        runtime.variable_pool.add("cond_node", &["score".to_string()], json!(10));
        let previous = route_state("cond_node", RouteStatus::Succeeded);

        let matching = cond(json!({"type": "equals", "selector": ["cond_node", "score"], "value": 10}));
        let mismatching = cond(json!({"type": "equals", "selector": ["cond_node", "score"], "value": 11}));

        assert!(manager.evaluate(&matching, &runtime, &previous).unwrap());
        assert!(!manager.evaluate(&mismatching, &runtime, &previous).unwrap());
    }

    #[test]
    fn edge_source_handle_distinguishes_exception_from_success() {
        let manager = ConditionManager::new();
        let runtime = RuntimeState::new();

        let succeeded = route_state("n1", RouteStatus::Succeeded);
        let rescued = route_state("n1", RouteStatus::Exception);

        let fail_edge = cond(json!({"type": "edge_source_handle", "handle": "fail"}));
        let success_edge = cond(json!({"type": "edge_source_handle", "handle": "success"}));

        assert!(!manager.evaluate(&fail_edge, &runtime, &succeeded).unwrap());
        assert!(manager.evaluate(&success_edge, &runtime, &succeeded).unwrap());
        assert!(manager.evaluate(&fail_edge, &runtime, &rescued).unwrap());
        assert!(!manager.evaluate(&success_edge, &runtime, &rescued).unwrap());
    }
}
