//! # workflow_engine - a directed-graph execution core for LLM workflows
//!
//! This crate drives a graph of typed nodes — LLM calls, HTTP requests,
//! retrieval, branching, iteration, loops, answer assembly — to
//! completion, emitting an ordered event stream a consumer turns into a
//! user-facing response. It owns graph traversal, parallel dispatch,
//! variable scoping, and per-node retry/error handling; it does not own
//! node *implementations*, persistence, auth, or an HTTP surface — those
//! are the embedding application's job.
//!
//! ## Core Concepts
//!
//! ### 1. Graph
//!
//! [`graph::Graph`] is the static, validated structure: nodes, edges, and
//! the parallel regions derived from them. It is built once per workflow
//! definition and reused across runs.
//!
//! ### 2. GraphEngine
//!
//! [`engine::GraphEngine`] drives one run of a [`graph::Graph`]: a
//! Pregel-style loop that resolves each ready node, runs it through
//! [`node::Node`], routes via [`condition::ConditionManager`], and
//! dispatches parallel branches on a [`worker_pool::WorkerPool`] bounded
//! by [`limits::ExecutionLimits`].
//!
//! ### 3. Variable Pool
//!
//! [`variable_pool::VariablePool`] is the hierarchical, namespaced store
//! every node reads its inputs from and writes its outputs into, shared
//! across a run including inside parallel branches.
//!
//! ### 4. Events
//!
//! [`event::GraphEngineEvent`] is the ordered lifecycle stream the engine
//! produces; [`response_pipeline`] translates it into the smaller,
//! stable [`response_pipeline::ResponseEvent`] shape a consumer actually
//! wants, with keep-alive pings spliced into idle gaps.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use workflow_engine::condition::ConditionManager;
//! use workflow_engine::engine::GraphEngine;
//! use workflow_engine::graph::{Graph, GraphConfig};
//! use workflow_engine::limits::ExecutionLimits;
//! use workflow_engine::node::NodeRegistry;
//! use workflow_engine::variable_pool::VariablePool;
//! use tokio_util::sync::CancellationToken;
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config: GraphConfig = serde_json::from_str(WORKFLOW_JSON)?;
//!     let graph = Arc::new(Graph::try_from_config(&config)?);
//!
//!     let mut registry = NodeRegistry::new();
//!     // registry.register(NodeType::Llm, "1", |cfg| Arc::new(MyLlmNode::new(cfg)));
//!
//!     let engine = Arc::new(GraphEngine::new(
//!         graph,
//!         Arc::new(registry),
//!         Arc::new(ConditionManager::new()),
//!         ExecutionLimits::default(),
//!     ));
//!
//!     let mut events = engine.run(VariablePool::new(), CancellationToken::new());
//!     while let Some(event) = events.next().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! # const WORKFLOW_JSON: &str = "{}";
//! ```
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────────────────────────┐
//!                    │              Graph                   │
//!                    │  nodes, edges, parallel regions      │
//!                    └──────────────┬────────────────────────┘
//!                                   │
//!                                   ▼
//!                    ┌─────────────────────────────────────┐
//!                    │           GraphEngine                │
//!                    │  • driver loop  • retry/error state  │
//!                    │  • parallel dispatch  • routing      │
//!                    └──────────────┬────────────────────────┘
//!                    ┌──────────────┼──────────────┐
//!                    ▼              ▼              ▼
//!         ┌──────────────────┐ ┌──────────┐ ┌──────────────────┐
//!         │   WorkerPool      │ │  Node    │ │ ConditionManager  │
//!         │  (bounded fan-out)│ │ Registry │ │  (edge routing)   │
//!         └──────────────────┘ └──────────┘ └──────────────────┘
//!                                   │
//!                                   ▼
//!                         ┌──────────────────┐
//!                         │  VariablePool     │
//!                         │  sys/env/conv +   │
//!                         │  per-node outputs  │
//!                         └──────────────────┘
//!                                   │
//!                                   ▼
//!                    GraphEngineEvent stream ──▶ response_pipeline ──▶ consumer
//! ```
//!
//! ## Module Organization
//!
//! ### Core
//! - [`graph`] - static graph model and validation
//! - [`engine`] - the driver loop
//! - [`node`] - the node contract and registry
//! - [`condition`] - edge routing predicates
//!
//! ### State
//! - [`variable_pool`] - the shared variable store
//! - [`route_state`] - per-node lifecycle bookkeeping
//! - [`runtime_state`] - run-wide counters (steps, wall clock, token usage)
//! - [`limits`] - caller-supplied execution bounds
//!
//! ### Execution support
//! - [`worker_pool`] - bounded parallel branch dispatch
//! - [`carver`] - iteration/loop sub-graph extraction for debugging
//! - [`stream_processor`] - answer-text extraction from the event stream
//! - [`response_pipeline`] - event translation and keep-alive pings
//!
//! ### Errors
//! - [`error`] - the crate's error taxonomy

pub mod carver;
pub mod condition;
pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod limits;
pub mod node;
pub mod response_pipeline;
pub mod route_state;
pub mod runtime_state;
pub mod stream_processor;
pub mod variable_pool;
pub mod worker_pool;

pub use engine::GraphEngine;
pub use error::{EngineError, Result};
pub use event::GraphEngineEvent;
pub use graph::{Graph, GraphConfig};
pub use limits::ExecutionLimits;
pub use node::{Node, NodeRegistry};
pub use response_pipeline::ResponseEvent;
pub use variable_pool::VariablePool;
