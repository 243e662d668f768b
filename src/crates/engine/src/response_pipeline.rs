//! The outermost seam of this crate: translates [`GraphEngineEvent`]s into
//! the smaller, stable [`ResponseEvent`] shape a consumer (an HTTP
//! streaming handler, a CLI, a test) actually wants, and injects
//! keep-alive pings so a consumer reading from a slow LLM node doesn't
//! see a dead connection.

use crate::event::GraphEngineEvent;
use crate::stream_processor::StreamProcessor;
use async_stream::stream;
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::interval;
use tokio_stream::StreamExt as _;

/// Default interval between keep-alive pings when no real event has been
/// emitted recently.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// The public event shape this crate hands to a consumer. Deliberately
/// smaller than [`GraphEngineEvent`]: internal bookkeeping variants
/// (`ParallelBranchRun*`, `IterationRun*`, `LoopRun*`) are folded into
/// `Progress` rather than exposed one-for-one, since a consumer outside
/// this crate shouldn't need to understand the engine's internal nesting
/// model to render a response.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResponseEvent {
    /// The run has started.
    WorkflowStarted,
    /// A chunk of user-visible answer text.
    TextChunk {
        /// The chunk's text.
        text: String,
    },
    /// Structural progress not meant to be rendered as answer text, but
    /// useful for a UI that wants to show "running node X" status.
    Progress {
        /// Human-readable description of what just happened.
        message: String,
    },
    /// The run finished successfully.
    WorkflowFinished {
        /// Final output variables.
        outputs: Value,
    },
    /// The run finished with some branches rescued by `continue_on_error`.
    WorkflowPartiallyFinished {
        /// Final output variables.
        outputs: Value,
        /// How many rescues occurred.
        exceptions_count: u32,
    },
    /// The run failed.
    WorkflowFailed {
        /// Human-readable failure description.
        error: String,
    },
    /// A keep-alive line; carries no payload.
    Ping,
}

/// Consumes a `GraphEngineEvent` stream, producing a `ResponseEvent`
/// stream with keep-alive pings spliced in during idle gaps.
pub fn pipe<S>(
    mut events: S,
    mut processor: Box<dyn StreamProcessor>,
    ping_interval: Duration,
) -> impl Stream<Item = ResponseEvent>
where
    S: Stream<Item = GraphEngineEvent> + Unpin + Send + 'static,
{
    stream! {
        let mut ticker = interval(ping_interval);
        ticker.tick().await; // first tick fires immediately; consume it.
        loop {
            tokio::select! {
                biased;
                next = events.next() => {
                    match next {
                        Some(event) => {
                            if let Some(text) = processor.process(&event) {
                                yield ResponseEvent::TextChunk { text };
                            }
                            if let Some(response) = translate_terminal(&event) {
                                yield response;
                                return;
                            }
                            if let Some(progress) = describe_progress(&event) {
                                yield ResponseEvent::Progress { message: progress };
                            }
                        }
                        None => return,
                    }
                }
                _ = ticker.tick() => {
                    yield ResponseEvent::Ping;
                }
            }
        }
    }
}

/// Drain `events` to completion without streaming anything, returning only
/// the final `ResponseEvent`. Used by non-streaming callers that just want
/// the finished result.
pub async fn collect<S>(mut events: S) -> ResponseEvent
where
    S: Stream<Item = GraphEngineEvent> + Unpin,
{
    while let Some(event) = events.next().await {
        if let Some(response) = translate_terminal(&event) {
            return response;
        }
    }
    ResponseEvent::WorkflowFailed { error: "workflow stream ended without a terminal event".to_string() }
}

fn translate_terminal(event: &GraphEngineEvent) -> Option<ResponseEvent> {
    match event {
        GraphEngineEvent::GraphRunStarted { .. } => Some(ResponseEvent::WorkflowStarted),
        GraphEngineEvent::GraphRunSucceeded { outputs, .. } => {
            Some(ResponseEvent::WorkflowFinished { outputs: outputs.clone() })
        }
        GraphEngineEvent::GraphRunPartialSucceeded { outputs, exceptions_count } => {
            Some(ResponseEvent::WorkflowPartiallyFinished {
                outputs: outputs.clone(),
                exceptions_count: *exceptions_count,
            })
        }
        GraphEngineEvent::GraphRunFailed { error } => Some(ResponseEvent::WorkflowFailed { error: error.clone() }),
        _ => None,
    }
}

fn describe_progress(event: &GraphEngineEvent) -> Option<String> {
    match event {
        GraphEngineEvent::NodeRunStarted { node_id, .. } => Some(format!("running {node_id}")),
        GraphEngineEvent::NodeRunSucceeded { node_id, .. } => Some(format!("{node_id} succeeded")),
        GraphEngineEvent::NodeRunFailed { node_id, error, .. } => Some(format!("{node_id} failed: {error}")),
        GraphEngineEvent::NodeRunException { node_id, error, .. } => {
            Some(format!("{node_id} rescued after error: {error}"))
        }
        GraphEngineEvent::NodeRunRetry { node_id, attempt, .. } => Some(format!("{node_id} retry {attempt}")),
        GraphEngineEvent::ParallelBranchRunStarted { parallel_id, .. } => {
            Some(format!("parallel {parallel_id} started"))
        }
        GraphEngineEvent::ParallelBranchRunSucceeded { parallel_id, .. } => {
            Some(format!("parallel {parallel_id} branch done"))
        }
        GraphEngineEvent::ParallelBranchRunFailed { parallel_id, error, .. } => {
            Some(format!("parallel {parallel_id} branch failed: {error}"))
        }
        _ => None,
    }
}
