//! Translates `NodeRunStreamChunk` events into the ordered, deduplicated
//! text stream a caller actually wants to show a user.
//!
//! Two strategies exist because a chat-style `Answer` node's text arrives
//! interleaved with the rest of the graph's bookkeeping events, while a
//! workflow's single `End` node's output is the whole answer at once —
//! the originating platform picks one or the other per `WorkflowType`;
//! here the caller picks explicitly via [`StreamProcessor`] construction.

use crate::event::GraphEngineEvent;
use crate::graph::NodeId;
use std::collections::HashSet;

/// Consumes the raw engine event stream and decides which
/// `NodeRunStreamChunk` events represent user-visible answer text.
pub trait StreamProcessor: Send {
    /// Inspect one event, returning the text chunk to surface to the end
    /// user, if any.
    fn process(&mut self, event: &GraphEngineEvent) -> Option<String>;
}

/// For chat-style graphs: every `Answer` node's stream chunks are
/// forwarded as they arrive, since an `Answer` node can appear mid-graph
/// and its output is always conversational text.
#[derive(Default)]
pub struct AnswerStreamProcessor {
    answer_node_ids: HashSet<NodeId>,
}

impl AnswerStreamProcessor {
    /// Track chunks from `answer_node_ids` as user-visible; any other
    /// node's stream chunks are treated as internal.
    pub fn new(answer_node_ids: HashSet<NodeId>) -> Self {
        Self { answer_node_ids }
    }
}

impl StreamProcessor for AnswerStreamProcessor {
    fn process(&mut self, event: &GraphEngineEvent) -> Option<String> {
        match event {
            GraphEngineEvent::NodeRunStreamChunk { node_id, chunk, .. } if self.answer_node_ids.contains(node_id) => {
                Some(chunk.clone())
            }
            _ => None,
        }
    }
}

/// For single-answer graphs (completion workflows): only chunks marked
/// `is_final_answer` are forwarded — intermediate node output (an LLM
/// node feeding a later transform) never reaches the caller mid-stream.
#[derive(Default)]
pub struct EndStreamProcessor;

impl EndStreamProcessor {
    /// A fresh processor.
    pub fn new() -> Self {
        Self
    }
}

impl StreamProcessor for EndStreamProcessor {
    fn process(&mut self, event: &GraphEngineEvent) -> Option<String> {
        match event {
            GraphEngineEvent::NodeRunStreamChunk { chunk, is_final_answer: true, .. } => Some(chunk.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ParallelContext;

    fn chunk(node_id: &str, text: &str, is_final: bool) -> GraphEngineEvent {
        GraphEngineEvent::NodeRunStreamChunk {
            node_id: node_id.to_string(),
            chunk: text.to_string(),
            is_final_answer: is_final,
            context: ParallelContext::root(),
        }
    }

    #[test]
    fn answer_processor_forwards_only_tracked_nodes() {
        let mut tracked = HashSet::new();
        tracked.insert("answer".to_string());
        let mut processor = AnswerStreamProcessor::new(tracked);

        assert_eq!(processor.process(&chunk("answer", "hi", false)), Some("hi".to_string()));
        assert_eq!(processor.process(&chunk("llm", "internal", false)), None);
    }

    #[test]
    fn end_processor_forwards_only_final_answer_chunks() {
        let mut processor = EndStreamProcessor::new();
        assert_eq!(processor.process(&chunk("end", "shown", true)), Some("shown".to_string()));
        assert_eq!(processor.process(&chunk("llm", "hidden", false)), None);
    }
}
