//! Whole-run bookkeeping: elapsed steps, wall clock, and accumulated token
//! usage, checked by the driver against [`crate::limits::ExecutionLimits`]
//! on every iteration.

use crate::variable_pool::VariablePool;
use std::time::{Duration, Instant};

/// Token accounting for one LLM call, summed into [`RuntimeState::llm_usage`]
/// as nodes complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LlmUsage {
    /// Prompt/input tokens.
    pub prompt_tokens: u64,
    /// Completion/output tokens.
    pub completion_tokens: u64,
}

impl LlmUsage {
    /// Total tokens across prompt and completion.
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    /// Fold another usage reading into this one.
    pub fn add(&mut self, other: LlmUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// Mutable counters threaded through one run of the driver loop.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    /// Number of node executions started so far, including retries.
    pub node_run_steps: u64,
    /// When the run began, for wall-clock budget checks.
    started_at: Instant,
    /// Tokens consumed by LLM nodes so far.
    pub llm_usage: LlmUsage,
    /// A read view of the pool as of this snapshot, for condition handlers
    /// that need to inspect variable values (e.g. `EqualsHandler`).
    pub variable_pool: VariablePool,
}

impl RuntimeState {
    /// Start a fresh run clock.
    pub fn new() -> Self {
        Self {
            node_run_steps: 0,
            started_at: Instant::now(),
            llm_usage: LlmUsage::default(),
            variable_pool: VariablePool::new(),
        }
    }

    /// Wall-clock time elapsed since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Record one more node step, returning the new total.
    pub fn record_step(&mut self) -> u64 {
        self.node_run_steps += 1;
        self.node_run_steps
    }

    /// A copy of this state with `pool` substituted for its variable pool
    /// snapshot, leaving steps/clock/usage untouched.
    pub fn with_pool(&self, pool: VariablePool) -> Self {
        Self { variable_pool: pool, ..self.clone() }
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates() {
        let mut total = LlmUsage::default();
        total.add(LlmUsage { prompt_tokens: 10, completion_tokens: 5 });
        total.add(LlmUsage { prompt_tokens: 3, completion_tokens: 7 });
        assert_eq!(total.total_tokens(), 25);
    }

    #[test]
    fn step_counter_increments() {
        let mut state = RuntimeState::new();
        assert_eq!(state.record_step(), 1);
        assert_eq!(state.record_step(), 2);
        assert_eq!(state.node_run_steps, 2);
    }
}
