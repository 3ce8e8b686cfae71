//! How a run terminated.

use pi_protocol::Message;
use pi_protocol::Usage;

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStopReason {
    /// The model finished without requesting more work.
    Completed,
    /// The caller cancelled the run.
    Aborted,
    /// A fatal (non-retryable) LLM error ended the run.
    Error { message: String },
    /// The configured turn limit was reached.
    MaxTurnsReached,
}

/// Result of one run of the agent loop.
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub stop_reason: LoopStopReason,
    /// Every message the run appended, in order.
    pub messages: Vec<Message>,
    /// Turns completed in this run.
    pub turns: i32,
    /// Aggregate usage across the run's LLM calls.
    pub usage: Usage,
}

impl LoopResult {
    pub fn is_complete(&self) -> bool {
        matches!(self.stop_reason, LoopStopReason::Completed)
    }

    /// Final assistant text, if the run produced any.
    pub fn final_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find_map(|m| m.as_assistant())
            .map(|a| a.text())
    }
}
