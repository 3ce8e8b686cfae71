//! Event types emitted by the agent loop.
//!
//! These events allow consumers (UI, logging, tests) to observe the agent's
//! progress without being coupled to loop internals. Events within one run
//! are totally ordered; `AgentStart` precedes everything and `AgentEnd` is
//! the terminal event carrying the run's new messages.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::message::Message;
use crate::message::Usage;
use crate::queue::QueueKind;

/// What triggered a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactTrigger {
    /// Usage crossed the configured threshold ratio.
    #[default]
    Threshold,
    /// A turn ended in a context-overflow error.
    Overflow,
    /// The user asked for a compaction.
    Manual,
}

impl CompactTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompactTrigger::Threshold => "threshold",
            CompactTrigger::Overflow => "overflow",
            CompactTrigger::Manual => "manual",
        }
    }
}

impl std::fmt::Display for CompactTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress update reported by a running tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Progress percentage (0-100) when the tool can estimate it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<i32>,
}

/// Events emitted during one agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    // ========== Run Lifecycle ==========
    /// The run has started. Always the first event.
    AgentStart,
    /// The run has finished. Terminal; carries every message the run produced.
    AgentEnd { messages: Vec<Message> },

    // ========== Turn Lifecycle ==========
    /// A turn (one LLM call plus its tool dispatch) has started.
    TurnStart {
        turn_id: String,
        /// Turn number within the run (1-indexed).
        turn_number: i32,
    },
    /// A turn has completed.
    TurnEnd { turn_id: String, usage: Usage },

    // ========== Message Streaming ==========
    /// A message has been added to the conversation.
    MessageStart { message: Message },
    /// The partially assembled assistant message changed.
    MessageUpdate { message: Message },
    /// A message is complete.
    MessageEnd { message: Message },

    // ========== Tool Execution ==========
    /// A tool is about to execute.
    ToolExecutionStart {
        call_id: String,
        name: String,
        arguments: Value,
    },
    /// Progress update from a running tool.
    ToolExecutionUpdate {
        call_id: String,
        progress: ToolProgress,
    },
    /// A tool has completed execution.
    ToolExecutionEnd {
        call_id: String,
        /// The synthesized tool-result message.
        result: Message,
        is_error: bool,
    },

    // ========== Context & Compaction ==========
    /// Context usage is above the warning ratio but below auto-compact.
    ContextUsageWarning {
        estimated_tokens: i64,
        context_window: i64,
        percent_left: f64,
    },
    /// A compaction has started.
    CompactionStart { trigger: CompactTrigger },
    /// A compaction has finished.
    CompactionEnd {
        trigger: CompactTrigger,
        tokens_before: i64,
        tokens_after: i64,
    },

    // ========== Retry ==========
    /// A transient LLM error is being retried after a backoff sleep.
    AutoRetryStart {
        /// Attempt number (1-indexed).
        attempt: i32,
        max_attempts: i32,
        delay_ms: i64,
        error: String,
    },
    /// The retry sequence ended.
    AutoRetryEnd { success: bool },

    // ========== Queue ==========
    /// A user message was queued while the agent was busy.
    MessageQueued {
        id: String,
        kind: QueueKind,
        /// Truncated preview for status displays.
        preview: String,
    },
    /// A queued message was taken up by the loop.
    MessageDequeued { id: String },
}

impl AgentEvent {
    /// Whether this event ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::AgentEnd { .. })
    }
}

#[cfg(test)]
#[path = "agent_event.test.rs"]
mod tests;
