//! Shared protocol types for the agent core.
//!
//! This crate defines the message model, the event types emitted by the
//! agent loop, and the configuration types shared between the loop, the
//! compaction engine, and the session facade. It contains no behaviour
//! beyond constructors and small accessors so that every other crate can
//! depend on it without pulling in runtime machinery.

mod agent_event;
mod config;
mod message;
mod queue;

pub use agent_event::{AgentEvent, CompactTrigger, ToolProgress};
pub use config::{CompactConfig, EditVariant, LoopConfig, RetryConfig};
pub use message::{
    AssistantBlock, AssistantMessage, MentionedFile, Message, StopReason, ToolResultBlock, Usage,
    UserBlock,
};
pub use queue::{QueueKind, QueueMode, QueuedMessage, StreamingBehavior};

/// Model role used for per-role model selection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModelRole {
    /// The model driving the conversation.
    Main,
    /// The model used for compaction summaries.
    Compact,
}

/// Thinking effort level requested from the model.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ThinkingLevel {
    Off,
    #[default]
    Low,
    Medium,
    High,
}
