//! Agent loop driver for multi-turn conversations with LLM providers.
//!
//! The loop alternates between streaming one assistant message and
//! dispatching its tool calls, emitting a totally ordered event stream per
//! run. Compaction and transient-error retry live here too; persistence is
//! reached through the [`SessionStore`] trait so the loop never depends on
//! the journal directly.

mod compaction;
mod driver;
mod queue;
mod result;
mod retry;
mod store;

pub use compaction::{
    CompactionOutcome, compact, is_context_overflow, split_short_summary, summary_message,
};
pub use driver::{AgentLoop, AgentLoopBuilder, EDIT_TOOL_NAME};
pub use queue::MessageQueue;
pub use result::{LoopResult, LoopStopReason};
pub use retry::{CredentialCycler, compute_delay, is_retryable, is_usage_limit, parse_retry_after};
pub use store::{CompactionRecord, MemoryStore, SessionStore, TrackedMessage};

use pi_inference::{EventSender, EventStream};
use pi_protocol::{AgentEvent, Message};

/// Producer half of a run's event stream. The terminal event is
/// `AgentEnd`, carrying the run's new messages as the stream result.
pub type AgentEventSender = EventSender<AgentEvent, Vec<Message>>;

/// Consumer half of a run's event stream.
pub type AgentEventStream = EventStream<AgentEvent, Vec<Message>>;
