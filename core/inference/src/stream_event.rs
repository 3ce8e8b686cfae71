//! Delta events produced by a model stream.

use pi_protocol::AssistantMessage;
use pi_protocol::StopReason;
use pi_protocol::Usage;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::event_stream::EventSender;
use crate::event_stream::EventStream;

/// One event from a streaming model response.
///
/// Indexes refer to the position of the block being assembled within the
/// assistant message's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The provider accepted the request.
    Start,
    TextStart {
        index: usize,
    },
    TextDelta {
        index: usize,
        delta: String,
    },
    TextEnd {
        index: usize,
    },
    ThinkingStart {
        index: usize,
    },
    ThinkingDelta {
        index: usize,
        delta: String,
    },
    ThinkingEnd {
        index: usize,
    },
    /// A tool call block opened; arguments stream as raw JSON text deltas.
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallDelta {
        index: usize,
        delta: String,
    },
    /// The tool call closed with its parsed arguments.
    ToolCallEnd {
        index: usize,
        arguments: Value,
    },
    /// The stream finished normally.
    Done {
        stop_reason: StopReason,
        usage: Usage,
    },
    /// The stream failed; the terminal assistant message carries the error.
    Error {
        message: String,
    },
}

/// Stream of [`StreamEvent`]s whose terminal value is the finalized
/// assistant message.
pub type AssistantStream = EventStream<StreamEvent, AssistantMessage>;

/// Producer half of an [`AssistantStream`].
pub type AssistantStreamSender = EventSender<StreamEvent, AssistantMessage>;
