//! Message model for conversations.
//!
//! Every record the agent handles is a [`Message`] variant. The enum is
//! internally tagged with `role` so journal records and event payloads
//! serialize to the same stable shape.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// A block of user-authored content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserBlock {
    /// Plain text.
    Text {
        text: String,
    },
    /// Base64-encoded image.
    Image {
        data: String,
        media_type: String,
    },
}

impl UserBlock {
    /// Create a text block.
    pub fn text(text: impl Into<String>) -> Self {
        UserBlock::Text { text: text.into() }
    }

    /// Create an image block from base64 data.
    pub fn image(data: impl Into<String>, media_type: impl Into<String>) -> Self {
        UserBlock::Image {
            data: data.into(),
            media_type: media_type.into(),
        }
    }

    /// Extract text if this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            UserBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// A block of assistant-authored content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantBlock {
    /// Plain text.
    Text { text: String },
    /// Thinking/reasoning content (for extended thinking models).
    Thinking {
        text: String,
        /// Optional signature for verification.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// Tool call requested by the model.
    ToolCall {
        /// Unique ID for this call within the message.
        id: String,
        /// Name of the tool being called.
        name: String,
        /// Arguments as JSON.
        #[serde(default)]
        arguments: Value,
    },
}

impl AssistantBlock {
    pub fn text(text: impl Into<String>) -> Self {
        AssistantBlock::Text { text: text.into() }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        AssistantBlock::Thinking {
            text: text.into(),
            signature: None,
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        AssistantBlock::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Check if this is a tool call block.
    pub fn is_tool_call(&self) -> bool {
        matches!(self, AssistantBlock::ToolCall { .. })
    }
}

/// A block of tool result content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultBlock {
    Text { text: String },
    Image { data: String, media_type: String },
}

impl ToolResultBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ToolResultBlock::Text { text: text.into() }
    }

    /// Extract text if this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ToolResultBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Token usage and cost for one assistant message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_read_tokens: i64,
    #[serde(default)]
    pub cache_write_tokens: i64,
    /// Accumulated cost in USD, as reported by the provider layer.
    #[serde(default)]
    pub cost: f64,
}

impl Usage {
    pub fn new(input_tokens: i64, output_tokens: i64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Self::default()
        }
    }

    /// Total tokens counted against the context window.
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }
}

/// Why an assistant message stopped.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::AsRefStr, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    /// The model finished normally.
    #[default]
    End,
    /// The model requested tool calls.
    ToolUse,
    /// The output token limit was reached.
    MaxTokens,
    /// The request failed; see `error_message`.
    Error,
    /// The caller cancelled the stream.
    Aborted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// A finalized (or partially assembled) assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<AssistantBlock>,
    pub model_id: String,
    pub provider: String,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: i64,
}

impl AssistantMessage {
    /// Create an empty assistant message for a model, timestamped now.
    pub fn empty(model_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            content: Vec::new(),
            model_id: model_id.into(),
            provider: provider.into(),
            usage: Usage::default(),
            stop_reason: StopReason::End,
            error_message: None,
            timestamp: now_ms(),
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                AssistantBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// All tool call blocks in textual order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                AssistantBlock::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some((id.as_str(), name.as_str(), arguments)),
                _ => None,
            })
            .collect()
    }

    /// Whether the message contains at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.content.iter().any(AssistantBlock::is_tool_call)
    }
}

/// A file referenced by a [`Message::FileMention`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentionedFile {
    pub path: String,
    pub content: String,
}

/// One message in a conversation.
///
/// The variants cover everything the loop, the journal, and the UI layers
/// exchange; tool-specific payloads stay opaque in `details`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: Vec<UserBlock>,
        timestamp: i64,
        /// Set for messages the system injected on the user's behalf.
        #[serde(default)]
        synthetic: bool,
    },
    Assistant(AssistantMessage),
    ToolResult {
        /// Matches the `id` of a tool call block in a prior assistant message.
        tool_call_id: String,
        tool_name: String,
        content: Vec<ToolResultBlock>,
        #[serde(default)]
        is_error: bool,
        /// Tool-owned structured data; the core never introspects it.
        #[serde(default)]
        details: Value,
        timestamp: i64,
    },
    BashExecution {
        command: String,
        output: String,
        exit_code: i32,
        #[serde(default)]
        cancelled: bool,
        #[serde(default)]
        truncated: bool,
        #[serde(default)]
        exclude_from_context: bool,
        timestamp: i64,
    },
    PythonExecution {
        code: String,
        output: String,
        exit_code: i32,
        #[serde(default)]
        cancelled: bool,
        #[serde(default)]
        truncated: bool,
        #[serde(default)]
        exclude_from_context: bool,
        timestamp: i64,
    },
    FileMention {
        files: Vec<MentionedFile>,
        timestamp: i64,
    },
    CompactionSummary {
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        short_summary: Option<String>,
        tokens_before: i64,
        /// Id of the first journal entry kept verbatim after the splice.
        first_kept_entry_id: String,
        timestamp: i64,
    },
    BranchSummary {
        summary: String,
        /// Id of the abandoned branch leaf.
        from_id: String,
        timestamp: i64,
    },
    Custom {
        custom_type: String,
        content: Vec<UserBlock>,
        #[serde(default)]
        display: bool,
        #[serde(default)]
        details: Value,
        timestamp: i64,
    },
}

impl Message {
    /// Create a user message from plain text, timestamped now.
    pub fn user(text: impl Into<String>) -> Self {
        Message::User {
            content: vec![UserBlock::text(text)],
            timestamp: now_ms(),
            synthetic: false,
        }
    }

    /// Create a synthetic user message (injected by the system).
    pub fn synthetic_user(text: impl Into<String>) -> Self {
        Message::User {
            content: vec![UserBlock::text(text)],
            timestamp: now_ms(),
            synthetic: true,
        }
    }

    /// Create a tool result with a single text block, timestamped now.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Message::ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: vec![ToolResultBlock::text(text)],
            is_error,
            details: Value::Null,
            timestamp: now_ms(),
        }
    }

    /// The message timestamp in Unix milliseconds.
    pub fn timestamp(&self) -> i64 {
        match self {
            Message::User { timestamp, .. }
            | Message::ToolResult { timestamp, .. }
            | Message::BashExecution { timestamp, .. }
            | Message::PythonExecution { timestamp, .. }
            | Message::FileMention { timestamp, .. }
            | Message::CompactionSummary { timestamp, .. }
            | Message::BranchSummary { timestamp, .. }
            | Message::Custom { timestamp, .. } => *timestamp,
            Message::Assistant(m) => m.timestamp,
        }
    }

    /// Whether the message should be sent to the model.
    ///
    /// Execution records can be excluded from context; everything else is
    /// model-visible.
    pub fn in_context(&self) -> bool {
        match self {
            Message::BashExecution {
                exclude_from_context,
                ..
            }
            | Message::PythonExecution {
                exclude_from_context,
                ..
            } => !exclude_from_context,
            _ => true,
        }
    }

    /// Rough token estimate for threshold checks (chars / 4).
    pub fn estimate_tokens(&self) -> i64 {
        (self.char_len() / 4) as i64
    }

    fn char_len(&self) -> usize {
        match self {
            Message::User { content, .. } | Message::Custom { content, .. } => content
                .iter()
                .map(|b| match b {
                    UserBlock::Text { text } => text.len(),
                    UserBlock::Image { data, .. } => data.len(),
                })
                .sum(),
            Message::Assistant(m) => m
                .content
                .iter()
                .map(|b| match b {
                    AssistantBlock::Text { text } | AssistantBlock::Thinking { text, .. } => {
                        text.len()
                    }
                    AssistantBlock::ToolCall { arguments, .. } => arguments.to_string().len(),
                })
                .sum(),
            Message::ToolResult { content, .. } => content
                .iter()
                .map(|b| match b {
                    ToolResultBlock::Text { text } => text.len(),
                    ToolResultBlock::Image { data, .. } => data.len(),
                })
                .sum(),
            Message::BashExecution {
                command, output, ..
            } => command.len() + output.len(),
            Message::PythonExecution { code, output, .. } => code.len() + output.len(),
            Message::FileMention { files, .. } => {
                files.iter().map(|f| f.path.len() + f.content.len()).sum()
            }
            Message::CompactionSummary { summary, .. }
            | Message::BranchSummary { summary, .. } => summary.len(),
        }
    }

    /// Borrow the inner assistant message if this is one.
    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Message::Assistant(m) => Some(m),
            _ => None,
        }
    }
}

/// Current time in Unix milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
#[path = "message.test.rs"]
mod tests;
