//! The model client contract consumed by the loop and compaction.

use async_trait::async_trait;
use pi_protocol::Message;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::stream_event::AssistantStream;

/// Static facts about a model endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    /// Context window size in tokens.
    pub context_window: i64,
}

/// A tool made visible to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub parameters_schema: Value,
}

/// Everything one LLM call needs.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
}

/// The request could not be started at all.
///
/// Errors that occur *during* streaming surface as an `Error` stream event
/// and a terminal assistant message with `stop_reason = error`.
#[derive(Debug, thiserror::Error)]
#[error("stream request failed: {message}")]
pub struct StreamError {
    pub message: String,
}

impl StreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One model endpoint capable of streaming a response.
///
/// Cancelling the token must terminate the underlying byte stream; the
/// client then finishes the event stream with whatever partial message it
/// assembled, marked `aborted`.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Static facts about this endpoint.
    fn info(&self) -> ModelInfo;

    /// Start a streaming request over the given context.
    async fn stream(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> Result<AssistantStream, StreamError>;
}
