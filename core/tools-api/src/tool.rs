//! The tool trait and its output types.

use async_trait::async_trait;
use pi_protocol::ToolProgress;
use pi_protocol::ToolResultBlock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Callback a tool may use to report intermediate progress.
pub type ProgressFn<'a> = &'a (dyn Fn(ToolProgress) + Send + Sync);

/// Result of a completed tool invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub content: Vec<ToolResultBlock>,
    /// Tool-owned structured data; the core never introspects it.
    pub details: Value,
    pub is_error: bool,
}

impl ToolOutput {
    /// A successful output with one text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultBlock::text(text)],
            details: Value::Null,
            is_error: false,
        }
    }

    /// An error output with one text block.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultBlock::text(text)],
            details: Value::Null,
            is_error: true,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// A tool invocation failed with an exception-like error.
///
/// The loop wraps this into an error tool result; it never escapes the turn.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// JSON schema for a `JsonSchema`-deriving arguments struct.
///
/// Convenience for tools that describe their arguments with a plain struct
/// instead of hand-writing the schema value.
pub fn schema_for<T: schemars::JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T).schema).unwrap_or(Value::Null)
}

/// A named, schema-described operation the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool.
    ///
    /// `cancel` is signalled when the user aborts the run; tools should
    /// return promptly with whatever they have. `on_progress` may be called
    /// any number of times; each call surfaces as a `ToolExecutionUpdate`
    /// event.
    async fn execute(
        &self,
        call_id: &str,
        arguments: Value,
        cancel: CancellationToken,
        on_progress: ProgressFn<'_>,
    ) -> Result<ToolOutput, ToolError>;
}
