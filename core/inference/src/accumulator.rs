//! Accumulates stream deltas into a partial assistant message.
//!
//! The loop holds one accumulator per LLM call and republishes the snapshot
//! with every `MessageUpdate` event, so consumers always see a coherent
//! partially-assembled message rather than raw deltas.

use std::collections::HashMap;

use pi_protocol::AssistantBlock;
use pi_protocol::AssistantMessage;
use pi_protocol::StopReason;
use serde_json::Value;

use crate::stream_event::StreamEvent;

/// Builds an [`AssistantMessage`] from a sequence of [`StreamEvent`]s.
pub struct StreamAccumulator {
    message: AssistantMessage,
    /// Raw JSON argument text per tool-call block index, as streamed so far.
    tool_args: HashMap<usize, String>,
}

impl StreamAccumulator {
    /// Start accumulating a message attributed to the given model.
    pub fn new(model_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            message: AssistantMessage::empty(model_id, provider),
            tool_args: HashMap::new(),
        }
    }

    /// Apply one event. Returns `true` when the event changed the message
    /// content (callers use this to decide whether to re-emit a snapshot).
    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::Start => false,
            StreamEvent::TextStart { index } => {
                self.ensure_block(*index, AssistantBlock::text(""));
                false
            }
            StreamEvent::TextDelta { index, delta } => {
                self.ensure_block(*index, AssistantBlock::text(""));
                if let Some(AssistantBlock::Text { text }) = self.message.content.get_mut(*index) {
                    text.push_str(delta);
                }
                true
            }
            StreamEvent::TextEnd { .. } => false,
            StreamEvent::ThinkingStart { index } => {
                self.ensure_block(*index, AssistantBlock::thinking(""));
                false
            }
            StreamEvent::ThinkingDelta { index, delta } => {
                self.ensure_block(*index, AssistantBlock::thinking(""));
                if let Some(AssistantBlock::Thinking { text, .. }) =
                    self.message.content.get_mut(*index)
                {
                    text.push_str(delta);
                }
                true
            }
            StreamEvent::ThinkingEnd { .. } => false,
            StreamEvent::ToolCallStart { index, id, name } => {
                self.ensure_block(
                    *index,
                    AssistantBlock::tool_call(id.clone(), name.clone(), Value::Null),
                );
                self.tool_args.insert(*index, String::new());
                true
            }
            StreamEvent::ToolCallDelta { index, delta } => {
                self.tool_args.entry(*index).or_default().push_str(delta);
                true
            }
            StreamEvent::ToolCallEnd { index, arguments } => {
                if let Some(AssistantBlock::ToolCall {
                    arguments: slot, ..
                }) = self.message.content.get_mut(*index)
                {
                    *slot = arguments.clone();
                }
                true
            }
            StreamEvent::Done { stop_reason, usage } => {
                self.message.stop_reason = *stop_reason;
                self.message.usage = usage.clone();
                false
            }
            StreamEvent::Error { message } => {
                self.message.stop_reason = StopReason::Error;
                self.message.error_message = Some(message.clone());
                false
            }
        }
    }

    /// The raw argument text streamed so far for a tool-call block.
    pub fn partial_tool_arguments(&self, index: usize) -> Option<&str> {
        self.tool_args.get(&index).map(String::as_str)
    }

    /// The tool name of the block at `index`, if it is a tool call.
    pub fn tool_name(&self, index: usize) -> Option<&str> {
        match self.message.content.get(index) {
            Some(AssistantBlock::ToolCall { name, .. }) => Some(name),
            _ => None,
        }
    }

    /// Current snapshot of the partially assembled message.
    pub fn snapshot(&self) -> &AssistantMessage {
        &self.message
    }

    /// Finalize and take the message.
    pub fn into_message(self) -> AssistantMessage {
        self.message
    }

    fn ensure_block(&mut self, index: usize, template: AssistantBlock) {
        while self.message.content.len() <= index {
            self.message.content.push(template.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use pi_protocol::Usage;

    #[test]
    fn accumulates_text_and_tool_call() {
        let mut acc = StreamAccumulator::new("m1", "prov");
        acc.apply(&StreamEvent::Start);
        acc.apply(&StreamEvent::TextStart { index: 0 });
        acc.apply(&StreamEvent::TextDelta {
            index: 0,
            delta: "hel".into(),
        });
        acc.apply(&StreamEvent::TextDelta {
            index: 0,
            delta: "lo".into(),
        });
        acc.apply(&StreamEvent::ToolCallStart {
            index: 1,
            id: "c1".into(),
            name: "read".into(),
        });
        acc.apply(&StreamEvent::ToolCallDelta {
            index: 1,
            delta: "{\"path\":".into(),
        });
        acc.apply(&StreamEvent::ToolCallDelta {
            index: 1,
            delta: "\"foo\"}".into(),
        });
        assert_eq!(acc.partial_tool_arguments(1), Some("{\"path\":\"foo\"}"));
        acc.apply(&StreamEvent::ToolCallEnd {
            index: 1,
            arguments: json!({"path": "foo"}),
        });
        acc.apply(&StreamEvent::Done {
            stop_reason: pi_protocol::StopReason::ToolUse,
            usage: Usage::new(10, 5),
        });

        let msg = acc.into_message();
        assert_eq!(msg.text(), "hello");
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, "read");
        assert_eq!(*calls[0].2, json!({"path": "foo"}));
        assert_eq!(msg.stop_reason, pi_protocol::StopReason::ToolUse);
        assert_eq!(msg.usage.input_tokens, 10);
    }

    #[test]
    fn error_event_sets_stop_reason() {
        let mut acc = StreamAccumulator::new("m1", "prov");
        acc.apply(&StreamEvent::Error {
            message: "overloaded".into(),
        });
        let msg = acc.into_message();
        assert_eq!(msg.stop_reason, pi_protocol::StopReason::Error);
        assert_eq!(msg.error_message.as_deref(), Some("overloaded"));
    }

    #[test]
    fn thinking_deltas_accumulate() {
        let mut acc = StreamAccumulator::new("m1", "prov");
        acc.apply(&StreamEvent::ThinkingStart { index: 0 });
        acc.apply(&StreamEvent::ThinkingDelta {
            index: 0,
            delta: "hmm".into(),
        });
        let msg = acc.snapshot();
        assert_eq!(
            msg.content[0],
            AssistantBlock::Thinking {
                text: "hmm".into(),
                signature: None
            }
        );
    }
}
