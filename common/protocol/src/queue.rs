//! Queueing types for user input that arrives while the agent is busy.
//!
//! Two flavours exist:
//!
//! 1. **Steer**: the user interrupted mid-turn. Injected at the next turn
//!    start and may preempt remaining tool calls.
//! 2. **Follow-up**: the user typed while the agent would otherwise stop.
//!    Forces one more turn after the current one completes.

use serde::Deserialize;
use serde::Serialize;

use crate::message::Message;

/// Which queue a message was placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Steer,
    FollowUp,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Steer => "steer",
            QueueKind::FollowUp => "follow_up",
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the loop drains queued messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// Drain everything that is queued.
    #[default]
    All,
    /// Take only the first queued message.
    OneAtATime,
}

/// How `prompt()` behaves when the agent is already streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingBehavior {
    /// Queue as a steer message.
    Steer,
    /// Queue as a follow-up message.
    FollowUp,
}

/// A user message waiting to be injected into the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub kind: QueueKind,
    pub message: Message,
    /// Timestamp when queued (Unix milliseconds).
    pub queued_at: i64,
}

impl QueuedMessage {
    /// Queue a plain-text user message.
    pub fn new(kind: QueueKind, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            message: Message::user(text),
            queued_at: crate::message::now_ms(),
        }
    }

    /// Get a preview of the message text (first `max_len` chars).
    pub fn preview(&self, max_len: usize) -> String {
        let text = match &self.message {
            Message::User { content, .. } => content
                .iter()
                .filter_map(|b| b.as_text())
                .collect::<String>(),
            other => format!("{other:?}"),
        };
        if text.chars().count() <= max_len {
            text
        } else {
            let truncated: String = text.chars().take(max_len).collect();
            format!("{truncated}...")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_message_has_id_and_timestamp() {
        let qm = QueuedMessage::new(QueueKind::Steer, "stop");
        assert!(!qm.id.is_empty());
        assert!(qm.queued_at > 0);
        assert_eq!(qm.kind, QueueKind::Steer);
    }

    #[test]
    fn preview_truncates_long_text() {
        let qm = QueuedMessage::new(QueueKind::FollowUp, "a very long follow-up message");
        assert_eq!(qm.preview(6), "a very...");
        assert_eq!(qm.preview(100), "a very long follow-up message");
    }

    #[test]
    fn queue_kind_strings() {
        assert_eq!(QueueKind::Steer.to_string(), "steer");
        assert_eq!(QueueKind::FollowUp.as_str(), "follow_up");
    }

    #[test]
    fn queue_mode_default_drains_all() {
        assert_eq!(QueueMode::default(), QueueMode::All);
    }
}
