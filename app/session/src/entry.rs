//! Journal entry records.
//!
//! Entries are line-delimited JSON; each carries its id, a parent link,
//! and one typed payload. Parent links form a forest: branching moves the
//! leaf pointer without rewriting history.

use pi_protocol::Message;
use pi_protocol::ModelRole;
use pi_protocol::ThinkingLevel;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Header payload of the first entry in every session file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub cwd: String,
    pub system_prompt: String,
    pub model_id: String,
    pub provider: String,
}

/// Typed payload of a journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPayload {
    /// First record of a session file.
    Session(SessionHeader),
    Message {
        message: Message,
    },
    /// Extension-owned message; projected into context like `Message`.
    CustomMessage {
        message: Message,
    },
    Compaction {
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        short_summary: Option<String>,
        first_kept_entry_id: String,
        tokens_before: i64,
        #[serde(default)]
        details: Value,
        #[serde(default)]
        from_extension: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preserve_data: Option<Value>,
    },
    BranchSummary {
        /// Leaf of the branch that was abandoned.
        from_id: String,
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    ModelChange {
        model_id: String,
        role: ModelRole,
    },
    ThinkingLevelChange {
        level: ThinkingLevel,
    },
    ModeChange {
        mode: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

/// One record in a journal file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub parent_id: Option<String>,
    /// Unix milliseconds.
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: EntryPayload,
}

impl Entry {
    /// New entry with a fresh id, timestamped now.
    pub fn new(parent_id: Option<String>, payload: EntryPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
        }
    }

    /// Whether this entry projects into the conversation context.
    pub fn is_message(&self) -> bool {
        matches!(
            self.payload,
            EntryPayload::Message { .. } | EntryPayload::CustomMessage { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn entry_serializes_with_type_tag() {
        let entry = Entry::new(
            Some("parent".into()),
            EntryPayload::Message {
                message: Message::user("hi"),
            },
        );
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["parent_id"], "parent");
        assert_eq!(value["message"]["role"], "user");

        let parsed: Entry = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn session_header_roundtrip() {
        let entry = Entry::new(
            None,
            EntryPayload::Session(SessionHeader {
                cwd: "/work".into(),
                system_prompt: "be helpful".into(),
                model_id: "m1".into(),
                provider: "prov".into(),
            }),
        );
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"type\":\"session\""));
        let parsed: Entry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, entry);
        assert!(!parsed.is_message());
    }

    #[test]
    fn compaction_payload_roundtrip() {
        let entry = Entry::new(
            Some("leaf".into()),
            EntryPayload::Compaction {
                summary: "did things".into(),
                short_summary: None,
                first_kept_entry_id: "e9".into(),
                tokens_before: 88_000,
                details: Value::Null,
                from_extension: false,
                preserve_data: None,
            },
        );
        let line = serde_json::to_string(&entry).unwrap();
        let parsed: Entry = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, entry);
    }
}
