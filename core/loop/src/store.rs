//! Persistence boundary between the loop and the session journal.
//!
//! The loop appends through [`SessionStore`] and never sees journal
//! internals; the session crate implements the trait for the on-disk
//! journal, and [`MemoryStore`] backs tests and ephemeral sessions.

use std::sync::Mutex;

use pi_protocol::Message;
use serde_json::Value;

/// A message as tracked by the loop's in-memory context.
#[derive(Debug, Clone)]
pub struct TrackedMessage {
    /// Journal entry id, when the message has been persisted.
    pub entry_id: Option<String>,
    pub message: Message,
}

impl TrackedMessage {
    pub fn new(entry_id: impl Into<String>, message: Message) -> Self {
        Self {
            entry_id: Some(entry_id.into()),
            message,
        }
    }

    /// A message that exists only in memory (e.g. a spliced summary view).
    pub fn unpersisted(message: Message) -> Self {
        Self {
            entry_id: None,
            message,
        }
    }
}

/// Payload of a compaction journal entry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CompactionRecord {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_summary: Option<String>,
    /// Entry id of the first message kept verbatim after the splice.
    pub first_kept_entry_id: String,
    pub tokens_before: i64,
    #[serde(default)]
    pub details: Value,
}

/// Where the loop persists conversation records.
pub trait SessionStore: Send + Sync {
    /// Append a message entry under the current leaf; returns its entry id.
    fn append_message(&self, message: &Message) -> anyhow::Result<String>;

    /// Append a compaction entry under the current leaf; returns its entry id.
    fn append_compaction(&self, record: &CompactionRecord) -> anyhow::Result<String>;
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<(String, Value)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of appended entries.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of `(entry_id, payload)` pairs in append order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, payload: Value) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.push((id.clone(), payload));
        id
    }
}

impl SessionStore for MemoryStore {
    fn append_message(&self, message: &Message) -> anyhow::Result<String> {
        let payload = serde_json::to_value(message)?;
        Ok(self.push(payload))
    }

    fn append_compaction(&self, record: &CompactionRecord) -> anyhow::Result<String> {
        let mut payload = serde_json::to_value(record)?;
        if let Some(object) = payload.as_object_mut() {
            object.insert("type".to_string(), Value::String("compaction".to_string()));
        }
        Ok(self.push(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_assigns_unique_ids() {
        let store = MemoryStore::new();
        let a = store.append_message(&Message::user("one")).unwrap();
        let b = store.append_message(&Message::user("two")).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn compaction_entries_are_typed() {
        let store = MemoryStore::new();
        store
            .append_compaction(&CompactionRecord {
                summary: "s".into(),
                short_summary: None,
                first_kept_entry_id: "e1".into(),
                tokens_before: 9000,
                details: Value::Null,
            })
            .unwrap();
        let entries = store.entries();
        assert_eq!(entries[0].1["type"], "compaction");
        assert_eq!(entries[0].1["tokens_before"], 9000);
    }
}
