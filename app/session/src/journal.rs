//! Append-only session journal with a parent-linked entry tree.
//!
//! One file per session, line-delimited JSON. The writer keeps the file
//! handle open for the session's lifetime and syncs at flush points;
//! history is only ever rewritten wholesale through an atomic
//! temp-file-and-rename.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use pi_loop::CompactionRecord;
use pi_loop::TrackedMessage;
use pi_protocol::Message;
use pi_protocol::ModelRole;
use pi_protocol::ThinkingLevel;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::entry::SessionHeader;

/// Journal failure modes. Write errors poison the writer: subsequent
/// writes fail fast until a new writer is opened.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("unknown entry: {id}")]
    UnknownEntry { id: String },
    #[error("entry {id} is not on the current branch")]
    NotInBranch { id: String },
    #[error("journal has no session entry")]
    NoSession,
    #[error("journal writer is errored; reopen the session to continue")]
    WriterErrored,
}

type ErrorCallback = Arc<dyn Fn(&JournalError) + Send + Sync>;

struct JournalWriter {
    file: fs::File,
    errored: bool,
}

impl JournalWriter {
    fn open(path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            errored: false,
        })
    }

    fn write_line(&mut self, line: &str) -> Result<(), JournalError> {
        if self.errored {
            return Err(JournalError::WriterErrored);
        }
        let result = self
            .file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.write_all(b"\n"));
        if let Err(error) = result {
            self.errored = true;
            return Err(error.into());
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), JournalError> {
        if self.errored {
            return Err(JournalError::WriterErrored);
        }
        self.file.sync_all().map_err(JournalError::from)
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        // Best-effort durability on teardown.
        if !self.errored {
            let _ = self.file.sync_all();
        }
    }
}

/// A session journal: on-disk file plus in-memory index.
pub struct SessionJournal {
    path: PathBuf,
    writer: JournalWriter,
    entries: HashMap<String, Entry>,
    /// Entry ids in file order; the last one is the leaf after open.
    order: Vec<String>,
    leaf: Option<String>,
    on_error: Option<ErrorCallback>,
}

impl SessionJournal {
    /// Create a new session file whose first entry is the header.
    pub fn create(path: impl Into<PathBuf>, header: SessionHeader) -> Result<Self, JournalError> {
        Self::create_with_parent(path, header, None)
    }

    /// Create a new session file whose header entry links to a parent in
    /// another session (`createBranchedSession`).
    pub fn create_with_parent(
        path: impl Into<PathBuf>,
        header: SessionHeader,
        parent_id: Option<String>,
    ) -> Result<Self, JournalError> {
        let path = path.into();
        let writer = JournalWriter::open(&path)?;
        let mut journal = Self {
            path,
            writer,
            entries: HashMap::new(),
            order: Vec::new(),
            leaf: None,
            on_error: None,
        };
        journal.write_entry(Entry::new(parent_id, EntryPayload::Session(header)))?;
        Ok(journal)
    }

    /// Open an existing session file, skipping malformed lines.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        let content = fs::read_to_string(&path)?;
        let mut entries = HashMap::new();
        let mut order = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Entry>(line) {
                Ok(entry) => {
                    if entries.contains_key(&entry.id) {
                        warn!(line = i + 1, id = %entry.id, "skipping duplicate journal entry");
                        continue;
                    }
                    order.push(entry.id.clone());
                    entries.insert(entry.id.clone(), entry);
                }
                Err(error) => {
                    // Tolerates a truncated last line from a partial write.
                    warn!(line = i + 1, %error, "skipping malformed journal line");
                }
            }
        }
        if !entries
            .values()
            .any(|e| matches!(e.payload, EntryPayload::Session(_)))
        {
            return Err(JournalError::NoSession);
        }
        let leaf = order.last().cloned();
        let writer = JournalWriter::open(&path)?;
        debug!(path = %path.display(), entries = order.len(), "journal opened");
        Ok(Self {
            path,
            writer,
            entries,
            order,
            leaf,
            on_error: None,
        })
    }

    /// Install a callback invoked on write errors.
    pub fn set_on_error(&mut self, callback: ErrorCallback) {
        self.on_error = Some(callback);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn leaf(&self) -> Option<&str> {
        self.leaf.as_deref()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn entry(&self, id: &str) -> Option<&Entry> {
        self.entries.get(id)
    }

    /// The session header of this file.
    pub fn header(&self) -> Option<&SessionHeader> {
        self.order.iter().find_map(|id| match &self.entries[id].payload {
            EntryPayload::Session(header) => Some(header),
            _ => None,
        })
    }

    // ------------------------------------------------------------------
    // Appends
    // ------------------------------------------------------------------

    pub fn append_message(&mut self, message: &Message) -> Result<String, JournalError> {
        self.append_payload(EntryPayload::Message {
            message: message.clone(),
        })
    }

    pub fn append_custom_message(&mut self, message: Message) -> Result<String, JournalError> {
        self.append_payload(EntryPayload::CustomMessage { message })
    }

    /// Append a compaction entry. `first_kept_entry_id` must sit on the
    /// current branch.
    pub fn append_compaction(&mut self, record: &CompactionRecord) -> Result<String, JournalError> {
        if !self.branch_contains(&record.first_kept_entry_id) {
            return Err(JournalError::NotInBranch {
                id: record.first_kept_entry_id.clone(),
            });
        }
        self.append_payload(EntryPayload::Compaction {
            summary: record.summary.clone(),
            short_summary: record.short_summary.clone(),
            first_kept_entry_id: record.first_kept_entry_id.clone(),
            tokens_before: record.tokens_before,
            details: record.details.clone(),
            from_extension: false,
            preserve_data: None,
        })
    }

    pub fn append_model_change(
        &mut self,
        model_id: impl Into<String>,
        role: ModelRole,
    ) -> Result<String, JournalError> {
        self.append_payload(EntryPayload::ModelChange {
            model_id: model_id.into(),
            role,
        })
    }

    pub fn append_thinking_level_change(
        &mut self,
        level: ThinkingLevel,
    ) -> Result<String, JournalError> {
        self.append_payload(EntryPayload::ThinkingLevelChange { level })
    }

    pub fn append_mode_change(
        &mut self,
        mode: impl Into<String>,
        data: Option<Value>,
    ) -> Result<String, JournalError> {
        self.append_payload(EntryPayload::ModeChange {
            mode: mode.into(),
            data,
        })
    }

    fn append_payload(&mut self, payload: EntryPayload) -> Result<String, JournalError> {
        self.write_entry(Entry::new(self.leaf.clone(), payload))
    }

    fn write_entry(&mut self, entry: Entry) -> Result<String, JournalError> {
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(error) => return Err(self.report(error.into())),
        };
        if let Err(error) = self.writer.write_line(&line) {
            return Err(self.report(error));
        }
        let id = entry.id.clone();
        self.order.push(id.clone());
        self.entries.insert(id.clone(), entry);
        self.leaf = Some(id.clone());
        Ok(id)
    }

    fn report(&self, error: JournalError) -> JournalError {
        if let Some(callback) = &self.on_error {
            callback(&error);
        }
        error
    }

    /// Force buffered records to disk.
    pub fn sync(&mut self) -> Result<(), JournalError> {
        self.writer.sync()
    }

    // ------------------------------------------------------------------
    // Tree navigation
    // ------------------------------------------------------------------

    /// Move the leaf to an existing entry. No new entry is created.
    pub fn branch(&mut self, entry_id: &str) -> Result<(), JournalError> {
        if !self.entries.contains_key(entry_id) {
            return Err(JournalError::UnknownEntry {
                id: entry_id.to_string(),
            });
        }
        self.leaf = Some(entry_id.to_string());
        Ok(())
    }

    /// Record a summary of an abandoned branch under `target` (or as a new
    /// root when `None`); the leaf moves to the new entry.
    pub fn branch_with_summary(
        &mut self,
        target: Option<&str>,
        from_id: &str,
        summary: &str,
        details: Option<Value>,
    ) -> Result<String, JournalError> {
        if let Some(target) = target {
            if !self.entries.contains_key(target) {
                return Err(JournalError::UnknownEntry {
                    id: target.to_string(),
                });
            }
        }
        self.write_entry(Entry::new(
            target.map(String::from),
            EntryPayload::BranchSummary {
                from_id: from_id.to_string(),
                summary: summary.to_string(),
                details,
            },
        ))
    }

    /// The root-to-leaf chain of entries.
    pub fn get_branch(&self) -> Vec<&Entry> {
        let mut branch = Vec::new();
        let mut cursor = self.leaf.as_deref();
        while let Some(id) = cursor {
            let Some(entry) = self.entries.get(id) else {
                // Parent lives in another session file (branched session).
                break;
            };
            branch.push(entry);
            cursor = entry.parent_id.as_deref();
        }
        branch.reverse();
        branch
    }

    fn branch_contains(&self, id: &str) -> bool {
        self.get_branch().iter().any(|e| e.id == id)
    }

    /// Project the branch into the agent's message list, applying
    /// compaction splicing: entries older than a compaction's first kept
    /// entry collapse into one synthesized summary message.
    pub fn build_session_context(&self) -> Vec<TrackedMessage> {
        let branch = self.get_branch();
        let position: HashMap<&str, usize> = branch
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.as_str(), i))
            .collect();

        let mut out: Vec<(usize, TrackedMessage)> = Vec::new();
        for (index, entry) in branch.iter().enumerate() {
            match &entry.payload {
                EntryPayload::Message { message } | EntryPayload::CustomMessage { message } => {
                    out.push((index, TrackedMessage::new(entry.id.clone(), message.clone())));
                }
                EntryPayload::BranchSummary {
                    summary, from_id, ..
                } => {
                    out.push((
                        index,
                        TrackedMessage::new(
                            entry.id.clone(),
                            Message::BranchSummary {
                                summary: summary.clone(),
                                from_id: from_id.clone(),
                                timestamp: entry.timestamp,
                            },
                        ),
                    ));
                }
                EntryPayload::Compaction {
                    summary,
                    first_kept_entry_id,
                    ..
                } => {
                    let kept_from = position
                        .get(first_kept_entry_id.as_str())
                        .copied()
                        .unwrap_or(0);
                    out.retain(|(i, _)| *i >= kept_from);
                    out.insert(
                        0,
                        (
                            index,
                            TrackedMessage::new(
                                entry.id.clone(),
                                pi_loop::summary_message(summary),
                            ),
                        ),
                    );
                }
                EntryPayload::Session(_)
                | EntryPayload::ModelChange { .. }
                | EntryPayload::ThinkingLevelChange { .. }
                | EntryPayload::ModeChange { .. } => {}
            }
        }
        out.into_iter().map(|(_, tracked)| tracked).collect()
    }

    // ------------------------------------------------------------------
    // File operations
    // ------------------------------------------------------------------

    /// Copy the session file (and its artifacts directory, if any) and
    /// switch this journal to the copy.
    pub fn fork(&mut self, new_path: impl Into<PathBuf>) -> Result<(), JournalError> {
        let new_path = new_path.into();
        self.writer.sync()?;
        fs::copy(&self.path, &new_path)?;
        if let (Some(old_dir), Some(new_dir)) =
            (artifacts_dir(&self.path), artifacts_dir(&new_path))
        {
            if old_dir.is_dir() {
                copy_dir_recursive(&old_dir, &new_dir)?;
            }
        }
        self.writer = JournalWriter::open(&new_path)?;
        self.path = new_path;
        debug!(path = %self.path.display(), "forked session");
        Ok(())
    }

    /// Create a new session file rooted at an entry of this journal.
    pub fn create_branched_session(
        &self,
        new_path: impl Into<PathBuf>,
        parent_id: &str,
        header: SessionHeader,
    ) -> Result<SessionJournal, JournalError> {
        if !self.entries.contains_key(parent_id) {
            return Err(JournalError::UnknownEntry {
                id: parent_id.to_string(),
            });
        }
        SessionJournal::create_with_parent(new_path, header, Some(parent_id.to_string()))
    }

    /// Serialize all live entries to a temp file and atomically replace
    /// the session file.
    pub fn rewrite_entries(&mut self) -> Result<(), JournalError> {
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        for id in &self.order {
            let line = serde_json::to_string(&self.entries[id])?;
            tmp.write_all(line.as_bytes())?;
            tmp.write_all(b"\n")?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| JournalError::Io(e.error))?;
        // Make the rename durable.
        if let Ok(dir) = fs::File::open(&parent) {
            let _ = dir.sync_all();
        }
        self.writer = JournalWriter::open(&self.path)?;
        Ok(())
    }

    /// Flush the current file and switch to another session file.
    pub fn set_session_file(&mut self, path: impl Into<PathBuf>) -> Result<(), JournalError> {
        self.writer.sync()?;
        *self = SessionJournal::open(path)?;
        Ok(())
    }
}

/// `S.jsonl` may have a sibling artifacts directory `S/`.
fn artifacts_dir(path: &Path) -> Option<PathBuf> {
    let stem = path.file_stem()?;
    Some(path.parent()?.join(stem))
}

fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "journal.test.rs"]
mod tests;
