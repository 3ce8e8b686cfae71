//! Session facade: the public API above the journal and the loop.
//!
//! A [`Session`] is cheap to clone and internally synchronized: one run at
//! a time holds the agent, while steering, queueing, and aborts stay
//! available from other tasks.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use pi_inference::ModelClient;
use pi_inference::StreamRequest;
use pi_loop::AgentEventSender;
use pi_loop::AgentEventStream;
use pi_loop::AgentLoop;
use pi_loop::CompactionOutcome;
use pi_loop::CompactionRecord;
use pi_loop::CredentialCycler;
use pi_loop::LoopResult;
use pi_loop::MessageQueue;
use pi_loop::SessionStore;
use pi_protocol::AgentEvent;
use pi_protocol::CompactConfig;
use pi_protocol::LoopConfig;
use pi_protocol::Message;
use pi_protocol::ModelRole;
use pi_protocol::QueueKind;
use pi_protocol::QueuedMessage;
use pi_protocol::RetryConfig;
use pi_protocol::StopReason;
use pi_protocol::StreamingBehavior;
use pi_protocol::ThinkingLevel;
use pi_protocol::UserBlock;
use pi_tools_api::ToolRegistry;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::entry::SessionHeader;
use crate::journal::JournalError;
use crate::journal::SessionJournal;

const HANDOFF_PROMPT: &str = "Write a self-contained handoff document for an assistant taking \
over this session: the goal, the current state, decisions made, files involved, and concrete \
next steps. Output only the document.";

/// Facade failure modes.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("agent is streaming; pass a streaming behavior to queue the prompt instead")]
    Busy,
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Options for [`Session::prompt`].
#[derive(Default)]
pub struct PromptOptions {
    /// Base64 images attached to the prompt, as `(data, media_type)`.
    pub images: Vec<(String, String)>,
    /// Mark the message as system-injected.
    pub synthetic: bool,
    /// What to do when the agent is already streaming.
    pub streaming_behavior: Option<StreamingBehavior>,
}

/// What [`Session::prompt`] did.
pub enum PromptOutcome {
    /// A run started; consume its event stream.
    Started(AgentEventStream),
    /// The agent was busy; the message was queued.
    Queued { id: String },
}

struct JournalStore {
    journal: Arc<StdMutex<SessionJournal>>,
}

impl SessionStore for JournalStore {
    fn append_message(&self, message: &Message) -> anyhow::Result<String> {
        Ok(lock(&self.journal).append_message(message)?)
    }

    fn append_compaction(&self, record: &CompactionRecord) -> anyhow::Result<String> {
        Ok(lock(&self.journal).append_compaction(record)?)
    }
}

struct SessionInner {
    journal: Arc<StdMutex<SessionJournal>>,
    agent: tokio::sync::Mutex<AgentLoop>,
    queue: MessageQueue,
    streaming: AtomicBool,
    current_events: StdMutex<Option<AgentEventSender>>,
    cancel: StdMutex<CancellationToken>,
    run_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<anyhow::Result<LoopResult>>>>,
}

/// Handle to one session. Clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Builder for opening or creating a [`Session`].
pub struct SessionBuilder {
    model: Option<Arc<dyn ModelClient>>,
    compact_model: Option<Arc<dyn ModelClient>>,
    extra_models: Vec<Arc<dyn ModelClient>>,
    tools: Arc<ToolRegistry>,
    system_prompt: String,
    workspace_root: PathBuf,
    loop_config: LoopConfig,
    compact_config: CompactConfig,
    retry_config: RetryConfig,
    credential_cycler: Option<Arc<dyn CredentialCycler>>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            model: None,
            compact_model: None,
            extra_models: Vec::new(),
            tools: Arc::new(ToolRegistry::new()),
            system_prompt: String::new(),
            workspace_root: PathBuf::from("."),
            loop_config: LoopConfig {
                edit_variant: pi_protocol::EditVariant::from_env(),
                ..LoopConfig::default()
            },
            compact_config: CompactConfig::default(),
            retry_config: RetryConfig::default(),
            credential_cycler: None,
        }
    }

    pub fn model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn compact_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.compact_model = Some(model);
        self
    }

    pub fn extra_models(mut self, models: Vec<Arc<dyn ModelClient>>) -> Self {
        self.extra_models = models;
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = config;
        self
    }

    pub fn compact_config(mut self, config: CompactConfig) -> Self {
        self.compact_config = config;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn credential_cycler(mut self, cycler: Arc<dyn CredentialCycler>) -> Self {
        self.credential_cycler = Some(cycler);
        self
    }

    /// Create a fresh session file at `path`.
    pub fn create(self, path: impl Into<PathBuf>) -> Result<Session, SessionError> {
        let header = self.header()?;
        let journal = SessionJournal::create(path, header)?;
        self.finish(journal)
    }

    /// Open an existing session file.
    pub fn open(self, path: impl Into<PathBuf>) -> Result<Session, SessionError> {
        let journal = SessionJournal::open(path)?;
        self.finish(journal)
    }

    fn header(&self) -> Result<SessionHeader, SessionError> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("session requires a model"))?;
        let info = model.info();
        Ok(SessionHeader {
            cwd: self.workspace_root.display().to_string(),
            system_prompt: self.system_prompt.clone(),
            model_id: info.id,
            provider: info.provider,
        })
    }

    fn finish(self, journal: SessionJournal) -> Result<Session, SessionError> {
        let model = self
            .model
            .ok_or_else(|| anyhow::anyhow!("session requires a model"))?;
        let journal = Arc::new(StdMutex::new(journal));
        let queue = MessageQueue::new();
        let store = Arc::new(JournalStore {
            journal: journal.clone(),
        });

        let mut builder = AgentLoop::builder()
            .model(model)
            .tools(self.tools)
            .store(store)
            .system_prompt(self.system_prompt)
            .workspace_root(self.workspace_root)
            .config(self.loop_config)
            .compact_config(self.compact_config)
            .retry_config(self.retry_config)
            .queue(queue.clone())
            .extra_models(self.extra_models);
        if let Some(compact_model) = self.compact_model {
            builder = builder.compact_model(compact_model);
        }
        if let Some(cycler) = self.credential_cycler {
            builder = builder.credential_cycler(cycler);
        }
        let mut agent = builder.build();
        agent.set_messages(lock(&journal).build_session_context());

        info!(path = %lock(&journal).path().display(), "session ready");
        Ok(Session {
            inner: Arc::new(SessionInner {
                journal,
                agent: tokio::sync::Mutex::new(agent),
                queue,
                streaming: AtomicBool::new(false),
                current_events: StdMutex::new(None),
                cancel: StdMutex::new(CancellationToken::new()),
                run_handle: tokio::sync::Mutex::new(None),
            }),
        })
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Path of the backing journal file.
    pub fn path(&self) -> PathBuf {
        lock(&self.inner.journal).path().to_path_buf()
    }

    /// Whether a run is in flight.
    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::SeqCst)
    }

    /// Run a closure against the journal (mainly for inspection).
    pub fn with_journal<R>(&self, f: impl FnOnce(&mut SessionJournal) -> R) -> R {
        f(&mut lock(&self.inner.journal))
    }

    /// Snapshot of the in-memory conversation.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner
            .agent
            .lock()
            .await
            .messages()
            .iter()
            .map(|t| t.message.clone())
            .collect()
    }

    /// Rebuild the in-memory conversation from the journal.
    pub async fn reload(&self) {
        let context = lock(&self.inner.journal).build_session_context();
        self.inner.agent.lock().await.set_messages(context);
    }

    // ------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------

    /// Send a user prompt.
    ///
    /// Starts a run when the agent is idle. While streaming, the prompt is
    /// queued according to `streaming_behavior`, or rejected with
    /// [`SessionError::Busy`] when none was given.
    pub async fn prompt(
        &self,
        text: impl Into<String>,
        options: PromptOptions,
    ) -> Result<PromptOutcome, SessionError> {
        let mut content = vec![UserBlock::text(text)];
        for (data, media_type) in options.images {
            content.push(UserBlock::image(data, media_type));
        }
        let message = Message::User {
            content,
            timestamp: chrono::Utc::now().timestamp_millis(),
            synthetic: options.synthetic,
        };

        if self.is_streaming() {
            let kind = match options.streaming_behavior {
                Some(StreamingBehavior::Steer) => QueueKind::Steer,
                Some(StreamingBehavior::FollowUp) => QueueKind::FollowUp,
                None => return Err(SessionError::Busy),
            };
            let queued = QueuedMessage {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                message,
                queued_at: chrono::Utc::now().timestamp_millis(),
            };
            let id = queued.id.clone();
            self.announce_queued(&queued);
            self.inner.queue.push_message(queued);
            return Ok(PromptOutcome::Queued { id });
        }

        let stream = self.start_run(Some(message)).await?;
        Ok(PromptOutcome::Started(stream))
    }

    /// Queue a steer message: injected at the next turn start, preempting
    /// remaining tool calls of the current message.
    pub fn steer(&self, text: impl Into<String>) -> String {
        self.queue_user(QueueKind::Steer, text.into())
    }

    /// Queue a follow-up message: runs one more turn after the agent
    /// would otherwise stop.
    pub fn follow_up(&self, text: impl Into<String>) -> String {
        self.queue_user(QueueKind::FollowUp, text.into())
    }

    /// Cancel the active run and wait for the loop to go idle.
    pub async fn abort(&self) -> Option<LoopResult> {
        lock(&self.inner.cancel).cancel();
        self.wait_idle().await
    }

    /// Wait for the active run (if any) to finish.
    pub async fn wait_idle(&self) -> Option<LoopResult> {
        let handle = self.inner.run_handle.lock().await.take()?;
        match handle.await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(error)) => {
                warn!(%error, "agent run failed");
                None
            }
            Err(error) => {
                warn!(%error, "agent task panicked or was cancelled");
                None
            }
        }
    }

    async fn start_run(&self, prompt: Option<Message>) -> Result<AgentEventStream, SessionError> {
        if self.inner.streaming.swap(true, Ordering::SeqCst) {
            return Err(SessionError::Busy);
        }
        let (tx, rx) = pi_inference::channel();
        let token = CancellationToken::new();
        *lock(&self.inner.cancel) = token.clone();
        *lock(&self.inner.current_events) = Some(tx.clone());

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let result = {
                let mut agent = inner.agent.lock().await;
                agent.reset_cancel_token(token);
                agent.run(prompt, &tx).await
            };
            *lock(&inner.current_events) = None;
            inner.streaming.store(false, Ordering::SeqCst);
            result
        });
        *self.inner.run_handle.lock().await = Some(handle);
        Ok(rx)
    }

    fn queue_user(&self, kind: QueueKind, text: String) -> String {
        let queued = QueuedMessage::new(kind, text);
        let id = queued.id.clone();
        self.announce_queued(&queued);
        self.inner.queue.push_message(queued);
        id
    }

    fn announce_queued(&self, queued: &QueuedMessage) {
        if let Some(events) = lock(&self.inner.current_events).as_ref() {
            events.push(AgentEvent::MessageQueued {
                id: queued.id.clone(),
                kind: queued.kind,
                preview: queued.preview(64),
            });
        }
    }

    // ------------------------------------------------------------------
    // Tree operations
    // ------------------------------------------------------------------

    /// Move the leaf to an existing entry and rebuild the context.
    pub async fn branch(&self, entry_id: &str) -> Result<(), SessionError> {
        self.ensure_idle()?;
        lock(&self.inner.journal).branch(entry_id)?;
        self.reload().await;
        Ok(())
    }

    /// Move the leaf to `target_id`, optionally recording a summary of the
    /// entries that fall off the path.
    pub async fn navigate_tree(
        &self,
        target_id: &str,
        summarize: bool,
    ) -> Result<(), SessionError> {
        self.ensure_idle()?;

        let (old_leaf, off_path) = {
            let journal = lock(&self.inner.journal);
            if journal.entry(target_id).is_none() {
                return Err(JournalError::UnknownEntry {
                    id: target_id.to_string(),
                }
                .into());
            }
            let old_leaf = journal.leaf().map(String::from);
            // Entries reachable from the target stay on path.
            let mut on_path = HashSet::new();
            let mut cursor = Some(target_id.to_string());
            while let Some(id) = cursor {
                let Some(entry) = journal.entry(&id) else { break };
                on_path.insert(id);
                cursor = entry.parent_id.clone();
            }
            let off_path: Vec<Message> = journal
                .get_branch()
                .iter()
                .filter(|e| !on_path.contains(&e.id) && e.is_message())
                .filter_map(|e| match &e.payload {
                    crate::entry::EntryPayload::Message { message }
                    | crate::entry::EntryPayload::CustomMessage { message } => {
                        Some(message.clone())
                    }
                    _ => None,
                })
                .collect();
            (old_leaf, off_path)
        };

        if summarize && !off_path.is_empty() {
            let summary = self.summarize_off_path(&off_path).await;
            let from_id = old_leaf.unwrap_or_else(|| target_id.to_string());
            lock(&self.inner.journal).branch_with_summary(
                Some(target_id),
                &from_id,
                &summary,
                None,
            )?;
        } else {
            lock(&self.inner.journal).branch(target_id)?;
        }
        self.reload().await;
        Ok(())
    }

    async fn summarize_off_path(&self, messages: &[Message]) -> String {
        let fallback = format!("Abandoned a branch with {} messages.", messages.len());
        let model = self.inner.agent.lock().await.model().clone();
        let transcript: String = messages
            .iter()
            .map(render_line)
            .collect::<Vec<_>>()
            .join("\n");
        let request = StreamRequest {
            system_prompt: "Summarize the abandoned conversation branch below in a few \
                            sentences, keeping concrete details."
                .to_string(),
            messages: vec![Message::user(transcript)],
            tools: Vec::new(),
        };
        match model.stream(request, CancellationToken::new()).await {
            Ok(stream) => match stream.result().await {
                Some(message)
                    if message.stop_reason != StopReason::Error
                        && !message.text().trim().is_empty() =>
                {
                    message.text()
                }
                _ => fallback,
            },
            Err(error) => {
                warn!(%error, "branch summarization failed; using fallback");
                fallback
            }
        }
    }

    /// Copy the session file (and artifacts) and switch to the copy.
    pub async fn fork(&self) -> Result<PathBuf, SessionError> {
        self.ensure_idle()?;
        let mut journal = lock(&self.inner.journal);
        let path = journal.path().to_path_buf();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "session".to_string());
        let suffix = &uuid::Uuid::new_v4().to_string()[..8];
        let new_path = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("{stem}-fork-{suffix}.jsonl"));
        journal.fork(&new_path)?;
        Ok(new_path)
    }

    /// Flush and switch to another session file.
    pub async fn switch_session(&self, path: impl Into<PathBuf>) -> Result<(), SessionError> {
        self.ensure_idle()?;
        lock(&self.inner.journal).set_session_file(path)?;
        self.reload().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Model & mode changes
    // ------------------------------------------------------------------

    /// Switch the driving model, recording the change in the journal.
    pub async fn set_model(&self, model: Arc<dyn ModelClient>) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let info = model.info();
        lock(&self.inner.journal).append_model_change(info.id, ModelRole::Main)?;
        self.inner.agent.lock().await.set_model(model);
        Ok(())
    }

    /// Record a thinking-level change.
    pub fn set_thinking_level(&self, level: ThinkingLevel) -> Result<(), SessionError> {
        lock(&self.inner.journal).append_thinking_level_change(level)?;
        Ok(())
    }

    /// Record a mode change.
    pub fn set_mode(
        &self,
        mode: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Result<(), SessionError> {
        lock(&self.inner.journal).append_mode_change(mode, data)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Compaction & handoff
    // ------------------------------------------------------------------

    /// Manually compact the conversation.
    pub async fn compact(
        &self,
        instructions: Option<&str>,
    ) -> Result<CompactionOutcome, SessionError> {
        self.ensure_idle()?;
        let (tx, _rx) = pi_inference::channel();
        let mut agent = self.inner.agent.lock().await;
        let outcome = agent.compact_now(instructions, &tx).await?;
        Ok(outcome)
    }

    /// Ask the agent for a continuation document, then open a fresh
    /// session seeded with it. Returns the new session file's path; this
    /// session switches to it.
    pub async fn handoff(&self, instructions: Option<&str>) -> Result<PathBuf, SessionError> {
        self.ensure_idle()?;

        let mut prompt_text = HANDOFF_PROMPT.to_string();
        if let Some(instructions) = instructions {
            prompt_text.push_str("\n\n");
            prompt_text.push_str(instructions);
        }
        let stream = self
            .start_run(Some(Message::synthetic_user(prompt_text)))
            .await?;
        let result = self.wait_idle().await;
        drop(stream);
        let document = result
            .and_then(|r| r.final_text())
            .ok_or_else(|| anyhow::anyhow!("handoff run produced no document"))?;

        let (new_path, header) = {
            let journal = lock(&self.inner.journal);
            let path = journal.path().to_path_buf();
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "session".to_string());
            let suffix = &uuid::Uuid::new_v4().to_string()[..8];
            let new_path = path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(format!("{stem}-handoff-{suffix}.jsonl"));
            let header = journal
                .header()
                .cloned()
                .ok_or(JournalError::NoSession)?;
            (new_path, header)
        };

        let mut seeded = SessionJournal::create(&new_path, header)?;
        seeded.append_message(&Message::synthetic_user(document))?;
        seeded.sync()?;
        drop(seeded);

        self.switch_session(&new_path).await?;
        Ok(new_path)
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        if self.is_streaming() {
            return Err(SessionError::Busy);
        }
        Ok(())
    }
}

fn render_line(message: &Message) -> String {
    match message {
        Message::User { content, .. } => {
            let text: String = content.iter().filter_map(|b| b.as_text()).collect();
            format!("User: {text}")
        }
        Message::Assistant(a) => format!("Assistant: {}", a.text()),
        other => format!("{other:?}"),
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[path = "session.test.rs"]
mod tests;
