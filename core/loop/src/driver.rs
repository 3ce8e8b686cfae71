//! Agent loop driver: the streaming turn state machine.
//!
//! One run alternates between streaming an assistant message and
//! dispatching its tool calls, until the model stops asking for tools (or
//! the run is cancelled, errors fatally, or hits the turn limit). Queued
//! user messages are injected at turn starts and may preempt remaining
//! tool calls mid-turn.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use pi_inference::ModelClient;
use pi_inference::StreamAccumulator;
use pi_inference::StreamEvent;
use pi_inference::StreamRequest;
use pi_protocol::AgentEvent;
use pi_protocol::AssistantMessage;
use pi_protocol::CompactConfig;
use pi_protocol::CompactTrigger;
use pi_protocol::LoopConfig;
use pi_protocol::Message;
use pi_protocol::RetryConfig;
use pi_protocol::StopReason;
use pi_protocol::ToolProgress;
use pi_protocol::Usage;
use pi_tools_api::ToolOutput;
use pi_tools_api::ToolRegistry;
use pi_tools_api::validate_tool_arguments;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::AgentEventSender;
use crate::compaction;
use crate::compaction::CompactionOutcome;
use crate::compaction::is_context_overflow;
use crate::queue::MessageQueue;
use crate::result::LoopResult;
use crate::result::LoopStopReason;
use crate::retry;
use crate::retry::CredentialCycler;
use crate::store::SessionStore;
use crate::store::TrackedMessage;

/// Name of the edit tool the streaming preview watches for.
pub const EDIT_TOOL_NAME: &str = "edit";

const SKIPPED_TOOL_TEXT: &str = "Skipped due to queued user message.";

/// A visibly-wrong edit detected while its tool call was still streaming.
struct EditAbort {
    call_id: String,
    reason: String,
}

enum DispatchEnd {
    Finished,
    Cancelled,
}

/// The agent loop. Owns the in-memory conversation and drives one run at
/// a time; persistence goes through [`SessionStore`].
pub struct AgentLoop {
    model: Arc<dyn ModelClient>,
    compact_model: Option<Arc<dyn ModelClient>>,
    extra_models: Vec<Arc<dyn ModelClient>>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn SessionStore>,
    system_prompt: String,
    workspace_root: PathBuf,
    config: LoopConfig,
    compact_config: CompactConfig,
    retry_config: RetryConfig,
    credential_cycler: Option<Arc<dyn CredentialCycler>>,
    queue: MessageQueue,
    cancel_token: CancellationToken,

    messages: Vec<TrackedMessage>,
    turn_number: i32,
    last_compaction_ms: Option<i64>,
}

/// Builder for constructing an [`AgentLoop`].
pub struct AgentLoopBuilder {
    model: Option<Arc<dyn ModelClient>>,
    compact_model: Option<Arc<dyn ModelClient>>,
    extra_models: Vec<Arc<dyn ModelClient>>,
    tools: Option<Arc<ToolRegistry>>,
    store: Option<Arc<dyn SessionStore>>,
    system_prompt: String,
    workspace_root: PathBuf,
    config: LoopConfig,
    compact_config: CompactConfig,
    retry_config: RetryConfig,
    credential_cycler: Option<Arc<dyn CredentialCycler>>,
    queue: MessageQueue,
    cancel_token: CancellationToken,
}

impl AgentLoopBuilder {
    pub fn new() -> Self {
        Self {
            model: None,
            compact_model: None,
            extra_models: Vec::new(),
            tools: None,
            store: None,
            system_prompt: String::new(),
            workspace_root: PathBuf::from("."),
            config: LoopConfig::default(),
            compact_config: CompactConfig::default(),
            retry_config: RetryConfig::default(),
            credential_cycler: None,
            queue: MessageQueue::new(),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    /// Model preferred for compaction summaries.
    pub fn compact_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.compact_model = Some(model);
        self
    }

    /// Additional models usable as compaction fallbacks.
    pub fn extra_models(mut self, models: Vec<Arc<dyn ModelClient>>) -> Self {
        self.extra_models = models;
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
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

    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
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

    pub fn queue(mut self, queue: MessageQueue) -> Self {
        self.queue = queue;
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    /// Build the [`AgentLoop`].
    ///
    /// # Panics
    /// Panics if `model`, `tools`, or `store` have not been set.
    #[allow(clippy::expect_used)]
    pub fn build(self) -> AgentLoop {
        AgentLoop {
            model: self.model.expect("model is required"),
            compact_model: self.compact_model,
            extra_models: self.extra_models,
            tools: self.tools.expect("tools is required"),
            store: self.store.expect("store is required"),
            system_prompt: self.system_prompt,
            workspace_root: self.workspace_root,
            config: self.config,
            compact_config: self.compact_config,
            retry_config: self.retry_config,
            credential_cycler: self.credential_cycler,
            queue: self.queue,
            cancel_token: self.cancel_token,
            messages: Vec::new(),
            turn_number: 0,
            last_compaction_ms: None,
        }
    }
}

impl Default for AgentLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentLoop {
    pub fn builder() -> AgentLoopBuilder {
        AgentLoopBuilder::new()
    }

    /// Replace the in-memory conversation (used when loading a journal).
    pub fn set_messages(&mut self, messages: Vec<TrackedMessage>) {
        self.messages = messages;
    }

    pub fn messages(&self) -> &[TrackedMessage] {
        &self.messages
    }

    /// Model-visible projection of the conversation.
    pub fn context_messages(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|t| t.message.in_context())
            .map(|t| t.message.clone())
            .collect()
    }

    /// Shared handle to the steer/follow-up queue.
    pub fn queue(&self) -> MessageQueue {
        self.queue.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Install a fresh cancel token for the next run.
    pub fn reset_cancel_token(&mut self, token: CancellationToken) {
        self.cancel_token = token;
    }

    /// Switch the driving model.
    pub fn set_model(&mut self, model: Arc<dyn ModelClient>) {
        self.model = model;
    }

    pub fn model(&self) -> &Arc<dyn ModelClient> {
        &self.model
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn turn_number(&self) -> i32 {
        self.turn_number
    }

    /// Rough token estimate of the current context.
    pub fn estimate_tokens(&self) -> i64 {
        compaction::estimate_tokens(&self.messages)
    }

    /// Run to completion, optionally starting with a new user message.
    ///
    /// `run(None, ..)` continues from the current context without a new
    /// prompt (used by overflow recovery and external retry harnesses).
    pub async fn run(
        &mut self,
        prompt: Option<Message>,
        events: &AgentEventSender,
    ) -> anyhow::Result<LoopResult> {
        events.push(AgentEvent::AgentStart);
        info!(turn_number = self.turn_number, "agent run started");

        let mut run_messages: Vec<Message> = Vec::new();
        let mut usage = Usage::default();
        let mut turns_this_run = 0i32;
        let mut retry_attempt = 0i32;
        let mut prelude = prompt;

        let stop_reason = loop {
            if self.cancel_token.is_cancelled() {
                break LoopStopReason::Aborted;
            }

            // ---- Turn start ----
            self.turn_number += 1;
            turns_this_run += 1;
            let turn_id = uuid::Uuid::new_v4().to_string();
            events.push(AgentEvent::TurnStart {
                turn_id: turn_id.clone(),
                turn_number: self.turn_number,
            });

            if let Some(message) = prelude.take() {
                self.record(message, &mut run_messages, events)?;
            }
            for queued in self.queue.drain(self.config.queue_mode) {
                events.push(AgentEvent::MessageDequeued {
                    id: queued.id.clone(),
                });
                self.record(queued.message, &mut run_messages, events)?;
            }

            self.maybe_threshold_compact(&mut run_messages, events)
                .await?;

            // ---- Streaming ----
            let (assistant, edit_abort) = self.stream_turn(events).await;
            add_usage(&mut usage, &assistant.usage);
            let turn_usage = assistant.usage.clone();
            let error_text = assistant.error_message.clone().unwrap_or_default();

            match assistant.stop_reason {
                StopReason::Aborted => {
                    self.finalize_assistant(assistant, &mut run_messages, events)?;
                    break LoopStopReason::Aborted;
                }
                StopReason::Error if self.overflow_applies(&assistant, &error_text) => {
                    // The error message is dropped from the in-memory view;
                    // compaction reclaims space and the run continues.
                    events.push(AgentEvent::MessageEnd {
                        message: Message::Assistant(assistant),
                    });
                    warn!(error = %error_text, "context overflow; compacting and continuing");
                    let outcome = self
                        .run_compaction(CompactTrigger::Overflow, None, events)
                        .await?;
                    events.push(AgentEvent::TurnEnd {
                        turn_id,
                        usage: turn_usage,
                    });
                    if !outcome.compacted {
                        // Nothing left to reclaim; retrying would overflow
                        // again immediately.
                        break LoopStopReason::Error {
                            message: error_text,
                        };
                    }
                    continue;
                }
                StopReason::Error if retry::is_retryable(&error_text) => {
                    // Kept in the journal for history, stripped from memory.
                    self.persist_without_tracking(&assistant, events)?;
                    events.push(AgentEvent::TurnEnd {
                        turn_id,
                        usage: turn_usage,
                    });

                    retry_attempt += 1;
                    if retry_attempt > self.retry_config.max_retries {
                        events.push(AgentEvent::AutoRetryEnd { success: false });
                        break LoopStopReason::Error {
                            message: error_text,
                        };
                    }
                    let mut delay_ms =
                        retry::compute_delay(&self.retry_config, retry_attempt, &error_text);
                    if retry::is_usage_limit(&error_text) {
                        if let Some(cycler) = &self.credential_cycler {
                            if cycler.try_rotate() {
                                delay_ms = 0;
                            }
                        }
                    }
                    events.push(AgentEvent::AutoRetryStart {
                        attempt: retry_attempt,
                        max_attempts: self.retry_config.max_retries,
                        delay_ms,
                        error: error_text.clone(),
                    });
                    warn!(attempt = retry_attempt, delay_ms, error = %error_text, "transient error; retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms as u64)) => {}
                        _ = self.cancel_token.cancelled() => break LoopStopReason::Aborted,
                    }
                    continue;
                }
                StopReason::Error => {
                    self.finalize_assistant(assistant, &mut run_messages, events)?;
                    events.push(AgentEvent::TurnEnd {
                        turn_id,
                        usage: turn_usage,
                    });
                    break LoopStopReason::Error {
                        message: error_text,
                    };
                }
                StopReason::ToolUse => {
                    if retry_attempt > 0 {
                        events.push(AgentEvent::AutoRetryEnd { success: true });
                        retry_attempt = 0;
                    }
                    let assistant =
                        self.finalize_assistant(assistant, &mut run_messages, events)?;
                    let end = self
                        .dispatch_tools(&assistant, edit_abort, &mut run_messages, events)
                        .await?;
                    events.push(AgentEvent::TurnEnd {
                        turn_id,
                        usage: turn_usage,
                    });
                    if matches!(end, DispatchEnd::Cancelled) {
                        break LoopStopReason::Aborted;
                    }
                    if let Some(max) = self.config.max_turns {
                        if turns_this_run >= max {
                            break LoopStopReason::MaxTurnsReached;
                        }
                    }
                    continue;
                }
                StopReason::End | StopReason::MaxTokens => {
                    if retry_attempt > 0 {
                        events.push(AgentEvent::AutoRetryEnd { success: true });
                        retry_attempt = 0;
                    }
                    self.finalize_assistant(assistant, &mut run_messages, events)?;
                    events.push(AgentEvent::TurnEnd {
                        turn_id,
                        usage: turn_usage,
                    });
                    // A queued follow-up forces one more turn.
                    if !self.queue.is_empty() {
                        continue;
                    }
                    break LoopStopReason::Completed;
                }
            }
        };

        info!(?stop_reason, turns = turns_this_run, "agent run finished");
        events.finish(
            AgentEvent::AgentEnd {
                messages: run_messages.clone(),
            },
            run_messages.clone(),
        );
        Ok(LoopResult {
            stop_reason,
            messages: run_messages,
            turns: turns_this_run,
            usage,
        })
    }

    /// Manually trigger a compaction (facade `compact()`).
    pub async fn compact_now(
        &mut self,
        instructions: Option<&str>,
        events: &AgentEventSender,
    ) -> anyhow::Result<CompactionOutcome> {
        self.run_compaction(CompactTrigger::Manual, instructions, events)
            .await
    }

    // ------------------------------------------------------------------
    // Turn internals
    // ------------------------------------------------------------------

    /// Stream one assistant message, forwarding snapshots and watching
    /// edit-tool calls for visibly-wrong patches.
    async fn stream_turn(
        &mut self,
        events: &AgentEventSender,
    ) -> (AssistantMessage, Option<EditAbort>) {
        let info = self.model.info();
        let request = StreamRequest {
            system_prompt: self.system_prompt.clone(),
            messages: self.context_messages(),
            tools: self.tools.descriptors(),
        };
        let stream_cancel = self.cancel_token.child_token();
        let mut acc = StreamAccumulator::new(info.id.clone(), info.provider.clone());
        events.push(AgentEvent::MessageStart {
            message: Message::Assistant(acc.snapshot().clone()),
        });

        let mut stream = match self.model.stream(request, stream_cancel.clone()).await {
            Ok(stream) => stream,
            Err(error) => {
                let mut message = acc.into_message();
                message.stop_reason = StopReason::Error;
                message.error_message = Some(error.message);
                return (message, None);
            }
        };

        let mut edit_abort: Option<EditAbort> = None;
        // Per tool-call block: cached target file content (None = unreadable).
        let mut edit_cache: HashMap<usize, Option<String>> = HashMap::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => {
                    stream_cancel.cancel();
                    break;
                }
                next = stream.next() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            if acc.apply(&event) {
                events.push(AgentEvent::MessageUpdate {
                    message: Message::Assistant(acc.snapshot().clone()),
                });
            }

            if edit_abort.is_none() {
                if let StreamEvent::ToolCallDelta { index, .. } = &event {
                    if let Some(abort) = self.check_streaming_edit(&acc, *index, &mut edit_cache) {
                        stream_cancel.cancel();
                        edit_abort = Some(abort);
                        break;
                    }
                }
            }
        }

        let mut message = acc.into_message();
        if self.cancel_token.is_cancelled() {
            message.stop_reason = StopReason::Aborted;
        } else if edit_abort.is_some() {
            // Force dispatch so the aborted call yields an error result the
            // model can react to.
            message.stop_reason = StopReason::ToolUse;
        }
        (message, edit_abort)
    }

    /// Preview a still-streaming edit call against cached file content.
    fn check_streaming_edit(
        &self,
        acc: &StreamAccumulator,
        index: usize,
        edit_cache: &mut HashMap<usize, Option<String>>,
    ) -> Option<EditAbort> {
        // Only the hashline edit variant streams checkable diffs.
        if !matches!(
            self.config.edit_variant,
            pi_protocol::EditVariant::Hashline | pi_protocol::EditVariant::Auto
        ) {
            return None;
        }
        if acc.tool_name(index) != Some(EDIT_TOOL_NAME) {
            return None;
        }
        let args = acc.partial_tool_arguments(index)?;
        let path = partial_string_field(args, "path")?;
        let cached = edit_cache
            .entry(index)
            .or_insert_with(|| std::fs::read_to_string(self.workspace_root.join(&path)).ok());
        let content = cached.as_ref()?;
        let diff = partial_string_field(args, "diff")?;
        if !pi_hashline::has_change_lines(&diff) {
            return None;
        }
        match pi_hashline::check_partial(content, &diff) {
            pi_hashline::PartialCheck::Ok => None,
            pi_hashline::PartialCheck::LineNotFound { body } => {
                let call_id = match acc.snapshot().content.get(index) {
                    Some(pi_protocol::AssistantBlock::ToolCall { id, .. }) => id.clone(),
                    _ => return None,
                };
                debug!(%call_id, %path, "aborting stream: edit removes a line the file does not have");
                Some(EditAbort {
                    call_id,
                    reason: format!("the diff removes {body:?}, which is not present in {path}"),
                })
            }
        }
    }

    /// Dispatch every tool call of an assistant message, in textual order.
    async fn dispatch_tools(
        &mut self,
        assistant: &AssistantMessage,
        edit_abort: Option<EditAbort>,
        run_messages: &mut Vec<Message>,
        events: &AgentEventSender,
    ) -> anyhow::Result<DispatchEnd> {
        let calls: Vec<(String, String, Value)> = assistant
            .tool_calls()
            .into_iter()
            .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
            .collect();

        let mut skip_remaining = false;
        for (i, (call_id, name, arguments)) in calls.iter().enumerate() {
            if self.cancel_token.is_cancelled() {
                return Ok(DispatchEnd::Cancelled);
            }
            // A steer that arrived while the previous tool ran preempts the
            // rest of this message; the queue drains at the next turn start.
            if i > 0 && !skip_remaining && self.queue.has_steer() {
                debug!(skipped_from = i, "steer queued; skipping remaining tool calls");
                skip_remaining = true;
            }

            events.push(AgentEvent::ToolExecutionStart {
                call_id: call_id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            });

            let output = if skip_remaining {
                ToolOutput::error(SKIPPED_TOOL_TEXT)
            } else if let Some(abort) = edit_abort.as_ref().filter(|a| a.call_id == *call_id) {
                ToolOutput::error(format!("Edit aborted during streaming: {}", abort.reason))
            } else {
                self.invoke_tool(call_id, name, arguments.clone(), events)
                    .await
            };

            let result = Message::ToolResult {
                tool_call_id: call_id.clone(),
                tool_name: name.clone(),
                content: output.content,
                is_error: output.is_error,
                details: output.details,
                timestamp: chrono::Utc::now().timestamp_millis(),
            };
            events.push(AgentEvent::ToolExecutionEnd {
                call_id: call_id.clone(),
                result: result.clone(),
                is_error: output.is_error,
            });
            self.record(result, run_messages, events)?;
        }
        Ok(DispatchEnd::Finished)
    }

    /// Look up, validate, and execute one tool call. Every failure mode
    /// collapses into an error output; nothing escapes the turn.
    async fn invoke_tool(
        &self,
        call_id: &str,
        name: &str,
        arguments: Value,
        events: &AgentEventSender,
    ) -> ToolOutput {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutput::error(format!("Tool not found: {name}"));
        };
        if let Err(error) = validate_tool_arguments(&tool.parameters_schema(), &arguments) {
            return ToolOutput::error(error.to_string());
        }
        let progress_events = events.clone();
        let progress_call_id = call_id.to_string();
        let on_progress = move |progress: ToolProgress| {
            progress_events.push(AgentEvent::ToolExecutionUpdate {
                call_id: progress_call_id.clone(),
                progress,
            });
        };
        match tool
            .execute(
                call_id,
                arguments,
                self.cancel_token.child_token(),
                &on_progress,
            )
            .await
        {
            Ok(output) => output,
            Err(error) => ToolOutput::error(error.message),
        }
    }

    // ------------------------------------------------------------------
    // Context & persistence helpers
    // ------------------------------------------------------------------

    /// Persist a message, track it in memory, and emit its start/end pair.
    fn record(
        &mut self,
        message: Message,
        run_messages: &mut Vec<Message>,
        events: &AgentEventSender,
    ) -> anyhow::Result<()> {
        let entry_id = self.store.append_message(&message)?;
        events.push(AgentEvent::MessageStart {
            message: message.clone(),
        });
        events.push(AgentEvent::MessageEnd {
            message: message.clone(),
        });
        self.messages
            .push(TrackedMessage::new(entry_id, message.clone()));
        run_messages.push(message);
        Ok(())
    }

    /// Persist and track a finished assistant message; `MessageStart` was
    /// already emitted when streaming began.
    fn finalize_assistant(
        &mut self,
        assistant: AssistantMessage,
        run_messages: &mut Vec<Message>,
        events: &AgentEventSender,
    ) -> anyhow::Result<AssistantMessage> {
        let message = Message::Assistant(assistant.clone());
        let entry_id = self.store.append_message(&message)?;
        events.push(AgentEvent::MessageEnd {
            message: message.clone(),
        });
        self.messages
            .push(TrackedMessage::new(entry_id, message.clone()));
        run_messages.push(message);
        Ok(assistant)
    }

    /// Journal an assistant message without keeping it in the in-memory
    /// view (retryable errors stay on disk for history only).
    fn persist_without_tracking(
        &self,
        assistant: &AssistantMessage,
        events: &AgentEventSender,
    ) -> anyhow::Result<()> {
        let message = Message::Assistant(assistant.clone());
        self.store.append_message(&message)?;
        events.push(AgentEvent::MessageEnd { message });
        Ok(())
    }

    /// Overflow recovery applies unless the user switched models since the
    /// failing call, or the branch was already compacted after it.
    fn overflow_applies(&self, assistant: &AssistantMessage, error_text: &str) -> bool {
        if !is_context_overflow(error_text) {
            return false;
        }
        if assistant.model_id != self.model.info().id {
            debug!("suppressing overflow recovery: model changed since the error");
            return false;
        }
        if let Some(compacted_at) = self.last_compaction_ms {
            if assistant.timestamp < compacted_at {
                debug!("suppressing overflow recovery: branch already compacted");
                return false;
            }
        }
        true
    }

    async fn maybe_threshold_compact(
        &mut self,
        run_messages: &mut Vec<Message>,
        events: &AgentEventSender,
    ) -> anyhow::Result<()> {
        let context_window = self.model.info().context_window;
        let estimated = self.estimate_tokens();
        if estimated >= self.compact_config.threshold_tokens(context_window) {
            let outcome = self
                .run_compaction(CompactTrigger::Threshold, None, events)
                .await?;
            if outcome.compacted && self.compact_config.inject_continuation {
                self.record(
                    Message::synthetic_user("Continue if you have next steps."),
                    run_messages,
                    events,
                )?;
            }
        } else if estimated >= self.compact_config.warning_tokens(context_window) {
            events.push(AgentEvent::ContextUsageWarning {
                estimated_tokens: estimated,
                context_window,
                percent_left: 1.0 - estimated as f64 / context_window as f64,
            });
        }
        Ok(())
    }

    async fn run_compaction(
        &mut self,
        trigger: CompactTrigger,
        instructions: Option<&str>,
        events: &AgentEventSender,
    ) -> anyhow::Result<CompactionOutcome> {
        let mut candidates: Vec<Arc<dyn ModelClient>> = Vec::new();
        if let Some(model) = &self.compact_model {
            candidates.push(model.clone());
        }
        candidates.push(self.model.clone());
        let mut extras = self.extra_models.clone();
        extras.sort_by_key(|m| std::cmp::Reverse(m.info().context_window));
        candidates.extend(extras);

        let outcome = compaction::compact(
            &mut self.messages,
            self.store.as_ref(),
            &candidates,
            &self.compact_config,
            &self.retry_config,
            &self.cancel_token,
            events,
            trigger,
            instructions,
        )
        .await?;
        if outcome.compacted {
            self.last_compaction_ms = Some(chrono::Utc::now().timestamp_millis());
        }
        Ok(outcome)
    }
}

fn add_usage(total: &mut Usage, delta: &Usage) {
    total.input_tokens += delta.input_tokens;
    total.output_tokens += delta.output_tokens;
    total.cache_read_tokens += delta.cache_read_tokens;
    total.cache_write_tokens += delta.cache_write_tokens;
    total.cost += delta.cost;
}

/// Extract a string field's decoded value from partial JSON object text,
/// tolerating an unterminated value (the tail of a still-streaming string).
fn partial_string_field(partial_json: &str, field: &str) -> Option<String> {
    let key = format!("\"{field}\"");
    let after_key = &partial_json[partial_json.find(&key)? + key.len()..];
    let after_colon = after_key.trim_start().strip_prefix(':')?;
    let raw = after_colon.trim_start().strip_prefix('"')?;

    let mut out = String::new();
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Some(out),
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some('/') => out.push('/'),
                Some('u') => {
                    let hex: String = chars.by_ref().take(4).collect();
                    if hex.len() < 4 {
                        break;
                    }
                    if let Some(ch) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                        out.push(ch);
                    }
                }
                Some(other) => out.push(other),
                // Escape split across deltas: drop the fragment.
                None => break,
            },
            other => out.push(other),
        }
    }
    Some(out)
}

#[cfg(test)]
#[path = "driver.test.rs"]
mod tests;
