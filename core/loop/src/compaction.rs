//! Context compaction: summarize an old branch prefix when usage grows.
//!
//! A compaction keeps a trailing window of turns verbatim (never splitting
//! an assistant message away from its tool results), summarizes everything
//! older through an LLM, and splices the result: the journal gains a
//! compaction entry and the in-memory list is rebuilt with a synthesized
//! user message carrying the summary.

use std::sync::Arc;
use std::sync::LazyLock;

use pi_inference::ModelClient;
use pi_inference::StreamRequest;
use pi_protocol::AgentEvent;
use pi_protocol::AssistantMessage;
use pi_protocol::CompactTrigger;
use pi_protocol::CompactConfig;
use pi_protocol::Message;
use pi_protocol::RetryConfig;
use pi_protocol::StopReason;
use regex::Regex;
use regex::RegexBuilder;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::AgentEventSender;
use crate::retry;
use crate::store::CompactionRecord;
use crate::store::SessionStore;
use crate::store::TrackedMessage;

/// Backoff delays beyond this switch to another candidate model instead of
/// waiting.
const CANDIDATE_SWITCH_DELAY_MS: i64 = 30_000;

/// Marker left in place of a pruned tool result.
pub(crate) const PRUNED_MARKER: &str = "[old tool result dropped to reclaim context]";

#[allow(clippy::expect_used)]
fn ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("static overflow pattern")
}

static OVERFLOW: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        ci(r"context[_ -](length|window)"),
        ci(r"context_length_exceeded"),
        ci(r"prompt is too long"),
        ci(r"input is too long"),
        ci(r"maximum context"),
        ci(r"too many tokens"),
        ci(r"exceeds? .{0,24}context"),
    ]
});

/// Whether an error message is the host LLM's context-overflow signal.
pub fn is_context_overflow(error: &str) -> bool {
    OVERFLOW.iter().any(|re| re.is_match(error))
}

/// Split an optional trailing `Short summary:` line off a summarization
/// response.
pub fn split_short_summary(text: &str) -> (String, Option<String>) {
    let trimmed = text.trim_end();
    if let Some(pos) = trimmed.rfind('\n') {
        let last = trimmed[pos + 1..].trim();
        if let Some(short) = strip_short_prefix(last) {
            return (trimmed[..pos].trim_end().to_string(), Some(short));
        }
    } else if let Some(short) = strip_short_prefix(trimmed) {
        return (String::new(), Some(short));
    }
    (trimmed.to_string(), None)
}

fn strip_short_prefix(line: &str) -> Option<String> {
    let lower = line.to_ascii_lowercase();
    lower
        .starts_with("short summary:")
        .then(|| line[14..].trim().to_string())
        .filter(|s| !s.is_empty())
}

/// What a compaction attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionOutcome {
    pub compacted: bool,
    pub tokens_before: i64,
    pub tokens_after: i64,
}

/// Rough context estimate over the in-memory list.
pub(crate) fn estimate_tokens(messages: &[TrackedMessage]) -> i64 {
    messages
        .iter()
        .filter(|t| t.message.in_context())
        .map(|t| t.message.estimate_tokens())
        .sum()
}

/// Index where the kept trailing window starts.
///
/// Walks back `keep_recent_turns` assistant messages, then extends the
/// window so it never starts on a tool result (which would orphan it from
/// its assistant message). Returns `None` when nothing precedes the
/// window.
pub(crate) fn partition_point(
    messages: &[TrackedMessage],
    keep_recent_turns: usize,
) -> Option<usize> {
    let mut assistants_seen = 0usize;
    let mut split = 0usize;
    for (i, tracked) in messages.iter().enumerate().rev() {
        if tracked.message.as_assistant().is_some() {
            assistants_seen += 1;
            if assistants_seen >= keep_recent_turns {
                split = i;
                break;
            }
        }
    }
    if assistants_seen < keep_recent_turns {
        // Fewer turns than the window: keep everything.
        return None;
    }
    // Never let the window open on a tool result.
    while split > 0 && matches!(messages[split].message, Message::ToolResult { .. }) {
        split -= 1;
    }
    // The first kept message must be a real journal entry to anchor
    // `first_kept_entry_id`.
    while split > 0 && messages[split].entry_id.is_none() {
        split -= 1;
    }
    (split > 0).then_some(split)
}

/// Truncate oversize tool results older than the retention horizon.
///
/// Returns the estimated tokens reclaimed. Journal entries are untouched;
/// only the in-memory view shrinks.
pub(crate) fn prune_old_tool_results(
    messages: &mut [TrackedMessage],
    config: &CompactConfig,
) -> i64 {
    // With fewer turns than the retention window, everything is protected.
    let protected_from = partition_point(messages, config.prune_retention_turns).unwrap_or(0);
    let mut saved: i64 = 0;
    for tracked in &mut messages[..protected_from] {
        let Message::ToolResult { content, .. } = &mut tracked.message else {
            continue;
        };
        let size: usize = content
            .iter()
            .filter_map(|b| b.as_text())
            .map(str::len)
            .sum();
        if size <= config.prune_max_tool_result_chars {
            continue;
        }
        saved += (size / 4) as i64;
        *content = vec![pi_protocol::ToolResultBlock::text(PRUNED_MARKER)];
    }
    if saved > 0 {
        debug!(tokens_saved = saved, "pruned old tool results");
    }
    saved
}

const COMPACT_SYSTEM_PROMPT: &str = "You summarize agent conversations so they can continue in a \
fresh context. Capture: the user's goals, decisions made, files touched \
with their relevant state, commands run, unresolved problems, and the \
agreed next steps. Be specific; prefer file paths and identifiers over \
prose. End with one line formatted exactly as `Short summary: <one \
sentence>`.";

/// Run a compaction over the current in-memory list.
///
/// `candidates` are tried in order: the role-specific compaction model
/// first if configured, then the main model, then any other model by
/// descending context window. Returns without compacting when pruning
/// alone reclaims enough, or when the prefix is too small to be worth an
/// LLM call.
#[allow(clippy::too_many_arguments)]
pub async fn compact(
    messages: &mut Vec<TrackedMessage>,
    store: &dyn SessionStore,
    candidates: &[Arc<dyn ModelClient>],
    config: &CompactConfig,
    retry_config: &RetryConfig,
    cancel: &CancellationToken,
    events: &AgentEventSender,
    trigger: CompactTrigger,
    custom_instructions: Option<&str>,
) -> anyhow::Result<CompactionOutcome> {
    let tokens_before = estimate_tokens(messages);
    events.push(AgentEvent::CompactionStart { trigger });

    let done = |tokens_after: i64, compacted: bool| {
        events.push(AgentEvent::CompactionEnd {
            trigger,
            tokens_before,
            tokens_after,
        });
        CompactionOutcome {
            compacted,
            tokens_before,
            tokens_after,
        }
    };

    let Some(primary) = candidates.first() else {
        anyhow::bail!("no model available for compaction");
    };

    // Pruning may reclaim enough on its own for a threshold-triggered
    // compaction.
    prune_old_tool_results(messages, config);
    let after_prune = estimate_tokens(messages);
    if trigger == CompactTrigger::Threshold
        && after_prune < config.threshold_tokens(primary.info().context_window)
    {
        info!(tokens_before, after_prune, "pruning sufficed; skipping summarization");
        return Ok(done(after_prune, false));
    }

    let Some(split) = partition_point(messages, config.keep_recent_turns) else {
        return Ok(done(after_prune, false));
    };
    let to_summarize = &messages[..split];
    let prefix_tokens = estimate_tokens(to_summarize);
    if prefix_tokens < config.min_tokens_to_summarize {
        debug!(prefix_tokens, "prefix below minimum; skipping compaction");
        return Ok(done(after_prune, false));
    }

    let first_kept_entry_id = messages[split]
        .entry_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("kept window is not anchored to a journal entry"))?;

    let transcript = render_transcript(to_summarize);
    let mut system_prompt = COMPACT_SYSTEM_PROMPT.to_string();
    if let Some(instructions) = custom_instructions {
        system_prompt.push_str("\n\nAdditional instructions:\n");
        system_prompt.push_str(instructions);
    }

    let response =
        summarize_with_retry(candidates, &system_prompt, &transcript, config, retry_config, cancel)
            .await?;
    let (summary, short_summary) = split_short_summary(&response.text());

    let entry_id = store.append_compaction(&CompactionRecord {
        summary: summary.clone(),
        short_summary,
        first_kept_entry_id,
        tokens_before,
        details: Value::Null,
    })?;

    splice(messages, split, &entry_id, &summary);
    let tokens_after = estimate_tokens(messages);
    info!(tokens_before, tokens_after, "compaction complete");
    Ok(done(tokens_after, true))
}

/// The synthesized user message a compaction summary is presented as.
pub fn summary_message(summary: &str) -> Message {
    Message::synthetic_user(format!("Summary of the conversation so far:\n\n{summary}"))
}

/// Rebuild the in-memory list after a compaction entry was appended:
/// everything before `split` collapses into one synthesized user message.
pub(crate) fn splice(
    messages: &mut Vec<TrackedMessage>,
    split: usize,
    compaction_entry_id: &str,
    summary: &str,
) {
    let kept = messages.split_off(split);
    messages.clear();
    messages.push(TrackedMessage::new(
        compaction_entry_id,
        summary_message(summary),
    ));
    messages.extend(kept);
}

async fn summarize_with_retry(
    candidates: &[Arc<dyn ModelClient>],
    system_prompt: &str,
    transcript: &str,
    config: &CompactConfig,
    retry_config: &RetryConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<AssistantMessage> {
    let mut candidate_index = 0usize;
    let mut attempt = 0i32;
    loop {
        attempt += 1;
        let model = &candidates[candidate_index];
        let request = StreamRequest {
            system_prompt: system_prompt.to_string(),
            messages: vec![Message::user(transcript)],
            tools: Vec::new(),
        };
        let error = match collect_response(model.as_ref(), request, cancel).await {
            Ok(message) => return Ok(message),
            Err(error) => error,
        };
        if cancel.is_cancelled() {
            anyhow::bail!("compaction cancelled");
        }
        if attempt > config.max_retries || !retry::is_retryable(&error) {
            anyhow::bail!("compaction failed after {attempt} attempts: {error}");
        }
        let mut delay_ms = retry::compute_delay(retry_config, attempt, &error);
        if delay_ms > CANDIDATE_SWITCH_DELAY_MS && candidate_index + 1 < candidates.len() {
            candidate_index += 1;
            warn!(
                model = %candidates[candidate_index].info().id,
                "long backoff requested; switching compaction model"
            );
            delay_ms = 0;
        }
        warn!(attempt, delay_ms, error = %error, "compaction attempt failed; retrying");
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms as u64)) => {}
            _ = cancel.cancelled() => anyhow::bail!("compaction cancelled"),
        }
    }
}

async fn collect_response(
    model: &dyn ModelClient,
    request: StreamRequest,
    cancel: &CancellationToken,
) -> Result<AssistantMessage, String> {
    let stream = model
        .stream(request, cancel.child_token())
        .await
        .map_err(|e| e.message)?;
    match stream.result().await {
        Some(message) if message.stop_reason == StopReason::Error => {
            Err(message.error_message.unwrap_or_else(|| "unknown stream error".to_string()))
        }
        Some(message) if message.text().trim().is_empty() => {
            Err("empty summary produced".to_string())
        }
        Some(message) => Ok(message),
        None => Err("stream ended without a result".to_string()),
    }
}

/// Plain-text rendering of the prefix for the summarization prompt.
fn render_transcript(messages: &[TrackedMessage]) -> String {
    let mut out = String::new();
    for tracked in messages {
        match &tracked.message {
            Message::User {
                content, synthetic, ..
            } => {
                let tag = if *synthetic { "User (system)" } else { "User" };
                let text: String = content.iter().filter_map(|b| b.as_text()).collect();
                out.push_str(&format!("{tag}: {text}\n"));
            }
            Message::Assistant(a) => {
                out.push_str(&format!("Assistant: {}\n", a.text()));
                for (id, name, args) in a.tool_calls() {
                    out.push_str(&format!("Assistant called {name} [{id}]: {args}\n"));
                }
            }
            Message::ToolResult {
                tool_name, content, ..
            } => {
                let text: String = content.iter().filter_map(|b| b.as_text()).collect();
                out.push_str(&format!("Result of {tool_name}: {text}\n"));
            }
            Message::BashExecution {
                command, output, ..
            } => out.push_str(&format!("$ {command}\n{output}\n")),
            Message::PythonExecution { code, output, .. } => {
                out.push_str(&format!(">>> {code}\n{output}\n"));
            }
            Message::FileMention { files, .. } => {
                for file in files {
                    out.push_str(&format!("Mentioned file {}\n", file.path));
                }
            }
            Message::CompactionSummary { summary, .. }
            | Message::BranchSummary { summary, .. } => {
                out.push_str(&format!("Earlier summary: {summary}\n"));
            }
            Message::Custom { content, .. } => {
                let text: String = content.iter().filter_map(|b| b.as_text()).collect();
                out.push_str(&format!("Note: {text}\n"));
            }
        }
    }
    out
}

#[cfg(test)]
#[path = "compaction.test.rs"]
mod tests;
