use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use pi_inference::ModelClient;
use pi_inference::ModelInfo;
use pi_inference::StreamError;
use pi_inference::StreamRequest;
use pi_inference::channel;
use pi_protocol::AgentEvent;
use pi_protocol::AssistantBlock;
use pi_protocol::AssistantMessage;
use pi_protocol::StopReason;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::store::MemoryStore;

/// Model that answers each call with the next scripted outcome.
struct ScriptedModel {
    info: ModelInfo,
    script: Mutex<Vec<Result<String, String>>>,
}

impl ScriptedModel {
    fn new(outcomes: Vec<Result<String, String>>) -> Arc<Self> {
        Arc::new(Self {
            info: ModelInfo {
                id: "mock-model".into(),
                provider: "mock".into(),
                context_window: 200_000,
            },
            script: Mutex::new(outcomes),
        })
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn info(&self) -> ModelInfo {
        self.info.clone()
    }

    async fn stream(
        &self,
        _request: StreamRequest,
        _cancel: CancellationToken,
    ) -> Result<pi_inference::AssistantStream, StreamError> {
        let outcome = self.script.lock().unwrap().remove(0);
        let (tx, rx) = channel();
        let mut message = AssistantMessage::empty("mock-model", "mock");
        match outcome {
            Ok(text) => {
                message.content.push(AssistantBlock::text(text));
                tx.finish(
                    pi_inference::StreamEvent::Done {
                        stop_reason: StopReason::End,
                        usage: Default::default(),
                    },
                    message,
                );
            }
            Err(error) => {
                message.stop_reason = StopReason::Error;
                message.error_message = Some(error.clone());
                tx.finish(pi_inference::StreamEvent::Error { message: error }, message);
            }
        }
        Ok(rx)
    }
}

fn user(text: &str, id: &str) -> TrackedMessage {
    TrackedMessage::new(id, pi_protocol::Message::user(text))
}

fn assistant(text: &str, id: &str) -> TrackedMessage {
    let mut message = AssistantMessage::empty("mock-model", "mock");
    message.content.push(AssistantBlock::text(text));
    TrackedMessage::new(id, pi_protocol::Message::Assistant(message))
}

fn tool_result(call_id: &str, text: &str, id: &str) -> TrackedMessage {
    TrackedMessage::new(
        id,
        pi_protocol::Message::tool_result(call_id, "read", text, false),
    )
}

/// A long conversation: `pairs` user/assistant turns, ~40 tokens each.
fn long_history(pairs: usize) -> Vec<TrackedMessage> {
    let mut messages = Vec::new();
    for i in 0..pairs {
        messages.push(user(&format!("question {i} {}", "x".repeat(160)), &format!("u{i}")));
        messages.push(assistant(
            &format!("answer {i} {}", "y".repeat(160)),
            &format!("a{i}"),
        ));
    }
    messages
}

#[test]
fn overflow_detection() {
    for error in [
        "prompt is too long: 250000 tokens",
        "context_length_exceeded",
        "This model's maximum context length is 200000 tokens",
        "request exceeds the context window",
        "Input is too long for requested model",
    ] {
        assert!(is_context_overflow(error), "{error}");
    }
    assert!(!is_context_overflow("overloaded"));
    assert!(!is_context_overflow("rate limit"));
}

#[test]
fn short_summary_split() {
    let (summary, short) =
        split_short_summary("Long text.\nMore text.\nShort summary: fixed the bug");
    assert_eq!(summary, "Long text.\nMore text.");
    assert_eq!(short.as_deref(), Some("fixed the bug"));

    let (summary, short) = split_short_summary("Just a summary with no marker");
    assert_eq!(summary, "Just a summary with no marker");
    assert_eq!(short, None);
}

#[test]
fn partition_never_splits_tool_results_from_assistant() {
    let mut messages = long_history(3);
    // Turn 4: assistant with tool call followed by its results.
    messages.push(user("do it", "u-last"));
    messages.push(assistant("calling tools", "a-last"));
    messages.push(tool_result("c1", "out1", "t1"));
    messages.push(tool_result("c2", "out2", "t2"));
    messages.push(assistant("done", "a-final"));

    // Keep the last two assistant turns: the window must open at the
    // assistant owning t1/t2, not at the tool results.
    let split = partition_point(&messages, 2).unwrap();
    assert_eq!(messages[split].entry_id.as_deref(), Some("a-last"));
}

#[test]
fn partition_keeps_everything_for_short_histories() {
    let messages = long_history(2);
    assert_eq!(partition_point(&messages, 5), None);
}

#[test]
fn prune_truncates_only_old_oversize_results() {
    let config = CompactConfig {
        prune_retention_turns: 1,
        prune_max_tool_result_chars: 100,
        ..CompactConfig::default()
    };
    let mut messages = vec![
        user("q1", "u1"),
        assistant("a1", "a1"),
        tool_result("c1", &"z".repeat(500), "t1"),
        user("q2", "u2"),
        assistant("a2", "a2"),
        tool_result("c2", &"z".repeat(500), "t2"),
    ];
    let saved = prune_old_tool_results(&mut messages, &config);
    assert!(saved > 0);

    let text_of = |t: &TrackedMessage| match &t.message {
        pi_protocol::Message::ToolResult { content, .. } => {
            content[0].as_text().unwrap().to_string()
        }
        _ => unreachable!(),
    };
    assert_eq!(text_of(&messages[2]), PRUNED_MARKER);
    // The recent result sits in the protected window.
    assert_eq!(text_of(&messages[5]), "z".repeat(500));
}

#[tokio::test]
async fn compact_splices_summary_and_appends_entry() {
    let mut messages = long_history(12);
    let store = MemoryStore::new();
    let model = ScriptedModel::new(vec![Ok(
        "Did a lot of work.\nShort summary: work done".to_string()
    )]);
    let candidates: Vec<Arc<dyn ModelClient>> = vec![model];
    let config = CompactConfig {
        min_tokens_to_summarize: 10,
        keep_recent_turns: 2,
        ..CompactConfig::default()
    };
    let (events, mut rx) = channel();

    let outcome = compact(
        &mut messages,
        &store,
        &candidates,
        &config,
        &RetryConfig::default(),
        &CancellationToken::new(),
        &events,
        CompactTrigger::Manual,
        None,
    )
    .await
    .unwrap();

    assert!(outcome.compacted);
    assert!(outcome.tokens_after < outcome.tokens_before);

    // One compaction entry in the store, anchored inside the old branch.
    let entries = store.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1["type"], "compaction");
    assert_eq!(entries[0].1["first_kept_entry_id"], "a10");
    assert_eq!(entries[0].1["short_summary"], "work done");

    // In-memory list: synthesized summary + kept window.
    match &messages[0].message {
        pi_protocol::Message::User {
            content, synthetic, ..
        } => {
            assert!(synthetic);
            assert!(content[0].as_text().unwrap().contains("Did a lot of work."));
        }
        other => panic!("expected synthesized user message, got {other:?}"),
    }
    assert_eq!(messages[0].entry_id.as_deref(), Some(entries[0].0.as_str()));
    assert_eq!(messages[1].entry_id.as_deref(), Some("a10"));

    // Events: start then end.
    drop(events);
    let mut seen = Vec::new();
    while let Some(ev) = rx.next().await {
        seen.push(ev);
    }
    assert!(matches!(seen[0], AgentEvent::CompactionStart { .. }));
    assert!(matches!(seen[1], AgentEvent::CompactionEnd { .. }));
}

#[tokio::test]
async fn compact_skips_small_prefixes() {
    let mut messages = long_history(6);
    let store = MemoryStore::new();
    let model = ScriptedModel::new(vec![Ok("unused".to_string())]);
    let candidates: Vec<Arc<dyn ModelClient>> = vec![model];
    let config = CompactConfig {
        min_tokens_to_summarize: 1_000_000,
        keep_recent_turns: 2,
        ..CompactConfig::default()
    };
    let (events, _rx) = channel();

    let outcome = compact(
        &mut messages,
        &store,
        &candidates,
        &config,
        &RetryConfig::default(),
        &CancellationToken::new(),
        &events,
        CompactTrigger::Manual,
        None,
    )
    .await
    .unwrap();

    assert!(!outcome.compacted);
    assert!(store.is_empty());
    assert_eq!(messages.len(), 12);
}

#[tokio::test]
async fn compact_retries_transient_summarization_failures() {
    let mut messages = long_history(12);
    let store = MemoryStore::new();
    let model = ScriptedModel::new(vec![
        Err("overloaded".to_string()),
        Ok("Recovered summary.".to_string()),
    ]);
    let candidates: Vec<Arc<dyn ModelClient>> = vec![model];
    let config = CompactConfig {
        min_tokens_to_summarize: 10,
        keep_recent_turns: 2,
        ..CompactConfig::default()
    };
    let retry_config = RetryConfig {
        base_delay_ms: 1,
        max_retries: 3,
    };
    let (events, _rx) = channel();

    let outcome = compact(
        &mut messages,
        &store,
        &candidates,
        &config,
        &retry_config,
        &CancellationToken::new(),
        &events,
        CompactTrigger::Overflow,
        None,
    )
    .await
    .unwrap();

    assert!(outcome.compacted);
    assert_eq!(store.len(), 1);
}
