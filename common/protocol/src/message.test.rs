use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;

#[test]
fn user_message_serde_roundtrip() {
    let msg = Message::user("hello");
    let line = serde_json::to_string(&msg).expect("serialize");
    assert!(line.contains("\"role\":\"user\""));
    let parsed: Message = serde_json::from_str(&line).expect("deserialize");
    assert_eq!(parsed, msg);
}

#[test]
fn synthetic_flag_survives_roundtrip() {
    let msg = Message::synthetic_user("continue");
    let line = serde_json::to_string(&msg).expect("serialize");
    let parsed: Message = serde_json::from_str(&line).expect("deserialize");
    match parsed {
        Message::User { synthetic, .. } => assert!(synthetic),
        other => panic!("expected user message, got {other:?}"),
    }
}

#[test]
fn assistant_message_tags_with_role() {
    let mut asst = AssistantMessage::empty("m1", "prov");
    asst.content.push(AssistantBlock::text("hi"));
    asst.content
        .push(AssistantBlock::tool_call("c1", "read", json!({"path": "f"})));
    asst.stop_reason = StopReason::ToolUse;

    let msg = Message::Assistant(asst.clone());
    let value = serde_json::to_value(&msg).expect("serialize");
    assert_eq!(value["role"], "assistant");
    assert_eq!(value["stop_reason"], "tool_use");
    assert_eq!(value["content"][1]["type"], "tool_call");

    let parsed: Message = serde_json::from_value(value).expect("deserialize");
    assert_eq!(parsed, Message::Assistant(asst));
}

#[test]
fn tool_calls_preserve_textual_order() {
    let mut asst = AssistantMessage::empty("m1", "prov");
    asst.content.push(AssistantBlock::tool_call("a", "x", json!({})));
    asst.content.push(AssistantBlock::text("between"));
    asst.content.push(AssistantBlock::tool_call("b", "y", json!({})));

    let calls = asst.tool_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, "a");
    assert_eq!(calls[1].0, "b");
    assert!(asst.has_tool_calls());
}

#[test]
fn assistant_text_concatenates_text_blocks_only() {
    let mut asst = AssistantMessage::empty("m1", "prov");
    asst.content.push(AssistantBlock::thinking("pondering"));
    asst.content.push(AssistantBlock::text("one "));
    asst.content.push(AssistantBlock::text("two"));
    assert_eq!(asst.text(), "one two");
}

#[test]
fn exclude_from_context_hides_executions() {
    let visible = Message::BashExecution {
        command: "ls".into(),
        output: "a".into(),
        exit_code: 0,
        cancelled: false,
        truncated: false,
        exclude_from_context: false,
        timestamp: 1,
    };
    let hidden = Message::BashExecution {
        command: "ls".into(),
        output: "a".into(),
        exit_code: 0,
        cancelled: false,
        truncated: false,
        exclude_from_context: true,
        timestamp: 1,
    };
    assert!(visible.in_context());
    assert!(!hidden.in_context());
}

#[test]
fn estimate_tokens_scales_with_text() {
    let short = Message::user("abcd");
    let long = Message::user("a".repeat(4000));
    assert_eq!(short.estimate_tokens(), 1);
    assert_eq!(long.estimate_tokens(), 1000);
}

#[test]
fn stop_reason_serializes_snake_case() {
    assert_eq!(
        serde_json::to_value(StopReason::MaxTokens).expect("serialize"),
        json!("max_tokens")
    );
    assert_eq!(StopReason::Aborted.to_string(), "aborted");
}

#[test]
fn usage_total_counts_cache_tokens() {
    let usage = Usage {
        input_tokens: 10,
        output_tokens: 5,
        cache_read_tokens: 100,
        cache_write_tokens: 20,
        cost: 0.0,
    };
    assert_eq!(usage.total(), 135);
}

#[test]
fn compaction_summary_roundtrip() {
    let msg = Message::CompactionSummary {
        summary: "did things".into(),
        short_summary: Some("things".into()),
        tokens_before: 120_000,
        first_kept_entry_id: "e42".into(),
        timestamp: 7,
    };
    let line = serde_json::to_string(&msg).expect("serialize");
    assert!(line.contains("\"role\":\"compaction_summary\""));
    let parsed: Message = serde_json::from_str(&line).expect("deserialize");
    assert_eq!(parsed, msg);
}
