use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;

#[test]
fn events_tag_with_type() {
    let ev = AgentEvent::TurnStart {
        turn_id: "t1".into(),
        turn_number: 3,
    };
    let value = serde_json::to_value(&ev).unwrap();
    assert_eq!(value["type"], "turn_start");
    assert_eq!(value["turn_number"], 3);
}

#[test]
fn agent_end_is_terminal() {
    assert!(AgentEvent::AgentEnd { messages: vec![] }.is_terminal());
    assert!(!AgentEvent::AgentStart.is_terminal());
}

#[test]
fn tool_execution_events_roundtrip() {
    let ev = AgentEvent::ToolExecutionStart {
        call_id: "c1".into(),
        name: "read".into(),
        arguments: json!({"path": "foo"}),
    };
    let line = serde_json::to_string(&ev).unwrap();
    let parsed: AgentEvent = serde_json::from_str(&line).unwrap();
    assert_eq!(parsed, ev);
}

#[test]
fn compact_trigger_display() {
    assert_eq!(CompactTrigger::Threshold.to_string(), "threshold");
    assert_eq!(CompactTrigger::Overflow.as_str(), "overflow");
    assert_eq!(
        serde_json::to_value(CompactTrigger::Manual).unwrap(),
        json!("manual")
    );
}

#[test]
fn auto_retry_events_roundtrip() {
    let start = AgentEvent::AutoRetryStart {
        attempt: 2,
        max_attempts: 5,
        delay_ms: 4000,
        error: "overloaded".into(),
    };
    let end = AgentEvent::AutoRetryEnd { success: true };
    for ev in [start, end] {
        let line = serde_json::to_string(&ev).unwrap();
        let parsed: AgentEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, ev);
    }
}
