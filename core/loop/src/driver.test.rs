use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use pi_inference::ModelClient;
use pi_inference::ModelInfo;
use pi_inference::StreamError;
use pi_inference::StreamRequest;
use pi_inference::channel;
use pi_protocol::AgentEvent;
use pi_protocol::AssistantMessage;
use pi_protocol::Message;
use pi_protocol::QueueKind;
use pi_protocol::RetryConfig;
use pi_protocol::StopReason;
use pi_protocol::Usage;
use pi_tools_api::ProgressFn;
use pi_tools_api::Tool;
use pi_tools_api::ToolError;
use pi_tools_api::ToolOutput;
use pi_tools_api::ToolRegistry;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::AgentEventStream;
use crate::store::MemoryStore;

// ============================================================================
// Scripted model
// ============================================================================

#[derive(Clone)]
enum ScriptedCall {
    /// Stream text deltas, stop with `end`.
    Text(String),
    /// Stream one tool call (arguments as deltas), stop with `tool_use`.
    ToolCalls(Vec<(String, String, Value)>),
    /// Stream a tool call whose argument JSON arrives in the given chunks;
    /// never completes the call (the loop is expected to abort first).
    StreamingToolCall {
        id: String,
        name: String,
        chunks: Vec<String>,
    },
    /// Fail with an error message.
    Error(String),
}

type CallHook = Box<dyn Fn() + Send + Sync>;

struct ScriptedModel {
    info: ModelInfo,
    script: Mutex<VecDeque<ScriptedCall>>,
    calls_made: Mutex<usize>,
    /// Hooks keyed by 0-based call index, run when that call starts
    /// (stands in for the user acting while the model streams).
    hooks: Mutex<std::collections::HashMap<usize, CallHook>>,
}

impl ScriptedModel {
    fn new(script: Vec<ScriptedCall>) -> Arc<Self> {
        Arc::new(Self {
            info: ModelInfo {
                id: "mock-model".into(),
                provider: "mock".into(),
                context_window: 200_000,
            },
            script: Mutex::new(script.into()),
            calls_made: Mutex::new(0),
            hooks: Mutex::new(std::collections::HashMap::new()),
        })
    }

    fn hook_call(&self, index: usize, hook: CallHook) {
        self.hooks.lock().unwrap().insert(index, hook);
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
        let call_index = {
            let mut calls_made = self.calls_made.lock().unwrap();
            let index = *calls_made;
            *calls_made += 1;
            index
        };
        if let Some(hook) = self.hooks.lock().unwrap().get(&call_index) {
            hook();
        }
        let call = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .expect("script exhausted");
        let (tx, rx) = channel();
        let mut message = AssistantMessage::empty("mock-model", "mock");
        match call {
            ScriptedCall::Text(text) => {
                tx.push(pi_inference::StreamEvent::Start);
                tx.push(pi_inference::StreamEvent::TextStart { index: 0 });
                for chunk in text.as_bytes().chunks(4) {
                    tx.push(pi_inference::StreamEvent::TextDelta {
                        index: 0,
                        delta: String::from_utf8_lossy(chunk).into_owned(),
                    });
                }
                tx.push(pi_inference::StreamEvent::TextEnd { index: 0 });
                message
                    .content
                    .push(pi_protocol::AssistantBlock::text(&text));
                tx.finish(
                    pi_inference::StreamEvent::Done {
                        stop_reason: StopReason::End,
                        usage: Usage::new(10, 5),
                    },
                    message,
                );
            }
            ScriptedCall::ToolCalls(calls) => {
                tx.push(pi_inference::StreamEvent::Start);
                for (index, (id, name, args)) in calls.iter().enumerate() {
                    tx.push(pi_inference::StreamEvent::ToolCallStart {
                        index,
                        id: id.clone(),
                        name: name.clone(),
                    });
                    tx.push(pi_inference::StreamEvent::ToolCallDelta {
                        index,
                        delta: args.to_string(),
                    });
                    tx.push(pi_inference::StreamEvent::ToolCallEnd {
                        index,
                        arguments: args.clone(),
                    });
                    message.content.push(pi_protocol::AssistantBlock::tool_call(
                        id.clone(),
                        name.clone(),
                        args.clone(),
                    ));
                }
                message.stop_reason = StopReason::ToolUse;
                tx.finish(
                    pi_inference::StreamEvent::Done {
                        stop_reason: StopReason::ToolUse,
                        usage: Usage::new(10, 5),
                    },
                    message,
                );
            }
            ScriptedCall::StreamingToolCall { id, name, chunks } => {
                tx.push(pi_inference::StreamEvent::Start);
                tx.push(pi_inference::StreamEvent::ToolCallStart {
                    index: 0,
                    id: id.clone(),
                    name,
                });
                for chunk in chunks {
                    tx.push(pi_inference::StreamEvent::ToolCallDelta {
                        index: 0,
                        delta: chunk,
                    });
                }
                // The loop aborts before the call completes; still finish so
                // an unaborted consumer terminates too.
                message.stop_reason = StopReason::ToolUse;
                tx.finish(
                    pi_inference::StreamEvent::Done {
                        stop_reason: StopReason::ToolUse,
                        usage: Usage::new(10, 5),
                    },
                    message,
                );
            }
            ScriptedCall::Error(error) => {
                message.stop_reason = StopReason::Error;
                message.error_message = Some(error.clone());
                tx.finish(
                    pi_inference::StreamEvent::Error { message: error },
                    message,
                );
            }
        }
        Ok(rx)
    }
}

// ============================================================================
// Test tools
// ============================================================================

type ToolFn = Box<dyn Fn(Value) -> ToolOutput + Send + Sync>;

struct ClosureTool {
    name: String,
    schema: Value,
    func: ToolFn,
}

impl ClosureTool {
    fn read(registry: &mut ToolRegistry) {
        registry.register(Arc::new(ClosureTool {
            name: "read".into(),
            schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            }),
            func: Box::new(|_args| ToolOutput::text("abc")),
        }));
    }
}

#[async_trait]
impl Tool for ClosureTool {
    fn name(&self) -> &str {
        &self.name
    }
    fn description(&self) -> &str {
        "test tool"
    }
    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }
    async fn execute(
        &self,
        _call_id: &str,
        arguments: Value,
        _cancel: CancellationToken,
        _on_progress: ProgressFn<'_>,
    ) -> Result<ToolOutput, ToolError> {
        Ok((self.func)(arguments))
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    agent: AgentLoop,
    store: Arc<MemoryStore>,
}

fn harness(script: Vec<ScriptedCall>, tools: ToolRegistry) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let agent = AgentLoop::builder()
        .model(ScriptedModel::new(script))
        .tools(Arc::new(tools))
        .store(store.clone())
        .system_prompt("You are a test agent.")
        .retry_config(RetryConfig {
            base_delay_ms: 1,
            max_retries: 5,
        })
        .build();
    Harness { agent, store }
}

async fn collect(mut rx: AgentEventStream) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(ev) = rx.next().await {
        events.push(ev);
    }
    events
}

fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|ev| match ev {
            AgentEvent::AgentStart => "agent_start",
            AgentEvent::AgentEnd { .. } => "agent_end",
            AgentEvent::TurnStart { .. } => "turn_start",
            AgentEvent::TurnEnd { .. } => "turn_end",
            AgentEvent::MessageStart { .. } => "message_start",
            AgentEvent::MessageUpdate { .. } => "message_update",
            AgentEvent::MessageEnd { .. } => "message_end",
            AgentEvent::ToolExecutionStart { .. } => "tool_start",
            AgentEvent::ToolExecutionUpdate { .. } => "tool_update",
            AgentEvent::ToolExecutionEnd { .. } => "tool_end",
            AgentEvent::ContextUsageWarning { .. } => "context_warning",
            AgentEvent::CompactionStart { .. } => "compaction_start",
            AgentEvent::CompactionEnd { .. } => "compaction_end",
            AgentEvent::AutoRetryStart { .. } => "auto_retry_start",
            AgentEvent::AutoRetryEnd { .. } => "auto_retry_end",
            AgentEvent::MessageQueued { .. } => "message_queued",
            AgentEvent::MessageDequeued { .. } => "message_dequeued",
        })
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn simple_turn_event_order() {
    let mut h = harness(
        vec![ScriptedCall::Text("hello".into())],
        ToolRegistry::new(),
    );
    let (tx, rx) = channel();
    let result = h.agent.run(Some(Message::user("hi")), &tx).await.unwrap();
    assert!(result.is_complete());

    let events = collect(rx).await;
    let kinds = kinds(&events);
    // Updates collapse to "one or more" for the assertion.
    let mut dedup = Vec::new();
    for k in &kinds {
        if *k == "message_update" && dedup.last() == Some(&"message_update") {
            continue;
        }
        dedup.push(*k);
    }
    assert_eq!(
        dedup,
        vec![
            "agent_start",
            "turn_start",
            "message_start", // user
            "message_end",
            "message_start", // assistant
            "message_update",
            "message_end",
            "turn_end",
            "agent_end",
        ]
    );
    assert!(kinds.iter().filter(|k| **k == "message_update").count() >= 1);

    // Final in-memory list: [user, assistant].
    assert_eq!(h.agent.messages().len(), 2);
    assert_eq!(result.final_text().as_deref(), Some("hello"));
    assert_eq!(result.messages.len(), 2);

    // The stream result carries the same messages.
    assert_eq!(h.store.len(), 2);
}

#[tokio::test]
async fn tool_use_runs_a_second_turn() {
    let mut tools = ToolRegistry::new();
    ClosureTool::read(&mut tools);
    let mut h = harness(
        vec![
            ScriptedCall::ToolCalls(vec![("c1".into(), "read".into(), json!({"path": "foo"}))]),
            ScriptedCall::Text("file says abc".into()),
        ],
        tools,
    );
    let (tx, rx) = channel();
    let result = h.agent.run(Some(Message::user("read foo")), &tx).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(result.turns, 2);

    let events = collect(rx).await;
    let kinds = kinds(&events);

    // Tool execution happens between the two assistant messages, and the
    // tool result's message events follow its execution end.
    let tool_start = kinds.iter().position(|k| *k == "tool_start").unwrap();
    let tool_end = kinds.iter().position(|k| *k == "tool_end").unwrap();
    assert!(tool_start < tool_end);
    let result_start = kinds[tool_end..]
        .iter()
        .position(|k| *k == "message_start")
        .unwrap()
        + tool_end;
    assert!(result_start > tool_end);

    // Journal: user, assistant(tool_use), tool result, assistant.
    assert_eq!(h.store.len(), 4);
    let entries = h.store.entries();
    assert_eq!(entries[0].1["role"], "user");
    assert_eq!(entries[1].1["role"], "assistant");
    assert_eq!(entries[1].1["stop_reason"], "tool_use");
    assert_eq!(entries[2].1["role"], "tool_result");
    assert_eq!(entries[2].1["tool_call_id"], "c1");
    assert_eq!(entries[3].1["role"], "assistant");
    assert_eq!(result.final_text().as_deref(), Some("file says abc"));
}

#[tokio::test]
async fn tool_calls_dispatch_in_textual_order() {
    let mut tools = ToolRegistry::new();
    ClosureTool::read(&mut tools);
    let mut h = harness(
        vec![
            ScriptedCall::ToolCalls(vec![
                ("c1".into(), "read".into(), json!({"path": "a"})),
                ("c2".into(), "read".into(), json!({"path": "b"})),
            ]),
            ScriptedCall::Text("done".into()),
        ],
        tools,
    );
    let (tx, rx) = channel();
    h.agent.run(Some(Message::user("go")), &tx).await.unwrap();
    let events = collect(rx).await;

    let call_order: Vec<String> = events
        .iter()
        .filter_map(|ev| match ev {
            AgentEvent::ToolExecutionStart { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(call_order, vec!["c1", "c2"]);
}

#[tokio::test]
async fn unknown_tool_becomes_error_result() {
    let mut h = harness(
        vec![
            ScriptedCall::ToolCalls(vec![("c1".into(), "nope".into(), json!({}))]),
            ScriptedCall::Text("sorry".into()),
        ],
        ToolRegistry::new(),
    );
    let (tx, rx) = channel();
    let result = h.agent.run(Some(Message::user("go")), &tx).await.unwrap();
    assert!(result.is_complete());

    let events = collect(rx).await;
    let (is_error, text) = events
        .iter()
        .find_map(|ev| match ev {
            AgentEvent::ToolExecutionEnd {
                result, is_error, ..
            } => Some((*is_error, result.clone())),
            _ => None,
        })
        .unwrap();
    assert!(is_error);
    match text {
        Message::ToolResult { content, .. } => {
            assert!(content[0].as_text().unwrap().contains("Tool not found"));
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_arguments_become_error_result() {
    let mut tools = ToolRegistry::new();
    ClosureTool::read(&mut tools);
    let mut h = harness(
        vec![
            ScriptedCall::ToolCalls(vec![("c1".into(), "read".into(), json!({"path": 42}))]),
            ScriptedCall::Text("retrying".into()),
        ],
        tools,
    );
    let (tx, rx) = channel();
    h.agent.run(Some(Message::user("go")), &tx).await.unwrap();
    let events = collect(rx).await;
    let errored = events.iter().any(|ev| {
        matches!(ev, AgentEvent::ToolExecutionEnd { is_error: true, result, .. }
            if matches!(result, Message::ToolResult { content, .. }
                if content[0].as_text().unwrap().contains("expected string")))
    });
    assert!(errored);
}

#[tokio::test]
async fn steer_skips_remaining_tool_calls_and_runs_next_turn() {
    let mut tools = ToolRegistry::new();
    // Reach into the queue from inside the first tool, as a user steering
    // mid-turn would.
    let queue_slot: Arc<Mutex<Option<MessageQueue>>> = Arc::new(Mutex::new(None));
    let slot = queue_slot.clone();
    tools.register(Arc::new(ClosureTool {
        name: "read".into(),
        schema: json!({"type": "object"}),
        func: Box::new(move |_args| {
            if let Some(queue) = slot.lock().unwrap().as_ref() {
                queue.push(QueueKind::Steer, "stop");
            }
            ToolOutput::text("first result")
        }),
    }));

    let mut h = harness(
        vec![
            ScriptedCall::ToolCalls(vec![
                ("c1".into(), "read".into(), json!({})),
                ("c2".into(), "read".into(), json!({})),
            ]),
            ScriptedCall::Text("acknowledged".into()),
        ],
        tools,
    );
    *queue_slot.lock().unwrap() = Some(h.agent.queue());

    let (tx, rx) = channel();
    let result = h.agent.run(Some(Message::user("go")), &tx).await.unwrap();
    assert!(result.is_complete());

    let events = collect(rx).await;
    // c2 was skipped with the canonical text.
    let skipped = events.iter().any(|ev| {
        matches!(ev, AgentEvent::ToolExecutionEnd { call_id, is_error: true, result }
            if call_id == "c2"
                && matches!(result, Message::ToolResult { content, .. }
                    if content[0].as_text() == Some("Skipped due to queued user message.")))
    });
    assert!(skipped, "second tool call should be skipped");

    // The steer message was dequeued and injected before the next LLM call.
    assert!(events
        .iter()
        .any(|ev| matches!(ev, AgentEvent::MessageDequeued { .. })));
    let steer_in_context = h.agent.messages().iter().any(|t| {
        matches!(&t.message, Message::User { content, synthetic: false, .. }
            if content[0].as_text() == Some("stop"))
    });
    assert!(steer_in_context);
}

#[tokio::test]
async fn follow_up_forces_one_more_turn() {
    let model = ScriptedModel::new(vec![
        ScriptedCall::Text("first answer".into()),
        ScriptedCall::Text("follow-up answer".into()),
    ]);
    let queue = MessageQueue::new();
    // The user types while the first answer streams: the agent would stop
    // after it, but the queued follow-up forces another turn.
    let hook_queue = queue.clone();
    model.hook_call(
        0,
        Box::new(move || {
            hook_queue.push(QueueKind::FollowUp, "also do this");
        }),
    );

    let store = Arc::new(MemoryStore::new());
    let mut agent = AgentLoop::builder()
        .model(model)
        .tools(Arc::new(ToolRegistry::new()))
        .store(store)
        .queue(queue)
        .build();

    let (tx, rx) = channel();
    let result = agent.run(Some(Message::user("hi")), &tx).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(result.turns, 2);
    drop(rx);
    assert_eq!(result.final_text().as_deref(), Some("follow-up answer"));
}

#[tokio::test]
async fn transient_errors_retry_then_succeed() {
    let mut h = harness(
        vec![
            ScriptedCall::Error("overloaded".into()),
            ScriptedCall::Error("overloaded".into()),
            ScriptedCall::Text("ok".into()),
        ],
        ToolRegistry::new(),
    );
    let (tx, rx) = channel();
    let result = h.agent.run(Some(Message::user("hi")), &tx).await.unwrap();
    assert!(result.is_complete());

    let events = collect(rx).await;
    let starts = events
        .iter()
        .filter(|ev| matches!(ev, AgentEvent::AutoRetryStart { .. }))
        .count();
    let ends: Vec<bool> = events
        .iter()
        .filter_map(|ev| match ev {
            AgentEvent::AutoRetryEnd { success } => Some(*success),
            _ => None,
        })
        .collect();
    assert_eq!(starts, 2);
    assert_eq!(ends, vec![true]);

    // Error messages are journaled but stripped from memory.
    assert_eq!(h.agent.messages().len(), 2); // user + final assistant
    assert_eq!(h.store.len(), 4); // user + 2 errors + assistant
    assert_eq!(result.messages.len(), 2);
}

#[tokio::test]
async fn retries_exhaust_into_fatal_error() {
    let store = Arc::new(MemoryStore::new());
    let mut agent = AgentLoop::builder()
        .model(ScriptedModel::new(vec![
            ScriptedCall::Error("overloaded".into()),
            ScriptedCall::Error("overloaded".into()),
            ScriptedCall::Error("overloaded".into()),
        ]))
        .tools(Arc::new(ToolRegistry::new()))
        .store(store)
        .retry_config(RetryConfig {
            base_delay_ms: 1,
            max_retries: 2,
        })
        .build();
    let (tx, rx) = channel();
    let result = agent.run(Some(Message::user("hi")), &tx).await.unwrap();
    assert!(matches!(result.stop_reason, LoopStopReason::Error { .. }));

    let events = collect(rx).await;
    let ends: Vec<bool> = events
        .iter()
        .filter_map(|ev| match ev {
            AgentEvent::AutoRetryEnd { success } => Some(*success),
            _ => None,
        })
        .collect();
    assert_eq!(ends, vec![false]);
}

#[tokio::test]
async fn non_retryable_error_is_fatal() {
    let mut h = harness(
        vec![ScriptedCall::Error("invalid api key".into())],
        ToolRegistry::new(),
    );
    let (tx, rx) = channel();
    let result = h.agent.run(Some(Message::user("hi")), &tx).await.unwrap();
    match &result.stop_reason {
        LoopStopReason::Error { message } => assert!(message.contains("invalid api key")),
        other => panic!("expected error stop, got {other:?}"),
    }
    let events = collect(rx).await;
    assert!(matches!(events.last(), Some(AgentEvent::AgentEnd { .. })));
}

#[tokio::test]
async fn overflow_compacts_and_continues() {
    let mut tools = ToolRegistry::new();
    ClosureTool::read(&mut tools);
    let store = Arc::new(MemoryStore::new());
    let agent = AgentLoop::builder()
        .model(ScriptedModel::new(vec![
            ScriptedCall::Error("prompt is too long: 250000 tokens > 200000 maximum".into()),
            ScriptedCall::Text("A summary of everything so far.".into()),
            ScriptedCall::Text("recovered".into()),
        ]))
        .tools(Arc::new(tools))
        .store(store.clone())
        .compact_config(pi_protocol::CompactConfig {
            min_tokens_to_summarize: 10,
            keep_recent_turns: 2,
            ..pi_protocol::CompactConfig::default()
        })
        .retry_config(RetryConfig {
            base_delay_ms: 1,
            max_retries: 5,
        })
        .build();
    let mut h = Harness { agent, store };

    // Seed a long conversation so there is something to summarize.
    let mut seeded = Vec::new();
    for i in 0..12 {
        seeded.push(TrackedMessage::new(
            format!("u{i}"),
            Message::user(format!("question {i} {}", "x".repeat(400))),
        ));
        let mut asst = AssistantMessage::empty("mock-model", "mock");
        asst.content
            .push(pi_protocol::AssistantBlock::text(format!(
                "answer {i} {}",
                "y".repeat(400)
            )));
        seeded.push(TrackedMessage::new(
            format!("a{i}"),
            Message::Assistant(asst),
        ));
    }
    h.agent.set_messages(seeded);

    let (tx, rx) = channel();
    let result = h.agent.run(Some(Message::user("next")), &tx).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(result.final_text().as_deref(), Some("recovered"));

    // Journal grew by: user("next"), one compaction entry, one assistant.
    let entries = h.store.entries();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].1["role"], "user");
    assert_eq!(entries[1].1["type"], "compaction");
    assert_eq!(entries[2].1["role"], "assistant");
    // The compaction anchors inside the original branch.
    let first_kept = entries[1].1["first_kept_entry_id"].as_str().unwrap();
    assert!(first_kept.starts_with('a') || first_kept.starts_with('u'));

    // In-memory list: synthesized summary first, no overflow error message.
    let messages = h.agent.messages();
    match &messages[0].message {
        Message::User {
            content, synthetic, ..
        } => {
            assert!(synthetic);
            assert!(content[0].as_text().unwrap().contains("A summary"));
        }
        other => panic!("expected synthesized summary, got {other:?}"),
    }
    let has_error = messages
        .iter()
        .any(|t| matches!(&t.message, Message::Assistant(a) if a.stop_reason == StopReason::Error));
    assert!(!has_error);

    let events = collect(rx).await;
    assert!(events
        .iter()
        .any(|ev| matches!(ev, AgentEvent::CompactionStart { .. })));
}

#[tokio::test]
async fn cancellation_mid_tools_aborts_the_run() {
    let cancel = CancellationToken::new();
    let mut tools = ToolRegistry::new();
    let cancel_clone = cancel.clone();
    tools.register(Arc::new(ClosureTool {
        name: "read".into(),
        schema: json!({"type": "object"}),
        func: Box::new(move |_args| {
            cancel_clone.cancel();
            ToolOutput::text("partial")
        }),
    }));

    let store = Arc::new(MemoryStore::new());
    let mut agent = AgentLoop::builder()
        .model(ScriptedModel::new(vec![ScriptedCall::ToolCalls(vec![
            ("c1".into(), "read".into(), json!({})),
            ("c2".into(), "read".into(), json!({})),
        ])]))
        .tools(Arc::new(tools))
        .store(store)
        .cancel_token(cancel)
        .build();

    let (tx, rx) = channel();
    let result = agent.run(Some(Message::user("go")), &tx).await.unwrap();
    assert_eq!(result.stop_reason, LoopStopReason::Aborted);

    let events = collect(rx).await;
    // c2 never started.
    let started: Vec<String> = events
        .iter()
        .filter_map(|ev| match ev {
            AgentEvent::ToolExecutionStart { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["c1"]);
    assert!(matches!(events.last(), Some(AgentEvent::AgentEnd { .. })));
}

#[tokio::test]
async fn streaming_edit_abort_synthesizes_error_result() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f.txt"), "alpha\nbeta\n").unwrap();

    let args_json = json!({
        "path": "f.txt",
        "diff": "-line that does not exist\n+replacement\n",
    })
    .to_string();
    // Split the argument JSON mid-diff so the check runs on a partial value.
    let split_at = args_json.len() - 2;
    let chunks = vec![
        args_json[..split_at].to_string(),
        args_json[split_at..].to_string(),
    ];

    let store = Arc::new(MemoryStore::new());
    let mut tools = ToolRegistry::new();
    // The edit tool itself must not run; give it a panicking body.
    tools.register(Arc::new(ClosureTool {
        name: EDIT_TOOL_NAME.into(),
        schema: json!({"type": "object"}),
        func: Box::new(|_args| panic!("edit tool must not execute")),
    }));

    let mut agent = AgentLoop::builder()
        .model(ScriptedModel::new(vec![
            ScriptedCall::StreamingToolCall {
                id: "c-edit".into(),
                name: EDIT_TOOL_NAME.into(),
                chunks,
            },
            ScriptedCall::Text("let me re-read the file".into()),
        ]))
        .tools(Arc::new(tools))
        .store(store)
        .workspace_root(dir.path())
        .build();

    let (tx, rx) = channel();
    let result = agent.run(Some(Message::user("edit it")), &tx).await.unwrap();
    assert!(result.is_complete());

    let events = collect(rx).await;
    let abort_result = events
        .iter()
        .find_map(|ev| match ev {
            AgentEvent::ToolExecutionEnd {
                call_id,
                result,
                is_error: true,
            } if call_id == "c-edit" => Some(result.clone()),
            _ => None,
        })
        .expect("aborted edit should produce an error result");
    match abort_result {
        Message::ToolResult { content, .. } => {
            let text = content[0].as_text().unwrap();
            assert!(text.contains("Edit aborted during streaming"), "{text}");
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn max_turns_stops_the_loop() {
    let mut tools = ToolRegistry::new();
    ClosureTool::read(&mut tools);
    let store = Arc::new(MemoryStore::new());
    let mut agent = AgentLoop::builder()
        .model(ScriptedModel::new(vec![
            ScriptedCall::ToolCalls(vec![("c1".into(), "read".into(), json!({"path": "a"}))]),
            ScriptedCall::ToolCalls(vec![("c2".into(), "read".into(), json!({"path": "b"}))]),
        ]))
        .tools(Arc::new(tools))
        .store(store)
        .config(pi_protocol::LoopConfig {
            max_turns: Some(2),
            ..pi_protocol::LoopConfig::default()
        })
        .build();

    let (tx, rx) = channel();
    let result = agent.run(Some(Message::user("go")), &tx).await.unwrap();
    drop(rx);
    assert_eq!(result.stop_reason, LoopStopReason::MaxTurnsReached);
    assert_eq!(result.turns, 2);
}

#[test]
fn partial_string_field_handles_escapes_and_truncation() {
    let full = r#"{"path":"a.txt","diff":"-old line\n+new line\n"}"#;
    assert_eq!(partial_string_field(full, "path").as_deref(), Some("a.txt"));
    assert_eq!(
        partial_string_field(full, "diff").as_deref(),
        Some("-old line\n+new line\n")
    );

    // Truncated mid-value: returns what has streamed so far.
    let partial = r#"{"path":"a.txt","diff":"-old line\n+ne"#;
    assert_eq!(
        partial_string_field(partial, "diff").as_deref(),
        Some("-old line\n+ne")
    );

    // Missing field.
    assert_eq!(partial_string_field(partial, "rename"), None);
}
