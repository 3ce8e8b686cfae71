use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use pi_inference::ModelClient;
use pi_inference::ModelInfo;
use pi_inference::StreamError;
use pi_inference::StreamRequest;
use pi_protocol::AgentEvent;
use pi_protocol::AssistantBlock;
use pi_protocol::AssistantMessage;
use pi_protocol::StreamingBehavior;
use pi_protocol::Usage;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::*;

/// Scripted facade model: each call pops the next response text. A call
/// index listed in `gated` waits for a permit first, so tests can hold a
/// run open while they poke the session from outside.
struct FacadeModel {
    responses: Mutex<VecDeque<String>>,
    gate: tokio::sync::Semaphore,
    gated_calls: Vec<usize>,
    calls_made: Mutex<usize>,
}

impl FacadeModel {
    fn new(responses: Vec<&str>) -> Arc<Self> {
        Self::gated(responses, vec![])
    }

    fn gated(responses: Vec<&str>, gated_calls: Vec<usize>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            gate: tokio::sync::Semaphore::new(0),
            gated_calls,
            calls_made: Mutex::new(0),
        })
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl ModelClient for FacadeModel {
    fn info(&self) -> ModelInfo {
        ModelInfo {
            id: "mock-model".into(),
            provider: "mock".into(),
            context_window: 200_000,
        }
    }

    async fn stream(
        &self,
        _request: StreamRequest,
        _cancel: CancellationToken,
    ) -> Result<pi_inference::AssistantStream, StreamError> {
        let call_index = {
            let mut calls = self.calls_made.lock().unwrap();
            let index = *calls;
            *calls += 1;
            index
        };
        if self.gated_calls.contains(&call_index) {
            let permit = self.gate.acquire().await.map_err(|_| StreamError::new("gate closed"))?;
            permit.forget();
        }
        let text = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("script exhausted");
        let (tx, rx) = pi_inference::channel();
        let mut message = AssistantMessage::empty("mock-model", "mock");
        tx.push(pi_inference::StreamEvent::TextStart { index: 0 });
        tx.push(pi_inference::StreamEvent::TextDelta {
            index: 0,
            delta: text.clone(),
        });
        message.content.push(AssistantBlock::text(&text));
        tx.finish(
            pi_inference::StreamEvent::Done {
                stop_reason: pi_protocol::StopReason::End,
                usage: Usage::new(5, 5),
            },
            message,
        );
        Ok(rx)
    }
}

fn session_with(model: Arc<FacadeModel>, dir: &tempfile::TempDir) -> Session {
    Session::builder()
        .model(model)
        .system_prompt("test agent")
        .workspace_root(dir.path())
        .create(dir.path().join("session.jsonl"))
        .unwrap()
}

async fn drain(mut stream: pi_loop::AgentEventStream) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Some(ev) = stream.next().await {
        events.push(ev);
    }
    events
}

#[tokio::test]
async fn prompt_runs_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let session = session_with(FacadeModel::new(vec!["hello"]), &dir);

    let outcome = session.prompt("hi", PromptOptions::default()).await.unwrap();
    let stream = match outcome {
        PromptOutcome::Started(stream) => stream,
        PromptOutcome::Queued { .. } => panic!("expected a run to start"),
    };
    let events = drain(stream).await;
    assert!(matches!(events.first(), Some(AgentEvent::AgentStart)));
    assert!(matches!(events.last(), Some(AgentEvent::AgentEnd { .. })));

    let result = session.wait_idle().await.unwrap();
    assert!(result.is_complete());
    assert_eq!(result.final_text().as_deref(), Some("hello"));

    // Journal: session header + user + assistant.
    session.with_journal(|j| {
        assert_eq!(j.len(), 3);
    });
    assert_eq!(session.messages().await.len(), 2);
    assert!(!session.is_streaming());
}

#[tokio::test]
async fn reopened_session_reconstructs_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.jsonl");
    {
        let session = Session::builder()
            .model(FacadeModel::new(vec!["first answer"]))
            .workspace_root(dir.path())
            .create(&path)
            .unwrap();
        match session.prompt("hi", PromptOptions::default()).await.unwrap() {
            PromptOutcome::Started(stream) => drain(stream).await,
            PromptOutcome::Queued { .. } => panic!("expected run"),
        };
        session.wait_idle().await;
        session.with_journal(|j| j.sync().unwrap());
    }

    let reopened = Session::builder()
        .model(FacadeModel::new(vec![]))
        .workspace_root(dir.path())
        .open(&path)
        .unwrap();
    let messages = reopened.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(
        messages[1].as_assistant().map(|a| a.text()).as_deref(),
        Some("first answer")
    );
}

#[tokio::test]
async fn busy_prompt_requires_streaming_behavior() {
    let dir = tempfile::tempdir().unwrap();
    let model = FacadeModel::gated(vec!["gated answer", "steered answer"], vec![0]);
    let session = session_with(model.clone(), &dir);

    let stream = match session.prompt("start", PromptOptions::default()).await.unwrap() {
        PromptOutcome::Started(stream) => stream,
        PromptOutcome::Queued { .. } => panic!("expected run"),
    };
    // Give the spawned run a chance to start streaming.
    tokio::task::yield_now().await;
    assert!(session.is_streaming());

    // No behavior: rejected.
    let denied = session.prompt("again", PromptOptions::default()).await;
    assert!(matches!(denied, Err(SessionError::Busy)));

    // Steer behavior: queued.
    let queued = session
        .prompt(
            "change course",
            PromptOptions {
                streaming_behavior: Some(StreamingBehavior::Steer),
                ..PromptOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(matches!(queued, PromptOutcome::Queued { .. }));

    model.release();
    let result = session.wait_idle().await.unwrap();
    // The queued steer forced a second turn.
    assert_eq!(result.turns, 2);
    assert_eq!(result.final_text().as_deref(), Some("steered answer"));

    let events = drain(stream).await;
    assert!(events
        .iter()
        .any(|ev| matches!(ev, AgentEvent::MessageQueued { .. })));
    assert!(events
        .iter()
        .any(|ev| matches!(ev, AgentEvent::MessageDequeued { .. })));
}

#[tokio::test]
async fn steer_and_follow_up_queue_messages() {
    let dir = tempfile::tempdir().unwrap();
    let model = FacadeModel::gated(vec!["one", "two"], vec![0]);
    let session = session_with(model.clone(), &dir);

    let stream = match session.prompt("go", PromptOptions::default()).await.unwrap() {
        PromptOutcome::Started(stream) => stream,
        PromptOutcome::Queued { .. } => panic!("expected run"),
    };
    tokio::task::yield_now().await;
    let id = session.steer("stop that");
    assert!(!id.is_empty());

    model.release();
    session.wait_idle().await.unwrap();
    drop(stream);

    // The steer text landed in the conversation.
    let messages = session.messages().await;
    let steered = messages.iter().any(|m| {
        matches!(m, pi_protocol::Message::User { content, .. }
            if content[0].as_text() == Some("stop that"))
    });
    assert!(steered);
}

#[tokio::test]
async fn abort_cancels_active_run() {
    let dir = tempfile::tempdir().unwrap();
    let model = FacadeModel::gated(vec!["never delivered"], vec![0]);
    let session = session_with(model.clone(), &dir);

    match session.prompt("go", PromptOptions::default()).await.unwrap() {
        PromptOutcome::Started(_) => {}
        PromptOutcome::Queued { .. } => panic!("expected run"),
    }
    tokio::task::yield_now().await;

    // Cancel while the model is gated, then release the gate so the run
    // can observe the cancellation and wind down.
    let aborter = {
        let session = session.clone();
        tokio::spawn(async move { session.abort().await })
    };
    tokio::task::yield_now().await;
    model.release();
    let result = aborter.await.unwrap().unwrap();
    assert_eq!(result.stop_reason, pi_loop::LoopStopReason::Aborted);
    assert!(!session.is_streaming());
}

#[tokio::test]
async fn fork_switches_to_copy_and_leaves_original() {
    let dir = tempfile::tempdir().unwrap();
    let session = session_with(FacadeModel::new(vec!["a", "b", "c"]), &dir);
    for _ in 0..3 {
        match session.prompt("msg", PromptOptions::default()).await.unwrap() {
            PromptOutcome::Started(stream) => drain(stream).await,
            PromptOutcome::Queued { .. } => panic!("expected run"),
        };
        session.wait_idle().await;
    }
    let original_path = session.path();
    let original_leaf = session.with_journal(|j| j.leaf().unwrap().to_string());

    let fork_path = session.fork().await.unwrap();
    assert_ne!(fork_path, original_path);
    assert_eq!(session.path(), fork_path);

    // Branch the fork back two entries; the original file's leaf stays.
    let target = session.with_journal(|j| j.get_branch()[2].id.clone());
    session.branch(&target).await.unwrap();
    assert_eq!(session.with_journal(|j| j.leaf().unwrap().to_string()), target);
    assert_eq!(session.with_journal(|j| j.get_branch().len()), 3);

    let original = SessionJournal::open(&original_path).unwrap();
    assert_eq!(original.leaf(), Some(original_leaf.as_str()));
}

#[tokio::test]
async fn navigate_tree_with_summary_records_branch_summary() {
    let dir = tempfile::tempdir().unwrap();
    // Last response feeds the branch summarization call.
    let session = session_with(
        FacadeModel::new(vec!["a", "b", "the branch tried an approach"]),
        &dir,
    );
    for _ in 0..2 {
        match session.prompt("msg", PromptOptions::default()).await.unwrap() {
            PromptOutcome::Started(stream) => drain(stream).await,
            PromptOutcome::Queued { .. } => panic!("expected run"),
        };
        session.wait_idle().await;
    }

    // Navigate back to the first user message.
    let target = session.with_journal(|j| j.get_branch()[1].id.clone());
    session.navigate_tree(&target, true).await.unwrap();

    let messages = session.messages().await;
    let has_summary = messages.iter().any(|m| {
        matches!(m, pi_protocol::Message::BranchSummary { summary, .. }
            if summary.contains("tried an approach"))
    });
    assert!(has_summary, "expected a branch summary message");
}

#[tokio::test]
async fn manual_compact_splices_history() {
    let dir = tempfile::tempdir().unwrap();
    let model = FacadeModel::new(vec!["A tidy summary of early work."]);
    let session = Session::builder()
        .model(model)
        .workspace_root(dir.path())
        .compact_config(pi_protocol::CompactConfig {
            min_tokens_to_summarize: 10,
            keep_recent_turns: 2,
            ..pi_protocol::CompactConfig::default()
        })
        .create(dir.path().join("session.jsonl"))
        .unwrap();

    // Seed a long history directly in the journal, then reload.
    session.with_journal(|j| {
        for i in 0..12 {
            j.append_message(&pi_protocol::Message::user(format!(
                "question {i} {}",
                "x".repeat(200)
            )))
            .unwrap();
            let mut asst = AssistantMessage::empty("mock-model", "mock");
            asst.content.push(AssistantBlock::text(format!(
                "answer {i} {}",
                "y".repeat(200)
            )));
            j.append_message(&pi_protocol::Message::Assistant(asst)).unwrap();
        }
    });
    session.reload().await;

    let outcome = session.compact(None).await.unwrap();
    assert!(outcome.compacted);
    assert!(outcome.tokens_after < outcome.tokens_before);

    // The journal gained a compaction entry and projects the splice.
    let context = session.with_journal(|j| j.build_session_context());
    match &context[0].message {
        pi_protocol::Message::User { content, synthetic, .. } => {
            assert!(synthetic);
            assert!(content[0].as_text().unwrap().contains("tidy summary"));
        }
        other => panic!("expected synthesized summary, got {other:?}"),
    }
    // In-memory view matches the journal projection.
    let in_memory = session.messages().await;
    assert_eq!(in_memory.len(), context.len());
}

#[tokio::test]
async fn handoff_seeds_a_new_session() {
    let dir = tempfile::tempdir().unwrap();
    let session = session_with(
        FacadeModel::new(vec!["context answer", "HANDOFF: finish the parser"]),
        &dir,
    );
    match session.prompt("work on the parser", PromptOptions::default()).await.unwrap() {
        PromptOutcome::Started(stream) => drain(stream).await,
        PromptOutcome::Queued { .. } => panic!("expected run"),
    };
    session.wait_idle().await;

    let new_path = session.handoff(None).await.unwrap();
    assert!(new_path.exists());
    assert_eq!(session.path(), new_path);

    // The new session starts from the handoff document alone.
    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        pi_protocol::Message::User { content, synthetic, .. } => {
            assert!(synthetic);
            assert!(content[0].as_text().unwrap().contains("finish the parser"));
        }
        other => panic!("expected seeded document, got {other:?}"),
    }
}
