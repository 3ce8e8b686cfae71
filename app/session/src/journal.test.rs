use pi_protocol::UserBlock;
use pretty_assertions::assert_eq;

use super::*;

fn header() -> SessionHeader {
    SessionHeader {
        cwd: "/work".into(),
        system_prompt: "be helpful".into(),
        model_id: "m1".into(),
        provider: "prov".into(),
    }
}

fn journal_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("session.jsonl")
}

#[test]
fn create_writes_session_entry_first() {
    let dir = tempfile::tempdir().unwrap();
    let journal = SessionJournal::create(journal_path(&dir), header()).unwrap();
    assert_eq!(journal.len(), 1);
    assert!(journal.leaf().is_some());
    assert_eq!(journal.header().unwrap().model_id, "m1");

    let content = std::fs::read_to_string(journal_path(&dir)).unwrap();
    let first: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
    assert_eq!(first["type"], "session");
    assert_eq!(first["parent_id"], serde_json::Value::Null);
}

#[test]
fn append_reopen_reconstructs_messages() {
    let dir = tempfile::tempdir().unwrap();
    let mut journal = SessionJournal::create(journal_path(&dir), header()).unwrap();
    let texts = ["one", "two", "three", "four", "five"];
    for text in texts {
        journal.append_message(&Message::user(text)).unwrap();
    }
    journal.sync().unwrap();
    drop(journal);

    let reopened = SessionJournal::open(journal_path(&dir)).unwrap();
    let context = reopened.build_session_context();
    assert_eq!(context.len(), texts.len());
    for (tracked, expected) in context.iter().zip(texts) {
        match &tracked.message {
            Message::User { content, .. } => {
                assert_eq!(content[0].as_text(), Some(expected));
            }
            other => panic!("expected user message, got {other:?}"),
        }
        assert!(tracked.entry_id.is_some());
    }
}

#[test]
fn every_branch_entry_is_reachable_and_parented() {
    let dir = tempfile::tempdir().unwrap();
    let mut journal = SessionJournal::create(journal_path(&dir), header()).unwrap();
    for i in 0..4 {
        journal
            .append_message(&Message::user(format!("m{i}")))
            .unwrap();
    }

    let branch = journal.get_branch();
    assert_eq!(branch.len(), 5); // session + 4 messages
    for window in branch.windows(2) {
        assert_eq!(window[1].parent_id.as_deref(), Some(window[0].id.as_str()));
    }
    assert_eq!(branch[0].parent_id, None);
    // The in-memory map contains every reachable entry.
    for entry in &branch {
        assert!(journal.entry(&entry.id).is_some());
    }
}

#[test]
fn malformed_and_truncated_lines_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = journal_path(&dir);
    let mut journal = SessionJournal::create(&path, header()).unwrap();
    journal.append_message(&Message::user("ok")).unwrap();
    journal.sync().unwrap();
    drop(journal);

    // Simulate junk plus a crash-truncated final record.
    let mut content = std::fs::read_to_string(&path).unwrap();
    content.push_str("not json at all\n");
    content.push_str("{\"id\":\"trunc\",\"parent_id\":null,\"time");
    std::fs::write(&path, content).unwrap();

    let reopened = SessionJournal::open(&path).unwrap();
    assert_eq!(reopened.len(), 2);
    assert_eq!(reopened.build_session_context().len(), 1);
}

#[test]
fn branch_moves_leaf_without_new_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut journal = SessionJournal::create(journal_path(&dir), header()).unwrap();
    let first = journal.append_message(&Message::user("first")).unwrap();
    journal.append_message(&Message::user("second")).unwrap();
    let len_before = journal.len();

    journal.branch(&first).unwrap();
    assert_eq!(journal.leaf(), Some(first.as_str()));
    assert_eq!(journal.len(), len_before);

    // Appending now grows a second branch under `first`.
    let sibling = journal.append_message(&Message::user("alternate")).unwrap();
    assert_eq!(
        journal.entry(&sibling).unwrap().parent_id.as_deref(),
        Some(first.as_str())
    );
    let context = journal.build_session_context();
    assert_eq!(context.len(), 2);
}

#[test]
fn branch_to_unknown_entry_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut journal = SessionJournal::create(journal_path(&dir), header()).unwrap();
    assert!(matches!(
        journal.branch("missing"),
        Err(JournalError::UnknownEntry { .. })
    ));
}

#[test]
fn fork_copies_file_and_artifacts_then_switches() {
    let dir = tempfile::tempdir().unwrap();
    let path = journal_path(&dir);
    let mut journal = SessionJournal::create(&path, header()).unwrap();
    let ids: Vec<String> = (0..3)
        .map(|i| journal.append_message(&Message::user(format!("m{i}"))).unwrap())
        .collect();

    // Artifacts directory S/ next to S.jsonl.
    let artifacts = dir.path().join("session");
    std::fs::create_dir_all(&artifacts).unwrap();
    std::fs::write(artifacts.join("todos.json"), "[]").unwrap();

    let fork_path = dir.path().join("fork.jsonl");
    journal.fork(&fork_path).unwrap();
    assert_eq!(journal.path(), fork_path.as_path());
    assert!(dir.path().join("fork").join("todos.json").is_file());

    // The fork can branch to entry 2 without touching the original.
    journal.branch(&ids[1]).unwrap();
    assert_eq!(journal.get_branch().len(), 3); // session + 2 messages

    let original = SessionJournal::open(&path).unwrap();
    assert_eq!(original.leaf(), Some(ids[2].as_str()));
    assert_eq!(original.get_branch().len(), 4);
}

#[test]
fn compaction_splices_context() {
    let dir = tempfile::tempdir().unwrap();
    let mut journal = SessionJournal::create(journal_path(&dir), header()).unwrap();
    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(journal.append_message(&Message::user(format!("m{i}"))).unwrap());
    }
    journal
        .append_compaction(&CompactionRecord {
            summary: "earlier work".into(),
            short_summary: None,
            first_kept_entry_id: ids[4].clone(),
            tokens_before: 1_000,
            details: Value::Null,
        })
        .unwrap();

    let context = journal.build_session_context();
    // Synthesized summary + m4 + m5.
    assert_eq!(context.len(), 3);
    match &context[0].message {
        Message::User {
            content, synthetic, ..
        } => {
            assert!(synthetic);
            assert!(content[0].as_text().unwrap().contains("earlier work"));
        }
        other => panic!("expected synthesized summary, got {other:?}"),
    }
    match &context[1].message {
        Message::User { content, .. } => assert_eq!(content[0].as_text(), Some("m4")),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn compaction_requires_kept_entry_on_branch() {
    let dir = tempfile::tempdir().unwrap();
    let mut journal = SessionJournal::create(journal_path(&dir), header()).unwrap();
    journal.append_message(&Message::user("m0")).unwrap();
    let result = journal.append_compaction(&CompactionRecord {
        summary: "s".into(),
        short_summary: None,
        first_kept_entry_id: "not-there".into(),
        tokens_before: 0,
        details: Value::Null,
    });
    assert!(matches!(result, Err(JournalError::NotInBranch { .. })));
}

#[test]
fn branch_with_summary_records_abandoned_leaf() {
    let dir = tempfile::tempdir().unwrap();
    let mut journal = SessionJournal::create(journal_path(&dir), header()).unwrap();
    let keep = journal.append_message(&Message::user("keep")).unwrap();
    let abandoned = journal.append_message(&Message::user("abandoned")).unwrap();

    let summary_id = journal
        .branch_with_summary(Some(&keep), &abandoned, "tried something else", None)
        .unwrap();
    assert_eq!(journal.leaf(), Some(summary_id.as_str()));

    let context = journal.build_session_context();
    assert_eq!(context.len(), 2);
    match &context[1].message {
        Message::BranchSummary { summary, from_id, .. } => {
            assert_eq!(summary, "tried something else");
            assert_eq!(from_id, &abandoned);
        }
        other => panic!("expected branch summary, got {other:?}"),
    }
}

#[test]
fn create_branched_session_roots_at_foreign_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut journal = SessionJournal::create(journal_path(&dir), header()).unwrap();
    let anchor = journal.append_message(&Message::user("anchor")).unwrap();

    let child_path = dir.path().join("child.jsonl");
    let child = journal
        .create_branched_session(&child_path, &anchor, header())
        .unwrap();
    let branch = child.get_branch();
    // The chain stops at the foreign parent: only the child's own session
    // entry is local.
    assert_eq!(branch.len(), 1);
    assert_eq!(branch[0].parent_id.as_deref(), Some(anchor.as_str()));
}

#[test]
fn rewrite_preserves_entries_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let path = journal_path(&dir);
    let mut journal = SessionJournal::create(&path, header()).unwrap();
    for i in 0..5 {
        journal.append_message(&Message::user(format!("m{i}"))).unwrap();
    }
    let before: Vec<String> = journal.get_branch().iter().map(|e| e.id.clone()).collect();

    journal.rewrite_entries().unwrap();
    // Appends still work after the rewrite.
    journal.append_message(&Message::user("after")).unwrap();
    journal.sync().unwrap();
    drop(journal);

    let reopened = SessionJournal::open(&path).unwrap();
    let after: Vec<String> = reopened.get_branch().iter().map(|e| e.id.clone()).collect();
    assert_eq!(&after[..before.len()], &before[..]);
    assert_eq!(after.len(), before.len() + 1);
}

#[test]
fn open_without_session_entry_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.jsonl");
    std::fs::write(&path, "{\"id\":\"x\",\"parent_id\":null,\"timestamp\":1,\"type\":\"message\",\"message\":{\"role\":\"user\",\"content\":[],\"timestamp\":1}}\n").unwrap();
    assert!(matches!(
        SessionJournal::open(&path),
        Err(JournalError::NoSession)
    ));
}

#[test]
fn content_hashes_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = journal_path(&dir);
    let mut journal = SessionJournal::create(&path, header()).unwrap();
    let original = Message::User {
        content: vec![
            UserBlock::text("mixed"),
            UserBlock::image("aGVsbG8=", "image/png"),
        ],
        timestamp: 123,
        synthetic: false,
    };
    journal.append_message(&original).unwrap();
    journal.sync().unwrap();
    drop(journal);

    let reopened = SessionJournal::open(&path).unwrap();
    let context = reopened.build_session_context();
    assert_eq!(context[0].message, original);
}
