use pretty_assertions::assert_eq;

use super::*;
use crate::hash::line_hash;

fn write_file(dir: &std::path::Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn anchored(line_no: u32, body: &str, sign: &str) -> String {
    format!("{line_no}:{}|{sign}{body}", line_hash(line_no, body))
}

#[test]
fn replaces_single_line() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "f.txt", "alpha\nbeta\ngamma\n");

    let diff = format!(
        "{}\n{}\n+BETA\n",
        anchored(1, "alpha", ""),
        format!("2:{}| -beta", line_hash(2, "beta")),
    );
    let result = preview(
        dir.path(),
        std::path::Path::new("f.txt"),
        EditOp::Update,
        &diff,
        &PatchOptions::default(),
    )
    .unwrap();

    assert_eq!(result.new_content, "alpha\nBETA\ngamma\n");
    assert_eq!(result.counts.replace_line, 1);
    assert_eq!(result.counts.total(), 1);
    // Preview must not write.
    assert_eq!(
        std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
        "alpha\nbeta\ngamma\n"
    );
}

#[test]
fn insert_after_anchor() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "f.txt", "one\ntwo\n");

    let diff = format!("1:{}| +one-and-a-half\n", line_hash(1, "one"));
    let result = preview(
        dir.path(),
        std::path::Path::new("f.txt"),
        EditOp::Update,
        &diff,
        &PatchOptions::default(),
    )
    .unwrap();
    assert_eq!(result.new_content, "one\none-and-a-half\ntwo\n");
    assert_eq!(result.counts.insert_after, 1);
}

#[test]
fn replaces_multiple_lines() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "f.txt", "a\nb\nc\nd\n");

    let diff = format!(
        "2:{}| -b\n3:{}| -c\n+B\n+C\n",
        line_hash(2, "b"),
        line_hash(3, "c"),
    );
    let result = preview(
        dir.path(),
        std::path::Path::new("f.txt"),
        EditOp::Update,
        &diff,
        &PatchOptions::default(),
    )
    .unwrap();
    assert_eq!(result.new_content, "a\nB\nC\nd\n");
    assert_eq!(result.counts.replace_lines, 1);
}

#[test]
fn anchor_mismatch_reports_expected_and_actual() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "f.txt", "line one\nother\n");

    // Hash computed for a body the file no longer contains.
    let diff = format!("2:{}| -old\n", line_hash(2, "old"));
    let err = preview(
        dir.path(),
        std::path::Path::new("f.txt"),
        EditOp::Update,
        &diff,
        &PatchOptions::default(),
    )
    .unwrap_err();

    match err {
        PatchError::AnchorMismatch {
            line_no,
            expected,
            actual,
            preview,
        } => {
            assert_eq!(line_no, 2);
            assert_eq!(expected, "old");
            assert_eq!(actual, "other");
            assert!(preview.contains("-old"));
            assert!(preview.contains("+other"));
        }
        other => panic!("expected AnchorMismatch, got {other:?}"),
    }
}

#[test]
fn no_change_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "f.txt", "a\nb\n");

    // Context only: verifies but changes nothing.
    let diff = format!("1:{}|a\n", line_hash(1, "a"));
    let err = preview(
        dir.path(),
        std::path::Path::new("f.txt"),
        EditOp::Update,
        &diff,
        &PatchOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, PatchError::NoChange));
}

#[test]
fn missing_file_reports_file_missing() {
    let dir = tempfile::tempdir().unwrap();
    let err = preview(
        dir.path(),
        std::path::Path::new("absent.txt"),
        EditOp::Update,
        "-x\n",
        &PatchOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, PatchError::FileMissing { .. }));
}

#[test]
fn fuzzy_recovers_drifted_anchor() {
    let dir = tempfile::tempdir().unwrap();
    // The file drifted: the target line moved down by one and gained a space.
    write_file(dir.path(), "f.txt", "intro\nalpha\nlet x= 1;\nomega\n");

    let diff = format!("2:{}| -let x = 1;\n+let x = 2;\n", line_hash(2, "let x = 1;"));
    let options = PatchOptions {
        fuzzy: FuzzyConfig {
            enabled: true,
            threshold: 2,
        },
    };
    let result = preview(
        dir.path(),
        std::path::Path::new("f.txt"),
        EditOp::Update,
        &diff,
        &options,
    )
    .unwrap();
    assert_eq!(result.new_content, "intro\nalpha\nlet x = 2;\nomega\n");
}

#[test]
fn fuzzy_off_by_default() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "f.txt", "intro\nalpha\nlet x= 1;\nomega\n");

    let diff = format!("2:{}| -let x = 1;\n+let x = 2;\n", line_hash(2, "let x = 1;"));
    let err = preview(
        dir.path(),
        std::path::Path::new("f.txt"),
        EditOp::Update,
        &diff,
        &PatchOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, PatchError::AnchorMismatch { .. }));
}

#[test]
fn fuzzy_ambiguity_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    // Two equally close candidates around the stated anchor.
    write_file(dir.path(), "f.txt", "value = 1\nmiddle\nvalue = 2\n");

    let diff = format!("2:{}| -value = 3\n", line_hash(2, "value = 3"));
    let options = PatchOptions {
        fuzzy: FuzzyConfig {
            enabled: true,
            threshold: 1,
        },
    };
    let err = preview(
        dir.path(),
        std::path::Path::new("f.txt"),
        EditOp::Update,
        &diff,
        &options,
    )
    .unwrap_err();
    match err {
        PatchError::AnchorAmbiguous { line_no, candidates } => {
            assert_eq!(line_no, 2);
            assert_eq!(candidates, vec![1, 3]);
        }
        other => panic!("expected AnchorAmbiguous, got {other:?}"),
    }
}

#[test]
fn create_writes_new_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = apply(
        dir.path(),
        std::path::Path::new("new/nested.txt"),
        EditOp::Create,
        "+first\n+second\n",
        None,
        &PatchOptions::default(),
    )
    .unwrap();
    assert_eq!(result.new_content, "first\nsecond\n");
    assert_eq!(result.counts.insert_after, 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("new/nested.txt")).unwrap(),
        "first\nsecond\n"
    );
    assert!(result.diff_block.contains("+first"));
}

#[test]
fn delete_removes_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "gone.txt", "content\n");
    apply(
        dir.path(),
        std::path::Path::new("gone.txt"),
        EditOp::Delete,
        "",
        None,
        &PatchOptions::default(),
    )
    .unwrap();
    assert!(!path.exists());
}

#[test]
fn rename_moves_content() {
    let dir = tempfile::tempdir().unwrap();
    let old = write_file(dir.path(), "old.txt", "keep me\n");
    apply(
        dir.path(),
        std::path::Path::new("old.txt"),
        EditOp::Rename,
        "",
        Some(std::path::Path::new("new.txt")),
        &PatchOptions::default(),
    )
    .unwrap();
    assert!(!old.exists());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("new.txt")).unwrap(),
        "keep me\n"
    );
}

#[test]
fn apply_matches_preview_and_is_not_rerunnable() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "f.txt", "a\nb\n");
    let diff = format!("1:{}| -a\n+A\n", line_hash(1, "a"));

    let previewed = preview(
        dir.path(),
        std::path::Path::new("f.txt"),
        EditOp::Update,
        &diff,
        &PatchOptions::default(),
    )
    .unwrap();
    let applied = apply(
        dir.path(),
        std::path::Path::new("f.txt"),
        EditOp::Update,
        &diff,
        None,
        &PatchOptions::default(),
    )
    .unwrap();
    assert_eq!(applied.new_content, previewed.new_content);

    // The anchor no longer matches after the first apply.
    let err = apply(
        dir.path(),
        std::path::Path::new("f.txt"),
        EditOp::Update,
        &diff,
        None,
        &PatchOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, PatchError::AnchorMismatch { .. }));
}

#[test]
fn normalizes_crlf_and_bom() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "f.txt", "\u{feff}a\r\nb\r\n");
    let diff = format!("2:{}| -b\n+B\n", line_hash(2, "b"));
    let result = preview(
        dir.path(),
        std::path::Path::new("f.txt"),
        EditOp::Update,
        &diff,
        &PatchOptions::default(),
    )
    .unwrap();
    assert_eq!(result.new_content, "a\nB\n");
}

#[test]
fn check_partial_accepts_matching_removals() {
    let cached = "fn main() {\n    println!(\"hi\");\n}\n";
    let partial = "-    println!(\"hi\");\n+    println!(\"bye\");\n";
    assert_eq!(check_partial(cached, partial), PartialCheck::Ok);
}

#[test]
fn check_partial_flags_unknown_removal() {
    let cached = "fn main() {}\n";
    let partial = "-does not exist\n";
    assert_eq!(
        check_partial(cached, partial),
        PartialCheck::LineNotFound {
            body: "does not exist".to_string()
        }
    );
}

#[test]
fn check_partial_ignores_incomplete_tail() {
    let cached = "alpha\n";
    // The removal line has no terminating newline yet; nothing to check.
    assert_eq!(check_partial(cached, "-alp"), PartialCheck::Ok);
    assert!(!has_change_lines("-alp"));
    assert!(has_change_lines("-alpha\n"));
}

#[test]
fn preserves_missing_trailing_newline() {
    let dir = tempfile::tempdir().unwrap();
    write_file(dir.path(), "f.txt", "a\nb");
    let diff = format!("1:{}| -a\n+A\n", line_hash(1, "a"));
    let result = preview(
        dir.path(),
        std::path::Path::new("f.txt"),
        EditOp::Update,
        &diff,
        &PatchOptions::default(),
    )
    .unwrap();
    assert_eq!(result.new_content, "A\nb");
}

#[test]
fn fuzzy_env_parsing() {
    // Defaults apply when the variables are unset.
    let config = FuzzyConfig::default();
    assert!(!config.enabled);
    assert_eq!(config.threshold, 2);
}
