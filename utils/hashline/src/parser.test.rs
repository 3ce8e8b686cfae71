use pretty_assertions::assert_eq;

use super::*;
use crate::hash::line_hash;

#[test]
fn parses_anchored_context_remove_add() {
    let h1 = line_hash(1, "alpha");
    let h2 = line_hash(2, "beta");
    let input = format!("1:{h1}|alpha\n2:{h2}| -beta\n2:{h2}| +gamma\n");
    let diff = parse_diff(&input).unwrap();
    assert_eq!(diff.lines.len(), 3);

    assert_eq!(diff.lines[0].kind, ChangeKind::Context);
    assert_eq!(diff.lines[0].body, "alpha");
    assert_eq!(diff.lines[0].anchor.as_ref().unwrap().line_no, 1);

    assert_eq!(diff.lines[1].kind, ChangeKind::Remove);
    assert_eq!(diff.lines[1].body, "beta");

    assert_eq!(diff.lines[2].kind, ChangeKind::Add);
    assert_eq!(diff.lines[2].body, "gamma");
    assert_eq!(diff.change_count(), 2);
}

#[test]
fn parses_bare_unified_lines() {
    let diff = parse_diff("-old line\n+new line\n").unwrap();
    assert_eq!(diff.lines[0].kind, ChangeKind::Remove);
    assert_eq!(diff.lines[0].anchor, None);
    assert_eq!(diff.lines[0].body, "old line");
    assert_eq!(diff.lines[1].kind, ChangeKind::Add);
    assert_eq!(diff.lines[1].body, "new line");
}

#[test]
fn context_body_starting_with_plus_is_not_an_add() {
    let h = line_hash(3, "+x");
    let diff = parse_diff(&format!("3:{h}|+x\n")).unwrap();
    assert_eq!(diff.lines[0].kind, ChangeKind::Context);
    assert_eq!(diff.lines[0].body, "+x");
}

#[test]
fn rejects_garbage_line() {
    let err = parse_diff("not a diff line\n").unwrap_err();
    assert_eq!(err.line_no, 1);
    assert!(err.reason.contains("anchor"));
}

#[test]
fn rejects_bad_hash() {
    let err = parse_diff("3:zzzzzz|body\n").unwrap_err();
    assert_eq!(err.line_no, 1);
    assert!(err.reason.contains("hash"));
}

#[test]
fn rejects_zero_line_number() {
    let err = parse_diff("0:abc123|body\n").unwrap_err();
    assert!(err.reason.contains("1-based"));
}

#[test]
fn rejects_empty_diff() {
    assert!(parse_diff("").is_err());
    assert!(parse_diff("\n  \n").is_err());
}

#[test]
fn skips_blank_lines_and_crlf() {
    let h = line_hash(1, "a");
    let diff = parse_diff(&format!("\n1:{h}| -a\r\n\n+b\n")).unwrap();
    assert_eq!(diff.lines.len(), 2);
    assert_eq!(diff.lines[0].kind, ChangeKind::Remove);
    assert_eq!(diff.lines[1].body, "b");
}

#[test]
fn removed_bodies_in_order() {
    let diff = parse_diff("-one\n+x\n-two\n").unwrap();
    let removed: Vec<&str> = diff.removed_bodies().collect();
    assert_eq!(removed, vec!["one", "two"]);
}

#[test]
fn partial_parse_ignores_trailing_fragment() {
    let h = line_hash(1, "a");
    let partial = format!("1:{h}| -a\n2:4f");
    let diff = parse_partial(&partial);
    assert_eq!(diff.lines.len(), 1);
    assert_eq!(diff.lines[0].kind, ChangeKind::Remove);

    // No newline yet: nothing is complete.
    assert_eq!(parse_partial("1:ab").lines.len(), 0);
}
