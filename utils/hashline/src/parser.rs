//! Parsing of hashline diffs.

use serde::Deserialize;
use serde::Serialize;

/// What a diff line does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// The line must still match; nothing changes.
    Context,
    /// Remove the addressed line.
    Remove,
    /// Insert new text (after the anchor, or at the current position).
    Add,
}

/// A `(line number, short hash)` anchor into the original file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    /// 1-based line number in the original file.
    pub line_no: u32,
    /// Six hex digits from [`crate::line_hash`].
    pub hash: String,
}

/// One parsed directive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffLine {
    pub kind: ChangeKind,
    /// Present for anchored directives, absent for bare `+`/`-` lines.
    pub anchor: Option<Anchor>,
    pub body: String,
}

/// A parsed hashline diff.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HashlineDiff {
    pub lines: Vec<DiffLine>,
}

impl HashlineDiff {
    /// Number of directives that mutate the file.
    pub fn change_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| l.kind != ChangeKind::Context)
            .count()
    }

    /// Bodies of every removal directive, in order.
    pub fn removed_bodies(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|l| l.kind == ChangeKind::Remove)
            .map(|l| l.body.as_str())
    }
}

/// The diff text could not be parsed.
///
/// Parsing never touches the target file; a parse failure reports the
/// offending diff line and the reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("diff line {line_no}: {reason}")]
pub struct ParseError {
    /// 1-based line number within the diff text.
    pub line_no: usize,
    pub reason: String,
}

impl ParseError {
    fn new(line_no: usize, reason: impl Into<String>) -> Self {
        Self {
            line_no,
            reason: reason.into(),
        }
    }
}

/// Parse a complete hashline diff.
pub fn parse_diff(input: &str) -> Result<HashlineDiff, ParseError> {
    let mut diff = HashlineDiff::default();
    for (i, raw) in input.lines().enumerate() {
        let line_no = i + 1;
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.trim().is_empty() {
            continue;
        }
        diff.lines.push(parse_line(line_no, line)?);
    }
    if diff.lines.is_empty() {
        return Err(ParseError::new(1, "empty diff"));
    }
    Ok(diff)
}

/// Parse the complete lines of a still-streaming diff, ignoring a trailing
/// partial line and any line that does not parse yet.
pub(crate) fn parse_partial(input: &str) -> HashlineDiff {
    let mut diff = HashlineDiff::default();
    let complete = match input.rfind('\n') {
        Some(pos) => &input[..pos],
        None => return diff,
    };
    for (i, raw) in complete.lines().enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(parsed) = parse_line(i + 1, line) {
            diff.lines.push(parsed);
        }
    }
    diff
}

fn parse_line(line_no: usize, line: &str) -> Result<DiffLine, ParseError> {
    if let Some(body) = line.strip_prefix('+') {
        return Ok(DiffLine {
            kind: ChangeKind::Add,
            anchor: None,
            body: body.to_string(),
        });
    }
    if let Some(body) = line.strip_prefix('-') {
        return Ok(DiffLine {
            kind: ChangeKind::Remove,
            anchor: None,
            body: body.to_string(),
        });
    }

    let Some(colon) = line.find(':') else {
        return Err(ParseError::new(
            line_no,
            "expected N:H| anchor or +/- prefix",
        ));
    };
    let number = &line[..colon];
    let anchor_line: u32 = number
        .parse()
        .map_err(|_| ParseError::new(line_no, format!("invalid line number {number:?}")))?;
    if anchor_line == 0 {
        return Err(ParseError::new(line_no, "line numbers are 1-based"));
    }

    let rest = &line[colon + 1..];
    let Some(pipe) = rest.find('|') else {
        return Err(ParseError::new(line_no, "missing '|' after anchor hash"));
    };
    let hash = &rest[..pipe];
    if hash.len() != 6 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ParseError::new(
            line_no,
            format!("invalid anchor hash {hash:?} (want 6 hex digits)"),
        ));
    }

    let payload = &rest[pipe + 1..];
    let anchor = Some(Anchor {
        line_no: anchor_line,
        hash: hash.to_ascii_lowercase(),
    });

    // Signs are only recognised after a separating space (`| +body`);
    // a context body follows the pipe verbatim, so code that itself starts
    // with '+' or '-' stays unambiguous.
    if let Some(body) = payload.strip_prefix(" +") {
        Ok(DiffLine {
            kind: ChangeKind::Add,
            anchor,
            body: body.to_string(),
        })
    } else if let Some(body) = payload.strip_prefix(" -") {
        Ok(DiffLine {
            kind: ChangeKind::Remove,
            anchor,
            body: body.to_string(),
        })
    } else {
        Ok(DiffLine {
            kind: ChangeKind::Context,
            anchor,
            body: payload.to_string(),
        })
    }
}

#[cfg(test)]
#[path = "parser.test.rs"]
mod tests;
