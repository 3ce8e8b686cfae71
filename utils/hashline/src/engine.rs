//! Preview and apply of hashline diffs against the filesystem.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use similar::TextDiff;
use tracing::debug;

use crate::hash::line_hash;
use crate::parser::Anchor;
use crate::parser::ChangeKind;
use crate::parser::HashlineDiff;
use crate::parser::ParseError;
use crate::parser::parse_diff;
use crate::parser::parse_partial;

/// How far fuzzy anchoring searches around the stated line.
const FUZZY_WINDOW: usize = 8;

/// File operation requested by an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOp {
    Update,
    Create,
    Delete,
    Rename,
}

/// Fuzzy anchoring configuration.
///
/// Off by default; `from_env` reads `PI_EDIT_FUZZY` and
/// `PI_EDIT_FUZZY_THRESHOLD` at the engine's edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuzzyConfig {
    pub enabled: bool,
    /// Maximum Levenshtein distance between trimmed bodies.
    pub threshold: usize,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 2,
        }
    }
}

impl FuzzyConfig {
    pub fn from_env() -> Self {
        let enabled = matches!(std::env::var("PI_EDIT_FUZZY").as_deref(), Ok("1"));
        let threshold = match std::env::var("PI_EDIT_FUZZY_THRESHOLD").as_deref() {
            Ok("auto") | Err(_) => Self::default().threshold,
            Ok(value) => value.parse().unwrap_or(Self::default().threshold),
        };
        Self { enabled, threshold }
    }
}

/// Options for preview and apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchOptions {
    pub fuzzy: FuzzyConfig,
}

/// Per-edit subtype counts, for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EditCounts {
    pub replace_line: usize,
    pub replace_lines: usize,
    pub insert_after: usize,
}

impl EditCounts {
    pub fn total(&self) -> usize {
        self.replace_line + self.replace_lines + self.insert_after
    }
}

/// Result of a successful preview. Nothing has been written.
#[derive(Debug, Clone)]
pub struct Preview {
    /// Absolute path of the edited file.
    pub path: PathBuf,
    pub old_content: String,
    pub new_content: String,
    pub counts: EditCounts,
}

/// Result of a successful apply.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    /// Human-readable unified diff of the change.
    pub diff_block: String,
    pub new_content: String,
    pub counts: EditCounts,
}

/// Why a preview or apply failed.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// An anchored or removed line no longer matches the file.
    ///
    /// `preview` holds a small diff of expected vs. actual content so the
    /// producer can correct itself.
    #[error("anchor mismatch at line {line_no}: expected {expected:?}, found {actual:?}\n{preview}")]
    AnchorMismatch {
        line_no: usize,
        expected: String,
        actual: String,
        preview: String,
    },
    /// Fuzzy anchoring found more than one equally close line.
    #[error("ambiguous anchor near line {line_no}: candidate lines {candidates:?}")]
    AnchorAmbiguous {
        line_no: usize,
        candidates: Vec<usize>,
    },
    /// Anchors must address strictly increasing file positions.
    #[error("anchors out of order at file line {line_no}")]
    OutOfOrder { line_no: usize },
    #[error("patch produced no change")]
    NoChange,
    #[error("file not found: {path}")]
    FileMissing { path: PathBuf },
    #[error("rename requires a target path")]
    RenameTargetMissing,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Preview an edit without writing anything.
pub fn preview(
    root: &Path,
    path: &Path,
    op: EditOp,
    diff_text: &str,
    options: &PatchOptions,
) -> Result<Preview, PatchError> {
    let abs = resolve(root, path);
    match op {
        EditOp::Create => {
            let diff = parse_diff(diff_text)?;
            let (new_content, counts) = apply_to_content("", &diff, options)?;
            Ok(Preview {
                path: abs,
                old_content: String::new(),
                new_content,
                counts,
            })
        }
        EditOp::Delete => {
            let old_content = read_normalized(&abs)?;
            Ok(Preview {
                path: abs,
                old_content,
                new_content: String::new(),
                counts: EditCounts::default(),
            })
        }
        EditOp::Update | EditOp::Rename => {
            let old_content = read_normalized(&abs)?;
            // A rename with no diff body moves the file unchanged.
            if op == EditOp::Rename && diff_text.trim().is_empty() {
                return Ok(Preview {
                    new_content: old_content.clone(),
                    path: abs,
                    old_content,
                    counts: EditCounts::default(),
                });
            }
            let diff = parse_diff(diff_text)?;
            let (new_content, counts) = apply_to_content(&old_content, &diff, options)?;
            Ok(Preview {
                path: abs,
                old_content,
                new_content,
                counts,
            })
        }
    }
}

/// Preview, then write the result atomically (temp file + rename).
pub fn apply(
    root: &Path,
    path: &Path,
    op: EditOp,
    diff_text: &str,
    rename_to: Option<&Path>,
    options: &PatchOptions,
) -> Result<ApplyResult, PatchError> {
    let previewed = preview(root, path, op, diff_text, options)?;
    match op {
        EditOp::Delete => {
            fs::remove_file(&previewed.path)?;
        }
        EditOp::Rename => {
            let target = resolve(root, rename_to.ok_or(PatchError::RenameTargetMissing)?);
            write_atomic(&target, &previewed.new_content)?;
            fs::remove_file(&previewed.path)?;
        }
        EditOp::Update | EditOp::Create => {
            write_atomic(&previewed.path, &previewed.new_content)?;
        }
    }
    debug!(
        path = %previewed.path.display(),
        op = ?op,
        edits = previewed.counts.total(),
        "applied patch"
    );
    Ok(ApplyResult {
        diff_block: unified_diff(&previewed.old_content, &previewed.new_content),
        new_content: previewed.new_content,
        counts: previewed.counts,
    })
}

/// Outcome of a streaming partial check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialCheck {
    /// Nothing contradicts the cached content so far.
    Ok,
    /// A removal body does not exist in the cached content; the edit is
    /// already known to fail.
    LineNotFound { body: String },
}

/// Test a still-streaming diff against cached file content.
///
/// Only complete removal lines are checked, by trimmed containment; a
/// negative result lets the caller abort the stream before the tool call
/// finishes.
pub fn check_partial(cached_content: &str, partial_diff: &str) -> PartialCheck {
    let diff = parse_partial(partial_diff);
    if diff.lines.is_empty() {
        return PartialCheck::Ok;
    }
    let normalized = normalize(cached_content);
    let lines: Vec<&str> = normalized.lines().map(str::trim).collect();
    for body in diff.removed_bodies() {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !lines.contains(&trimmed) {
            return PartialCheck::LineNotFound {
                body: body.to_string(),
            };
        }
    }
    PartialCheck::Ok
}

/// Whether a partial diff already carries change lines worth checking.
pub fn has_change_lines(partial_diff: &str) -> bool {
    parse_partial(partial_diff).change_count() > 0
}

// ============================================================================
// Content machinery
// ============================================================================

fn normalize(content: &str) -> String {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    content.replace("\r\n", "\n")
}

fn read_normalized(path: &Path) -> Result<String, PatchError> {
    if !path.is_file() {
        return Err(PatchError::FileMissing {
            path: path.to_path_buf(),
        });
    }
    Ok(normalize(&fs::read_to_string(path)?))
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn apply_to_content(
    original: &str,
    diff: &HashlineDiff,
    options: &PatchOptions,
) -> Result<(String, EditCounts), PatchError> {
    let had_trailing_newline = original.ends_with('\n');
    let lines: Vec<&str> = original.lines().collect();

    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut cursor: usize = 0;
    let mut counts = EditCounts::default();
    let mut group = GroupTracker::default();

    for directive in &diff.lines {
        match directive.kind {
            ChangeKind::Context => {
                let anchor = directive
                    .anchor
                    .as_ref()
                    .ok_or_else(|| ParseError {
                        line_no: 0,
                        reason: "context line without anchor".to_string(),
                    })?;
                let idx = resolve_anchor(&lines, anchor, &directive.body, options)?;
                if idx + 1 == cursor {
                    // Restates the line just consumed; nothing to do.
                } else if idx >= cursor {
                    group.flush(&mut counts);
                    out.extend(lines[cursor..=idx].iter().map(|s| (*s).to_string()));
                    cursor = idx + 1;
                } else {
                    return Err(PatchError::OutOfOrder {
                        line_no: anchor.line_no as usize,
                    });
                }
                group.flush(&mut counts);
            }
            ChangeKind::Remove => {
                let idx = match &directive.anchor {
                    Some(anchor) => {
                        let idx = resolve_anchor(&lines, anchor, &directive.body, options)?;
                        if idx < cursor {
                            return Err(PatchError::OutOfOrder {
                                line_no: anchor.line_no as usize,
                            });
                        }
                        idx
                    }
                    None => seek_body(&lines, cursor, &directive.body).ok_or_else(|| {
                        mismatch(cursor + 1, &directive.body, lines.get(cursor).copied())
                    })?,
                };
                if idx > cursor {
                    group.flush(&mut counts);
                }
                out.extend(lines[cursor..idx].iter().map(|s| (*s).to_string()));
                cursor = idx + 1;
                group.removes += 1;
            }
            ChangeKind::Add => {
                match &directive.anchor {
                    Some(anchor) => {
                        let idx = (anchor.line_no - 1) as usize;
                        verify_hash(&lines, anchor)?;
                        if idx + 1 == cursor {
                            // Anchor already consumed; append right here.
                        } else if idx >= cursor {
                            group.flush(&mut counts);
                            out.extend(lines[cursor..=idx].iter().map(|s| (*s).to_string()));
                            cursor = idx + 1;
                        } else {
                            return Err(PatchError::OutOfOrder {
                                line_no: anchor.line_no as usize,
                            });
                        }
                    }
                    None => {}
                }
                out.push(directive.body.clone());
                group.adds += 1;
            }
        }
    }
    group.flush(&mut counts);

    out.extend(lines[cursor..].iter().map(|s| (*s).to_string()));

    let mut new_content = out.join("\n");
    if (had_trailing_newline || original.is_empty()) && !new_content.is_empty() {
        new_content.push('\n');
    }
    if new_content == original {
        return Err(PatchError::NoChange);
    }
    Ok((new_content, counts))
}

/// Tracks one contiguous run of change directives for subtype counting.
#[derive(Debug, Default)]
struct GroupTracker {
    removes: usize,
    adds: usize,
}

impl GroupTracker {
    fn flush(&mut self, counts: &mut EditCounts) {
        match (self.removes, self.adds) {
            (0, 0) => {}
            (0, _) => counts.insert_after += 1,
            (1, _) => counts.replace_line += 1,
            (_, _) => counts.replace_lines += 1,
        }
        self.removes = 0;
        self.adds = 0;
    }
}

/// Find the file index for a body-carrying anchored directive.
///
/// Exact match first (verbatim, then trailing-whitespace-insensitive, then
/// the recorded hash); fuzzy anchoring within `FUZZY_WINDOW` lines when
/// enabled.
fn resolve_anchor(
    lines: &[&str],
    anchor: &Anchor,
    body: &str,
    options: &PatchOptions,
) -> Result<usize, PatchError> {
    let idx = (anchor.line_no - 1) as usize;
    if let Some(file_line) = lines.get(idx) {
        if *file_line == body
            || file_line.trim_end() == body.trim_end()
            || line_hash(anchor.line_no, file_line) == anchor.hash
        {
            return Ok(idx);
        }
    }

    if !options.fuzzy.enabled {
        return Err(mismatch(
            anchor.line_no as usize,
            body,
            lines.get(idx).copied(),
        ));
    }

    let lo = idx.saturating_sub(FUZZY_WINDOW);
    let hi = (idx + FUZZY_WINDOW).min(lines.len().saturating_sub(1));
    let wanted = body.trim();
    let mut best_distance = usize::MAX;
    let mut candidates: Vec<usize> = Vec::new();
    for (i, line) in lines.iter().enumerate().take(hi + 1).skip(lo) {
        let distance = strsim::levenshtein(line.trim(), wanted);
        if distance > options.fuzzy.threshold {
            continue;
        }
        match distance.cmp(&best_distance) {
            std::cmp::Ordering::Less => {
                best_distance = distance;
                candidates = vec![i];
            }
            std::cmp::Ordering::Equal => candidates.push(i),
            std::cmp::Ordering::Greater => {}
        }
    }
    match candidates.len() {
        0 => Err(mismatch(
            anchor.line_no as usize,
            body,
            lines.get(idx).copied(),
        )),
        1 => Ok(candidates[0]),
        _ => Err(PatchError::AnchorAmbiguous {
            line_no: anchor.line_no as usize,
            candidates: candidates.iter().map(|i| i + 1).collect(),
        }),
    }
}

/// Verify an insert-after anchor, which carries no expected body: the hash
/// must match the file's current line.
fn verify_hash(lines: &[&str], anchor: &Anchor) -> Result<(), PatchError> {
    let idx = (anchor.line_no - 1) as usize;
    match lines.get(idx) {
        Some(file_line) if line_hash(anchor.line_no, file_line) == anchor.hash => Ok(()),
        other => Err(mismatch(
            anchor.line_no as usize,
            &format!("line with hash {}", anchor.hash),
            other.copied(),
        )),
    }
}

/// Forward search for an unanchored removal body: verbatim first, then
/// whitespace-trimmed.
fn seek_body(lines: &[&str], start: usize, body: &str) -> Option<usize> {
    let rest = lines.get(start..)?;
    if let Some(offset) = rest.iter().position(|l| *l == body) {
        return Some(start + offset);
    }
    let wanted = body.trim();
    rest.iter()
        .position(|l| l.trim() == wanted)
        .map(|offset| start + offset)
}

fn mismatch(line_no: usize, expected: &str, actual: Option<&str>) -> PatchError {
    let actual = actual.unwrap_or("<end of file>").to_string();
    let preview = unified_diff(&format!("{expected}\n"), &format!("{actual}\n"));
    PatchError::AnchorMismatch {
        line_no,
        expected: expected.to_string(),
        actual,
        preview,
    }
}

fn unified_diff(old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header("before", "after")
        .to_string()
}

fn write_atomic(path: &Path, content: &str) -> Result<(), PatchError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| PatchError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
#[path = "engine.test.rs"]
mod tests;
