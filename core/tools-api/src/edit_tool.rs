//! Built-in file edit tool backed by the hashline patch engine.

use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use pi_hashline::EditOp;
use pi_hashline::FuzzyConfig;
use pi_hashline::PatchOptions;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::tool::ProgressFn;
use crate::tool::Tool;
use crate::tool::ToolError;
use crate::tool::ToolOutput;
use crate::tool::schema_for;

/// Operation requested of the edit tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EditOpArg {
    #[default]
    Update,
    Create,
    Delete,
    Rename,
}

impl From<EditOpArg> for EditOp {
    fn from(op: EditOpArg) -> Self {
        match op {
            EditOpArg::Update => EditOp::Update,
            EditOpArg::Create => EditOp::Create,
            EditOpArg::Delete => EditOp::Delete,
            EditOpArg::Rename => EditOp::Rename,
        }
    }
}

/// Arguments of the `edit` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct EditArgs {
    /// Path of the file, relative to the workspace root.
    pub path: String,
    /// Operation to perform.
    #[serde(default)]
    pub op: EditOpArg,
    /// Hashline diff describing the change. Ignored for `delete` and
    /// optional for `rename`.
    #[serde(default)]
    pub diff: String,
    /// Target path for `rename`.
    #[serde(default)]
    pub rename_to: Option<String>,
}

/// File mutation through line-hash anchored diffs.
///
/// Patch failures (parse errors, stale anchors, no-op diffs) come back as
/// error outputs carrying the engine's diagnostic, preview included, so
/// the model can correct itself on the next turn.
pub struct EditTool {
    workspace_root: PathBuf,
    options: PatchOptions,
}

impl EditTool {
    /// Create an edit tool rooted at the workspace, with fuzzy anchoring
    /// configured from the environment.
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            options: PatchOptions {
                fuzzy: FuzzyConfig::from_env(),
            },
        }
    }

    pub fn with_options(mut self, options: PatchOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Edit a file using a line-hash diff. Anchor lines as N:H|content, \
         remove with `N:H| -content`, insert after an anchor with \
         `N:H| +content`, or use bare +/- lines."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<EditArgs>()
    }

    async fn execute(
        &self,
        _call_id: &str,
        arguments: Value,
        _cancel: CancellationToken,
        _on_progress: ProgressFn<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let args: EditArgs = serde_json::from_value(arguments)
            .map_err(|e| ToolError::new(format!("invalid edit arguments: {e}")))?;
        let result = pi_hashline::apply(
            &self.workspace_root,
            Path::new(&args.path),
            args.op.into(),
            &args.diff,
            args.rename_to.as_deref().map(Path::new),
            &self.options,
        );
        match result {
            Ok(applied) => Ok(ToolOutput::text(applied.diff_block).with_details(json!({
                "counts": applied.counts,
            }))),
            Err(error) => Ok(ToolOutput::error(error.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use pi_hashline::line_hash;
    use pretty_assertions::assert_eq;

    use super::*;

    async fn run(tool: &EditTool, args: Value) -> ToolOutput {
        tool.execute("c1", args, CancellationToken::new(), &|_| {})
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn applies_an_update() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "alpha\nbeta\n").unwrap();
        let tool = EditTool::new(dir.path());

        let diff = format!("1:{}| -alpha\n+ALPHA\n", line_hash(1, "alpha"));
        let output = run(&tool, json!({"path": "f.txt", "diff": diff})).await;
        assert!(!output.is_error);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "ALPHA\nbeta\n"
        );
        assert_eq!(output.details["counts"]["replace_line"], 1);
    }

    #[tokio::test]
    async fn stale_anchor_reports_mismatch_with_preview() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "line one\nother\n").unwrap();
        let tool = EditTool::new(dir.path());

        let diff = format!("2:{}| -old\n+new\n", line_hash(2, "old"));
        let output = run(&tool, json!({"path": "f.txt", "diff": diff})).await;
        assert!(output.is_error);
        let text = output.content[0].as_text().unwrap();
        assert!(text.contains("anchor mismatch at line 2"), "{text}");
        assert!(text.contains("expected \"old\""), "{text}");
        // The preview block shows the actual line for self-correction.
        assert!(text.contains("+other"), "{text}");
    }

    #[tokio::test]
    async fn create_and_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tool = EditTool::new(dir.path());

        let output = run(
            &tool,
            json!({"path": "new.txt", "op": "create", "diff": "+hello\n"}),
        )
        .await;
        assert!(!output.is_error);
        assert!(dir.path().join("new.txt").is_file());

        let output = run(&tool, json!({"path": "new.txt", "op": "delete"})).await;
        assert!(!output.is_error, "{:?}", output.content);
        assert!(!dir.path().join("new.txt").exists());
    }

    #[test]
    fn schema_declares_required_path() {
        let tool = EditTool::new(".");
        let schema = tool.parameters_schema();
        let required: Vec<&str> = schema["required"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        assert!(required.contains(&"path"));
    }
}
