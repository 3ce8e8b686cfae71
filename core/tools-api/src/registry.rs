//! Registry of tools available to the loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use pi_inference::ToolDescriptor;

use crate::tool::Tool;

/// Name-indexed set of tools. Iteration order is stable (sorted by name).
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A later registration with the same name replaces
    /// the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors for every registered tool, for the model request.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters_schema: t.parameters_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::tool::ProgressFn;
    use crate::tool::ToolError;
    use crate::tool::ToolOutput;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }
        async fn execute(
            &self,
            _call_id: &str,
            arguments: Value,
            _cancel: CancellationToken,
            _on_progress: ProgressFn<'_>,
        ) -> Result<ToolOutput, ToolError> {
            let text = arguments["text"].as_str().unwrap_or_default();
            Ok(ToolOutput::text(text))
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn descriptors_expose_schema() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "echo");
        assert_eq!(descriptors[0].parameters_schema["type"], "object");
    }

    #[tokio::test]
    async fn execute_through_registry() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let tool = registry.get("echo").unwrap();
        let out = tool
            .execute(
                "c1",
                json!({"text": "hi"}),
                CancellationToken::new(),
                &|_| {},
            )
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(out.content[0].as_text(), Some("hi"));
    }
}
