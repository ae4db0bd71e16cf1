//! Tool layer: the capability trait the orchestrator executes against, plus
//! the registry of available tools.

mod browser;

pub use browser::BrowserTool;

use crate::llm::ToolDefinition;
use std::collections::HashMap;
use std::sync::Arc;

/// A tool the model may invoke. Execution errors come back as `Err(String)`
/// so the orchestrator can feed them to the model as text.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, input: &serde_json::Value) -> Result<String, String>;
}

/// Tools keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.definition().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".to_string(),
                description: "Echo the input back".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
            }
        }

        async fn execute(&self, input: &serde_json::Value) -> Result<String, String> {
            Ok(input.to_string())
        }
    }

    #[tokio::test]
    async fn registry_lookup_and_definitions() {
        let mut reg = ToolRegistry::new();
        assert!(reg.is_empty());
        reg.register(Arc::new(EchoTool));
        assert!(reg.get("echo").is_some());
        assert!(reg.get("missing").is_none());
        assert_eq!(reg.definitions().len(), 1);

        let out = reg
            .get("echo")
            .unwrap()
            .execute(&serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(out, r#"{"a":1}"#);
    }
}
