//! Browser automation tool. The definition is offered to the model; execution
//! delegates to an external automation service over HTTP.

use crate::llm::ToolDefinition;
use crate::tools::Tool;
use serde_json::json;

/// Drives a headless browser through an automation service endpoint.
pub struct BrowserTool {
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl BrowserTool {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint: endpoint
                .map(|e| e.trim_end_matches('/').to_string())
                .filter(|e| !e.is_empty()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for BrowserTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "browser".to_string(),
            description: "Control a web browser: navigate to URLs, click elements, \
                          fill forms, extract page content, take screenshots."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["navigate", "screenshot", "click", "fill", "extract", "close"],
                        "description": "The browser action to perform"
                    },
                    "url": { "type": "string", "description": "URL for navigate" },
                    "selector": { "type": "string", "description": "CSS selector for click/fill/extract" },
                    "value": { "type": "string", "description": "Text to type for fill" }
                },
                "required": ["action"]
            }),
        }
    }

    async fn execute(&self, input: &serde_json::Value) -> Result<String, String> {
        let Some(endpoint) = &self.endpoint else {
            return Err(
                "browser automation is not configured (set agent.browser.endpoint)".to_string(),
            );
        };
        let res = self
            .client
            .post(endpoint)
            .json(input)
            .send()
            .await
            .map_err(|e| format!("browser service request failed: {e}"))?;
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(format!("browser service error: {status} {body}"));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_endpoint_is_an_error() {
        let tool = BrowserTool::new(None);
        let err = tool
            .execute(&json!({"action": "navigate", "url": "https://example.com"}))
            .await
            .unwrap_err();
        assert!(err.contains("not configured"));
    }

    #[test]
    fn definition_lists_actions() {
        let def = BrowserTool::new(None).definition();
        assert_eq!(def.name, "browser");
        let actions = &def.input_schema["properties"]["action"]["enum"];
        assert!(actions.as_array().unwrap().iter().any(|a| a == "navigate"));
    }
}
