//! Model backend abstraction and the Ollama implementation.
//!
//! The orchestrator talks to a [`ModelBackend`] and never to a provider API
//! directly; errors cross the seam as [`ModelError`], never panics.

mod ollama;

use crate::gateway::protocol::TokenUsage;
use serde::{Deserialize, Serialize};

pub use ollama::OllamaBackend;

/// One message in the conversation sent to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    /// When role is "tool", which call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
        }
    }
}

/// Tool surface offered to the model for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool input.
    pub input_schema: serde_json::Value,
}

/// One complete request to the backend.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

/// What a streaming backend reports while answering.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    /// Incremental assistant text.
    Delta(String),
    /// The model wants a tool executed.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The model finished this round.
    Done { usage: Option<TokenUsage> },
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model api error: {0}")]
    Api(String),
}

/// A streaming chat-completion provider.
#[async_trait::async_trait]
pub trait ModelBackend: Send + Sync {
    /// Run one request, invoking `on_event` for every delta, tool call, and
    /// the terminal done. Must emit `Done` exactly once on the Ok path.
    async fn stream(
        &self,
        request: ModelRequest,
        on_event: &mut (dyn FnMut(ModelEvent) + Send),
    ) -> Result<(), ModelError>;
}
