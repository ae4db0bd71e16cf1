//! Ollama chat backend (http://127.0.0.1:11434 by default).
//! Streams /api/chat NDJSON and maps chunks onto [`ModelEvent`]s.

use crate::gateway::protocol::TokenUsage;
use crate::llm::{ChatMessage, ModelBackend, ModelError, ModelEvent, ModelRequest, ToolDefinition};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

/// Backend speaking Ollama's chat API.
#[derive(Clone)]
pub struct OllamaBackend {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl ModelBackend for OllamaBackend {
    async fn stream(
        &self,
        request: ModelRequest,
        on_event: &mut (dyn FnMut(ModelEvent) + Send),
    ) -> Result<(), ModelError> {
        let url = format!("{}/api/chat", self.base_url);

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(OllamaMessage {
                role: "system".to_string(),
                content: request.system_prompt.clone(),
                tool_calls: None,
                tool_name: None,
            });
        }
        messages.extend(request.messages.iter().map(to_ollama_message));

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(to_ollama_tool).collect())
        };

        let body = ChatRequest {
            model: request.model.clone(),
            messages,
            stream: true,
            tools,
            options: ChatOptions {
                num_predict: request.max_tokens,
            },
        };

        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ModelError::Api(format!("{} {}", status, body)));
        }

        let mut stream = res.bytes_stream();
        let mut buffer = Vec::new();
        let mut saw_done = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(ModelError::Request)?;
            buffer.extend_from_slice(&chunk);
            while let Some(i) = buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = buffer.drain(..i).collect();
                buffer.drain(..1);
                let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let event: ChatStreamEvent = match serde_json::from_str(&line) {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                if let Some(msg) = event.message {
                    if !msg.content.is_empty() {
                        on_event(ModelEvent::Delta(msg.content));
                    }
                    for call in msg.tool_calls.unwrap_or_default() {
                        on_event(ModelEvent::ToolCall {
                            id: format!("call_{}", uuid::Uuid::new_v4()),
                            name: call.function.name,
                            input: normalize_arguments(call.function.arguments),
                        });
                    }
                }
                if event.done {
                    saw_done = true;
                    let usage = match (event.prompt_eval_count, event.eval_count) {
                        (None, None) => None,
                        (input, output) => Some(TokenUsage {
                            input_tokens: input.unwrap_or(0),
                            output_tokens: output.unwrap_or(0),
                        }),
                    };
                    on_event(ModelEvent::Done { usage });
                }
            }
        }
        if !saw_done {
            on_event(ModelEvent::Done { usage: None });
        }
        Ok(())
    }
}

fn to_ollama_message(m: &ChatMessage) -> OllamaMessage {
    OllamaMessage {
        role: m.role.clone(),
        content: m.content.clone(),
        tool_calls: None,
        tool_name: m.tool_name.clone(),
    }
}

fn to_ollama_tool(t: &ToolDefinition) -> OllamaToolDefinition {
    OllamaToolDefinition {
        typ: "function".to_string(),
        function: OllamaFunctionDefinition {
            name: t.name.clone(),
            description: Some(t.description.clone()),
            parameters: t.input_schema.clone(),
        },
    }
}

/// Some models send arguments as a JSON string rather than an object.
fn normalize_arguments(args: serde_json::Value) -> serde_json::Value {
    match args {
        serde_json::Value::String(s) => {
            serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s))
        }
        other => other,
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OllamaToolDefinition>>,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    num_predict: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaToolCall {
    #[serde(rename = "type", default)]
    typ: String,
    function: OllamaToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaToolCallFunction {
    name: String,
    /// JSON object or string, model-dependent.
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
struct OllamaToolDefinition {
    #[serde(rename = "type")]
    typ: String,
    function: OllamaFunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
struct OllamaFunctionDefinition {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatStreamEvent {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_string_arguments() {
        let args = serde_json::Value::String(r#"{"url":"https://example.com"}"#.to_string());
        let v = normalize_arguments(args);
        assert_eq!(v["url"], "https://example.com");

        let plain = serde_json::Value::String("not json".to_string());
        assert_eq!(normalize_arguments(plain), serde_json::json!("not json"));
    }

    #[test]
    fn parses_stream_event_with_usage() {
        let line = r#"{"message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":12,"eval_count":34}"#;
        let ev: ChatStreamEvent = serde_json::from_str(line).unwrap();
        assert!(ev.done);
        assert_eq!(ev.prompt_eval_count, Some(12));
        assert_eq!(ev.eval_count, Some(34));
    }
}
