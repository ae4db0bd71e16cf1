//! Gateway WebSocket protocol types (frames, method params, agent events).

use serde::{Deserialize, Serialize};

/// Wire frame: the three shapes that cross a gateway WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsFrame {
    /// `{ "type": "req", "id", "method", "params" }`
    #[serde(rename = "req")]
    Req(WsRequest),
    /// `{ "type": "res", "id", "ok", "payload" or "error" }`
    #[serde(rename = "res")]
    Res(WsResponse),
    /// `{ "type": "event", "event", "payload", "seq" }`
    #[serde(rename = "event")]
    Event(WsEvent),
}

/// Wire request: a client-initiated method call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Wire response: exactly one per request, ok/payload or error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Wire event: a server push carrying the registry-global sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub seq: u64,
}

impl WsResponse {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error.into()),
        }
    }
}

/// Parse one inbound text frame. Distinguishes malformed JSON from JSON that
/// is not a valid frame so the router can report which one it was.
pub fn parse_frame(raw: &str) -> Result<WsFrame, String> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|_| "Invalid JSON".to_string())?;
    serde_json::from_value(value).map_err(|_| "Invalid frame".to_string())
}

/// Client connect params (auth token, optional client identity).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    #[serde(default)]
    pub auth: ConnectAuth,
    pub client_id: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    pub token: Option<String>,
}

/// Params for method "agent": run one conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunParams {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Override model for this turn.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub thinking_level: Option<String>,
    #[serde(default = "default_true")]
    pub stream: bool,
}

fn default_true() -> bool {
    true
}

/// Params for method "send": append a message to a session without running the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendParams {
    pub session_id: String,
    pub message: String,
    #[serde(default)]
    pub channel: Option<String>,
}

/// Params for method "sessions.history".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsHistoryParams {
    pub session_id: String,
    /// Return only the most recent `limit` messages.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Params for method "sessions.reset".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsResetParams {
    pub session_id: String,
}

/// Params for method "pairing.approve".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingApproveParams {
    pub channel: String,
    pub user_id: String,
}

/// What happened inside an agent run, streamed as "agent" events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventKind {
    Delta,
    ToolCall,
    ToolResult,
    Done,
    Error,
}

/// Token usage reported by the model backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Payload of an "agent" event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub run_id: String,
    #[serde(rename = "type")]
    pub kind: AgentEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl AgentEvent {
    fn base(run_id: impl Into<String>, kind: AgentEventKind) -> Self {
        Self {
            run_id: run_id.into(),
            kind,
            delta: None,
            tool_name: None,
            tool_input: None,
            tool_result: None,
            error: None,
            usage: None,
        }
    }

    pub fn delta(run_id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self {
            delta: Some(delta.into()),
            ..Self::base(run_id, AgentEventKind::Delta)
        }
    }

    pub fn tool_call(
        run_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_input: serde_json::Value,
    ) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            tool_input: Some(tool_input),
            ..Self::base(run_id, AgentEventKind::ToolCall)
        }
    }

    pub fn tool_result(
        run_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_result: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            tool_result: Some(tool_result.into()),
            ..Self::base(run_id, AgentEventKind::ToolResult)
        }
    }

    pub fn done(run_id: impl Into<String>, usage: Option<TokenUsage>) -> Self {
        Self {
            usage,
            ..Self::base(run_id, AgentEventKind::Done)
        }
    }

    pub fn error(run_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::base(run_id, AgentEventKind::Error)
        }
    }
}
