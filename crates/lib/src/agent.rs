//! Agent turn orchestration: drive the model backend through up to ten
//! tool-calling rounds, streaming progress as events and persisting the final
//! answer to the session.

use crate::gateway::protocol::{AgentEvent, TokenUsage};
use crate::gateway::store::{MessageExtra, Role, SessionStore};
use crate::llm::{ChatMessage, ModelBackend, ModelEvent, ModelRequest};
use crate::tools::ToolRegistry;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Rounds per turn: one initial model call plus re-calls after tool results.
const MAX_TURN_ROUNDS: usize = 10;

const PERSONA: &str = "You are Harbor, a helpful personal AI assistant. \
You are concise, accurate, and proactive.";

/// One turn request.
#[derive(Debug, Clone)]
pub struct AgentRunOptions {
    pub run_id: String,
    pub message: String,
    pub session_id: Option<String>,
    pub model: Option<String>,
}

/// Where a run's events go. The receiving side forwards them to whoever is
/// listening (WebSocket client, channel connector, CLI).
pub type EventSink = UnboundedSender<AgentEvent>;

/// Runs one conversational turn. The gateway picks an implementation at
/// startup based on whether a model is configured.
#[async_trait::async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, opts: AgentRunOptions, events: EventSink) -> Result<()>;
}

/// Fallback runner used when no model backend is configured.
pub struct StubAgentRunner;

#[async_trait::async_trait]
impl AgentRunner for StubAgentRunner {
    async fn run(&self, opts: AgentRunOptions, events: EventSink) -> Result<()> {
        let _ = events.send(AgentEvent::delta(
            &opts.run_id,
            "Agent not configured. Set agent.model in ~/.harbor/config.json.",
        ));
        let _ = events.send(AgentEvent::done(&opts.run_id, None));
        Ok(())
    }
}

/// The real orchestrator: session-backed multi-round tool loop over a
/// [`ModelBackend`].
pub struct TurnRunner {
    backend: Arc<dyn ModelBackend>,
    tools: ToolRegistry,
    sessions: Arc<SessionStore>,
    /// Skills appendix appended to the persona, rendered once at startup.
    skills_appendix: String,
    default_model: String,
    max_tokens: u32,
}

impl TurnRunner {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        tools: ToolRegistry,
        sessions: Arc<SessionStore>,
        skills_appendix: String,
        default_model: String,
        max_tokens: u32,
    ) -> Self {
        Self {
            backend,
            tools,
            sessions,
            skills_appendix,
            default_model,
            max_tokens,
        }
    }

    fn system_prompt(&self) -> String {
        format!("{}{}", PERSONA, self.skills_appendix)
    }
}

/// What one model round produced.
struct RoundOutcome {
    text: String,
    tool_call: Option<(String, String, serde_json::Value)>,
    usage: Option<TokenUsage>,
}

#[async_trait::async_trait]
impl AgentRunner for TurnRunner {
    async fn run(&self, opts: AgentRunOptions, events: EventSink) -> Result<()> {
        let session_id = opts
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let session = self
            .sessions
            .get_or_create(&session_id)
            .await
            .context("creating session")?;
        self.sessions
            .add_message(&session.id, Role::User, &opts.message, MessageExtra::default())
            .await
            .context("persisting user message")?;

        let model = opts
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.default_model.clone());
        log::info!("agent run {} using model {}", opts.run_id, model);

        // Working copy for the loop: persisted history plus this turn's tool
        // rounds. Tool rounds never reach the store.
        let session = self
            .sessions
            .get(&session.id)
            .await
            .context("reloading session")?;
        let mut messages: Vec<ChatMessage> = session
            .messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .map(|m| {
                ChatMessage::new(
                    match m.role {
                        Role::User => "user",
                        _ => "assistant",
                    },
                    &m.content,
                )
            })
            .collect();

        let tool_definitions = self.tools.definitions();
        let mut final_text = String::new();
        let mut last_usage: Option<TokenUsage> = None;

        for round in 0..MAX_TURN_ROUNDS {
            let request = ModelRequest {
                model: model.clone(),
                system_prompt: self.system_prompt(),
                messages: messages.clone(),
                tools: tool_definitions.clone(),
                max_tokens: self.max_tokens,
            };

            let run_id = opts.run_id.clone();
            let sink = events.clone();
            let mut text = String::new();
            let mut tool_call: Option<(String, String, serde_json::Value)> = None;
            let mut usage: Option<TokenUsage> = None;
            {
                let mut on_event = |ev: ModelEvent| match ev {
                    ModelEvent::Delta(delta) => {
                        text.push_str(&delta);
                        let _ = sink.send(AgentEvent::delta(&run_id, delta));
                    }
                    ModelEvent::ToolCall { id, name, input } => {
                        // only the first announcement per round is honored
                        if tool_call.is_none() {
                            tool_call = Some((id, name, input));
                        }
                    }
                    ModelEvent::Done { usage: u } => {
                        if u.is_some() {
                            usage = u;
                        }
                    }
                };
                self.backend
                    .stream(request, &mut on_event)
                    .await
                    .with_context(|| format!("model round {round}"))?;
            }
            let outcome = RoundOutcome { text, tool_call, usage };

            if outcome.usage.is_some() {
                last_usage = outcome.usage;
            }

            let Some((call_id, name, input)) = outcome.tool_call else {
                final_text = outcome.text;
                break;
            };

            let _ = events.send(AgentEvent::tool_call(&opts.run_id, &name, input.clone()));
            let result = match self.tools.get(&name) {
                Some(tool) => match tool.execute(&input).await {
                    Ok(out) => out,
                    Err(e) => {
                        log::warn!("tool {} failed: {}", name, e);
                        format!("Tool error: {e}")
                    }
                },
                None => format!("Unknown tool: {name}"),
            };
            let _ = events.send(AgentEvent::tool_result(&opts.run_id, &name, &result));

            // tool-round text stays on the working copy only; nothing is
            // persisted unless a round completes without a tool call
            messages.push(ChatMessage::new("assistant", &outcome.text));
            messages.push(ChatMessage::tool_result(call_id, name, result));
        }

        if !final_text.is_empty() {
            self.sessions
                .add_message(
                    &session.id,
                    Role::Assistant,
                    &final_text,
                    MessageExtra::default(),
                )
                .await
                .context("persisting assistant message")?;
        }

        let _ = events.send(AgentEvent::done(&opts.run_id, last_usage));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::protocol::AgentEventKind;
    use crate::llm::{ModelError, ModelRequest};
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Backend that replays a script: one Vec<ModelEvent> per round.
    struct ScriptedBackend {
        rounds: Mutex<Vec<Vec<ModelEvent>>>,
        /// Requests seen, for asserting what the orchestrator sent.
        requests: Mutex<Vec<ModelRequest>>,
    }

    impl ScriptedBackend {
        fn new(rounds: Vec<Vec<ModelEvent>>) -> Self {
            Self {
                rounds: Mutex::new(rounds),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ModelBackend for ScriptedBackend {
        async fn stream(
            &self,
            request: ModelRequest,
            on_event: &mut (dyn FnMut(ModelEvent) + Send),
        ) -> Result<(), ModelError> {
            self.requests.lock().unwrap().push(request);
            let mut rounds = self.rounds.lock().unwrap();
            let round = if rounds.is_empty() {
                vec![ModelEvent::Done { usage: None }]
            } else {
                rounds.remove(0)
            };
            for ev in round {
                on_event(ev);
            }
            Ok(())
        }
    }

    struct EchoTool;

    #[async_trait::async_trait]
    impl crate::tools::Tool for EchoTool {
        fn definition(&self) -> crate::llm::ToolDefinition {
            crate::llm::ToolDefinition {
                name: "echo".to_string(),
                description: "echo".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
            }
        }

        async fn execute(&self, input: &serde_json::Value) -> Result<String, String> {
            Ok(input.to_string())
        }
    }

    struct FailingTool;

    #[async_trait::async_trait]
    impl crate::tools::Tool for FailingTool {
        fn definition(&self) -> crate::llm::ToolDefinition {
            crate::llm::ToolDefinition {
                name: "flaky".to_string(),
                description: "always fails".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
            }
        }

        async fn execute(&self, _input: &serde_json::Value) -> Result<String, String> {
            Err("boom".to_string())
        }
    }

    fn temp_sessions() -> Arc<SessionStore> {
        let dir: PathBuf =
            std::env::temp_dir().join(format!("harbor-agent-{}", uuid::Uuid::new_v4()));
        Arc::new(SessionStore::load(dir.join("sessions.json")))
    }

    fn runner_with(backend: ScriptedBackend, tools: ToolRegistry) -> (TurnRunner, Arc<SessionStore>) {
        let sessions = temp_sessions();
        let runner = TurnRunner::new(
            Arc::new(backend),
            tools,
            sessions.clone(),
            String::new(),
            "test-model".to_string(),
            1024,
        );
        (runner, sessions)
    }

    fn tool_call_round(name: &str) -> Vec<ModelEvent> {
        vec![
            ModelEvent::ToolCall {
                id: format!("call_{}", uuid::Uuid::new_v4()),
                name: name.to_string(),
                input: serde_json::json!({}),
            },
            ModelEvent::Done { usage: None },
        ]
    }

    async fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn streams_deltas_persists_final_text_and_reports_usage() {
        let backend = ScriptedBackend::new(vec![vec![
            ModelEvent::Delta("h".to_string()),
            ModelEvent::Delta("i".to_string()),
            ModelEvent::Done {
                usage: Some(TokenUsage {
                    input_tokens: 5,
                    output_tokens: 2,
                }),
            },
        ]]);
        let (runner, sessions) = runner_with(backend, ToolRegistry::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        runner
            .run(
                AgentRunOptions {
                    run_id: "r1".to_string(),
                    message: "say hi".to_string(),
                    session_id: Some("s1".to_string()),
                    model: None,
                },
                tx,
            )
            .await
            .unwrap();

        let events = drain(&mut rx).await;
        let deltas: String = events
            .iter()
            .filter(|e| e.kind == AgentEventKind::Delta)
            .filter_map(|e| e.delta.clone())
            .collect();
        assert_eq!(deltas, "hi");

        let dones: Vec<_> = events
            .iter()
            .filter(|e| e.kind == AgentEventKind::Done)
            .collect();
        assert_eq!(dones.len(), 1);
        let usage = dones[0].usage.unwrap();
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 2);

        let session = sessions.get("s1").await.unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].role, Role::Assistant);
        assert_eq!(session.messages[1].content, "hi");
    }

    #[tokio::test]
    async fn executes_tool_and_feeds_result_back() {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool));
        let backend = ScriptedBackend::new(vec![
            tool_call_round("echo"),
            vec![
                ModelEvent::Delta("answer".to_string()),
                ModelEvent::Done { usage: None },
            ],
        ]);
        let (runner, sessions) = runner_with(backend, tools);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        runner
            .run(
                AgentRunOptions {
                    run_id: "r1".to_string(),
                    message: "use the tool".to_string(),
                    session_id: Some("s1".to_string()),
                    model: None,
                },
                tx,
            )
            .await
            .unwrap();

        let events = drain(&mut rx).await;
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&AgentEventKind::ToolCall));
        assert!(kinds.contains(&AgentEventKind::ToolResult));
        assert_eq!(kinds.last(), Some(&AgentEventKind::Done));

        // tool rounds stay off the persisted history
        let session = sessions.get("s1").await.unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].content, "answer");
    }

    #[tokio::test]
    async fn unknown_tool_becomes_text_result() {
        let backend = ScriptedBackend::new(vec![
            tool_call_round("missing"),
            vec![ModelEvent::Done { usage: None }],
        ]);
        let (runner, _sessions) = runner_with(backend, ToolRegistry::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        runner
            .run(
                AgentRunOptions {
                    run_id: "r1".to_string(),
                    message: "go".to_string(),
                    session_id: Some("s1".to_string()),
                    model: None,
                },
                tx,
            )
            .await
            .unwrap();

        let events = drain(&mut rx).await;
        let result = events
            .iter()
            .find(|e| e.kind == AgentEventKind::ToolResult)
            .unwrap();
        assert_eq!(result.tool_result.as_deref(), Some("Unknown tool: missing"));
    }

    #[tokio::test]
    async fn failing_tool_becomes_tool_error_text() {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(FailingTool));
        let backend = ScriptedBackend::new(vec![
            tool_call_round("flaky"),
            vec![ModelEvent::Done { usage: None }],
        ]);
        let (runner, _sessions) = runner_with(backend, tools);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        runner
            .run(
                AgentRunOptions {
                    run_id: "r1".to_string(),
                    message: "go".to_string(),
                    session_id: Some("s1".to_string()),
                    model: None,
                },
                tx,
            )
            .await
            .unwrap();

        let events = drain(&mut rx).await;
        let result = events
            .iter()
            .find(|e| e.kind == AgentEventKind::ToolResult)
            .unwrap();
        assert_eq!(result.tool_result.as_deref(), Some("Tool error: boom"));
    }

    #[tokio::test]
    async fn round_ceiling_ends_turn_with_single_done() {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool));
        // backend asks for a tool every round, forever
        let rounds: Vec<Vec<ModelEvent>> = (0..20).map(|_| tool_call_round("echo")).collect();
        let backend = ScriptedBackend::new(rounds);
        let (runner, _sessions) = runner_with(backend, tools);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        runner
            .run(
                AgentRunOptions {
                    run_id: "r1".to_string(),
                    message: "loop".to_string(),
                    session_id: Some("s1".to_string()),
                    model: None,
                },
                tx,
            )
            .await
            .unwrap();

        let events = drain(&mut rx).await;
        let tool_calls = events
            .iter()
            .filter(|e| e.kind == AgentEventKind::ToolCall)
            .count();
        let dones = events
            .iter()
            .filter(|e| e.kind == AgentEventKind::Done)
            .count();
        let errors = events
            .iter()
            .filter(|e| e.kind == AgentEventKind::Error)
            .count();
        assert_eq!(tool_calls, 10);
        assert_eq!(dones, 1);
        assert_eq!(errors, 0);
    }

    #[tokio::test]
    async fn ceiling_exit_does_not_persist_tool_round_text() {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool));
        // every round streams text and then asks for a tool, past the ceiling
        let rounds: Vec<Vec<ModelEvent>> = (0..12)
            .map(|_| {
                vec![
                    ModelEvent::Delta("working on it".to_string()),
                    ModelEvent::ToolCall {
                        id: format!("call_{}", uuid::Uuid::new_v4()),
                        name: "echo".to_string(),
                        input: serde_json::json!({}),
                    },
                    ModelEvent::Done { usage: None },
                ]
            })
            .collect();
        let backend = ScriptedBackend::new(rounds);
        let (runner, sessions) = runner_with(backend, tools);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        runner
            .run(
                AgentRunOptions {
                    run_id: "r1".to_string(),
                    message: "loop".to_string(),
                    session_id: Some("s1".to_string()),
                    model: None,
                },
                tx,
            )
            .await
            .unwrap();

        let events = drain(&mut rx).await;
        assert_eq!(
            events
                .iter()
                .filter(|e| e.kind == AgentEventKind::Done)
                .count(),
            1
        );

        // only the user message survives; the rounds' pre-tool text does not
        let session = sessions.get("s1").await.unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn stub_runner_reports_not_configured() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        StubAgentRunner
            .run(
                AgentRunOptions {
                    run_id: "r1".to_string(),
                    message: "hello".to_string(),
                    session_id: None,
                    model: None,
                },
                tx,
            )
            .await
            .unwrap();
        let events = drain(&mut rx).await;
        assert_eq!(events.len(), 2);
        assert!(events[0].delta.as_deref().unwrap().contains("not configured"));
        assert_eq!(events[1].kind, AgentEventKind::Done);
    }
}
