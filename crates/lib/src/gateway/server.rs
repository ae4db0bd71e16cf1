//! Gateway HTTP + WebSocket server (single port).

use crate::agent::{AgentRunOptions, AgentRunner, StubAgentRunner, TurnRunner};
use crate::channels::{InboundMessage, TelegramChannel, TelegramUpdate};
use crate::config::{self, Config, DmPolicy};
use crate::gateway::clients::ClientRegistry;
use crate::gateway::protocol::{AgentEvent, AgentEventKind};
use crate::gateway::router::{session_summary, Router as MethodRouter};
use crate::gateway::store::SessionStore;
use crate::llm::OllamaBackend;
use crate::skills;
use crate::tools::{BrowserTool, ToolRegistry};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Shared state for the gateway.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub clients: Arc<ClientRegistry>,
    pub sessions: Arc<SessionStore>,
    pub router: Arc<MethodRouter>,
    pub runner: Arc<dyn AgentRunner>,
    /// Sender for inbound channel messages (e.g. Telegram webhook POSTs).
    pub inbound_tx: mpsc::Sender<InboundMessage>,
    pub telegram: Option<Arc<TelegramChannel>>,
    pub started: Instant,
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, a gateway token must be configured or startup
/// fails. Blocks until shutdown (Ctrl+C or SIGTERM). `config_path` resolves
/// the state and skills directories.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) && config::resolve_gateway_token(&config).is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or HARBOR_GATEWAY_TOKEN)",
            bind
        );
    }

    let sessions = Arc::new(SessionStore::load(config::sessions_file(&config_path)));
    let clients = Arc::new(ClientRegistry::new());

    let mut skill_dirs = vec![config::resolve_skills_dir(&config, &config_path)];
    skill_dirs.extend(config.skills.extra_dirs.iter().cloned());
    let loaded_skills = match skills::load_skills(&skill_dirs) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("loading skills failed: {}", e);
            Vec::new()
        }
    };
    log::info!("loaded {} skill(s)", loaded_skills.len());
    let skills_appendix = skills::system_prompt_appendix(&loaded_skills);

    let mut tools = ToolRegistry::new();
    if config.agent.browser.enabled {
        tools.register(Arc::new(BrowserTool::new(
            config.agent.browser.endpoint.clone(),
        )));
    }

    let runner: Arc<dyn AgentRunner> = match config
        .agent
        .model
        .as_ref()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
    {
        Some(model) => {
            log::info!("agent backend: ollama, model {}", model);
            Arc::new(TurnRunner::new(
                Arc::new(OllamaBackend::new(config::resolve_ollama_base_url())),
                tools,
                sessions.clone(),
                skills_appendix,
                model,
                config.agent.max_tokens,
            ))
        }
        None => {
            log::info!("no agent.model configured, using stub runner");
            Arc::new(StubAgentRunner)
        }
    };

    let router = Arc::new(MethodRouter::new(
        clients.clone(),
        sessions.clone(),
        runner.clone(),
        &config,
    ));

    let telegram = match (
        config::resolve_telegram_token(&config),
        config.channels.telegram.webhook_url.clone(),
    ) {
        (Some(token), Some(url)) => {
            let channel = Arc::new(TelegramChannel::new(
                token,
                config.channels.telegram.webhook_secret.clone(),
            ));
            if let Err(e) = channel.set_webhook(&url).await {
                log::warn!("telegram set_webhook failed: {}", e);
            } else {
                log::info!("telegram channel registered (webhook mode): {}", url);
            }
            Some(channel)
        }
        (Some(_), None) => {
            log::info!("telegram bot token set but no webhookUrl, channel inactive");
            None
        }
        _ => None,
    };

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundMessage>(64);
    let state = GatewayState {
        config: Arc::new(config.clone()),
        clients,
        sessions,
        router,
        runner,
        inbound_tx,
        telegram: telegram.clone(),
        started: Instant::now(),
    };

    {
        let state_inbound = state.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound_rx.recv().await {
                process_inbound_message(state_inbound.clone(), msg).await;
            }
        });
    }

    let app = Router::new()
        .route("/health", get(health_http))
        .route("/sessions", get(sessions_http))
        .route("/sessions/:id", get(session_http))
        .route("/pairing", get(pairing_http))
        .route("/pairing/approve", post(pairing_approve_http))
        .route("/channels/telegram/webhook", post(telegram_webhook))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(telegram))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM; removes the Telegram webhook on the way out.
async fn shutdown_signal(telegram: Option<Arc<TelegramChannel>>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");

    if let Some(t) = telegram {
        if let Err(e) = t.delete_webhook().await {
            log::debug!("telegram delete_webhook on shutdown: {}", e);
        }
    }
}

/// Process one inbound channel message: access policy, session lookup, one
/// agent turn, reply with the accumulated text.
async fn process_inbound_message(state: GatewayState, msg: InboundMessage) {
    let Some(telegram) = state.telegram.clone() else {
        return;
    };
    let policy = state.config.channels.telegram.dm_policy;
    match policy {
        DmPolicy::Open => {
            let allow = &state.config.channels.telegram.allow_from;
            if !allow.is_empty() && !allow.iter().any(|a| a == "*" || a == &msg.user_id) {
                log::debug!("telegram: dropping message from unlisted user {}", msg.user_id);
                return;
            }
        }
        DmPolicy::Pairing => {
            if !state.sessions.is_approved(&msg.channel_id, &msg.user_id).await {
                let reply = match state.sessions.get_pairing(&msg.channel_id, &msg.user_id).await {
                    Some(pending) => format!(
                        "Your access request is still pending approval.\nPairing code: {}",
                        pending.pairing_code.as_deref().unwrap_or("(unknown)")
                    ),
                    None => match state
                        .sessions
                        .create_pairing(&msg.channel_id, &msg.user_id)
                        .await
                    {
                        Ok(entry) => format!(
                            "Hi! This assistant requires approval before it can talk to you.\n\
                             Pairing code: {}\n\
                             Ask the gateway owner to run: harbor pairing approve {} {}",
                            entry.pairing_code.as_deref().unwrap_or("(unknown)"),
                            msg.channel_id,
                            msg.user_id
                        ),
                        Err(e) => {
                            log::warn!("creating pairing failed: {:#}", e);
                            return;
                        }
                    },
                };
                let _ = telegram.send_chunked(&msg.chat_id, &reply).await;
                return;
            }
        }
    }

    let session = match state
        .sessions
        .get_or_create_for_channel(&msg.channel_id, &msg.user_id)
        .await
    {
        Ok(s) => s,
        Err(e) => {
            log::warn!("channel session lookup failed: {:#}", e);
            return;
        }
    };

    let run_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<AgentEvent>();
    let collector = tokio::spawn(async move {
        let mut text = String::new();
        while let Some(ev) = rx.recv().await {
            if ev.kind == AgentEventKind::Delta {
                if let Some(delta) = ev.delta {
                    text.push_str(&delta);
                }
            }
        }
        text
    });
    let result = state
        .runner
        .run(
            AgentRunOptions {
                run_id,
                message: msg.text.clone(),
                session_id: Some(session.id.clone()),
                model: None,
            },
            tx,
        )
        .await;
    let text = collector.await.unwrap_or_default();

    if let Err(e) = result {
        log::warn!("channel agent turn failed: {:#}", e);
        let _ = telegram
            .send_chunked(&msg.chat_id, &format!("Error: {e:#}"))
            .await;
        return;
    }
    if text.trim().is_empty() {
        return;
    }
    if let Err(e) = telegram.send_chunked(&msg.chat_id, &text).await {
        log::warn!("telegram reply failed: {}", e);
    }
}

/// POST /channels/telegram/webhook — verifies the optional secret header and
/// queues the update for processing.
async fn telegram_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(telegram) = &state.telegram else {
        return StatusCode::NOT_FOUND;
    };
    let provided = headers
        .get("X-Telegram-Bot-Api-Secret-Token")
        .and_then(|v| v.to_str().ok());
    if !telegram.verify_secret(provided) {
        return StatusCode::FORBIDDEN;
    }
    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    let Some(msg) = update.message else {
        return StatusCode::OK;
    };
    let Some(text) = msg.text else {
        return StatusCode::OK;
    };
    let user_id = msg
        .from
        .map(|u| u.id.to_string())
        .unwrap_or_else(|| msg.chat.id.to_string());
    let inbound = InboundMessage {
        channel_id: "telegram".to_string(),
        user_id,
        chat_id: msg.chat.id.to_string(),
        text,
    };
    if state.inbound_tx.send(inbound).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

/// GET /health — same shape as the WS health method.
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "clients": state.clients.count().await,
        "sessions": state.sessions.list().await.len(),
        "uptimeMs": state.started.elapsed().as_millis() as u64,
    }))
}

/// GET /sessions — session summaries, most recent first.
async fn sessions_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let sessions: Vec<serde_json::Value> = state
        .sessions
        .list()
        .await
        .iter()
        .map(session_summary)
        .collect();
    Json(json!({ "sessions": sessions }))
}

/// GET /sessions/:id — full session including messages.
async fn session_http(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Response {
    match state.sessions.get(&id).await {
        Some(session) => Json(json!({ "session": session })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Session not found" })),
        )
            .into_response(),
    }
}

/// GET /pairing — all pairing entries.
async fn pairing_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({ "pairing": state.sessions.list_pairing().await }))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairingApproveBody {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    user_id: String,
}

/// POST /pairing/approve — body `{"channel": ..., "userId": ...}`.
async fn pairing_approve_http(
    State(state): State<GatewayState>,
    Json(body): Json<PairingApproveBody>,
) -> Response {
    if body.channel.trim().is_empty() || body.user_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "channel and userId required" })),
        )
            .into_response();
    }
    match state
        .sessions
        .approve_pairing(&body.channel, &body.user_id)
        .await
    {
        Ok(true) => Json(json!({ "approved": true })).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Pairing not found" })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// GET /ws — upgrade to the gateway WebSocket protocol.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    state.clients.add(&client_id, outbound_tx).await;
    log::debug!("ws client {} attached", client_id);

    let (mut sender, mut receiver) = socket.split();
    let write_task = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // frames are handled sequentially per connection
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => state.router.handle(&client_id, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.clients.remove(&client_id).await;
    write_task.abort();
    let clients = state.clients.count().await;
    log::debug!("ws client {} detached ({} online)", client_id, clients);
    state
        .clients
        .broadcast("presence", json!({ "clients": clients }))
        .await;
}
