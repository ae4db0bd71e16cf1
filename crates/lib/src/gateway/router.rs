//! Gateway method router: per-connection auth gate plus dispatch for every
//! WebSocket method. Exactly one response goes out per request.

use crate::agent::{AgentRunOptions, AgentRunner};
use crate::config::Config;
use crate::gateway::clients::ClientRegistry;
use crate::gateway::protocol::{
    AgentEvent, AgentRunParams, ConnectParams, PairingApproveParams, SendParams,
    SessionsHistoryParams, SessionsResetParams, WsFrame, WsRequest, WsResponse,
};
use crate::gateway::store::{MessageExtra, Role, Session, SessionStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Dispatches requests against the registry, store, and agent runner.
pub struct Router {
    clients: Arc<ClientRegistry>,
    sessions: Arc<SessionStore>,
    runner: Arc<dyn AgentRunner>,
    gateway_token: Option<String>,
    started: Instant,
}

impl Router {
    pub fn new(
        clients: Arc<ClientRegistry>,
        sessions: Arc<SessionStore>,
        runner: Arc<dyn AgentRunner>,
        config: &Config,
    ) -> Self {
        Self {
            clients,
            sessions,
            runner,
            gateway_token: crate::config::resolve_gateway_token(config),
            started: Instant::now(),
        }
    }

    /// Handle one inbound text frame from `client_id`.
    pub async fn handle(&self, client_id: &str, raw: &str) {
        let frame = match crate::gateway::protocol::parse_frame(raw) {
            Ok(f) => f,
            Err(e) => {
                // best effort to echo the request id back
                let id = serde_json::from_str::<serde_json::Value>(raw)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|i| i.as_str()).map(str::to_string))
                    .unwrap_or_default();
                self.respond(client_id, WsResponse::err(id, e)).await;
                return;
            }
        };
        let req = match frame {
            WsFrame::Req(req) => req,
            // clients only send requests; anything else is dropped
            _ => return,
        };

        if req.method != "connect" && !self.clients.is_authenticated(client_id).await {
            self.respond(client_id, WsResponse::err(req.id, "Not authenticated"))
                .await;
            return;
        }

        let res = match req.method.as_str() {
            "connect" => self.handle_connect(client_id, &req).await,
            "health" => self.handle_health().await,
            // responds on its own so the accepted response precedes run events
            "agent" => match self.handle_agent(client_id, &req).await {
                Ok(()) => return,
                Err(e) => Err(e),
            },
            "send" => self.handle_send(&req).await,
            "sessions.list" => self.handle_sessions_list().await,
            "sessions.history" => self.handle_sessions_history(&req).await,
            "sessions.reset" => self.handle_sessions_reset(&req).await,
            "pairing.list" => self.handle_pairing_list().await,
            "pairing.approve" => self.handle_pairing_approve(&req).await,
            m => Err(format!("Unknown method: {m}")),
        };
        let response = match res {
            Ok(payload) => WsResponse::ok(req.id, payload),
            Err(e) => WsResponse::err(req.id, e),
        };
        self.respond(client_id, response).await;
    }

    async fn respond(&self, client_id: &str, res: WsResponse) {
        self.clients.send_response(client_id, res).await;
    }

    async fn handle_connect(
        &self,
        client_id: &str,
        req: &WsRequest,
    ) -> Result<serde_json::Value, String> {
        let params: ConnectParams = parse_params(&req.params).unwrap_or_default();
        if let Some(expected) = &self.gateway_token {
            if params.auth.token.as_deref() != Some(expected.as_str()) {
                return Err("Invalid token".to_string());
            }
        }
        self.clients.set_authenticated(client_id, true).await;
        let clients = self.clients.count().await;
        log::info!("client {} connected ({} online)", client_id, clients);
        self.clients
            .broadcast("presence", json!({ "clients": clients }))
            .await;
        Ok(json!({
            "hello": "ok",
            "health": { "status": "ok", "clients": clients },
            "version": env!("CARGO_PKG_VERSION"),
        }))
    }

    async fn handle_health(&self) -> Result<serde_json::Value, String> {
        Ok(json!({
            "status": "ok",
            "clients": self.clients.count().await,
            "sessions": self.sessions.list().await.len(),
            "uptimeMs": self.started.elapsed().as_millis() as u64,
        }))
    }

    async fn handle_agent(&self, client_id: &str, req: &WsRequest) -> Result<(), String> {
        let params: AgentRunParams =
            parse_params(&req.params).map_err(|_| "message required".to_string())?;
        if params.message.trim().is_empty() {
            return Err("message required".to_string());
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        let opts = AgentRunOptions {
            run_id: run_id.clone(),
            message: params.message,
            session_id: params.session_id,
            model: params.model,
        };

        // accepted response must reach the client before any run event
        self.respond(
            client_id,
            WsResponse::ok(
                req.id.clone(),
                json!({ "runId": run_id, "status": "accepted" }),
            ),
        )
        .await;

        let runner = self.runner.clone();
        let clients = self.clients.clone();
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<AgentEvent>();
            let forward_clients = clients.clone();
            let forward_client_id = client_id.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(ev) = rx.recv().await {
                    if let Ok(payload) = serde_json::to_value(&ev) {
                        forward_clients
                            .send_event(&forward_client_id, "agent", payload)
                            .await;
                    }
                }
            });
            let run_id_for_error = opts.run_id.clone();
            let result = runner.run(opts, tx).await;
            // tx dropped above; wait until every buffered event went out
            let _ = forwarder.await;
            if let Err(e) = result {
                log::warn!("agent run {} failed: {:#}", run_id_for_error, e);
                if let Ok(payload) =
                    serde_json::to_value(AgentEvent::error(&run_id_for_error, format!("{e:#}")))
                {
                    clients.send_event(&client_id, "agent", payload).await;
                }
            }
        });

        Ok(())
    }

    async fn handle_send(&self, req: &WsRequest) -> Result<serde_json::Value, String> {
        let params: SendParams =
            parse_params(&req.params).map_err(|_| "sessionId required".to_string())?;
        let message = self
            .sessions
            .add_message(
                &params.session_id,
                Role::User,
                &params.message,
                MessageExtra {
                    channel: params.channel,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "message": message }))
    }

    async fn handle_sessions_list(&self) -> Result<serde_json::Value, String> {
        let sessions: Vec<serde_json::Value> = self
            .sessions
            .list()
            .await
            .iter()
            .map(session_summary)
            .collect();
        Ok(json!({ "sessions": sessions }))
    }

    async fn handle_sessions_history(&self, req: &WsRequest) -> Result<serde_json::Value, String> {
        let params: SessionsHistoryParams =
            parse_params(&req.params).map_err(|_| "sessionId required".to_string())?;
        let session = self
            .sessions
            .get(&params.session_id)
            .await
            .ok_or_else(|| "Session not found".to_string())?;
        let mut messages = session.messages;
        if let Some(limit) = params.limit {
            if messages.len() > limit {
                messages = messages.split_off(messages.len() - limit);
            }
        }
        Ok(json!({ "sessionId": session.id, "messages": messages }))
    }

    async fn handle_sessions_reset(&self, req: &WsRequest) -> Result<serde_json::Value, String> {
        let params: SessionsResetParams =
            parse_params(&req.params).map_err(|_| "sessionId required".to_string())?;
        // resetting an unknown session is a no-op
        let reset = self
            .sessions
            .reset(&params.session_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "reset": reset }))
    }

    async fn handle_pairing_list(&self) -> Result<serde_json::Value, String> {
        Ok(json!({ "pairing": self.sessions.list_pairing().await }))
    }

    async fn handle_pairing_approve(&self, req: &WsRequest) -> Result<serde_json::Value, String> {
        let params: PairingApproveParams =
            parse_params(&req.params).map_err(|_| "channel and userId required".to_string())?;
        if params.channel.trim().is_empty() || params.user_id.trim().is_empty() {
            return Err("channel and userId required".to_string());
        }
        let approved = self
            .sessions
            .approve_pairing(&params.channel, &params.user_id)
            .await
            .map_err(|e| e.to_string())?;
        if !approved {
            return Err("Pairing not found".to_string());
        }
        Ok(json!({ "approved": true }))
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: &serde_json::Value) -> Result<T, String> {
    serde_json::from_value(params.clone()).map_err(|e| e.to_string())
}

pub(crate) fn session_summary(s: &Session) -> serde_json::Value {
    json!({
        "id": s.id,
        "name": s.name,
        "createdAt": s.created_at,
        "updatedAt": s.updated_at,
        "messageCount": s.messages.len(),
        "channel": s.channel,
    })
}
