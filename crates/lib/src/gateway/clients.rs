//! Live WebSocket connection registry.
//!
//! Tracks connected clients, their outbound queues, and the global event
//! sequence counter. Sends to a closed connection are silent no-ops; a run
//! that outlives its originating connection just drops its events here.

use crate::gateway::protocol::{WsEvent, WsFrame, WsResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;

/// One live connection.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    /// Outbound queue; the socket write task drains this.
    pub tx: UnboundedSender<String>,
    /// Unix ms.
    pub connected_at: i64,
    /// Set after a successful `connect`.
    pub authenticated: bool,
}

/// Registry of live connections plus the global event sequence.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Client>>,
    seq: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, id: impl Into<String>, tx: UnboundedSender<String>) {
        let id = id.into();
        let client = Client {
            id: id.clone(),
            tx,
            connected_at: chrono::Utc::now().timestamp_millis(),
            authenticated: false,
        };
        self.clients.write().await.insert(id, client);
    }

    pub async fn remove(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Client> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn set_authenticated(&self, id: &str, authenticated: bool) {
        if let Some(client) = self.clients.write().await.get_mut(id) {
            client.authenticated = authenticated;
        }
    }

    pub async fn is_authenticated(&self, id: &str) -> bool {
        self.clients
            .read()
            .await
            .get(id)
            .map(|c| c.authenticated)
            .unwrap_or(false)
    }

    /// Next value of the global event sequence. Strictly increasing across
    /// all events the registry ever stamps, unicast and broadcast alike.
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Send raw text to one client. Unknown or closed connection: no-op.
    pub async fn send(&self, id: &str, text: String) {
        if let Some(client) = self.clients.read().await.get(id) {
            let _ = client.tx.send(text);
        }
    }

    /// Send a response frame to one client.
    pub async fn send_response(&self, id: &str, res: WsResponse) {
        if let Ok(text) = serde_json::to_string(&WsFrame::Res(res)) {
            self.send(id, text).await;
        }
    }

    /// Send an event to one client, stamping the next sequence number.
    pub async fn send_event(&self, id: &str, event: impl Into<String>, payload: serde_json::Value) {
        let frame = WsFrame::Event(WsEvent {
            event: event.into(),
            payload: Some(payload),
            seq: self.next_seq(),
        });
        if let Ok(text) = serde_json::to_string(&frame) {
            self.send(id, text).await;
        }
    }

    /// Broadcast an event to every connected client. One sequence number is
    /// consumed; all recipients see the same `seq`.
    pub async fn broadcast(&self, event: impl Into<String>, payload: serde_json::Value) {
        let frame = WsFrame::Event(WsEvent {
            event: event.into(),
            payload: Some(payload),
            seq: self.next_seq(),
        });
        let text = match serde_json::to_string(&frame) {
            Ok(t) => t,
            Err(_) => return,
        };
        for client in self.clients.read().await.values() {
            let _ = client.tx.send(text.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn add_remove_count() {
        let reg = ClientRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        reg.add("a", tx.clone()).await;
        reg.add("b", tx).await;
        assert_eq!(reg.count().await, 2);
        assert!(reg.remove("a").await.is_some());
        assert_eq!(reg.count().await, 1);
        assert!(reg.remove("a").await.is_none());
    }

    #[tokio::test]
    async fn authenticated_flag_defaults_false() {
        let reg = ClientRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        reg.add("a", tx).await;
        assert!(!reg.is_authenticated("a").await);
        reg.set_authenticated("a", true).await;
        assert!(reg.is_authenticated("a").await);
        assert!(!reg.is_authenticated("missing").await);
    }

    #[tokio::test]
    async fn event_seq_strictly_increases_across_unicast_and_broadcast() {
        let reg = ClientRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.add("a", tx).await;

        reg.send_event("a", "agent", serde_json::json!({})).await;
        reg.broadcast("presence", serde_json::json!({"clients": 1}))
            .await;
        reg.send_event("a", "agent", serde_json::json!({})).await;

        let mut seqs = Vec::new();
        while let Ok(text) = rx.try_recv() {
            let v: serde_json::Value = serde_json::from_str(&text).unwrap();
            seqs.push(v["seq"].as_u64().unwrap());
        }
        assert_eq!(seqs.len(), 3);
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn send_to_closed_connection_is_noop() {
        let reg = ClientRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        reg.add("gone", tx).await;
        drop(rx);
        // must not panic or error
        reg.send("gone", "hello".to_string()).await;
        reg.send_event("gone", "agent", serde_json::json!({})).await;
        reg.send("never-existed", "hello".to_string()).await;
    }
}
