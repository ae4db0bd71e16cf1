//! Session, message, and pairing storage.
//!
//! All state lives in one JSON document (`{sessions, pairing}`) mirrored to
//! disk on every mutation. A missing or corrupt file loads as empty state;
//! write failures propagate to the caller. One async Mutex serializes every
//! operation so lookup-then-insert sequences cannot race.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Message role within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// One immutable message, owned by its session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Unix ms.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_user_id: Option<String>,
}

/// Extra attribution attached to an appended message.
#[derive(Debug, Clone, Default)]
pub struct MessageExtra {
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    pub channel: Option<String>,
    pub channel_user_id: Option<String>,
}

/// One conversation, keyed by id with a secondary (channel, user) lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Unix ms.
    pub created_at: i64,
    /// Unix ms, bumped on every append and reset.
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Pairing record for a chat-platform user, keyed by (channel, user).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingEntry {
    pub user_id: String,
    pub channel: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    /// Unix ms.
    pub created_at: i64,
    /// Unix ms, stamped once on first approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<i64>,
}

/// On-disk document shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDoc {
    #[serde(default)]
    sessions: Vec<Session>,
    #[serde(default)]
    pairing: Vec<PairingEntry>,
}

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<String, Session>,
    /// Keyed by "{channel}:{user_id}".
    pairing: HashMap<String, PairingEntry>,
}

/// Session + pairing store with write-through JSON persistence.
pub struct SessionStore {
    path: PathBuf,
    state: Mutex<State>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn pairing_key(channel: &str, user_id: &str) -> String {
    format!("{channel}:{user_id}")
}

/// 6-char uppercase alphanumeric pairing code from OS randomness.
fn generate_pairing_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut buf = [0u8; 6];
    if getrandom::getrandom(&mut buf).is_err() {
        // uuid still draws from OS randomness internally; shape stays the same
        let fallback = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
        return fallback[..6].to_string();
    }
    buf.iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect()
}

impl SessionStore {
    /// Load from `path`. Missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = match std::fs::read_to_string(&path) {
            Ok(s) => match serde_json::from_str::<StoreDoc>(&s) {
                Ok(doc) => doc,
                Err(e) => {
                    log::warn!("ignoring corrupt store at {}: {}", path.display(), e);
                    StoreDoc::default()
                }
            },
            Err(_) => StoreDoc::default(),
        };
        let state = State {
            sessions: doc.sessions.into_iter().map(|s| (s.id.clone(), s)).collect(),
            pairing: doc
                .pairing
                .into_iter()
                .map(|p| (pairing_key(&p.channel, &p.user_id), p))
                .collect(),
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, state: &State) -> Result<()> {
        let doc = StoreDoc {
            sessions: {
                let mut v: Vec<Session> = state.sessions.values().cloned().collect();
                v.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                v
            },
            pairing: state.pairing.values().cloned().collect(),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&doc)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("writing store to {}", self.path.display()))?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.state.lock().await.sessions.get(id).cloned()
    }

    /// Get the session with `id` or create it. Repeat calls with the same id
    /// return the same session.
    pub async fn get_or_create(&self, id: &str) -> Result<Session> {
        let mut state = self.state.lock().await;
        if let Some(s) = state.sessions.get(id) {
            return Ok(s.clone());
        }
        let now = now_ms();
        let session = Session {
            id: id.to_string(),
            name: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            model: None,
            channel: None,
            channel_user_id: None,
            metadata: None,
        };
        state.sessions.insert(id.to_string(), session.clone());
        self.save(&state)?;
        Ok(session)
    }

    /// Find or create the one session for a (channel, user) pair. The scan
    /// and insert happen under the same lock, so concurrent callers converge
    /// on a single session.
    pub async fn get_or_create_for_channel(
        &self,
        channel: &str,
        channel_user_id: &str,
    ) -> Result<Session> {
        let mut state = self.state.lock().await;
        if let Some(s) = state.sessions.values().find(|s| {
            s.channel.as_deref() == Some(channel)
                && s.channel_user_id.as_deref() == Some(channel_user_id)
        }) {
            return Ok(s.clone());
        }
        let now = now_ms();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            name: Some(format!("{channel}:{channel_user_id}")),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            model: None,
            channel: Some(channel.to_string()),
            channel_user_id: Some(channel_user_id.to_string()),
            metadata: None,
        };
        state.sessions.insert(session.id.clone(), session.clone());
        self.save(&state)?;
        Ok(session)
    }

    /// All sessions, most recently updated first.
    pub async fn list(&self) -> Vec<Session> {
        let state = self.state.lock().await;
        let mut v: Vec<Session> = state.sessions.values().cloned().collect();
        v.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        v
    }

    /// Append a message, creating the session first when it does not exist.
    /// Returns the stored message.
    pub async fn add_message(
        &self,
        session_id: &str,
        role: Role,
        content: impl Into<String>,
        extra: MessageExtra,
    ) -> Result<Message> {
        let mut state = self.state.lock().await;
        let now = now_ms();
        let session = state
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session {
                id: session_id.to_string(),
                name: None,
                messages: Vec::new(),
                created_at: now,
                updated_at: now,
                model: None,
                channel: None,
                channel_user_id: None,
                metadata: None,
            });
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: now_ms(),
            tool_name: extra.tool_name,
            tool_call_id: extra.tool_call_id,
            channel: extra.channel,
            channel_user_id: extra.channel_user_id,
        };
        session.messages.push(message.clone());
        session.updated_at = now_ms();
        self.save(&state)?;
        Ok(message)
    }

    /// Clear a session's messages, keeping the session itself. Returns false
    /// when the session does not exist.
    pub async fn reset(&self, session_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get_mut(session_id) else {
            return Ok(false);
        };
        session.messages.clear();
        session.updated_at = now_ms();
        self.save(&state)?;
        Ok(true)
    }

    /// Remove a session entirely. Returns false when it does not exist.
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.sessions.remove(session_id).is_none() {
            return Ok(false);
        }
        self.save(&state)?;
        Ok(true)
    }

    pub async fn get_pairing(&self, channel: &str, user_id: &str) -> Option<PairingEntry> {
        self.state
            .lock()
            .await
            .pairing
            .get(&pairing_key(channel, user_id))
            .cloned()
    }

    /// Create a pending pairing entry with a fresh code. Returns the existing
    /// entry unchanged when one is already present.
    pub async fn create_pairing(&self, channel: &str, user_id: &str) -> Result<PairingEntry> {
        let mut state = self.state.lock().await;
        let key = pairing_key(channel, user_id);
        if let Some(p) = state.pairing.get(&key) {
            return Ok(p.clone());
        }
        let entry = PairingEntry {
            user_id: user_id.to_string(),
            channel: channel.to_string(),
            approved: false,
            pairing_code: Some(generate_pairing_code()),
            created_at: now_ms(),
            approved_at: None,
        };
        state.pairing.insert(key, entry.clone());
        self.save(&state)?;
        Ok(entry)
    }

    /// Approve a pairing. Returns false when no entry exists. Idempotent: a
    /// second call returns true and leaves the original approved_at in place.
    pub async fn approve_pairing(&self, channel: &str, user_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = pairing_key(channel, user_id);
        let Some(entry) = state.pairing.get_mut(&key) else {
            return Ok(false);
        };
        if entry.approved {
            return Ok(true);
        }
        entry.approved = true;
        entry.approved_at = Some(now_ms());
        entry.pairing_code = None;
        self.save(&state)?;
        Ok(true)
    }

    pub async fn is_approved(&self, channel: &str, user_id: &str) -> bool {
        self.get_pairing(channel, user_id)
            .await
            .map(|p| p.approved)
            .unwrap_or(false)
    }

    pub async fn list_pairing(&self) -> Vec<PairingEntry> {
        let state = self.state.lock().await;
        let mut v: Vec<PairingEntry> = state.pairing.values().cloned().collect();
        v.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (SessionStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("harbor-store-{}", uuid::Uuid::new_v4()));
        let path = dir.join("sessions.json");
        (SessionStore::load(&path), path)
    }

    #[tokio::test]
    async fn get_or_create_is_stable_for_fixed_id() {
        let (store, _path) = temp_store();
        let a = store.get_or_create("fixed-id").await.unwrap();
        let b = store.get_or_create("fixed-id").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.created_at, b.created_at);
        assert_eq!(store.list().await.len(), 1);
    }

    #[tokio::test]
    async fn add_message_appends_and_bumps_updated_at() {
        let (store, _path) = temp_store();
        let session = store.get_or_create("s1").await.unwrap();
        let before = session.updated_at;

        let m1 = store
            .add_message("s1", Role::User, "first", MessageExtra::default())
            .await
            .unwrap();
        let m2 = store
            .add_message("s1", Role::Assistant, "second", MessageExtra::default())
            .await
            .unwrap();

        let session = store.get("s1").await.unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].id, m1.id);
        assert_eq!(session.messages[1].id, m2.id);
        assert!(m1.timestamp <= m2.timestamp);
        assert!(session.updated_at >= before);
    }

    #[tokio::test]
    async fn add_message_creates_missing_session() {
        let (store, _path) = temp_store();
        let msg = store
            .add_message("fresh", Role::User, "x", MessageExtra::default())
            .await
            .unwrap();
        assert_eq!(msg.content, "x");
        let session = store.get("fresh").await.unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].id, msg.id);
    }

    #[tokio::test]
    async fn channel_lookup_converges_on_one_session() {
        let (store, _path) = temp_store();
        let a = store
            .get_or_create_for_channel("telegram", "42")
            .await
            .unwrap();
        let b = store
            .get_or_create_for_channel("telegram", "42")
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.name.as_deref(), Some("telegram:42"));

        let other = store
            .get_or_create_for_channel("telegram", "43")
            .await
            .unwrap();
        assert_ne!(a.id, other.id);
    }

    #[tokio::test]
    async fn reset_clears_messages_keeps_session() {
        let (store, _path) = temp_store();
        store.get_or_create("s1").await.unwrap();
        store
            .add_message("s1", Role::User, "hello", MessageExtra::default())
            .await
            .unwrap();
        assert!(store.reset("s1").await.unwrap());
        let session = store.get("s1").await.unwrap();
        assert!(session.messages.is_empty());
        assert!(!store.reset("missing").await.unwrap());
    }

    #[tokio::test]
    async fn approve_pairing_is_idempotent_and_keeps_first_timestamp() {
        let (store, _path) = temp_store();
        let entry = store.create_pairing("telegram", "42").await.unwrap();
        assert!(!entry.approved);
        let code = entry.pairing_code.unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

        assert!(store.approve_pairing("telegram", "42").await.unwrap());
        let first = store.get_pairing("telegram", "42").await.unwrap();
        assert!(first.approved);
        assert!(first.pairing_code.is_none());
        let stamped = first.approved_at.unwrap();

        assert!(store.approve_pairing("telegram", "42").await.unwrap());
        let second = store.get_pairing("telegram", "42").await.unwrap();
        assert_eq!(second.approved_at, Some(stamped));

        assert!(!store.approve_pairing("telegram", "unknown").await.unwrap());
    }

    #[tokio::test]
    async fn create_pairing_returns_existing_entry() {
        let (store, _path) = temp_store();
        let a = store.create_pairing("telegram", "42").await.unwrap();
        let b = store.create_pairing("telegram", "42").await.unwrap();
        assert_eq!(a.pairing_code, b.pairing_code);
        assert_eq!(a.created_at, b.created_at);
    }

    #[tokio::test]
    async fn persists_and_reloads_round_trip() {
        let (store, path) = temp_store();
        store.get_or_create("s1").await.unwrap();
        store
            .add_message("s1", Role::User, "hello", MessageExtra::default())
            .await
            .unwrap();
        store.create_pairing("telegram", "42").await.unwrap();
        store.approve_pairing("telegram", "42").await.unwrap();

        let reloaded = SessionStore::load(&path);
        let session = reloaded.get("s1").await.unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].content, "hello");
        assert!(reloaded.is_approved("telegram", "42").await);
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = std::env::temp_dir().join(format!("harbor-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sessions.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = SessionStore::load(&path);
        assert!(store.list().await.is_empty());
        assert!(store.list_pairing().await.is_empty());
    }

    #[tokio::test]
    async fn list_orders_by_updated_at_desc() {
        let (store, _path) = temp_store();
        store.get_or_create("old").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.get_or_create("new").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .add_message("old", Role::User, "bump", MessageExtra::default())
            .await
            .unwrap();
        let list = store.list().await;
        assert_eq!(list[0].id, "old");
        assert_eq!(list[1].id, "new");
    }
}
