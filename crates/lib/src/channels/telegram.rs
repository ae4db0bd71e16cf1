//! Telegram channel: webhook updates in, sendMessage out.

use serde::Deserialize;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Telegram's hard limit on message length.
const MAX_MESSAGE_LEN: usize = 4096;

/// Webhook POST body.
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
}

/// Telegram Bot API client for webhook mode.
pub struct TelegramChannel {
    token: String,
    webhook_secret: Option<String>,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(token: String, webhook_secret: Option<String>) -> Self {
        Self {
            token,
            webhook_secret: webhook_secret.filter(|s| !s.is_empty()),
            client: reqwest::Client::new(),
        }
    }

    /// Check the X-Telegram-Bot-Api-Secret-Token header. Always true when no
    /// secret is configured.
    pub fn verify_secret(&self, header: Option<&str>) -> bool {
        match &self.webhook_secret {
            Some(expected) => header == Some(expected.as_str()),
            None => true,
        }
    }

    /// Register the webhook URL (and the secret, when configured).
    pub async fn set_webhook(&self, url: &str) -> Result<(), String> {
        let api_url = format!("{}/bot{}/setWebhook", TELEGRAM_API_BASE, self.token);
        let mut body = serde_json::json!({ "url": url });
        if let Some(s) = &self.webhook_secret {
            body["secret_token"] = serde_json::Value::String(s.clone());
        }
        let res = self
            .client
            .post(&api_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("setWebhook failed: {} {}", status, body));
        }
        Ok(())
    }

    /// Remove the webhook registration.
    pub async fn delete_webhook(&self) -> Result<(), String> {
        let url = format!("{}/bot{}/deleteWebhook", TELEGRAM_API_BASE, self.token);
        let res = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("deleteWebhook failed: {} {}", status, body));
        }
        Ok(())
    }

    /// Send one text message to a chat.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), String> {
        let url = format!("{}/bot{}/sendMessage", TELEGRAM_API_BASE, self.token);
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("sendMessage failed: {} {}", status, body));
        }
        Ok(())
    }

    /// Send text of any length, split into Telegram-sized chunks.
    pub async fn send_chunked(&self, chat_id: &str, text: &str) -> Result<(), String> {
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            self.send_message(chat_id, &chunk).await?;
        }
        Ok(())
    }
}

/// Split text into chunks of at most `max_len` characters, on char boundaries.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        if count >= max_len {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(c);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_webhook_update() {
        let raw = r#"{
            "update_id": 7,
            "message": {
                "chat": { "id": 100 },
                "from": { "id": 42 },
                "text": "hello"
            }
        }"#;
        let update: TelegramUpdate = serde_json::from_str(raw).unwrap();
        let msg = update.message.unwrap();
        assert_eq!(msg.chat.id, 100);
        assert_eq!(msg.from.unwrap().id, 42);
        assert_eq!(msg.text.as_deref(), Some("hello"));
    }

    #[test]
    fn split_message_chunks() {
        assert_eq!(split_message("", 5), Vec::<String>::new());
        assert_eq!(split_message("abc", 5), vec!["abc"]);
        assert_eq!(split_message("abcdefgh", 3), vec!["abc", "def", "gh"]);

        let long = "x".repeat(10_000);
        let chunks = split_message(&long, MAX_MESSAGE_LEN);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= MAX_MESSAGE_LEN));
    }

    #[test]
    fn verify_secret_matches_configured_value() {
        let ch = TelegramChannel::new("t".to_string(), Some("shh".to_string()));
        assert!(ch.verify_secret(Some("shh")));
        assert!(!ch.verify_secret(Some("nope")));
        assert!(!ch.verify_secret(None));

        let open = TelegramChannel::new("t".to_string(), None);
        assert!(open.verify_secret(None));
        assert!(open.verify_secret(Some("anything")));
    }
}
