//! Chat-platform connectors (e.g. Telegram).
//!
//! Connectors translate platform traffic into [`InboundMessage`]s for the
//! gateway and deliver the agent's replies back out.

mod telegram;

pub use telegram::{split_message, TelegramChannel, TelegramMessage, TelegramUpdate};

/// A message from a channel, routed to a session and answered by the agent.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel_id: String,
    /// Platform user the message came from; pairing is keyed on this.
    pub user_id: String,
    /// Conversation to reply into.
    pub chat_id: String,
    pub text: String,
}
