//! Inbound events from a channel: delivered to the bot for dispatch.

/// A text message from a chat.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub conversation_id: String,
    /// Sender's user id; None for messages without a sender (e.g. channel posts).
    pub user_id: Option<i64>,
    pub text: String,
}

/// An inline-keyboard button press.
#[derive(Debug, Clone)]
pub struct InboundCallback {
    pub callback_id: String,
    pub conversation_id: Option<String>,
    /// Message carrying the keyboard, when Telegram still has it.
    pub message_id: Option<i64>,
    pub user_id: i64,
    pub data: String,
}

#[derive(Debug, Clone)]
pub enum Inbound {
    Message(InboundMessage),
    Callback(InboundCallback),
}

/// A bot command parsed from message text: `/name@bot arg1 arg2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotCommand {
    pub name: String,
    /// Whitespace-separated tokens after the command, unparsed (quotes are not interpreted).
    pub args: Vec<String>,
}

impl BotCommand {
    /// Parse `/command[@bot] args...`. Returns None for text that is not a command.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let head = parts.next()?.strip_prefix('/')?;
        let name = head.split('@').next().unwrap_or(head);
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_lowercase(),
            args: parts.map(String::from).collect(),
        })
    }
}
