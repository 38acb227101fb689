//! Telegram channel: long-poll getUpdates and reply via the Bot API
//! (sendMessage, editMessageText, answerCallbackQuery).

use crate::channels::inbound::{Inbound, InboundCallback, InboundMessage};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("telegram bot token not configured")]
    MissingToken,
    #[error("telegram request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("telegram api error: {0}")]
    Api(String),
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

/// Telegram update payload (getUpdates result item).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
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

#[derive(Debug, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

impl TelegramUpdate {
    /// Convert to an inbound event; updates the bot does not handle yield None.
    pub fn into_inbound(self) -> Option<Inbound> {
        if let Some(q) = self.callback_query {
            return Some(Inbound::Callback(InboundCallback {
                callback_id: q.id,
                conversation_id: q.message.as_ref().map(|m| m.chat.id.to_string()),
                message_id: q.message.as_ref().map(|m| m.message_id),
                user_id: q.from.id,
                data: q.data.unwrap_or_default(),
            }));
        }
        let msg = self.message?;
        let text = msg.text?;
        Some(Inbound::Message(InboundMessage {
            conversation_id: msg.chat.id.to_string(),
            user_id: msg.from.map(|u| u.id),
            text,
        }))
    }
}

/// One inline keyboard button (text + callback data).
#[derive(Debug, Clone)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

fn keyboard_json(rows: &[Vec<InlineButton>]) -> serde_json::Value {
    let rows: Vec<Vec<serde_json::Value>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| json!({ "text": b.text, "callback_data": b.callback_data }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

/// Telegram channel connector: long-polls for updates and talks to the Bot API.
pub struct TelegramChannel {
    token: Option<String>,
    api_base: String,
    running: AtomicBool,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token,
            api_base: telegram_api_base(),
            running: AtomicBool::new(false),
            client: reqwest::Client::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn method_url(&self, method: &str) -> Result<String, TelegramError> {
        let token = self.token.as_ref().ok_or(TelegramError::MissingToken)?;
        Ok(format!("{}/bot{}/{}", self.api_base, token, method))
    }

    /// POST a Bot API method and decode its `result`.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, TelegramError> {
        let url = self.method_url(method)?;
        let res = self.client.post(&url).json(&body).send().await?;
        let status = res.status();
        let data: ApiResponse<T> = res.json().await?;
        if !data.ok {
            return Err(TelegramError::Api(format!(
                "{} failed: {} {}",
                method,
                status,
                data.description.unwrap_or_default()
            )));
        }
        data.result
            .ok_or_else(|| TelegramError::Api(format!("{} returned no result", method)))
    }

    /// Start the getUpdates long-poll loop and forward events to the bot. Returns a handle to await on shutdown.
    pub fn start_inbound(self: Arc<Self>, inbound_tx: mpsc::Sender<Inbound>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        log::info!("telegram channel: starting getUpdates long-poll loop");
        tokio::spawn(async move {
            run_get_updates_loop(self, inbound_tx).await;
        })
    }

    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), TelegramError> {
        let mut body = json!({
            "timeout": LONG_POLL_TIMEOUT,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(off) = offset {
            body["offset"] = json!(off);
        }
        let updates: Vec<TelegramUpdate> = self.call("getUpdates", body).await?;
        let next_offset = updates.iter().map(|u| u.update_id).max().map(|id| id + 1);
        Ok((updates, next_offset))
    }

    /// Remove any webhook and discard updates queued while the bot was offline.
    pub async fn drop_pending_updates(&self) -> Result<(), TelegramError> {
        let _: bool = self
            .call("deleteWebhook", json!({ "drop_pending_updates": true }))
            .await?;
        Ok(())
    }

    /// Send a plain text message to a chat.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), TelegramError> {
        let _: serde_json::Value = self
            .call("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await?;
        Ok(())
    }

    /// Send a MarkdownV2 message, optionally with an inline keyboard. Returns the new message id.
    pub async fn send_markdown(
        &self,
        chat_id: &str,
        text: &str,
        keyboard: Option<&[Vec<InlineButton>]>,
    ) -> Result<i64, TelegramError> {
        let mut body = json!({ "chat_id": chat_id, "text": text, "parse_mode": "MarkdownV2" });
        if let Some(rows) = keyboard {
            body["reply_markup"] = keyboard_json(rows);
        }
        let msg: TelegramMessage = self.call("sendMessage", body).await?;
        Ok(msg.message_id)
    }

    /// Replace the text of an existing message (dropping its keyboard).
    pub async fn edit_message_text(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
        markdown: bool,
    ) -> Result<(), TelegramError> {
        let mut body = json!({ "chat_id": chat_id, "message_id": message_id, "text": text });
        if markdown {
            body["parse_mode"] = json!("MarkdownV2");
        }
        let _: serde_json::Value = self.call("editMessageText", body).await?;
        Ok(())
    }

    /// Acknowledge a button press; with `text`, show it as a toast (or an alert when `show_alert`).
    pub async fn answer_callback_query(
        &self,
        callback_id: &str,
        text: Option<&str>,
        show_alert: bool,
    ) -> Result<(), TelegramError> {
        let mut body = json!({ "callback_query_id": callback_id, "show_alert": show_alert });
        if let Some(t) = text {
            body["text"] = json!(t);
        }
        let _: bool = self.call("answerCallbackQuery", body).await?;
        Ok(())
    }
}

async fn run_get_updates_loop(channel: Arc<TelegramChannel>, inbound_tx: mpsc::Sender<Inbound>) {
    let mut offset: Option<i64> = None;
    while channel.running() {
        match channel.get_updates(offset).await {
            Ok((updates, next)) => {
                if next.is_some() {
                    offset = next;
                }
                for u in updates {
                    let Some(inbound) = u.into_inbound() else {
                        continue;
                    };
                    if inbound_tx.send(inbound).await.is_err() {
                        log::debug!("telegram: inbound channel closed, stopping loop");
                        return;
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

/// Resolve Telegram bot API base URL (for tests or custom endpoints).
pub fn telegram_api_base() -> String {
    std::env::var("TELEGRAM_API_BASE").unwrap_or_else(|_| TELEGRAM_API_BASE.to_string())
}

/// Escape text for MarkdownV2 outside code blocks.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if "_*[]()~`>#+-=|{}.!\\".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape text for a MarkdownV2 pre/code block (only '`' and '\' are special there).
pub fn escape_code(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '`' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
