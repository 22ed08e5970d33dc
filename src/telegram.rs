//! Telegram transport.
//!
//! A long-polling loop that:
//! - Receives group-chat messages via `getUpdates` and hands each one to the
//!   agent, strictly in arrival order.
//! - Sends replies, unsolicited messages, and the typing indicator back
//!   through the Bot API.
//!
//! Transport failures back off and keep polling; handler failures are logged
//! and the offending update is dropped.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::agent::Agent;

/// Telegram enforces a 4096-character limit per message.
const MAX_MESSAGE_LEN: usize = 4096;

/// Long-poll hold time for getUpdates, in seconds. The HTTP client timeout
/// must sit above this.
const POLL_TIMEOUT_SECS: u64 = 30;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(35);

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    from: Option<TelegramUser>,
    text: Option<String>,
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<PhotoSize>,
}

#[derive(Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct TelegramUser {
    id: i64,
    first_name: String,
}

/// Photo payloads are never downloaded; presence alone routes the reply.
#[derive(Deserialize)]
struct PhotoSize {}

// ─── Normalized inbound message ──────────────────────────────────────────────

/// What the agent sees for every inbound update.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub is_private: bool,
    pub sender_id: i64,
    pub sender_name: String,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub has_photo: bool,
}

impl IncomingMessage {
    /// Message body used for memory entries and mention checks: the text,
    /// else the caption, else the empty string.
    pub fn body(&self) -> &str {
        self.text
            .as_deref()
            .or(self.caption.as_deref())
            .unwrap_or("")
    }
}

/// Outbound surface of the messaging gateway. The agent only ever needs
/// plain sends and the typing indicator; tests substitute a recording fake.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()>;
    async fn send_typing(&self, chat_id: i64) -> Result<()>;
}

// ─── Bot API client ──────────────────────────────────────────────────────────

pub struct TelegramApi {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramApi {
    pub fn new(token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build Telegram HTTP client")?;

        Ok(Self {
            client,
            api_base: format!("https://api.telegram.org/bot{}", token),
        })
    }

    /// One getUpdates long poll. Transport errors log, back off, and
    /// return None so the caller just polls again.
    async fn poll_updates(&self, offset: i64) -> Option<Vec<Update>> {
        let url = format!("{}/getUpdates", self.api_base);
        let params = serde_json::json!({
            "offset": offset,
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["message"]
        });

        let resp = match self.client.post(&url).json(&params).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Telegram getUpdates error: {}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                return None;
            }
        };

        let body: TelegramResponse<Vec<Update>> = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Telegram getUpdates parse error: {}", e);
                tokio::time::sleep(Duration::from_secs(5)).await;
                return None;
            }
        };

        if !body.ok {
            tracing::warn!("Telegram API returned ok=false");
            tokio::time::sleep(Duration::from_secs(10)).await;
            return None;
        }

        Some(body.result.unwrap_or_default())
    }
}

#[async_trait]
impl ChatTransport for TelegramApi {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let url = format!("{}/sendMessage", self.api_base);
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "text": truncate_message(text),
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("Telegram sendMessage request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Telegram sendMessage failed: HTTP {}", resp.status());
        }

        tracing::debug!("Telegram: sent message to chat {}", chat_id);
        Ok(())
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        let url = format!("{}/sendChatAction", self.api_base);
        let payload = serde_json::json!({ "chat_id": chat_id, "action": "typing" });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("Telegram sendChatAction request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Telegram sendChatAction failed: HTTP {}", resp.status());
        }
        Ok(())
    }
}

// ─── Bot loop ────────────────────────────────────────────────────────────────

/// Poll forever, dispatching each message to the agent in arrival order.
pub async fn run_bot(api: Arc<TelegramApi>, agent: Arc<Agent>) {
    let mut offset: i64 = 0;

    loop {
        let updates = match api.poll_updates(offset).await {
            Some(u) => u,
            None => continue,
        };

        for update in updates {
            offset = update.update_id + 1;

            let msg = match update.message {
                Some(m) => m,
                None => continue,
            };

            let incoming = match normalize(msg) {
                Some(i) => i,
                None => continue,
            };

            tracing::debug!(
                "Telegram [chat {}] {}: {:?}",
                incoming.chat_id,
                incoming.sender_name,
                incoming.body()
            );

            if let Err(e) = Arc::clone(&agent).handle_update(incoming).await {
                tracing::error!("Failed to handle update: {:#}", e);
            }
        }
    }
}

/// Flatten a raw Telegram message into what the agent consumes. Messages
/// with no sender, or with neither text, caption, nor photo (stickers,
/// joins, and so on) are dropped.
fn normalize(message: TelegramMessage) -> Option<IncomingMessage> {
    let from = message.from?;
    if message.text.is_none() && message.caption.is_none() && message.photo.is_empty() {
        return None;
    }

    Some(IncomingMessage {
        chat_id: message.chat.id,
        is_private: message.chat.kind == "private",
        sender_id: from.id,
        sender_name: from.first_name,
        text: message.text,
        caption: message.caption,
        has_photo: !message.photo.is_empty(),
    })
}

/// Cut to the Telegram limit without splitting a UTF-8 character.
fn truncate_message(text: &str) -> &str {
    if text.len() <= MAX_MESSAGE_LEN {
        return text;
    }
    let mut end = MAX_MESSAGE_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_message(json: &str) -> TelegramMessage {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn short_messages_pass_through_untouched() {
        assert_eq!(truncate_message("hello"), "hello");
        let exact = "a".repeat(MAX_MESSAGE_LEN);
        assert_eq!(truncate_message(&exact), exact);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // A four-byte emoji straddling the limit must be dropped whole.
        let mut text = "a".repeat(MAX_MESSAGE_LEN - 2);
        text.push('\u{1F600}');
        text.push_str("tail");

        let cut = truncate_message(&text);
        assert_eq!(cut.len(), MAX_MESSAGE_LEN - 2);
        assert!(cut.chars().all(|c| c == 'a'));
    }

    #[test]
    fn normalize_group_text_message() {
        let msg = raw_message(
            r#"{
                "message_id": 10,
                "chat": {"id": -100, "type": "supergroup"},
                "from": {"id": 42, "first_name": "Alice"},
                "text": "hello"
            }"#,
        );

        let incoming = normalize(msg).unwrap();
        assert_eq!(incoming.chat_id, -100);
        assert!(!incoming.is_private);
        assert_eq!(incoming.sender_id, 42);
        assert_eq!(incoming.sender_name, "Alice");
        assert_eq!(incoming.body(), "hello");
        assert!(!incoming.has_photo);
    }

    #[test]
    fn normalize_photo_message_uses_caption_as_body() {
        let msg = raw_message(
            r#"{
                "message_id": 11,
                "chat": {"id": 5, "type": "private"},
                "from": {"id": 42, "first_name": "Alice"},
                "caption": "look at this",
                "photo": [{"file_id": "abc", "width": 90, "height": 90}]
            }"#,
        );

        let incoming = normalize(msg).unwrap();
        assert!(incoming.is_private);
        assert!(incoming.has_photo);
        assert!(incoming.text.is_none());
        assert_eq!(incoming.body(), "look at this");
    }

    #[test]
    fn normalize_drops_stickers_and_service_messages() {
        let sticker = raw_message(
            r#"{
                "message_id": 12,
                "chat": {"id": -100, "type": "group"},
                "from": {"id": 42, "first_name": "Alice"}
            }"#,
        );
        assert!(normalize(sticker).is_none());

        let no_sender = raw_message(
            r#"{
                "message_id": 13,
                "chat": {"id": -100, "type": "group"},
                "text": "channel post"
            }"#,
        );
        assert!(normalize(no_sender).is_none());
    }

    #[test]
    fn update_batch_parses_from_wire_format() {
        let body: TelegramResponse<Vec<Update>> = serde_json::from_str(
            r#"{
                "ok": true,
                "result": [
                    {
                        "update_id": 1000,
                        "message": {
                            "message_id": 1,
                            "chat": {"id": -100, "type": "group"},
                            "from": {"id": 42, "first_name": "Alice"},
                            "text": "hi"
                        }
                    },
                    {"update_id": 1001}
                ]
            }"#,
        )
        .unwrap();

        assert!(body.ok);
        let updates = body.result.unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].update_id, 1000);
        assert!(updates[1].message.is_none());
    }
}
