// src/publish/telegram.rs
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::PublishError;
use crate::publish::format::OutboundMessage;
use crate::publish::Publisher;

/// Telegram caps photo captions well below message length.
pub const MAX_CAPTION_CHARS: usize = 1024;

/// Bot API `sendMessage` / `sendPhoto` into a single channel, HTML parse mode.
#[derive(Clone)]
pub struct TelegramPublisher {
    client: Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<SentMessage>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

impl TelegramPublisher {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent("news-relay/0.1")
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .context("building telegram http client")?;
        Ok(Self {
            client,
            api_base: "https://api.telegram.org".to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
        })
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    async fn call(&self, method: &str, payload: serde_json::Value) -> Result<String, PublishError> {
        let url = format!("{}/bot{}/{}", self.api_base, self.bot_token, method);
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            // The token is part of the URL; keep it out of the error text.
            .map_err(|e| PublishError::Transient(format!("telegram {method}: {}", e.without_url())))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let parsed: ApiResponse = serde_json::from_str(&body)
            .map_err(|e| PublishError::Transient(format!("telegram {method}: malformed response: {e}")))?;
        match (parsed.ok, parsed.result) {
            (true, Some(m)) => Ok(m.message_id.to_string()),
            _ => Err(PublishError::Permanent(format!(
                "telegram {method}: {}",
                parsed.description.unwrap_or_else(|| "request rejected".into())
            ))),
        }
    }
}

/// 429 and 5xx are retryable; any other failure status means the request
/// itself is wrong (bad token, unknown chat, unparsable HTML).
pub(crate) fn classify_status(status: StatusCode, body: &str) -> PublishError {
    let description = serde_json::from_str::<ApiResponse>(body)
        .ok()
        .and_then(|r| r.description)
        .unwrap_or_else(|| body.chars().take(200).collect());
    let msg = format!("HTTP {}: {}", status.as_u16(), description);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        PublishError::Transient(msg)
    } else {
        PublishError::Permanent(msg)
    }
}

#[async_trait]
impl Publisher for TelegramPublisher {
    async fn send(&self, message: &OutboundMessage) -> Result<String, PublishError> {
        if let Some(photo) = &message.image_url {
            if message.text.chars().count() <= MAX_CAPTION_CHARS {
                let res = self
                    .call(
                        "sendPhoto",
                        json!({
                            "chat_id": self.chat_id,
                            "photo": photo,
                            "caption": message.text,
                            "parse_mode": "HTML"
                        }),
                    )
                    .await;
                match res {
                    Err(PublishError::Permanent(e)) => {
                        // Usually an image Telegram cannot fetch; the text still goes out.
                        tracing::warn!(target: "publish", error = %e, "sendPhoto rejected, falling back to text");
                    }
                    other => return other,
                }
            }
        }

        self.call(
            "sendMessage",
            json!({
                "chat_id": self.chat_id,
                "text": message.text,
                "parse_mode": "HTML",
                "disable_web_page_preview": false
            }),
        )
        .await
    }

    fn name(&self) -> &str {
        "telegram"
    }
}

/// Logs instead of sending. Every call "succeeds" with a fresh id.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunPublisher;

#[async_trait]
impl Publisher for DryRunPublisher {
    async fn send(&self, message: &OutboundMessage) -> Result<String, PublishError> {
        let id = format!("dry-run-{}", Uuid::new_v4());
        tracing::info!(
            target: "publish",
            message_id = %id,
            chars = message.text.chars().count(),
            has_image = message.image_url.is_some(),
            "dry run: message not sent"
        );
        Ok(id)
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}
