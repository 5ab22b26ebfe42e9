//! Telegram transport: the `ChatTransport` capability and its Bot API
//! client.
//!
//! The rest of the system only sees [`ChatTransport`]; the client here is
//! the one real implementation. HTTPS-only, long-polling, single allowed
//! chat enforced by the router (not here).

pub mod types;

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::TelegramConfig;
use crate::types::{Capability, ChatId, CoreError, CoreResult};

pub use types::{
    CallbackQuery, Keyboard, KeyboardButton, TelegramMessage, TelegramUpdate, TelegramUser,
    TelegramVoice,
};

use types::{EditMessageRequest, SendMessageRequest, TelegramFile, TelegramResponse};

/// Reference to a sent message, used for edit-in-place progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: i64,
}

/// Narrow transport capability consumed by the router and presentation
/// layers.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> CoreResult<MessageRef>;

    async fn edit_text(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> CoreResult<()>;

    async fn send_voice(&self, chat: ChatId, path: &Path) -> CoreResult<()>;

    async fn send_file(&self, chat: ChatId, path: &Path, caption: Option<&str>) -> CoreResult<()>;

    async fn download_voice(&self, file_id: &str) -> CoreResult<Vec<u8>>;

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> CoreResult<()>;
}

/// Telegram Bot API client.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    config: TelegramConfig,
    http_client: reqwest::Client,
}

impl TelegramClient {
    pub fn new(config: TelegramConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            config,
            http_client,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base, self.config.bot_token, method
        )
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{}",
            self.config.api_base, self.config.bot_token, file_path
        )
    }

    fn transport_error(message: impl Into<String>) -> CoreError {
        CoreError::CapabilityFailure {
            capability: Capability::Transport,
            message: message.into(),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: &impl serde::Serialize,
    ) -> CoreResult<T> {
        let response = self
            .http_client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| Self::transport_error(format!("{method} request failed: {e}")))?;

        let envelope: TelegramResponse<T> = response
            .json()
            .await
            .map_err(|e| Self::transport_error(format!("{method} response unparsable: {e}")))?;

        if envelope.ok {
            envelope
                .result
                .ok_or_else(|| Self::transport_error(format!("{method} returned no result")))
        } else {
            let description = envelope
                .description
                .unwrap_or_else(|| "unknown error".to_string());
            error!(method, code = ?envelope.error_code, %description, "telegram api error");
            Err(Self::transport_error(format!("{method}: {description}")))
        }
    }

    /// Bot identity check; used by the doctor command.
    pub async fn get_me(&self) -> CoreResult<TelegramUser> {
        self.call("getMe", &serde_json::json!({})).await
    }

    /// Long-poll for updates after `offset`.
    pub async fn get_updates(&self, offset: Option<i64>) -> CoreResult<Vec<TelegramUpdate>> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": 30,
            "allowed_updates": ["message", "callback_query"],
        });
        let updates: Vec<TelegramUpdate> = self.call("getUpdates", &body).await?;
        if !updates.is_empty() {
            debug!(count = updates.len(), "updates received");
        }
        Ok(updates)
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> CoreResult<MessageRef> {
        let request = SendMessageRequest {
            chat_id: chat.0,
            text: text.to_string(),
            parse_mode: Some("HTML".to_string()),
            reply_markup: keyboard
                .filter(|k| !k.is_empty())
                .map(|k| k.to_reply_markup()),
        };
        let message: TelegramMessage = self.call("sendMessage", &request).await?;
        Ok(MessageRef {
            chat_id: chat,
            message_id: message.message_id,
        })
    }

    async fn edit_text(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> CoreResult<()> {
        let request = EditMessageRequest {
            chat_id: message.chat_id.0,
            message_id: message.message_id,
            text: text.to_string(),
            parse_mode: Some("HTML".to_string()),
            reply_markup: keyboard
                .filter(|k| !k.is_empty())
                .map(|k| k.to_reply_markup()),
        };
        let _: TelegramMessage = self.call("editMessageText", &request).await?;
        Ok(())
    }

    async fn send_voice(&self, chat: ChatId, path: &Path) -> CoreResult<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| CoreError::io("read voice artifact", e))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "voice.ogg".to_string());

        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat.0.to_string())
            .part(
                "voice",
                reqwest::multipart::Part::bytes(bytes).file_name(filename),
            );

        let response = self
            .http_client
            .post(self.api_url("sendVoice"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Self::transport_error(format!("sendVoice failed: {e}")))?;

        let envelope: TelegramResponse<TelegramMessage> = response
            .json()
            .await
            .map_err(|e| Self::transport_error(format!("sendVoice response unparsable: {e}")))?;
        if !envelope.ok {
            return Err(Self::transport_error(format!(
                "sendVoice: {}",
                envelope.description.unwrap_or_default()
            )));
        }
        info!(chat_id = %chat, "voice message sent");
        Ok(())
    }

    async fn send_file(&self, chat: ChatId, path: &Path, caption: Option<&str>) -> CoreResult<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| CoreError::io("read file attachment", e))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.txt".to_string());

        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat.0.to_string())
            .part(
                "document",
                reqwest::multipart::Part::bytes(bytes).file_name(filename),
            );
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }

        let response = self
            .http_client
            .post(self.api_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Self::transport_error(format!("sendDocument failed: {e}")))?;

        let envelope: TelegramResponse<TelegramMessage> = response
            .json()
            .await
            .map_err(|e| Self::transport_error(format!("sendDocument response unparsable: {e}")))?;
        if !envelope.ok {
            return Err(Self::transport_error(format!(
                "sendDocument: {}",
                envelope.description.unwrap_or_default()
            )));
        }
        Ok(())
    }

    async fn download_voice(&self, file_id: &str) -> CoreResult<Vec<u8>> {
        let file: TelegramFile = self
            .call("getFile", &serde_json::json!({ "file_id": file_id }))
            .await?;
        let file_path = file
            .file_path
            .ok_or_else(|| Self::transport_error("getFile returned no path"))?;

        let response = self
            .http_client
            .get(self.file_url(&file_path))
            .send()
            .await
            .map_err(|e| Self::transport_error(format!("file download failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Self::transport_error(format!(
                "file download returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::transport_error(format!("file body unreadable: {e}")))?;
        debug!(file_id, bytes = bytes.len(), "voice downloaded");
        Ok(bytes.to_vec())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> CoreResult<()> {
        let body = serde_json::json!({
            "callback_query_id": callback_id,
            "text": text,
        });
        let _: bool = self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }
}

/// Escape HTML for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
