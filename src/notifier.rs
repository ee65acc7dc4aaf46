//! Telegram notifications (photo + caption, plain text for heartbeats).

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::config::TelegramConfig;
use crate::error::NotifyError;

/// Telegram rejects photo captions longer than this.
pub const CAPTION_LIMIT: usize = 1024;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_photo(&self, jpeg: &[u8], caption: &str) -> Result<(), NotifyError>;

    async fn send_text(&self, text: &str) -> Result<(), NotifyError>;
}

/// Cut at a char boundary, never mid-codepoint.
pub fn truncate_caption(caption: &str) -> String {
    caption.chars().take(CAPTION_LIMIT).collect()
}

pub struct TelegramNotifier {
    http: Client,
    api_base: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, token: &str, chat_id: &str) -> Result<Self, NotifyError> {
        let http = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn check(resp: reqwest::Response) -> Result<(), NotifyError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(NotifyError::Status {
            status: status.as_u16(),
            body: body.chars().take(300).collect(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_photo(&self, jpeg: &[u8], caption: &str) -> Result<(), NotifyError> {
        let photo = Part::bytes(jpeg.to_vec())
            .file_name("frame.jpg")
            .mime_str("image/jpeg")?;
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", truncate_caption(caption))
            .part("photo", photo);

        let resp = self
            .http
            .post(self.method_url("sendPhoto"))
            .multipart(form)
            .send()
            .await?;
        Self::check(resp).await?;
        debug!("telegram photo sent ({} bytes)", jpeg.len());
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), NotifyError> {
        let resp = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&serde_json::json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await?;
        Self::check(resp).await
    }
}

/// Used when no bot token/chat id is configured.
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn send_photo(&self, _jpeg: &[u8], caption: &str) -> Result<(), NotifyError> {
        debug!("telegram disabled, dropping alert: {}", caption);
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), NotifyError> {
        debug!("telegram disabled, dropping message: {}", text);
        Ok(())
    }
}

/// Telegram when configured, otherwise a no-op.
pub fn from_config(cfg: &TelegramConfig) -> Result<Box<dyn Notifier>, NotifyError> {
    match (&cfg.bot_token, &cfg.chat_id) {
        (Some(token), Some(chat)) if cfg.is_configured() => {
            Ok(Box::new(TelegramNotifier::new(&cfg.api_base, token, chat)?))
        }
        _ => Ok(Box::new(DisabledNotifier)),
    }
}
