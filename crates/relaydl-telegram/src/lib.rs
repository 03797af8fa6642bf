//! Relaydl Telegram Adapter
//!
//! Telegram Bot API long-polling with offset persistence, client recreation,
//! webhook ingress, inline keyboards, file uploads and message chunking

pub mod menu;
mod webhook;

pub use webhook::{serve_webhook, webhook_path};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use relaydl_config::{telegram_account_tag, TelegramConfig};
use relaydl_ipc::{
    ChatAction, ChatTransport, Envelope, EventBus, Keyboard, MemberStatus, MessageKind,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, ClientBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};

pub const CHANNEL: &str = "telegram";

const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;
const TELEGRAM_MAX_CAPTION_LEN: usize = 1024;
const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const UPLOAD_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
    pub chat: TelegramChat,
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    pub message: Option<TelegramMessage>,
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChatMember {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramAdapter {
    client: Client,
    account_tag: String,
    api_url: String,
    data_dir: PathBuf,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
    event_bus: Option<EventBus>,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig, data_dir: PathBuf) -> Result<Self> {
        let base = config
            .api_base_url
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/');
        let api_url = format!("{}/bot{}", base, config.bot_token.trim());

        Ok(Self {
            client: Self::build_client()?,
            account_tag: telegram_account_tag(&config.bot_token),
            api_url,
            data_dir,
            poll_timeout_secs: config
                .poll_timeout_secs
                .unwrap_or(relaydl_config::DEFAULT_POLL_TIMEOUT_SECS),
            client_recreate_interval_secs: config
                .client_recreate_interval_secs
                .unwrap_or(relaydl_config::DEFAULT_CLIENT_RECREATE_SECS),
            event_bus: None,
        })
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn account_tag(&self) -> &str {
        &self.account_tag
    }

    fn build_client() -> Result<Client> {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("failed to build HTTP client: {}", e))
    }

    fn offset_path(&self) -> PathBuf {
        self.data_dir
            .join("runtime")
            .join(format!("telegram.{}.offset", self.account_tag))
    }

    async fn read_offset(&self) -> Option<i64> {
        match fs::read_to_string(self.offset_path()).await {
            Ok(content) => content.trim().parse().ok(),
            Err(_) => None,
        }
    }

    async fn write_offset(&self, offset: i64) {
        let p = self.offset_path();
        if let Some(parent) = p.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        if let Err(e) = fs::write(&p, format!("{}\n", offset)).await {
            warn!("Failed to persist Telegram offset: {}", e);
        }
    }

    /// Request errors are stripped of their URL, which carries the bot token.
    async fn call(&self, client: &Client, method: &str, payload: &Value) -> Result<Value> {
        let url = format!("{}/{}", self.api_url, method);
        let resp = client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} request failed: {}", method, e.without_url()))?;
        Self::read_response(method, resp).await
    }

    async fn read_response(method: &str, resp: Response) -> Result<Value> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| anyhow!("telegram {} read failed: {}", method, e.without_url()))?;
        let parsed: ApiResponse<Value> = serde_json::from_str(&body)
            .map_err(|e| anyhow!("telegram {} decode failed (HTTP {}): {}", method, status, e))?;
        if !parsed.ok {
            return Err(anyhow!(
                "telegram {} HTTP {}: {}",
                method,
                status,
                parsed.description.unwrap_or_default()
            ));
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    pub async fn get_updates(
        &self,
        client: &Client,
        offset: Option<i64>,
    ) -> Result<Vec<TelegramUpdate>> {
        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });

        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }

        let result = self.call(client, "getUpdates", &payload).await?;
        serde_json::from_value(result)
            .map_err(|e| anyhow!("telegram getUpdates decode failed: {}", e))
    }

    /// Sends `text` split into 4096-char chunks; the keyboard goes on the last
    /// chunk. Returns the id of the last message sent.
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        inline_keyboard: Option<&Keyboard>,
    ) -> Result<Option<i64>> {
        let chunks = chunk_message(text);
        let mut last_id = None;

        for (i, chunk) in chunks.iter().enumerate() {
            let mut payload = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "disable_web_page_preview": true,
            });

            if i == chunks.len() - 1 {
                if let Some(keyboard) = inline_keyboard {
                    payload["reply_markup"] = keyboard_markup(keyboard);
                }
            }

            let result = self.call(&self.client, "sendMessage", &payload).await?;
            last_id = result.get("message_id").and_then(Value::as_i64);
        }

        Ok(last_id)
    }

    pub async fn edit_message_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        // editMessageText cannot be split into chunks: fallback to a new message if too long.
        if text.chars().count() > TELEGRAM_MAX_MESSAGE_LEN {
            return self.send_message(chat_id, text, None).await.map(|_| ());
        }

        let payload = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "disable_web_page_preview": true,
        });

        match self.call(&self.client, "editMessageText", &payload).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_modified(&e.to_string()) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn answer_callback_query(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
    ) -> Result<()> {
        let mut payload = serde_json::json!({
            "callback_query_id": callback_query_id,
        });

        if let Some(t) = text {
            payload["text"] = serde_json::json!(t);
        }

        self.call(&self.client, "answerCallbackQuery", &payload)
            .await
            .map(|_| ())
    }

    pub async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "action": action,
        });
        self.call(&self.client, "sendChatAction", &payload)
            .await
            .map(|_| ())
    }

    pub async fn get_chat_member(&self, channel: &str, user_id: i64) -> Result<MemberStatus> {
        let payload = serde_json::json!({
            "chat_id": channel,
            "user_id": user_id,
        });
        let result = self.call(&self.client, "getChatMember", &payload).await?;
        let member: TelegramChatMember = serde_json::from_value(result)
            .map_err(|e| anyhow!("telegram getChatMember decode failed: {}", e))?;
        Ok(MemberStatus::parse(&member.status))
    }

    async fn upload(
        &self,
        method: &str,
        field: &str,
        chat_id: i64,
        file: &Path,
        extra: Vec<(&'static str, String)>,
    ) -> Result<()> {
        let handle = fs::File::open(file)
            .await
            .map_err(|e| anyhow!("cannot open {}: {}", file.display(), e))?;
        let len = handle.metadata().await?.len();
        let file_name = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("media")
            .to_string();

        let part = Part::stream_with_length(Body::from(handle), len).file_name(file_name);
        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field.to_string(), part);
        for (key, value) in extra {
            form = form.text(key, value);
        }

        debug!(method, chat_id, size = len, "Uploading file");
        let url = format!("{}/{}", self.api_url, method);
        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} request failed: {}", method, e.without_url()))?;
        Self::read_response(method, resp).await.map(|_| ())
    }

    pub async fn poll(&self) -> Result<()> {
        let mut offset: Option<i64> = self.read_offset().await;

        info!(offset = ?offset, "Telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        if let Err(err) = self.delete_webhook().await {
            warn!("Failed to clear Telegram webhook: {}", err);
        }

        if let Err(err) = self.sync_bot_commands().await {
            warn!("Failed to sync Telegram bot commands: {}", err);
        } else {
            info!("Telegram bot commands synced");
        }

        loop {
            if Instant::now() >= client_recreate_at {
                info!("Recreating HTTP client to prevent stale connections");
                match Self::build_client() {
                    Ok(fresh) => client = fresh,
                    Err(e) => warn!("{}", e),
                }
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                self.write_offset(update.update_id + 1).await;
                self.handle_update(&update);
            }
        }
    }

    pub async fn sync_bot_commands(&self) -> Result<()> {
        let commands = serde_json::json!([
            { "command": "start", "description": "Start the bot" },
            { "command": "help", "description": "How to use the bot" },
            { "command": "me", "description": "Show your usage and VIP status" }
        ]);

        let payload = serde_json::json!({ "commands": commands });
        self.call(&self.client, "setMyCommands", &payload)
            .await
            .map(|_| ())
    }

    pub async fn set_webhook(&self, url: &str, secret_token: Option<&str>) -> Result<()> {
        let mut payload = serde_json::json!({
            "url": url,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(secret) = secret_token {
            payload["secret_token"] = serde_json::json!(secret);
        }
        self.call(&self.client, "setWebhook", &payload)
            .await
            .map(|_| ())
    }

    pub async fn delete_webhook(&self) -> Result<()> {
        self.call(&self.client, "deleteWebhook", &serde_json::json!({}))
            .await
            .map(|_| ())
    }

    /// Publishes an update on the event bus. Shared by polling and webhook.
    pub fn handle_update(&self, update: &TelegramUpdate) {
        let Some(envelope) = update_to_envelope(update) else {
            debug!(update_id = update.update_id, "Ignoring update");
            return;
        };

        match &self.event_bus {
            Some(event_bus) => {
                if let Err(e) = event_bus.publish(envelope) {
                    warn!("Failed to publish update to event bus: {}", e);
                }
            }
            None => info!("No event bus configured, update not forwarded"),
        }
    }
}

#[async_trait]
impl ChatTransport for TelegramAdapter {
    async fn chat_member_status(&self, channel: &str, user_id: i64) -> Result<MemberStatus> {
        self.get_chat_member(channel, user_id).await
    }

    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<Option<i64>> {
        self.send_message(chat_id, text, keyboard).await
    }

    async fn edit_text(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        self.edit_message_text(chat_id, message_id, text).await
    }

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> Result<()> {
        self.answer_callback_query(query_id, text).await
    }

    async fn send_chat_action(&self, chat_id: i64, action: ChatAction) -> Result<()> {
        TelegramAdapter::send_chat_action(self, chat_id, action.as_str()).await
    }

    async fn send_video(&self, chat_id: i64, file: &Path, caption: &str) -> Result<()> {
        self.upload(
            "sendVideo",
            "video",
            chat_id,
            file,
            vec![
                ("caption", truncate_chars(caption, TELEGRAM_MAX_CAPTION_LEN)),
                ("supports_streaming", "true".to_string()),
            ],
        )
        .await
    }

    async fn send_audio(&self, chat_id: i64, file: &Path, title: &str) -> Result<()> {
        self.upload(
            "sendAudio",
            "audio",
            chat_id,
            file,
            vec![("title", truncate_chars(title, TELEGRAM_MAX_CAPTION_LEN))],
        )
        .await
    }

    async fn send_document(&self, chat_id: i64, file: &Path, caption: &str) -> Result<()> {
        self.upload(
            "sendDocument",
            "document",
            chat_id,
            file,
            vec![("caption", truncate_chars(caption, TELEGRAM_MAX_CAPTION_LEN))],
        )
        .await
    }
}

/// Maps an update to an inbound envelope. Bot senders and updates without a
/// user are dropped.
pub fn update_to_envelope(update: &TelegramUpdate) -> Option<Envelope> {
    if let Some(message) = &update.message {
        let from = message.from.as_ref()?;
        if from.is_bot == Some(true) {
            return None;
        }

        let text = message
            .text
            .as_deref()
            .or(message.caption.as_deref())
            .unwrap_or("")
            .trim()
            .to_string();

        let kind = parse_command(&text).unwrap_or(MessageKind::Message { text });
        return Some(
            Envelope::new(CHANNEL, kind)
                .with_user_id(from.id)
                .with_chat_id(message.chat.id)
                .with_message_id(message.message_id),
        );
    }

    if let Some(callback) = &update.callback_query {
        let mut envelope = Envelope::new(
            CHANNEL,
            MessageKind::Callback {
                query_id: callback.id.clone(),
                data: callback.data.clone().unwrap_or_default(),
            },
        )
        .with_user_id(callback.from.id);

        if let Some(message) = &callback.message {
            envelope = envelope
                .with_chat_id(message.chat.id)
                .with_message_id(message.message_id);
        }
        return Some(envelope);
    }

    None
}

/// `/name@bot arg1 arg2` -> `Command { name, args, raw_args }`. Line breaks
/// and spacing inside the arguments are kept in `raw_args`.
fn parse_command(text: &str) -> Option<MessageKind> {
    let rest = text.strip_prefix('/')?;
    let (head, raw_args) = match rest.find(char::is_whitespace) {
        Some(i) => (&rest[..i], rest[i..].trim_start()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    if name.is_empty() {
        return None;
    }
    Some(MessageKind::Command {
        name,
        args: raw_args.split_whitespace().map(str::to_string).collect(),
        raw_args: raw_args.to_string(),
    })
}

fn keyboard_markup(keyboard: &Keyboard) -> Value {
    serde_json::json!({
        "inline_keyboard": keyboard.iter().map(|row| {
            row.iter().map(|btn| serde_json::json!({
                "text": btn.text,
                "callback_data": btn.callback_data
            })).collect::<Vec<_>>()
        }).collect::<Vec<_>>()
    })
}

fn is_not_modified(error: &str) -> bool {
    error.to_ascii_lowercase().contains("message is not modified")
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn chunk_message(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= TELEGRAM_MAX_MESSAGE_LEN {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + TELEGRAM_MAX_MESSAGE_LEN).min(chars.len());

        if end < chars.len() {
            let mut split = end;
            for i in (start..end).rev() {
                let c = chars[i];
                if c == '\n' || c == ' ' || c == '.' || c == '!' || c == '?' {
                    split = i + 1;
                    break;
                }
            }
            if split > start {
                end = split;
            }
        }

        chunks.push(chars[start..end].iter().collect::<String>());
        start = end;
    }

    chunks
}
