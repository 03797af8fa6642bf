//! Relaydl IPC
//!
//! Event bus for transport-to-core communication and the outbound chat
//! transport contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn default_trace_id() -> String {
    generate_trace_id()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    pub id: String,
    pub channel: String,
    pub kind: MessageKind,
    pub user_id: Option<i64>,
    pub chat_id: Option<i64>,
    pub message_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageKind {
    #[serde(rename = "message")]
    Message { text: String },

    #[serde(rename = "callback")]
    Callback { query_id: String, data: String },

    /// `args` is the whitespace split of `raw_args`, the untouched text
    /// after the command name.
    #[serde(rename = "command")]
    Command {
        name: String,
        args: Vec<String>,
        #[serde(default)]
        raw_args: String,
    },
}

impl Envelope {
    pub fn new(channel: &str, kind: MessageKind) -> Self {
        Self {
            trace_id: generate_trace_id(),
            id: generate_trace_id(),
            channel: channel.to_string(),
            kind,
            user_id: None,
            chat_id: None,
            message_id: None,
        }
    }

    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_chat_id(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn with_message_id(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Key used to serialize handling of events from the same user.
    pub fn scope_key(&self) -> String {
        match (self.user_id, self.chat_id) {
            (Some(user), _) => format!("{}:user:{}", self.channel, user),
            (None, Some(chat)) => format!("{}:chat:{}", self.channel, chat),
            (None, None) => format!("{}:anon:{}", self.channel, self.id),
        }
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inbound: inbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.inbound.send(envelope)?;
        Ok(())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

pub type Keyboard = Vec<Vec<InlineButton>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// Video height ceiling. Ignored for audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quality {
    Best,
    MaxHeight(u32),
}

/// Membership as reported by `getChatMember`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberStatus {
    Creator,
    Administrator,
    Member,
    Restricted,
    Left,
    Kicked,
    Other(String),
}

impl MemberStatus {
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "creator" => MemberStatus::Creator,
            "administrator" => MemberStatus::Administrator,
            "member" => MemberStatus::Member,
            "restricted" => MemberStatus::Restricted,
            "left" => MemberStatus::Left,
            "kicked" => MemberStatus::Kicked,
            other => MemberStatus::Other(other.to_string()),
        }
    }

    /// Only `left` and `kicked` count as not subscribed.
    pub fn is_subscribed(&self) -> bool {
        !matches!(self, MemberStatus::Left | MemberStatus::Kicked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatAction {
    Typing,
    UploadVideo,
    UploadAudio,
    UploadDocument,
}

impl ChatAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatAction::Typing => "typing",
            ChatAction::UploadVideo => "upload_video",
            ChatAction::UploadAudio => "upload_voice",
            ChatAction::UploadDocument => "upload_document",
        }
    }
}

/// Outbound half of a chat transport.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn chat_member_status(&self, channel: &str, user_id: i64) -> anyhow::Result<MemberStatus>;

    /// Returns the id of the sent message when the transport reports one.
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> anyhow::Result<Option<i64>>;

    async fn edit_text(&self, chat_id: i64, message_id: i64, text: &str) -> anyhow::Result<()>;

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> anyhow::Result<()>;

    async fn send_chat_action(&self, chat_id: i64, action: ChatAction) -> anyhow::Result<()>;

    async fn send_video(&self, chat_id: i64, file: &Path, caption: &str) -> anyhow::Result<()>;

    async fn send_audio(&self, chat_id: i64, file: &Path, title: &str) -> anyhow::Result<()>;

    async fn send_document(&self, chat_id: i64, file: &Path, caption: &str)
        -> anyhow::Result<()>;
}
