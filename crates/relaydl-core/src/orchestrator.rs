use crate::error::RelayError;
use crate::messages;
use crate::session::SessionStore;
use anyhow::Result;
use chrono::NaiveDate;
use relaydl_config::{Config, VipMode};
use relaydl_exec::{is_url, Extractor, FetchedMedia, Fetcher, FetcherSettings, Resolver, WorkerPool};
use relaydl_ipc::{ChatAction, ChatTransport, Envelope, MediaKind, MessageKind};
use relaydl_policy::{AccessGate, Admission, GatePolicy};
use relaydl_storage::Storage;
use relaydl_telegram::menu::{choice_menu, DownloadChoice};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of handling one inbound event.
#[derive(Debug)]
pub enum Outcome {
    Replied,
    Prompted,
    AwaitingChoice { url: String },
    Delivered { kind: MediaKind, size: u64 },
    Failed(RelayError),
    Ignored,
}

pub(crate) fn local_today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Drives one request from input through gating, resolution, choice, fetch,
/// delivery and bookkeeping.
pub struct Orchestrator {
    pub(crate) transport: Arc<dyn ChatTransport>,
    pub(crate) storage: Arc<Mutex<Storage>>,
    pub(crate) gate: AccessGate,
    resolver: Resolver,
    fetcher: Fetcher,
    sessions: SessionStore,
    pub(crate) admin_id: Option<i64>,
    pub(crate) vip_mode: VipMode,
    clock: fn() -> NaiveDate,
}

impl Orchestrator {
    pub fn from_config(
        config: &Config,
        data_dir: &Path,
        transport: Arc<dyn ChatTransport>,
        storage: Arc<Mutex<Storage>>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        let pool = WorkerPool::new(
            config.fetcher.workers(),
            Duration::from_secs(config.fetcher.job_timeout_secs()),
        );
        let settings = FetcherSettings::from_config(&config.fetcher, data_dir);

        Self {
            transport,
            storage,
            gate: AccessGate::new(GatePolicy::from_config(config)),
            resolver: Resolver::new(Arc::clone(&extractor), pool.clone()),
            fetcher: Fetcher::new(extractor, pool, settings),
            sessions: SessionStore::new(Duration::from_secs(config.session.pending_ttl_secs)),
            admin_id: config.access.admin_id,
            vip_mode: config.quota.vip_mode,
            clock: local_today,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> NaiveDate) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn today(&self) -> NaiveDate {
        (self.clock)()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Handles one envelope. Request-level failures are reported to the user
    /// and returned as `Outcome::Failed`; `Err` is reserved for transport
    /// failures while replying.
    pub async fn handle(&self, envelope: Envelope) -> Result<Outcome> {
        let Some(user_id) = envelope.user_id else {
            debug!(trace_id = %envelope.trace_id, "Envelope without user, ignoring");
            return Ok(Outcome::Ignored);
        };
        let chat_id = envelope.chat_id.unwrap_or(user_id);

        match &envelope.kind {
            MessageKind::Message { text } => self.handle_text(user_id, chat_id, text).await,
            MessageKind::Callback { query_id, data } => {
                self.handle_choice(user_id, chat_id, envelope.message_id, query_id, data)
                    .await
            }
            MessageKind::Command {
                name,
                args,
                raw_args,
            } => {
                self.handle_command(user_id, chat_id, name, args, raw_args)
                    .await
            }
        }
    }

    async fn admit(&self, user_id: i64) -> Admission {
        self.gate
            .check(self.transport.as_ref(), &self.storage, user_id, self.today())
            .await
    }

    async fn handle_text(&self, user_id: i64, chat_id: i64, text: &str) -> Result<Outcome> {
        if let Admission::Denied(denial) = self.admit(user_id).await {
            self.transport
                .send_text(chat_id, &denial.message(), None)
                .await?;
            return Ok(Outcome::Failed(RelayError::AccessDenied(denial)));
        }

        let input = text.trim();
        if input.is_empty() {
            self.transport
                .send_text(chat_id, messages::PROMPT_INPUT, None)
                .await?;
            return Ok(Outcome::Prompted);
        }

        if !is_url(input) {
            self.transport
                .send_text(chat_id, messages::SEARCHING, None)
                .await?;
        }

        let Some(url) = self.resolver.resolve(input).await else {
            let err = RelayError::ResolutionFailed;
            self.transport
                .send_text(chat_id, &err.user_message(), None)
                .await?;
            return Ok(Outcome::Failed(err));
        };

        self.sessions.put(user_id, url.clone()).await;
        let streaming = self.fetcher.settings().is_streaming_platform(&url);
        let (prompt, keyboard) = choice_menu(streaming);
        self.transport
            .send_text(chat_id, &prompt, Some(&keyboard))
            .await?;

        info!(user_id, url = %url, streaming, "Awaiting download choice");
        Ok(Outcome::AwaitingChoice { url })
    }

    async fn handle_choice(
        &self,
        user_id: i64,
        chat_id: i64,
        message_id: Option<i64>,
        query_id: &str,
        data: &str,
    ) -> Result<Outcome> {
        if let Err(e) = self.transport.answer_callback(query_id, None).await {
            warn!(user_id, "Failed to answer callback: {}", e);
        }

        let Some(choice) = DownloadChoice::parse(data) else {
            debug!(user_id, data, "Unknown callback data");
            return Ok(Outcome::Ignored);
        };

        if let Admission::Denied(denial) = self.admit(user_id).await {
            self.reply(chat_id, message_id, &denial.message()).await?;
            return Ok(Outcome::Failed(RelayError::AccessDenied(denial)));
        }

        let Some(url) = self.sessions.get(user_id).await else {
            let err = RelayError::StaleSession;
            self.reply(chat_id, message_id, &err.user_message()).await?;
            return Ok(Outcome::Failed(err));
        };

        let status_id = match message_id {
            Some(id) => {
                self.transport
                    .edit_text(chat_id, id, messages::DOWNLOADING)
                    .await?;
                Some(id)
            }
            None => {
                self.transport
                    .send_text(chat_id, messages::DOWNLOADING, None)
                    .await?
            }
        };

        info!(user_id, url = %url, kind = choice.kind.as_str(), "Fetching");
        let media = match self.fetcher.fetch(&url, choice.kind, choice.quality).await {
            Ok(media) => media,
            Err(e) => {
                warn!(user_id, url = %url, "Fetch failed: {}", e);
                let err = RelayError::from(e);
                self.reply(chat_id, status_id, &err.user_message()).await?;
                return Ok(Outcome::Failed(err));
            }
        };

        let delivered = self.deliver(chat_id, &media).await;
        let (kind, size) = (media.kind, media.size);
        drop(media);

        if let Err(err) = delivered {
            warn!(user_id, url = %url, "{}", err);
            self.reply(chat_id, status_id, &err.user_message()).await?;
            return Ok(Outcome::Failed(err));
        }

        if let Err(e) = self.storage.lock().await.increment(user_id) {
            warn!(user_id, "Failed to record download: {}", e);
        }
        self.reply(chat_id, status_id, messages::SENT).await?;

        info!(user_id, url = %url, size, "Delivered");
        Ok(Outcome::Delivered { kind, size })
    }

    /// Kind-specific upload first; any failure falls back once to a generic
    /// document upload.
    async fn deliver(&self, chat_id: i64, media: &FetchedMedia) -> Result<(), RelayError> {
        let action = match media.kind {
            MediaKind::Video => ChatAction::UploadVideo,
            MediaKind::Audio => ChatAction::UploadAudio,
        };
        self.chat_action(chat_id, action).await;

        let caption = media.caption();
        let primary = match media.kind {
            MediaKind::Video => self.transport.send_video(chat_id, &media.file, &caption).await,
            MediaKind::Audio => {
                self.transport
                    .send_audio(chat_id, &media.file, media.metadata.display_title())
                    .await
            }
        };

        let Err(first) = primary else {
            return Ok(());
        };
        warn!(chat_id, "Upload as {} rejected, retrying as document: {}", media.kind.as_str(), first);

        self.chat_action(chat_id, ChatAction::UploadDocument).await;
        self.transport
            .send_document(chat_id, &media.file, &caption)
            .await
            .map_err(|e| RelayError::DeliveryFailed(e.to_string()))
    }

    async fn chat_action(&self, chat_id: i64, action: ChatAction) {
        if let Err(e) = self.transport.send_chat_action(chat_id, action).await {
            debug!(chat_id, "Chat action failed: {}", e);
        }
    }

    /// Edits the status message when there is one, otherwise sends a new text.
    pub(crate) async fn reply(&self, chat_id: i64, message_id: Option<i64>, text: &str) -> Result<()> {
        match message_id {
            Some(id) => self.transport.edit_text(chat_id, id, text).await,
            None => self.transport.send_text(chat_id, text, None).await.map(|_| ()),
        }
    }
}
