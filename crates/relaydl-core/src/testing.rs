//! In-memory transport and extractor fakes for orchestrator tests

use async_trait::async_trait;
use relaydl_config::Config;
use relaydl_exec::{DownloadRequest, Extractor, FetchError, FormatSpec, MediaMetadata};
use relaydl_ipc::{ChatAction, ChatTransport, Envelope, Keyboard, MemberStatus, MessageKind};
use relaydl_storage::Storage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::Orchestrator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    MemberStatus { channel: String },
    SendText { chat_id: i64, text: String, buttons: Vec<String> },
    EditText { message_id: i64, text: String },
    AnswerCallback,
    ChatAction(ChatAction),
    SendVideo { caption: String },
    SendAudio { title: String },
    SendDocument { caption: String },
}

#[derive(Default)]
pub struct FakeTransport {
    pub statuses: HashMap<String, &'static str>,
    pub fail_video: bool,
    pub fail_document: bool,
    pub fail_text_for: Vec<i64>,
    pub(crate) calls: StdMutex<Vec<Call>>,
    pub(crate) next_message_id: AtomicI64,
}

impl FakeTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Every text the user saw, sent or edited, in order.
    pub fn texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::SendText { text, .. } | Call::EditText { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn last_text(&self) -> String {
        self.texts().pop().unwrap_or_default()
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn ensure_file(file: &Path) -> anyhow::Result<()> {
        if !file.is_file() {
            anyhow::bail!("file {} does not exist", file.display());
        }
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn chat_member_status(&self, channel: &str, _user_id: i64) -> anyhow::Result<MemberStatus> {
        self.record(Call::MemberStatus {
            channel: channel.to_string(),
        });
        match self.statuses.get(channel) {
            Some(&"error") => anyhow::bail!("Bad Request: chat not found"),
            Some(status) => Ok(MemberStatus::parse(status)),
            None => Ok(MemberStatus::Member),
        }
    }

    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> anyhow::Result<Option<i64>> {
        if self.fail_text_for.contains(&chat_id) {
            anyhow::bail!("Forbidden: bot was blocked by the user");
        }
        self.record(Call::SendText {
            chat_id,
            text: text.to_string(),
            buttons: keyboard
                .map(|rows| {
                    rows.iter()
                        .flatten()
                        .map(|b| b.callback_data.clone())
                        .collect()
                })
                .unwrap_or_default(),
        });
        Ok(Some(self.next_message_id.fetch_add(1, Ordering::SeqCst) + 100))
    }

    async fn edit_text(&self, _chat_id: i64, message_id: i64, text: &str) -> anyhow::Result<()> {
        self.record(Call::EditText {
            message_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn answer_callback(&self, _query_id: &str, _text: Option<&str>) -> anyhow::Result<()> {
        self.record(Call::AnswerCallback);
        Ok(())
    }

    async fn send_chat_action(&self, _chat_id: i64, action: ChatAction) -> anyhow::Result<()> {
        self.record(Call::ChatAction(action));
        Ok(())
    }

    async fn send_video(&self, _chat_id: i64, file: &Path, caption: &str) -> anyhow::Result<()> {
        Self::ensure_file(file)?;
        if self.fail_video {
            anyhow::bail!("Bad Request: wrong file identifier/HTTP URL specified");
        }
        self.record(Call::SendVideo {
            caption: caption.to_string(),
        });
        Ok(())
    }

    async fn send_audio(&self, _chat_id: i64, file: &Path, title: &str) -> anyhow::Result<()> {
        Self::ensure_file(file)?;
        self.record(Call::SendAudio {
            title: title.to_string(),
        });
        Ok(())
    }

    async fn send_document(&self, _chat_id: i64, file: &Path, caption: &str) -> anyhow::Result<()> {
        Self::ensure_file(file)?;
        if self.fail_document {
            anyhow::bail!("Request Entity Too Large");
        }
        self.record(Call::SendDocument {
            caption: caption.to_string(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeExtractor {
    pub search_hit: Option<String>,
    pub fail_with: Option<String>,
    pub delay: Option<Duration>,
    pub searches: AtomicUsize,
    pub downloads: StdMutex<Vec<(String, FormatSpec)>>,
    pub job_dirs: StdMutex<Vec<PathBuf>>,
    pub(crate) running: AtomicUsize,
    pub peak_running: AtomicUsize,
}

impl FakeExtractor {
    pub fn download_count(&self) -> usize {
        self.downloads.lock().expect("downloads lock").len()
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn search(&self, _query: &str) -> Result<Option<String>, FetchError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        Ok(self.search_hit.clone())
    }

    async fn download(&self, request: &DownloadRequest) -> Result<MediaMetadata, FetchError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running.fetch_max(now, Ordering::SeqCst);
        self.downloads
            .lock()
            .expect("downloads lock")
            .push((request.url.clone(), request.format.clone()));
        self.job_dirs
            .lock()
            .expect("job dirs lock")
            .push(request.output_dir.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = match &self.fail_with {
            Some(message) => {
                std::fs::write(request.output_dir.join("partial.part"), b"xx")?;
                Err(FetchError::Extraction(message.clone()))
            }
            None => {
                std::fs::write(request.output_dir.join("abc.f137.mp4"), vec![0u8; 120])?;
                std::fs::write(request.output_dir.join("abc.mp4"), vec![0u8; 4096])?;
                Ok(MediaMetadata {
                    id: Some("abc".to_string()),
                    title: Some("Test Clip".to_string()),
                })
            }
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub transport: Arc<FakeTransport>,
    pub extractor: Arc<FakeExtractor>,
    pub storage: Arc<Mutex<Storage>>,
    pub work_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(config: Config, transport: FakeTransport, extractor: FakeExtractor) -> Self {
        let work_dir = tempfile::tempdir().expect("tempdir");
        let mut config = config;
        config.fetcher.work_dir = Some(work_dir.path().to_string_lossy().to_string());

        let transport = Arc::new(transport);
        let extractor = Arc::new(extractor);
        let storage = Arc::new(Mutex::new(Storage::open_in_memory().expect("storage")));
        let orchestrator = Arc::new(Orchestrator::from_config(
            &config,
            work_dir.path(),
            transport.clone(),
            Arc::clone(&storage),
            extractor.clone(),
        ));

        Self {
            orchestrator,
            transport,
            extractor,
            storage,
            work_dir,
        }
    }

    pub fn leftover_jobs(&self) -> usize {
        std::fs::read_dir(self.work_dir.path())
            .map(|d| d.count())
            .unwrap_or(0)
    }
}

pub fn base_config() -> Config {
    let mut config = Config::default();
    config.telegram.bot_token = "123:abc".to_string();
    config
}

pub fn text(user_id: i64, text: &str) -> Envelope {
    Envelope::new(
        "telegram",
        MessageKind::Message {
            text: text.to_string(),
        },
    )
    .with_user_id(user_id)
    .with_chat_id(user_id)
}

pub fn callback(user_id: i64, data: &str, message_id: i64) -> Envelope {
    Envelope::new(
        "telegram",
        MessageKind::Callback {
            query_id: format!("q-{}", message_id),
            data: data.to_string(),
        },
    )
    .with_user_id(user_id)
    .with_chat_id(user_id)
    .with_message_id(message_id)
}

pub fn command(user_id: i64, name: &str, args: &[&str]) -> Envelope {
    Envelope::new(
        "telegram",
        MessageKind::Command {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            raw_args: args.join(" "),
        },
    )
    .with_user_id(user_id)
    .with_chat_id(user_id)
}
