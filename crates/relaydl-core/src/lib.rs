//! Relaydl Core
//!
//! Request orchestration, pending sessions, admin commands and the runtime
//! that wires the Telegram transport to them.

mod admin;
mod dispatch;
mod error;
pub mod messages;
mod orchestrator;
mod session;
#[cfg(test)]
mod testing;

pub use dispatch::{Dispatcher, MAX_INBOUND_CONCURRENCY};
pub use error::RelayError;
pub use orchestrator::{Orchestrator, Outcome};
pub use session::SessionStore;

use anyhow::{Context, Result};
use relaydl_config::Config;
use relaydl_exec::{sweep_stale_jobs, FetcherSettings, YtDlp};
use relaydl_ipc::EventBus;
use relaydl_storage::Storage;
use relaydl_telegram::{serve_webhook, TelegramAdapter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const DB_FILE_NAME: &str = "relaydl.db";

pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILE_NAME)
}

pub struct RelayRuntime {
    config: Config,
    data_dir: PathBuf,
    storage: Arc<Mutex<Storage>>,
    event_bus: EventBus,
}

impl RelayRuntime {
    pub fn new(config: Config, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;
        let storage = Storage::new(db_path(&data_dir))?;

        Ok(Self {
            config,
            data_dir,
            storage: Arc::new(Mutex::new(storage)),
            event_bus: EventBus::new(),
        })
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Runs until the ingress (polling or webhook server) stops.
    pub async fn run(&self) -> Result<()> {
        info!("Relaydl runtime starting...");

        let settings = FetcherSettings::from_config(&self.config.fetcher, &self.data_dir);
        match sweep_stale_jobs(&settings.work_root) {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "Removed stale job directories"),
            Err(e) => warn!("Failed to sweep job directories: {}", e),
        }

        let adapter = Arc::new(
            TelegramAdapter::new(&self.config.telegram, self.data_dir.clone())?
                .with_event_bus(self.event_bus.clone()),
        );
        let extractor = Arc::new(YtDlp::new(
            self.config.fetcher.ytdlp_bin.clone(),
            self.config.fetcher.search_prefix.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::from_config(
            &self.config,
            &self.data_dir,
            adapter.clone(),
            Arc::clone(&self.storage),
            extractor,
        ));

        let inbound_rx = self.event_bus.subscribe();
        let dispatcher = Dispatcher::new(orchestrator);
        tokio::spawn(dispatcher.run(inbound_rx));

        info!(
            account = adapter.account_tag(),
            channels = self.config.access.required_channels.len(),
            workers = self.config.fetcher.workers(),
            "Relaydl runtime ready"
        );

        let result = match self.config.telegram.webhook.clone() {
            Some(webhook) => serve_webhook(adapter, webhook).await,
            None => adapter.poll().await,
        };
        if let Err(e) = &result {
            error!("Telegram ingress stopped: {}", e);
        }
        result
    }
}
