//! Relaydl Configuration
//!
//! TOML configuration loading with environment variable support

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CLIENT_RECREATE_SECS: u64 = 60;
pub const DEFAULT_WEBHOOK_LISTEN: &str = "0.0.0.0:10000";
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_PENDING_TTL_SECS: u64 = 1800;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    pub poll_timeout_secs: Option<u64>,
    pub client_recreate_interval_secs: Option<u64>,
    /// Overrides `https://api.telegram.org` (local Bot API server).
    pub api_base_url: Option<String>,
    pub webhook: Option<WebhookConfig>,
}

/// Public callback endpoint. When present the bot receives updates through
/// `setWebhook` instead of long polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub public_url: String,
    #[serde(default = "default_webhook_listen")]
    pub listen: String,
    pub path: Option<String>,
    pub secret_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccessConfig {
    /// Channels a user must have joined, as `@name` or numeric id.
    #[serde(default)]
    pub required_channels: Vec<String>,
    pub admin_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VipMode {
    /// `vip_until = today + days`
    #[default]
    Overwrite,
    /// `vip_until = max(today, vip_until) + days`
    Extend,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuotaConfig {
    /// Omit for unlimited downloads.
    pub daily_limit: Option<u32>,
    /// Omit for unlimited downloads while VIP.
    pub vip_limit: Option<u32>,
    #[serde(default)]
    pub vip_mode: VipMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    #[serde(default = "default_ytdlp_bin")]
    pub ytdlp_bin: String,
    pub cookies_file: Option<String>,
    pub work_dir: Option<String>,
    pub workers: Option<usize>,
    pub job_timeout_secs: Option<u64>,
    #[serde(default = "default_merge_format")]
    pub merge_format: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,
    #[serde(default = "default_search_prefix")]
    pub search_prefix: String,
    /// Hosts that get the audio and quality options in the choice menu.
    #[serde(default = "default_audio_hosts")]
    pub audio_hosts: Vec<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            ytdlp_bin: default_ytdlp_bin(),
            cookies_file: None,
            work_dir: None,
            workers: None,
            job_timeout_secs: None,
            merge_format: default_merge_format(),
            audio_codec: default_audio_codec(),
            audio_bitrate_kbps: default_audio_bitrate(),
            search_prefix: default_search_prefix(),
            audio_hosts: default_audio_hosts(),
        }
    }
}

impl FetcherConfig {
    pub fn workers(&self) -> usize {
        self.workers.unwrap_or(DEFAULT_WORKERS)
    }

    pub fn job_timeout_secs(&self) -> u64 {
        self.job_timeout_secs.unwrap_or(DEFAULT_JOB_TIMEOUT_SECS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pending_ttl_secs: default_pending_ttl(),
        }
    }
}

pub fn telegram_account_tag(bot_token: &str) -> String {
    let token = bot_token.trim();
    token.split(':').next().unwrap_or(token).trim().to_string()
}

fn default_webhook_listen() -> String {
    DEFAULT_WEBHOOK_LISTEN.to_string()
}

fn default_ytdlp_bin() -> String {
    "yt-dlp".to_string()
}

fn default_merge_format() -> String {
    "mp4".to_string()
}

fn default_audio_codec() -> String {
    "mp3".to_string()
}

fn default_audio_bitrate() -> u32 {
    192
}

fn default_search_prefix() -> String {
    "ytsearch1".to_string()
}

fn default_audio_hosts() -> Vec<String> {
    vec![
        "youtube.com".to_string(),
        "youtu.be".to_string(),
        "music.youtube.com".to_string(),
    ]
}

fn default_pending_ttl() -> u64 {
    DEFAULT_PENDING_TTL_SECS
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("relaydl").join("config.toml"))
    }

    /// Deployment platforms inject secrets through the environment; those win
    /// over the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(token) = non_empty("BOT_TOKEN") {
            self.telegram.bot_token = token;
        }

        if let Some(url) = non_empty("WEBHOOK_URL") {
            match self.telegram.webhook.as_mut() {
                Some(webhook) => webhook.public_url = url,
                None => {
                    self.telegram.webhook = Some(WebhookConfig {
                        public_url: url,
                        listen: default_webhook_listen(),
                        path: None,
                        secret_token: None,
                    })
                }
            }
        }

        if let Some(port) = non_empty("PORT").and_then(|p| p.parse::<u16>().ok()) {
            if let Some(webhook) = self.telegram.webhook.as_mut() {
                let host = webhook
                    .listen
                    .rsplit_once(':')
                    .map(|(host, _)| host.to_string())
                    .unwrap_or_else(|| "0.0.0.0".to_string());
                webhook.listen = format!("{}:{}", host, port);
            }
        }

        if let Some(admin) = non_empty("ADMIN_ID").and_then(|v| v.parse::<i64>().ok()) {
            self.access.admin_id = Some(admin);
        }

        if let Some(cookies) = non_empty("COOKIES_FILE") {
            self.fetcher.cookies_file = Some(cookies);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let token = self.telegram.bot_token.trim();
        if token.is_empty() {
            anyhow::bail!("telegram.bot_token cannot be empty (set it in the file or BOT_TOKEN)");
        }
        if telegram_account_tag(token).is_empty() {
            anyhow::bail!("telegram.bot_token has invalid account tag");
        }

        if let Some(timeout) = self.telegram.poll_timeout_secs {
            if timeout == 0 || timeout > 600 {
                anyhow::bail!("telegram.poll_timeout_secs must be in range 1..=600");
            }
        }

        if let Some(webhook) = &self.telegram.webhook {
            if !webhook.public_url.trim().starts_with("https://") {
                anyhow::bail!("telegram.webhook.public_url must be an https:// URL");
            }
            if webhook.listen.trim().is_empty() {
                anyhow::bail!("telegram.webhook.listen cannot be empty");
            }
            if let Some(secret) = &webhook.secret_token {
                let valid = !secret.is_empty()
                    && secret.len() <= 256
                    && secret
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
                if !valid {
                    anyhow::bail!(
                        "telegram.webhook.secret_token must be 1-256 chars of [A-Za-z0-9_-]"
                    );
                }
            }
        }

        let mut seen_channels = HashSet::new();
        for channel in &self.access.required_channels {
            let channel = channel.trim();
            if channel.is_empty() || channel == "@" {
                anyhow::bail!("access.required_channels contains an empty entry");
            }
            if !seen_channels.insert(channel.trim_start_matches('@').to_lowercase()) {
                anyhow::bail!("access.required_channels contains duplicate '{}'", channel);
            }
        }

        if self.quota.daily_limit == Some(0) {
            anyhow::bail!("quota.daily_limit must be > 0 (omit it for unlimited)");
        }
        if self.quota.vip_limit == Some(0) {
            anyhow::bail!("quota.vip_limit must be > 0 (omit it for unlimited)");
        }

        let fetcher = &self.fetcher;
        if fetcher.ytdlp_bin.trim().is_empty() {
            anyhow::bail!("fetcher.ytdlp_bin cannot be empty");
        }
        if let Some(workers) = fetcher.workers {
            if workers == 0 || workers > 16 {
                anyhow::bail!("fetcher.workers must be in range 1..=16");
            }
        }
        if fetcher.job_timeout_secs == Some(0) {
            anyhow::bail!("fetcher.job_timeout_secs must be > 0");
        }
        if !(32..=320).contains(&fetcher.audio_bitrate_kbps) {
            anyhow::bail!("fetcher.audio_bitrate_kbps must be in range 32..=320");
        }
        if fetcher.merge_format.trim().is_empty() {
            anyhow::bail!("fetcher.merge_format cannot be empty");
        }
        if fetcher.audio_codec.trim().is_empty() {
            anyhow::bail!("fetcher.audio_codec cannot be empty");
        }
        if fetcher.search_prefix.trim().is_empty() {
            anyhow::bail!("fetcher.search_prefix cannot be empty");
        }

        if self.session.pending_ttl_secs == 0 {
            anyhow::bail!("session.pending_ttl_secs must be > 0");
        }

        Ok(())
    }
}
