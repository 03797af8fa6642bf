//! Relaydl Exec
//!
//! Extraction service client, bounded worker pool, URL resolution and
//! per-job media fetching.

mod fetch;
mod pool;
mod resolve;
mod ytdlp;

pub use fetch::{
    human_size, select_largest, sweep_stale_jobs, FetchJob, FetchedMedia, Fetcher, FetcherSettings,
};
pub use pool::WorkerPool;
pub use resolve::{is_url, Resolver};
pub use ytdlp::{translate_error, YtDlp};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const MAX_ERROR_CHARS: usize = 400;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("{0}")]
    Extraction(String),

    #[error("the download produced no file")]
    EmptyOutput,

    #[error("the download took longer than {0}s and was stopped")]
    Timeout(u64),

    #[error("worker pool is shut down")]
    PoolClosed,

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("failed to start {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected extractor output: {0}")]
    Output(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the extraction service is asked to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSpec {
    /// Best video+audio merged into one container, optionally height-capped.
    BestVideo {
        max_height: Option<u32>,
        merge_format: String,
    },
    /// Best audio stream transcoded to `codec` at `bitrate_kbps`.
    AudioOnly { codec: String, bitrate_kbps: u32 },
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub format: FormatSpec,
    pub output_dir: PathBuf,
    pub cookies_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub id: Option<String>,
    pub title: Option<String>,
}

impl MediaMetadata {
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("-")
    }
}

/// Opaque media extraction service.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Canonical page URL of the first search hit.
    async fn search(&self, query: &str) -> Result<Option<String>, FetchError>;

    /// Writes the produced file(s) into `request.output_dir`.
    async fn download(&self, request: &DownloadRequest) -> Result<MediaMetadata, FetchError>;
}

fn truncate_output(content: &str, max_chars: usize) -> String {
    let mut chars = content.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}
