use crate::{
    truncate_output, DownloadRequest, Extractor, FetchError, FormatSpec, MediaMetadata,
    MAX_ERROR_CHARS,
};
use async_trait::async_trait;
use serde_json::Value;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

const OUTPUT_TEMPLATE: &str = "%(id)s.%(ext)s";

/// `yt-dlp` driven as a child process.
#[derive(Debug, Clone)]
pub struct YtDlp {
    bin: String,
    search_prefix: String,
}

impl YtDlp {
    pub fn new(bin: impl Into<String>, search_prefix: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            search_prefix: search_prefix.into(),
        }
    }

    pub fn search_args(&self, query: &str) -> Vec<String> {
        vec![
            "--flat-playlist".to_string(),
            "--skip-download".to_string(),
            "--no-warnings".to_string(),
            "-J".to_string(),
            "--".to_string(),
            format!("{}:{}", self.search_prefix, query.trim()),
        ]
    }

    pub fn download_args(request: &DownloadRequest) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-progress".to_string(),
            "--no-warnings".to_string(),
            "--restrict-filenames".to_string(),
            "-J".to_string(),
            "--no-simulate".to_string(),
            "-o".to_string(),
            request
                .output_dir
                .join(OUTPUT_TEMPLATE)
                .to_string_lossy()
                .to_string(),
        ];

        match &request.format {
            FormatSpec::BestVideo {
                max_height,
                merge_format,
            } => {
                let selector = match max_height {
                    Some(h) => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]"),
                    None => "bestvideo+bestaudio/best".to_string(),
                };
                args.extend([
                    "-f".to_string(),
                    selector,
                    "--merge-output-format".to_string(),
                    merge_format.clone(),
                ]);
            }
            FormatSpec::AudioOnly {
                codec,
                bitrate_kbps,
            } => {
                args.extend([
                    "-f".to_string(),
                    "bestaudio/best".to_string(),
                    "-x".to_string(),
                    "--audio-format".to_string(),
                    codec.clone(),
                    "--audio-quality".to_string(),
                    format!("{}K", bitrate_kbps),
                ]);
            }
        }

        if let Some(cookies) = &request.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().to_string());
        }

        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }

    async fn run(&self, args: &[String]) -> Result<Output, FetchError> {
        debug!(bin = %self.bin, ?args, "Running extractor");
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| FetchError::Spawn {
                bin: self.bin.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::Extraction(translate_error(&stderr)));
        }
        Ok(output)
    }
}

#[async_trait]
impl Extractor for YtDlp {
    async fn search(&self, query: &str) -> Result<Option<String>, FetchError> {
        let output = self.run(&self.search_args(query)).await?;
        let info: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| FetchError::Output(e.to_string()))?;
        Ok(first_result_url(&info))
    }

    async fn download(&self, request: &DownloadRequest) -> Result<MediaMetadata, FetchError> {
        let output = self.run(&Self::download_args(request)).await?;
        Ok(parse_metadata(&output.stdout))
    }
}

fn first_result_url(info: &Value) -> Option<String> {
    let entry_url = |entry: &Value| {
        entry
            .get("webpage_url")
            .and_then(Value::as_str)
            .or_else(|| {
                entry
                    .get("url")
                    .and_then(Value::as_str)
                    .filter(|u| crate::is_url(u))
            })
            .map(str::to_string)
    };

    match info.get("entries").and_then(Value::as_array) {
        Some(entries) => entries.first().and_then(entry_url),
        None => entry_url(info),
    }
}

/// Metadata is best effort; a download that succeeded is not failed over
/// unparsable JSON.
fn parse_metadata(stdout: &[u8]) -> MediaMetadata {
    let Ok(info) = serde_json::from_slice::<Value>(stdout) else {
        return MediaMetadata::default();
    };
    let field = |key: &str| info.get(key).and_then(Value::as_str).map(str::to_string);
    MediaMetadata {
        id: field("id"),
        title: field("title"),
    }
}

/// Short user-facing reason for a failed extractor run.
pub fn translate_error(stderr: &str) -> String {
    let lower = stderr.to_lowercase();

    if lower.contains("http error 429") {
        return "The source is rate limiting requests (429). Try again later.".to_string();
    }
    if lower.contains("http error 403") || lower.contains("forbidden") {
        return "Access denied (403). The media may be private or region-restricted.".to_string();
    }
    if lower.contains("sign in to confirm") || lower.contains("login required") {
        return "The source requires login. Configure a cookies file or try another link."
            .to_string();
    }
    if lower.contains("private video") {
        return "This video is private.".to_string();
    }
    if lower.contains("video unavailable") || lower.contains("is not available") {
        return "The media is unavailable or was removed.".to_string();
    }
    if lower.contains("unsupported url") {
        return "Unsupported URL. Check that the link is correct.".to_string();
    }
    if lower.contains("ffmpeg") && (lower.contains("not found") || lower.contains("no such file"))
    {
        return "FFmpeg is not installed on the server.".to_string();
    }

    let last_error_line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.to_lowercase().starts_with("error:"))
        .unwrap_or("");

    let message = if !last_error_line.is_empty() {
        last_error_line
    } else {
        stderr.lines().map(str::trim).rfind(|l| !l.is_empty()).unwrap_or("")
    };

    if message.is_empty() {
        "The extractor failed without an error message.".to_string()
    } else {
        truncate_output(message, MAX_ERROR_CHARS)
    }
}
