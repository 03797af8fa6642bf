use crate::{DownloadRequest, Extractor, FetchError, FormatSpec, MediaMetadata, WorkerPool};
use relaydl_config::FetcherConfig;
use relaydl_ipc::{MediaKind, Quality};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fetcher settings resolved once at startup.
#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub work_root: PathBuf,
    pub cookies_file: Option<PathBuf>,
    pub merge_format: String,
    pub audio_codec: String,
    pub audio_bitrate_kbps: u32,
    pub audio_hosts: Vec<String>,
}

impl FetcherSettings {
    pub fn from_config(config: &FetcherConfig, data_dir: &Path) -> Self {
        let work_root = config
            .work_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("jobs"));
        Self {
            work_root,
            cookies_file: config.cookies_file.as_deref().map(PathBuf::from),
            merge_format: config.merge_format.clone(),
            audio_codec: config.audio_codec.clone(),
            audio_bitrate_kbps: config.audio_bitrate_kbps,
            audio_hosts: config
                .audio_hosts
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn format_for(&self, kind: MediaKind, quality: Quality) -> FormatSpec {
        match kind {
            MediaKind::Video => FormatSpec::BestVideo {
                max_height: match quality {
                    Quality::Best => None,
                    Quality::MaxHeight(h) => Some(h),
                },
                merge_format: self.merge_format.clone(),
            },
            MediaKind::Audio => FormatSpec::AudioOnly {
                codec: self.audio_codec.clone(),
                bitrate_kbps: self.audio_bitrate_kbps,
            },
        }
    }

    /// Streaming platforms get the audio and quality options; any other URL
    /// only gets the generic download.
    pub fn is_streaming_platform(&self, media_url: &str) -> bool {
        let Some(host) = url::Url::parse(media_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        else {
            return false;
        };
        self.audio_hosts
            .iter()
            .any(|known| host == *known || host.ends_with(&format!(".{}", known)))
    }

    /// The cookies file is optional; a configured but missing file is skipped.
    pub fn usable_cookies(&self) -> Option<PathBuf> {
        let path = self.cookies_file.as_ref()?;
        if path.is_file() {
            Some(path.clone())
        } else {
            debug!(path = %path.display(), "Cookies file not found, continuing without it");
            None
        }
    }
}

/// Exclusively owned working directory of one fetch. Removed on drop.
#[derive(Debug)]
pub struct FetchJob {
    dir: PathBuf,
}

impl FetchJob {
    pub fn create(work_root: &Path) -> io::Result<Self> {
        fs::create_dir_all(work_root)?;
        let dir = work_root.join(format!("job-{}", uuid::Uuid::new_v4()));
        fs::create_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Removes job directories a previous process left behind. Run before the
/// first fetch; live jobs of this process would be removed too.
pub fn sweep_stale_jobs(work_root: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(work_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let is_job = entry.file_name().to_string_lossy().starts_with("job-");
        if is_job && entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

impl Drop for FetchJob {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!(dir = %self.dir.display(), "Removed job directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.dir.display(), "Failed to remove job directory: {}", e),
        }
    }
}

/// A produced file plus the job that owns it. Dropping this removes the file.
#[derive(Debug)]
pub struct FetchedMedia {
    job: FetchJob,
    pub file: PathBuf,
    pub size: u64,
    pub kind: MediaKind,
    pub metadata: MediaMetadata,
}

impl FetchedMedia {
    pub fn job_dir(&self) -> &Path {
        self.job.dir()
    }

    pub fn caption(&self) -> String {
        format!("{}\n{}", self.metadata.display_title(), human_size(self.size))
    }
}

/// Largest regular file in `dir`. Ties keep the first one enumerated.
pub fn select_largest(dir: &Path) -> io::Result<Option<(PathBuf, u64)>> {
    let mut best: Option<(PathBuf, u64)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let size = meta.len();
        if best.as_ref().is_none_or(|(_, best_size)| size > *best_size) {
            best = Some((entry.path(), size));
        }
    }
    Ok(best)
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{:.1}{}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1}PB", size)
}

pub struct Fetcher {
    extractor: Arc<dyn Extractor>,
    pool: WorkerPool,
    settings: FetcherSettings,
}

impl Fetcher {
    pub fn new(extractor: Arc<dyn Extractor>, pool: WorkerPool, settings: FetcherSettings) -> Self {
        Self {
            extractor,
            pool,
            settings,
        }
    }

    pub fn settings(&self) -> &FetcherSettings {
        &self.settings
    }

    /// Materializes one file for `url`. The job directory is gone when this
    /// returns an error, and when the returned media is dropped.
    pub async fn fetch(
        &self,
        url: &str,
        kind: MediaKind,
        quality: Quality,
    ) -> Result<FetchedMedia, FetchError> {
        let job = FetchJob::create(&self.settings.work_root)?;
        let request = DownloadRequest {
            url: url.to_string(),
            format: self.settings.format_for(kind, quality),
            output_dir: job.dir().to_path_buf(),
            cookies_file: self.settings.usable_cookies(),
        };
        debug!(url = %url, kind = kind.as_str(), dir = %job.dir().display(), "Starting fetch");

        let extractor = Arc::clone(&self.extractor);
        let metadata = self
            .pool
            .run(async move { extractor.download(&request).await })
            .await?;

        let (file, size) = select_largest(job.dir())?.ok_or(FetchError::EmptyOutput)?;
        info!(url = %url, file = %file.display(), size, "Fetch complete");

        Ok(FetchedMedia {
            job,
            file,
            size,
            kind,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    fn settings(root: &Path) -> FetcherSettings {
        FetcherSettings::from_config(
            &FetcherConfig {
                work_dir: Some(root.to_string_lossy().to_string()),
                ..FetcherConfig::default()
            },
            root,
        )
    }

    fn write_file(dir: &Path, name: &str, size: usize) {
        fs::write(dir.join(name), vec![0u8; size]).expect("write file");
    }

    enum Script {
        Write(Vec<(&'static str, usize)>),
        WriteThenFail(&'static str),
        Hang,
    }

    struct ScriptedDownload(Script);

    #[async_trait]
    impl Extractor for ScriptedDownload {
        async fn search(&self, _: &str) -> Result<Option<String>, FetchError> {
            Ok(None)
        }

        async fn download(&self, request: &DownloadRequest) -> Result<MediaMetadata, FetchError> {
            match &self.0 {
                Script::Write(files) => {
                    for (name, size) in files {
                        write_file(&request.output_dir, name, *size);
                    }
                    Ok(MediaMetadata {
                        id: Some("vid".to_string()),
                        title: Some("Clip".to_string()),
                    })
                }
                Script::WriteThenFail(msg) => {
                    write_file(&request.output_dir, "partial.part", 64);
                    Err(FetchError::Extraction(msg.to_string()))
                }
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(MediaMetadata::default())
                }
            }
        }
    }

    fn fetcher(root: &Path, script: Script, timeout: Duration) -> Fetcher {
        Fetcher::new(
            Arc::new(ScriptedDownload(script)),
            WorkerPool::new(1, timeout),
            settings(root),
        )
    }

    fn job_dirs(root: &Path) -> usize {
        fs::read_dir(root).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn select_largest_picks_biggest_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_file(dir.path(), "a.webm", 120);
        write_file(dir.path(), "b.mp4", 4096);
        write_file(dir.path(), "c.m4a", 512);
        fs::create_dir(dir.path().join("subdir")).expect("subdir");

        let (path, size) = select_largest(dir.path())
            .expect("read dir")
            .expect("some file");
        assert_eq!(size, 4096);
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("b.mp4"));
    }

    #[test]
    fn select_largest_on_empty_dir_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(select_largest(dir.path()).expect("read dir").is_none());
    }

    #[test]
    fn fetch_job_removes_directory_on_drop() {
        let root = tempfile::tempdir().expect("tempdir");
        let job = FetchJob::create(root.path()).expect("job");
        let dir = job.dir().to_path_buf();
        write_file(&dir, "x.bin", 10);
        assert!(dir.exists());
        drop(job);
        assert!(!dir.exists());
    }

    #[test]
    fn sweep_removes_only_job_directories() {
        let root = tempfile::tempdir().expect("tempdir");
        fs::create_dir(root.path().join("job-old")).expect("mkdir");
        write_file(&root.path().join("job-old"), "x.part", 10);
        fs::create_dir(root.path().join("keep")).expect("mkdir");
        write_file(root.path(), "job-file", 1);

        assert_eq!(sweep_stale_jobs(root.path()).expect("sweep"), 1);
        assert!(!root.path().join("job-old").exists());
        assert!(root.path().join("keep").exists());
        assert!(root.path().join("job-file").exists());
        assert_eq!(sweep_stale_jobs(&root.path().join("missing")).expect("sweep"), 0);
    }

    #[test]
    fn concurrent_jobs_get_distinct_directories() {
        let root = tempfile::tempdir().expect("tempdir");
        let a = FetchJob::create(root.path()).expect("job a");
        let b = FetchJob::create(root.path()).expect("job b");
        assert_ne!(a.dir(), b.dir());
    }

    #[test]
    fn platform_detection_matches_host_suffix() {
        let root = tempfile::tempdir().expect("tempdir");
        let s = settings(root.path());
        assert!(s.is_streaming_platform("https://www.youtube.com/watch?v=x"));
        assert!(s.is_streaming_platform("https://youtu.be/x"));
        assert!(s.is_streaming_platform("https://MUSIC.youtube.com/watch?v=x"));
        assert!(!s.is_streaming_platform("https://notyoutube.com/x"));
        assert!(!s.is_streaming_platform("https://example.com/youtube.com"));
        assert!(!s.is_streaming_platform("not a url"));
    }

    #[test]
    fn missing_cookies_file_is_skipped() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut s = settings(root.path());
        s.cookies_file = Some(root.path().join("missing.txt"));
        assert_eq!(s.usable_cookies(), None);

        let present = root.path().join("cookies.txt");
        write_file(root.path(), "cookies.txt", 3);
        s.cookies_file = Some(present.clone());
        assert_eq!(s.usable_cookies(), Some(present));
    }

    #[test]
    fn format_for_maps_kind_and_quality() {
        let root = tempfile::tempdir().expect("tempdir");
        let s = settings(root.path());
        assert_eq!(
            s.format_for(MediaKind::Video, Quality::MaxHeight(1080)),
            FormatSpec::BestVideo {
                max_height: Some(1080),
                merge_format: "mp4".to_string()
            }
        );
        assert_eq!(
            s.format_for(MediaKind::Audio, Quality::MaxHeight(1080)),
            FormatSpec::AudioOnly {
                codec: "mp3".to_string(),
                bitrate_kbps: 192
            }
        );
    }

    #[test]
    fn human_size_formats_units() {
        assert_eq!(human_size(512), "512.0B");
        assert_eq!(human_size(1536), "1.5KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0MB");
    }

    #[tokio::test]
    async fn fetch_returns_largest_and_cleans_up_on_drop() {
        let root = tempfile::tempdir().expect("tempdir");
        let fetcher = fetcher(
            root.path(),
            Script::Write(vec![("frag.f1", 120), ("vid.mp4", 4096), ("vid.f2", 512)]),
            Duration::from_secs(5),
        );

        let media = fetcher
            .fetch("https://example.com/v", MediaKind::Video, Quality::Best)
            .await
            .expect("fetch");
        assert_eq!(media.size, 4096);
        assert_eq!(media.metadata.display_title(), "Clip");
        assert!(media.caption().starts_with("Clip\n4.0KB"));
        let dir = media.job_dir().to_path_buf();
        assert!(dir.exists());

        drop(media);
        assert!(!dir.exists());
        assert_eq!(job_dirs(root.path()), 0);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_no_files() {
        let root = tempfile::tempdir().expect("tempdir");
        let fetcher = fetcher(
            root.path(),
            Script::WriteThenFail("ERROR: boom"),
            Duration::from_secs(5),
        );
        let err = fetcher
            .fetch("https://example.com/v", MediaKind::Audio, Quality::Best)
            .await
            .expect_err("fetch must fail");
        assert_eq!(err.to_string(), "ERROR: boom");
        assert_eq!(job_dirs(root.path()), 0);
    }

    #[tokio::test]
    async fn empty_output_is_an_error() {
        let root = tempfile::tempdir().expect("tempdir");
        let fetcher = fetcher(root.path(), Script::Write(vec![]), Duration::from_secs(5));
        let err = fetcher
            .fetch("https://example.com/v", MediaKind::Video, Quality::Best)
            .await
            .expect_err("fetch must fail");
        assert!(matches!(err, FetchError::EmptyOutput));
        assert_eq!(job_dirs(root.path()), 0);
    }

    #[tokio::test]
    async fn timed_out_fetch_is_cleaned_up() {
        let root = tempfile::tempdir().expect("tempdir");
        let fetcher = fetcher(root.path(), Script::Hang, Duration::from_millis(50));
        let err = fetcher
            .fetch("https://example.com/v", MediaKind::Video, Quality::Best)
            .await
            .expect_err("fetch must time out");
        assert!(matches!(err, FetchError::Timeout(_)));
        assert_eq!(job_dirs(root.path()), 0);
    }
}
