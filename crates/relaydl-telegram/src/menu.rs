//! Inline keyboards for the download choice prompt

use relaydl_ipc::{InlineButton, Keyboard, MediaKind, Quality};

const CHOICE_PREFIX: &str = "dl";

/// Kind and quality picked from the choice prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadChoice {
    pub kind: MediaKind,
    pub quality: Quality,
}

impl DownloadChoice {
    pub fn video(quality: Quality) -> Self {
        Self {
            kind: MediaKind::Video,
            quality,
        }
    }

    pub fn audio() -> Self {
        Self {
            kind: MediaKind::Audio,
            quality: Quality::Best,
        }
    }

    pub fn callback_data(&self) -> String {
        match (self.kind, self.quality) {
            (MediaKind::Audio, _) => format!("{}:audio", CHOICE_PREFIX),
            (MediaKind::Video, Quality::Best) => format!("{}:video:best", CHOICE_PREFIX),
            (MediaKind::Video, Quality::MaxHeight(h)) => {
                format!("{}:video:{}", CHOICE_PREFIX, h)
            }
        }
    }

    /// Accepts `dl:video:<best|height>`, `dl:audio` and the bare `video` /
    /// `audio` payloads of older prompts.
    pub fn parse(data: &str) -> Option<Self> {
        let mut parts = data.trim().split(':');
        let first = parts.next()?;
        let (kind, quality) = if first == CHOICE_PREFIX {
            (parts.next()?, parts.next())
        } else {
            (first, parts.next())
        };

        let choice = match kind {
            "audio" if quality.is_none() => DownloadChoice::audio(),
            "video" => match quality {
                None | Some("best") => DownloadChoice::video(Quality::Best),
                Some(h) => {
                    let height = h.parse::<u32>().ok().filter(|h| *h > 0)?;
                    DownloadChoice::video(Quality::MaxHeight(height))
                }
            },
            _ => return None,
        };

        if parts.next().is_some() {
            return None;
        }
        Some(choice)
    }
}

/// Prompt shown after a link is accepted. Streaming platforms get the quality
/// ladder and audio; anything else a single download button.
pub fn choice_menu(streaming_platform: bool) -> (String, Keyboard) {
    let button = |text: &str, choice: DownloadChoice| {
        vec![InlineButton::new(text, choice.callback_data())]
    };

    if streaming_platform {
        (
            "Choose what to download:".to_string(),
            vec![
                button("🎬 Video (best)", DownloadChoice::video(Quality::Best)),
                button("🎬 Video ≤1080p", DownloadChoice::video(Quality::MaxHeight(1080))),
                button("🎬 Video ≤720p", DownloadChoice::video(Quality::MaxHeight(720))),
                button("🎧 Audio MP3", DownloadChoice::audio()),
            ],
        )
    } else {
        (
            "Ready to download:".to_string(),
            vec![button("⬇️ Download", DownloadChoice::video(Quality::Best))],
        )
    }
}
