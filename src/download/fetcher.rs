//! Media extraction boundary.
//!
//! The core treats extraction as an opaque call; [`YtDlpFetcher`] runs the
//! `yt-dlp` executable as a subprocess so a long download never blocks the
//! runtime.

use super::MediaKind;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Patterns indicating the post itself cannot be fetched
const UNAVAILABLE_PATTERNS: &[&str] = &[
    "Video unavailable",
    "Private video",
    "This video is private",
    "Sign in to confirm your age",
    "removed by the uploader",
    "no longer available",
    "geo-restricted",
    "ERROR: Unsupported URL",
    "is not a valid URL",
    "Unable to extract",
    "HTTP Error 403",
    "HTTP Error 404",
    "login required",
];

/// Maximum stderr characters kept in errors
const MAX_STDERR_CHARS: usize = 500;

/// Extraction errors
#[derive(Debug, Error)]
pub enum FetchError {
    /// The extractor could not be started
    #[error("failed to run extractor: {0}")]
    Spawn(#[from] std::io::Error),
    /// The post is private, removed, or otherwise unavailable
    #[error("media unavailable: {0}")]
    Unavailable(String),
    /// The extractor exited with an error
    #[error("extractor failed: {0}")]
    Failed(String),
    /// The extractor finished without describing any media
    #[error("extractor returned no result")]
    NoResult,
}

/// Per-call extraction options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Video or audio extraction
    pub media_kind: MediaKind,
    /// Whether separate streams can be merged / audio transcoded
    pub merge_capable: bool,
    /// Optional cookie file for authenticated extraction
    pub credential_file: Option<PathBuf>,
    /// Path prefix for produced artifacts (extension is appended)
    pub output_base: PathBuf,
}

/// What the extractor reports about a finished download
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Post title
    pub title: Option<String>,
    /// Extension of the downloaded media
    pub ext: Option<String>,
    /// Thumbnail URL
    pub thumbnail: Option<String>,
    /// Final artifact path when the extractor reports one
    pub artifact: Option<PathBuf>,
}

/// Opaque media extraction call
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Downloads `url` according to `options`
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchOutcome, FetchError>;
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    ext: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    requested_downloads: Vec<YtDlpDownload>,
    #[serde(rename = "_filename")]
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtDlpDownload {
    filepath: Option<String>,
}

/// `yt-dlp` subprocess fetcher
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    binary: String,
}

impl YtDlpFetcher {
    /// Creates a fetcher invoking the given executable
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Command-line arguments for one download
    #[must_use]
    pub fn build_args(url: &str, options: &FetchOptions) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--no-playlist".into(),
            "--quiet".into(),
            "--no-warnings".into(),
            "--dump-json".into(),
            "--no-simulate".into(),
            "-o".into(),
            format!("{}.%(ext)s", options.output_base.display()),
        ];

        match (options.media_kind, options.merge_capable) {
            (MediaKind::Audio, true) => {
                args.extend(["-f", "bestaudio", "-x", "--audio-format", "mp3"].map(String::from));
            }
            (MediaKind::Audio, false) => {
                args.extend(["-f", "bestaudio/best"].map(String::from));
            }
            (MediaKind::Video, true) => {
                args.extend(
                    ["-f", "bestvideo+bestaudio/best", "--merge-output-format", "mp4"]
                        .map(String::from),
                );
            }
            (MediaKind::Video, false) => {
                args.extend(["-f", "best"].map(String::from));
            }
        }

        if let Some(ref cookies) = options.credential_file {
            args.push("--cookies".into());
            args.push(cookies.display().to_string());
        }

        args.push("--".into());
        args.push(url.to_string());
        args
    }

    fn parse_output(stdout: &str) -> Result<FetchOutcome, FetchError> {
        let line = stdout
            .lines()
            .rev()
            .find(|l| l.trim_start().starts_with('{'))
            .ok_or(FetchError::NoResult)?;

        let info: YtDlpInfo = serde_json::from_str(line)
            .map_err(|e| FetchError::Failed(format!("unreadable extractor output: {e}")))?;

        let artifact = info
            .requested_downloads
            .iter()
            .find_map(|d| d.filepath.clone())
            .or(info.filename)
            .map(PathBuf::from);

        Ok(FetchOutcome {
            title: info.title,
            ext: info.ext,
            thumbnail: info.thumbnail,
            artifact,
        })
    }
}

fn classify_stderr(stderr: &str) -> FetchError {
    let trimmed = crate::utils::truncate_str(stderr.trim(), MAX_STDERR_CHARS);
    if UNAVAILABLE_PATTERNS.iter().any(|p| stderr.contains(p)) {
        FetchError::Unavailable(trimmed)
    } else {
        FetchError::Failed(trimmed)
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchOutcome, FetchError> {
        let args = Self::build_args(url, options);
        debug!(binary = %self.binary, ?args, "Executing yt-dlp");

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let err = classify_stderr(&stderr);
            warn!(url = %url, status = ?output.status.code(), error = %err, "yt-dlp exited with error");
            return Err(err);
        }

        Self::parse_output(&stdout)
    }
}

/// Probes whether ffmpeg is runnable, enabling stream merging and mp3 extraction
pub async fn probe_merge_capability(ffmpeg: &str) -> bool {
    let available = Command::new(ffmpeg)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|status| status.success());
    info!(ffmpeg = %ffmpeg, available, "Probed merge capability");
    available
}

/// Credential file for a platform, if one exists on disk
#[must_use]
pub fn credential_file_for(cookies_dir: &Path, platform_tag: &str) -> Option<PathBuf> {
    let path = cookies_dir.join(format!("{platform_tag}_cookies.txt"));
    path.is_file().then_some(path)
}
