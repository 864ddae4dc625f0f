#![forbid(unsafe_code)]

//! Adapter around the external fetch engine (yt-dlp).
//!
//! The engine does all protocol work. We only decide which item, which format
//! and when; in return we need three things from it: the list of items behind a
//! URL, the metadata (formats included) of one item, and the bytes of one
//! chosen format written into a directory we own.
//!
//! Every subprocess is spawned with `kill_on_drop`, so dropping an in-flight
//! future (Ctrl-C, attempt timeout) terminates the child.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::formats::FormatInfo;
use crate::job::PlaylistItem;

/// Output of the remote service that means "slow down or try again".
const TRANSIENT_SIGNALS: &[&str] = &[
    "http error 429",
    "too many requests",
    "rate limit",
    "rate-limit",
    "timed out",
    "timeout",
    "connection reset",
    "temporarily unavailable",
    "not a bot",
    "ssap",
    "signature extraction",
    "nsig extraction",
    "fragment not found",
    "downloaded file is empty",
    "formats have been skipped",
    "missing a url",
    "http error 5",
];

/// Output that no amount of retrying will fix.
const FATAL_SIGNALS: &[&str] = &[
    "video unavailable",
    "private video",
    "not available in your country",
    "geo restrict",
    "has been removed",
    "members-only",
    "http error 404",
    "unsupported url",
    "does not exist",
];

/// Player clients that sidestep YouTube's SSAP experiment, which otherwise
/// hides most formats from the default web client.
const YOUTUBE_CLIENTS: &str = "youtube:player_client=android,web";

/// Files yt-dlp leaves behind while a download is still in progress.
const PARTIAL_SUFFIXES: &[&str] = &["part", "ytdl", "temp", "tmp"];

/// A failed interaction with the fetch engine, already classified.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl FetchError {
    /// Classifies the engine's error output. Fatal signals win over transient
    /// ones and anything unrecognised is fatal.
    pub fn classify(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let lowered = detail.to_ascii_lowercase();
        if FATAL_SIGNALS.iter().any(|signal| lowered.contains(signal)) {
            return FetchError::Fatal(detail);
        }
        if TRANSIENT_SIGNALS.iter().any(|signal| lowered.contains(signal)) {
            return FetchError::Transient(detail);
        }
        FetchError::Fatal(detail)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// The items behind a source URL, in the order the service listed them.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub playlist_title: Option<String>,
    pub items: Vec<PlaylistItem>,
}

/// Per-item metadata from the engine's JSON dump.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemInfo {
    #[serde(default)]
    pub id: String,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub playlist_title: Option<String>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub formats: Vec<FormatInfo>,
}

/// Everything the engine needs to retrieve one chosen format.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub item: &'a PlaylistItem,
    pub format_spec: &'a str,
    pub staging_dir: &'a Path,
    /// Container to merge separate video/audio streams into.
    pub merge_container: Option<&'a str>,
    pub ffmpeg: Option<&'a Path>,
}

#[async_trait]
pub trait FetchEngine: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<Listing, FetchError>;
    async fn probe(&self, item: &PlaylistItem) -> Result<ItemInfo, FetchError>;
    /// Downloads into `request.staging_dir` and returns the finished file.
    async fn fetch(&self, request: &FetchRequest<'_>) -> Result<PathBuf, FetchError>;
}

#[derive(Deserialize)]
struct FlatListing {
    #[serde(rename = "_type")]
    kind: Option<String>,
    id: Option<String>,
    title: Option<String>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    #[serde(default)]
    entries: Vec<Option<FlatEntry>>,
}

#[derive(Deserialize)]
struct FlatEntry {
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
}

/// yt-dlp driven through its command line.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Runs `<program> --version` so a missing engine fails before any work.
    pub async fn ensure_available(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(output) => bail!(
                "{} is installed but returned a failure status ({})",
                self.program.display(),
                output.status
            ),
            Err(err) => bail!(
                "{} is not installed or not in PATH: {}",
                self.program.display(),
                err
            ),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, mut command: Command, label: &str) -> Result<Output, FetchError> {
        let output = command.output().await.map_err(|err| {
            FetchError::Fatal(format!(
                "could not start {} for {label}: {err}",
                self.program.display()
            ))
        })?;

        if output.status.success() {
            return Ok(output);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = last_error_lines(&stderr)
            .unwrap_or_else(|| format!("{label} exited with status {}", output.status));
        Err(FetchError::classify(detail))
    }
}

#[async_trait]
impl FetchEngine for YtDlp {
    async fn resolve(&self, url: &str) -> Result<Listing, FetchError> {
        let mut command = self.command();
        command
            .arg("--flat-playlist")
            .arg("--dump-single-json")
            .arg("--no-warnings")
            .arg(url);

        let output = self.run(command, "playlist listing").await?;
        parse_listing(&output.stdout, url)
            .map_err(|err| FetchError::Fatal(format!("unreadable listing for {url}: {err:#}")))
    }

    async fn probe(&self, item: &PlaylistItem) -> Result<ItemInfo, FetchError> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--extractor-args")
            .arg(YOUTUBE_CLIENTS)
            .arg(&item.resolved_url);

        let output = self.run(command, "metadata").await?;
        let mut info: ItemInfo = serde_json::from_slice(&output.stdout).map_err(|err| {
            FetchError::Fatal(format!("unreadable metadata for {}: {err}", item.item_id))
        })?;
        if info.id.is_empty() {
            info.id = item.item_id.clone();
        }
        Ok(info)
    }

    async fn fetch(&self, request: &FetchRequest<'_>) -> Result<PathBuf, FetchError> {
        let output_pattern = request.staging_dir.join("%(id)s.%(ext)s");

        let mut command = self.command();
        command
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--no-overwrites")
            .arg("--extractor-args")
            .arg(YOUTUBE_CLIENTS)
            .arg("--format")
            .arg(request.format_spec)
            .arg("--output")
            .arg(&output_pattern)
            .arg("--no-simulate")
            .arg("--print")
            .arg("after_move:filepath");
        if let Some(container) = request.merge_container {
            command.arg("--merge-output-format").arg(container);
        }
        if let Some(ffmpeg) = request.ffmpeg {
            command.arg("--ffmpeg-location").arg(ffmpeg);
        }
        command.arg(&request.item.resolved_url);

        debug!(item_id = %request.item.item_id, format = request.format_spec, "starting fetch");
        let output = self.run(command, "download").await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let printed = stdout
            .lines()
            .map(str::trim)
            .rev()
            .find(|line| !line.is_empty())
            .map(PathBuf::from)
            .filter(|path| path.is_file());

        match printed.or_else(|| find_finished_file(request.staging_dir)) {
            Some(path) => Ok(path),
            None => Err(FetchError::Transient(format!(
                "downloaded file is empty or missing for {}",
                request.item.item_id
            ))),
        }
    }
}

/// Turns yt-dlp's `--flat-playlist` JSON into playlist items. A single video
/// URL yields a one-item listing.
fn parse_listing(raw: &[u8], source_url: &str) -> Result<Listing> {
    let listing: FlatListing = serde_json::from_slice(raw).context("deserializing listing JSON")?;

    if listing.kind.as_deref() == Some("playlist") {
        let items = listing
            .entries
            .into_iter()
            .flatten()
            .filter_map(|entry| {
                let item_id = entry.id?.trim().to_owned();
                if item_id.is_empty() {
                    return None;
                }
                let resolved_url = entry
                    .webpage_url
                    .or(entry.url)
                    .unwrap_or_else(|| watch_url(&item_id));
                Some(PlaylistItem {
                    title: entry.title.unwrap_or_else(|| item_id.clone()),
                    item_id,
                    resolved_url,
                })
            })
            .collect();
        return Ok(Listing {
            playlist_title: listing.title,
            items,
        });
    }

    let Some(item_id) = listing.id.filter(|id| !id.trim().is_empty()) else {
        bail!("listing has neither entries nor an id");
    };
    let resolved_url = listing
        .webpage_url
        .or(listing.original_url)
        .unwrap_or_else(|| source_url.to_string());
    Ok(Listing {
        playlist_title: None,
        items: vec![PlaylistItem {
            title: listing.title.unwrap_or_else(|| item_id.clone()),
            item_id,
            resolved_url,
        }],
    })
}

fn watch_url(item_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={item_id}")
}

/// Keeps the `ERROR:` lines of yt-dlp's stderr, or the last line when there
/// are none.
fn last_error_lines(stderr: &str) -> Option<String> {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let errors: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| line.starts_with("ERROR"))
        .collect();
    if !errors.is_empty() {
        return Some(errors.join("; "));
    }
    lines.last().map(|line| line.to_string())
}

/// Fallback when the engine did not print the final path: the only finished
/// media file in the staging directory.
fn find_finished_file(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut finished: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            let ext = path
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or_default();
            !PARTIAL_SUFFIXES.contains(&ext)
        })
        .collect();
    finished.sort();
    if finished.len() == 1 {
        finished.pop()
    } else {
        None
    }
}
