#![forbid(unsafe_code)]

//! Embeds title/artist/album (and cover art where the container allows it)
//! into a finished file.
//!
//! Tags are written by remuxing into a sibling `*.tagging.*` file that only
//! replaces the original after ffmpeg succeeded, so the original is either
//! fully tagged or untouched.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::transcode::staging_name;

const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(10);
const THUMBNAIL_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Containers that can carry an attached cover picture.
const COVER_CONTAINERS: &[&str] = &["mp3", "m4a"];
/// Containers we only write text tags into.
const TEXT_ONLY_CONTAINERS: &[&str] = &["wav", "webm", "opus", "ogg", "flac", "mka", "mkv", "mp4"];

/// ffmpeg diagnostics that mean the media itself is broken.
const CORRUPTION_SIGNALS: &[&str] = &[
    "invalid data found",
    "moov atom not found",
    "header missing",
    "could not find codec parameters",
    "end of file",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackTags {
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaggingError {
    #[error("cannot tag .{0} files")]
    Unsupported(String),
    #[error("media file is corrupt: {0}")]
    Corrupt(String),
    #[error("tagging failed: {0}")]
    Failed(String),
}

impl TaggingError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, TaggingError::Corrupt(_))
    }
}

#[async_trait]
pub trait MetadataTagger: Send + Sync {
    async fn tag(&self, file: &Path, tags: &TrackTags) -> Result<(), TaggingError>;
}

pub struct FfmpegTagger {
    ffmpeg: PathBuf,
    http: ureq::Agent,
}

impl FfmpegTagger {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        let http = ureq::AgentBuilder::new()
            .timeout(THUMBNAIL_TIMEOUT)
            .build();
        Self {
            ffmpeg: ffmpeg.into(),
            http,
        }
    }

    /// Downloads the thumbnail next to `file`. Any failure only costs us the
    /// cover, so it is logged and swallowed.
    async fn fetch_cover(&self, url: &str, file: &Path) -> Option<PathBuf> {
        let agent = self.http.clone();
        let owned_url = url.to_string();
        let fetched = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, String> {
            let response = agent.get(&owned_url).call().map_err(|err| err.to_string())?;
            let mut bytes = Vec::new();
            response
                .into_reader()
                .take(THUMBNAIL_MAX_BYTES)
                .read_to_end(&mut bytes)
                .map_err(|err| err.to_string())?;
            Ok(bytes)
        })
        .await;

        let bytes = match fetched {
            Ok(Ok(bytes)) if !bytes.is_empty() => bytes,
            Ok(Ok(_)) => {
                warn!(url, "thumbnail was empty, tagging without cover");
                return None;
            }
            Ok(Err(err)) => {
                warn!(url, error = %err, "could not fetch thumbnail, tagging without cover");
                return None;
            }
            Err(err) => {
                warn!(url, error = %err, "thumbnail task failed");
                return None;
            }
        };

        let cover = staging_name(&file.with_extension("img"), "cover");
        match tokio::fs::write(&cover, &bytes).await {
            Ok(()) => Some(cover),
            Err(err) => {
                warn!(path = %cover.display(), error = %err, "could not store thumbnail");
                None
            }
        }
    }

    fn build_command(
        &self,
        file: &Path,
        output: &Path,
        ext: &str,
        cover: Option<&Path>,
        tags: &TrackTags,
    ) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-nostdin")
            .arg("-y")
            .arg("-i")
            .arg(file);

        match cover {
            Some(cover) => {
                command
                    .arg("-i")
                    .arg(cover)
                    .args(["-map", "0:a", "-map", "1:0", "-c:a", "copy", "-c:v", "mjpeg"])
                    .args(["-disposition:v", "attached_pic"]);
                if ext == "mp3" {
                    command.args(["-id3v2_version", "3", "-metadata:s:v", "title=Album cover"]);
                }
            }
            None => {
                command.args(["-map", "0", "-c", "copy"]);
            }
        }

        command.arg("-metadata").arg(format!("title={}", tags.title));
        if let Some(artist) = tags.artist.as_deref() {
            command.arg("-metadata").arg(format!("artist={artist}"));
        }
        if let Some(album) = tags.album.as_deref() {
            command.arg("-metadata").arg(format!("album={album}"));
        }

        command
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl MetadataTagger for FfmpegTagger {
    async fn tag(&self, file: &Path, tags: &TrackTags) -> Result<(), TaggingError> {
        let ext = file
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let wants_cover = COVER_CONTAINERS.contains(&ext.as_str());
        if !wants_cover && !TEXT_ONLY_CONTAINERS.contains(&ext.as_str()) {
            return Err(TaggingError::Unsupported(ext));
        }

        match tokio::fs::metadata(file).await {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => return Err(TaggingError::Corrupt(format!("{} is empty", file.display()))),
            Err(err) => {
                return Err(TaggingError::Corrupt(format!(
                    "{} is unreadable: {err}",
                    file.display()
                )));
            }
        }

        let cover = match tags.thumbnail_url.as_deref() {
            Some(url) if wants_cover => self.fetch_cover(url, file).await,
            _ => None,
        };
        self.write_tags(file, &ext, cover, tags).await
    }
}

impl FfmpegTagger {
    /// A cover ffmpeg cannot read says nothing about the media, so a failed
    /// run with a cover is repeated with text tags only. Only that second run
    /// decides between corrupt and failed.
    async fn write_tags(
        &self,
        file: &Path,
        ext: &str,
        cover: Option<PathBuf>,
        tags: &TrackTags,
    ) -> Result<(), TaggingError> {
        if let Some(cover) = cover {
            let with_cover = self.remux(file, ext, Some(&cover), tags).await;
            let _ = tokio::fs::remove_file(&cover).await;
            match with_cover {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(file = %file.display(), error = %err, "tagging with cover failed, retrying without it");
                }
            }
        }
        self.remux(file, ext, None, tags).await
    }

    async fn remux(
        &self,
        file: &Path,
        ext: &str,
        cover: Option<&Path>,
        tags: &TrackTags,
    ) -> Result<(), TaggingError> {
        let output = staging_name(file, "tagging");
        debug!(file = %file.display(), cover = cover.is_some(), "writing tags");
        let result = match self.build_command(file, &output, ext, cover, tags).output().await {
            Ok(result) => result,
            Err(err) => {
                let _ = tokio::fs::remove_file(&output).await;
                return Err(TaggingError::Failed(format!(
                    "could not run {}: {err}",
                    self.ffmpeg.display()
                )));
            }
        };

        if !result.status.success() {
            let _ = tokio::fs::remove_file(&output).await;
            let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            let lowered = stderr.to_ascii_lowercase();
            if cover.is_none() && CORRUPTION_SIGNALS.iter().any(|signal| lowered.contains(signal)) {
                return Err(TaggingError::Corrupt(stderr));
            }
            return Err(TaggingError::Failed(if stderr.is_empty() {
                format!("ffmpeg exited with {}", result.status)
            } else {
                stderr
            }));
        }

        let written = tokio::fs::metadata(&output)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if written == 0 {
            let _ = tokio::fs::remove_file(&output).await;
            return Err(TaggingError::Failed("ffmpeg produced no output".into()));
        }

        tokio::fs::rename(&output, file).await.map_err(|err| {
            TaggingError::Failed(format!("replacing {}: {err}", file.display()))
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Returns a scripted result and records what it was asked to tag.
    #[derive(Default)]
    pub struct FakeTagger {
        pub failure: Option<TaggingError>,
        pub calls: Mutex<Vec<(PathBuf, TrackTags)>>,
    }

    impl FakeTagger {
        pub fn failing(failure: TaggingError) -> Self {
            Self {
                failure: Some(failure),
                calls: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl MetadataTagger for FakeTagger {
        async fn tag(&self, file: &Path, tags: &TrackTags) -> Result<(), TaggingError> {
            self.calls
                .lock()
                .unwrap()
                .push((file.to_path_buf(), tags.clone()));
            match &self.failure {
                Some(failure) => Err(failure.clone()),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn tags() -> TrackTags {
        TrackTags {
            title: "Song".into(),
            artist: Some("Band".into()),
            album: Some("Record".into()),
            thumbnail_url: None,
        }
    }

    #[tokio::test]
    async fn unknown_container_is_unsupported() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("song.xyz");
        fs::write(&file, "bytes")?;
        let err = FfmpegTagger::new("ffmpeg").tag(&file, &tags()).await.unwrap_err();
        assert_eq!(err, TaggingError::Unsupported("xyz".into()));
        Ok(())
    }

    #[tokio::test]
    async fn empty_file_is_corrupt() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("song.mp3");
        fs::write(&file, "")?;
        let err = FfmpegTagger::new("ffmpeg").tag(&file, &tags()).await.unwrap_err();
        assert!(err.is_corruption());
        Ok(())
    }

    #[cfg(unix)]
    fn install_ffmpeg_stub(dir: &Path, body: &str) -> anyhow::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let script_path = dir.join("ffmpeg");
        fs::write(&script_path, format!("#!/usr/bin/env bash\nset -eu\n{body}"))?;
        let mut perms = fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms)?;
        Ok(script_path)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_tagging_replaces_file_in_place() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let log = dir.path().join("args.log");
        let body = format!(
            r#"printf '%s\n' "$@" > "{}"
out="${{@: -1}}"
echo "tagged" > "$out"
"#,
            log.display()
        );
        let tagger = FfmpegTagger::new(install_ffmpeg_stub(dir.path(), &body)?);
        let file = dir.path().join("song.wav");
        fs::write(&file, "pcm")?;

        tagger.tag(&file, &tags()).await?;

        assert_eq!(fs::read_to_string(&file)?, "tagged\n");
        assert!(!dir.path().join("song.tagging.wav").exists());
        let args = fs::read_to_string(&log)?;
        assert!(args.contains("title=Song"));
        assert!(args.contains("artist=Band"));
        assert!(args.contains("album=Record"));
        assert!(!args.contains("attached_pic"));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn corrupt_input_is_reported_and_original_untouched() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let body = "echo 'song.mp3: Invalid data found when processing input' >&2\nexit 1\n";
        let tagger = FfmpegTagger::new(install_ffmpeg_stub(dir.path(), body)?);
        let file = dir.path().join("song.mp3");
        fs::write(&file, "garbage")?;

        let err = tagger.tag(&file, &tags()).await.unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(fs::read_to_string(&file)?, "garbage");
        assert!(!dir.path().join("song.tagging.mp3").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn other_ffmpeg_errors_are_plain_failures() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let body = "echo 'Unknown encoder' >&2\nexit 1\n";
        let tagger = FfmpegTagger::new(install_ffmpeg_stub(dir.path(), body)?);
        let file = dir.path().join("song.m4a");
        fs::write(&file, "aac")?;

        let err = tagger.tag(&file, &tags()).await.unwrap_err();
        assert_eq!(err, TaggingError::Failed("Unknown encoder".into()));
        assert_eq!(fs::read_to_string(&file)?, "aac");
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_cover_falls_back_to_text_tags() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let log = dir.path().join("runs.log");
        let body = format!(
            r#"echo run >> "{}"
if printf '%s\n' "$@" | grep -q -- 'attached_pic'; then
  echo 'song.cover.img: Invalid data found when processing input' >&2
  exit 1
fi
out="${{@: -1}}"
echo "tagged" > "$out"
"#,
            log.display()
        );
        let tagger = FfmpegTagger::new(install_ffmpeg_stub(dir.path(), &body)?);
        let file = dir.path().join("song.mp3");
        fs::write(&file, "mp3 frames")?;
        let cover = dir.path().join("song.cover.img");
        fs::write(&cover, "<html>not an image</html>")?;

        tagger.write_tags(&file, "mp3", Some(cover.clone()), &tags()).await?;

        assert_eq!(fs::read_to_string(&file)?, "tagged\n");
        assert_eq!(fs::read_to_string(&log)?.lines().count(), 2);
        assert!(!cover.exists());
        assert!(!dir.path().join("song.tagging.mp3").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn corrupt_media_is_still_detected_after_cover_fallback() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let body = "echo 'song.mp3: Invalid data found when processing input' >&2\nexit 1\n";
        let tagger = FfmpegTagger::new(install_ffmpeg_stub(dir.path(), body)?);
        let file = dir.path().join("song.mp3");
        fs::write(&file, "garbage")?;
        let cover = dir.path().join("song.cover.img");
        fs::write(&cover, "jpeg")?;

        let err = tagger
            .write_tags(&file, "mp3", Some(cover.clone()), &tags())
            .await
            .unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(fs::read_to_string(&file)?, "garbage");
        assert!(!cover.exists());
        Ok(())
    }
}
