#![forbid(unsafe_code)]

//! Audio transcoding through the provisioned ffmpeg binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Interrupted;

/// Audio containers the downloader can produce by transcoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioTarget {
    /// PCM s16le, 48 kHz, stereo.
    Wav,
    /// LAME at 320 kbit/s.
    Mp3,
}

impl AudioTarget {
    pub fn extension(self) -> &'static str {
        match self {
            AudioTarget::Wav => "wav",
            AudioTarget::Mp3 => "mp3",
        }
    }

    fn codec_args(self) -> &'static [&'static str] {
        match self {
            AudioTarget::Wav => &[
                "-acodec", "pcm_s16le", "-ar", "48000", "-ac", "2", "-f", "wav",
            ],
            AudioTarget::Mp3 => &["-acodec", "libmp3lame", "-b:a", "320k", "-f", "mp3"],
        }
    }
}

#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    /// Converts `input` into `target` next to it and returns the new path.
    /// The input file is consumed.
    async fn transcode(&self, input: &Path, target: AudioTarget) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg: PathBuf,
}

impl Transcoder {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    /// Converts a local media file to WAV at `output`. The result is written
    /// under a staging name first, so a failed conversion never leaves a
    /// partial file at `output`. The input is left untouched. Cancelling
    /// `cancel` kills ffmpeg and fails with [`Interrupted`].
    pub async fn convert_local(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        if !input.is_file() {
            bail!("input file {} does not exist", input.display());
        }
        if let Some(parent) = output.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let staging = staging_name(output, "converting");
        let converted = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupted.into()),
            result = self.run(input, &staging, AudioTarget::Wav) => result,
        };
        if let Err(err) = converted {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err);
        }
        tokio::fs::rename(&staging, output)
            .await
            .with_context(|| format!("moving {} into place", output.display()))?;
        Ok(output.to_path_buf())
    }

    async fn run(&self, input: &Path, output: &Path, target: AudioTarget) -> Result<()> {
        debug!(input = %input.display(), output = %output.display(), target = target.extension(), "running ffmpeg");
        let result = Command::new(&self.ffmpeg)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-nostdin")
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .args(target.codec_args())
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("running {}", self.ffmpeg.display()))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let detail = stderr
                .lines()
                .map(str::trim)
                .rfind(|line| !line.is_empty())
                .unwrap_or("no diagnostic output");
            bail!(
                "ffmpeg could not convert {} to {}: {} ({})",
                input.display(),
                target.extension(),
                detail,
                result.status
            );
        }
        Ok(())
    }
}

#[async_trait]
impl AudioTranscoder for Transcoder {
    async fn transcode(&self, input: &Path, target: AudioTarget) -> Result<PathBuf> {
        let output = input.with_extension(target.extension());
        let staging = staging_name(&output, "transcoding");

        if let Err(err) = self.run(input, &staging, target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err);
        }
        tokio::fs::rename(&staging, &output)
            .await
            .with_context(|| format!("moving {} into place", output.display()))?;
        if output != input {
            tokio::fs::remove_file(input)
                .await
                .with_context(|| format!("removing {}", input.display()))?;
        }
        Ok(output)
    }
}

/// `dir/song.wav` -> `dir/song.<marker>.wav`. The extension is kept so ffmpeg
/// and tag writers still recognise the container.
pub(crate) fn staging_name(path: &Path, marker: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = match path.extension() {
        Some(ext) => format!("{stem}.{marker}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{marker}"),
    };
    path.with_file_name(name)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn codec_args_match_output_targets() {
        let wav = AudioTarget::Wav.codec_args();
        assert!(wav.windows(2).any(|pair| pair == ["-acodec", "pcm_s16le"]));
        assert!(wav.windows(2).any(|pair| pair == ["-ar", "48000"]));
        assert!(wav.windows(2).any(|pair| pair == ["-ac", "2"]));

        let mp3 = AudioTarget::Mp3.codec_args();
        assert!(mp3.windows(2).any(|pair| pair == ["-acodec", "libmp3lame"]));
        assert!(mp3.windows(2).any(|pair| pair == ["-b:a", "320k"]));
    }

    #[test]
    fn staging_name_keeps_extension() {
        assert_eq!(
            staging_name(Path::new("/tmp/out/song.wav"), "converting"),
            PathBuf::from("/tmp/out/song.converting.wav")
        );
        assert_eq!(
            staging_name(Path::new("bare"), "tagging"),
            PathBuf::from("bare.tagging")
        );
    }

    #[cfg(unix)]
    fn install_ffmpeg_stub(dir: &Path, fail: bool) -> Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let script_path = dir.join("ffmpeg");
        let script = if fail {
            "#!/usr/bin/env bash\necho 'Invalid data found when processing input' >&2\nexit 1\n"
                .to_string()
        } else {
            r#"#!/usr/bin/env bash
set -eu
input=""
prev=""
for arg in "$@"; do
  if [[ "$prev" == "-i" ]]; then input="$arg"; fi
  prev="$arg"
done
out="${@: -1}"
cp "$input" "$out"
"#
            .to_string()
        };
        fs::write(&script_path, script)?;
        let mut perms = fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms)?;
        Ok(script_path)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn transcode_replaces_input_with_target() -> Result<()> {
        let dir = tempdir()?;
        let transcoder = Transcoder::new(install_ffmpeg_stub(dir.path(), false)?);
        let input = dir.path().join("abc.webm");
        fs::write(&input, "opus bytes")?;

        let output = transcoder.transcode(&input, AudioTarget::Wav).await?;
        assert_eq!(output, dir.path().join("abc.wav"));
        assert_eq!(fs::read_to_string(&output)?, "opus bytes");
        assert!(!input.exists());
        assert!(!dir.path().join("abc.transcoding.wav").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_transcode_keeps_no_partial_output() -> Result<()> {
        let dir = tempdir()?;
        let transcoder = Transcoder::new(install_ffmpeg_stub(dir.path(), true)?);
        let input = dir.path().join("abc.webm");
        fs::write(&input, "broken")?;

        let err = transcoder
            .transcode(&input, AudioTarget::Mp3)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("Invalid data found"));
        assert!(!dir.path().join("abc.mp3").exists());
        assert!(!dir.path().join("abc.transcoding.mp3").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn convert_local_leaves_the_source_alone() -> Result<()> {
        let dir = tempdir()?;
        let transcoder = Transcoder::new(install_ffmpeg_stub(dir.path(), false)?);
        let input = dir.path().join("clip.mp4");
        fs::write(&input, "video bytes")?;
        let output = dir.path().join("sounds").join("clip.wav");

        transcoder
            .convert_local(&input, &output, &CancellationToken::new())
            .await?;
        assert!(input.exists());
        assert_eq!(fs::read_to_string(&output)?, "video bytes");
        Ok(())
    }

    #[tokio::test]
    async fn convert_local_rejects_missing_input() {
        let transcoder = Transcoder::new("ffmpeg");
        let err = transcoder
            .convert_local(
                Path::new("/nonexistent/clip.mp4"),
                Path::new("/tmp/x.wav"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn cancelled_conversion_reports_interrupt_and_leaves_nothing() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("clip.mp4");
        fs::write(&input, "video bytes")?;
        let output = dir.path().join("clip.wav");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = Transcoder::new("ffmpeg")
            .convert_local(&input, &output, &cancel)
            .await
            .unwrap_err();
        assert!(err.is::<Interrupted>());
        assert!(!output.exists());
        assert!(!dir.path().join("clip.converting.wav").exists());
        Ok(())
    }
}
