#![forbid(unsafe_code)]

//! Format selection cascade.
//!
//! yt-dlp reports every stream it can see for an item. [`select`] narrows that
//! list down to the streams that satisfy an [`OutputPolicy`] and orders them
//! best first. Ties on the quality score go to the smaller file so the result
//! is deterministic regardless of the order the service listed formats in.

use std::cmp::Ordering;
use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::transcode::AudioTarget;

const MAX_VIDEO_HEIGHT: u32 = 1080;
const MAX_VIDEO_FPS: u32 = 60;
const DEFAULT_FPS: u32 = 30;

/// Containers that can be kept as-is for `--best-native`.
const NATIVE_AUDIO_CONTAINERS: &[&str] = &["webm", "m4a", "opus", "ogg", "mp3", "aac", "flac"];

/// What the operator asked to end up with on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPolicy {
    Video1080p60,
    Wav,
    Mp3,
    NativeBest,
}

impl OutputPolicy {
    /// Whether producing this output needs the external transcoder (ffmpeg).
    /// Video needs it to merge the separate video and audio streams.
    pub fn requires_transcoder(self) -> bool {
        !matches!(self, OutputPolicy::NativeBest)
    }

    pub fn audio_target(self) -> Option<AudioTarget> {
        match self {
            OutputPolicy::Wav => Some(AudioTarget::Wav),
            OutputPolicy::Mp3 => Some(AudioTarget::Mp3),
            OutputPolicy::Video1080p60 | OutputPolicy::NativeBest => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            OutputPolicy::Video1080p60 => "video (1080p60 ceiling)",
            OutputPolicy::Wav => "wav",
            OutputPolicy::Mp3 => "mp3",
            OutputPolicy::NativeBest => "best native audio",
        }
    }
}

impl fmt::Display for OutputPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One entry of yt-dlp's `formats` array. Everything is optional because the
/// service omits fields freely.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatInfo {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub abr: Option<f64>,
    pub tbr: Option<f64>,
    pub filesize: Option<i64>,
    #[serde(rename = "filesize_approx")]
    pub filesize_approx: Option<i64>,
    pub format_note: Option<String>,
}

impl FormatInfo {
    fn has_video(&self) -> bool {
        codec_present(self.vcodec.as_deref())
    }

    fn has_audio(&self) -> bool {
        codec_present(self.acodec.as_deref())
    }

    fn is_storyboard(&self) -> bool {
        self.ext.as_deref() == Some("mhtml")
            || self
                .format_note
                .as_deref()
                .is_some_and(|note| note.eq_ignore_ascii_case("storyboard"))
    }

    fn size(&self) -> Option<u64> {
        self.filesize
            .or(self.filesize_approx)
            .and_then(|size| u64::try_from(size).ok())
    }

    fn audio_kbps(&self) -> u32 {
        self.abr
            .or(self.tbr)
            .filter(|rate| rate.is_finite() && *rate > 0.0)
            .map(|rate| rate.round() as u32)
            .unwrap_or(0)
    }

    fn video_score(&self) -> (u32, u32) {
        let height = self
            .height
            .and_then(|h| u32::try_from(h).ok())
            .unwrap_or(0);
        let fps = self
            .fps
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .map(|fps| fps.round() as u32)
            .unwrap_or(DEFAULT_FPS);
        (height, fps)
    }
}

fn codec_present(codec: Option<&str>) -> bool {
    codec.is_some_and(|codec| !codec.is_empty() && !codec.eq_ignore_ascii_case("none"))
}

/// Resolution for video-bearing streams, bitrate for audio-only ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Video { height: u32, fps: u32 },
    Audio { kbps: u32 },
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Video { height, fps } => write!(f, "{height}p{fps}"),
            Quality::Audio { kbps } => write!(f, "{kbps}k"),
        }
    }
}

/// A ranked source stream. `rank` starts at 1 for the most preferred entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatCandidate {
    pub format_id: String,
    pub codec: String,
    pub container: String,
    pub quality: Quality,
    pub filesize: Option<u64>,
    pub has_audio: bool,
    pub rank: usize,
}

impl FormatCandidate {
    fn from_info(info: &FormatInfo, quality: Quality) -> Option<Self> {
        let format_id = info.format_id.as_deref()?.trim();
        if format_id.is_empty() {
            return None;
        }
        let codec = if info.has_video() {
            info.vcodec.clone()
        } else {
            info.acodec.clone()
        };
        Some(Self {
            format_id: format_id.to_owned(),
            codec: codec.unwrap_or_else(|| "unknown".to_string()),
            container: info.ext.clone().unwrap_or_else(|| "unknown".to_string()),
            quality,
            filesize: info.size(),
            has_audio: info.has_audio(),
            rank: 0,
        })
    }

    /// One row of the `--list-formats` table.
    pub fn describe(&self) -> String {
        let size = self
            .filesize
            .map(format_size)
            .unwrap_or_else(|| "?".to_string());
        format!(
            "{:>3}  {:<8} {:<6} {:<16} {:<9} {:>10}",
            self.rank, self.format_id, self.container, self.codec, self.quality, size
        )
    }
}

/// Raised when none of the available streams meets the policy's minimum.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no acceptable format for {policy}: {reason}")]
pub struct NoAcceptableFormat {
    pub policy: OutputPolicy,
    pub reason: String,
}

/// Returns the streams acceptable under `policy`, best first.
pub fn select(
    policy: OutputPolicy,
    available: &[FormatInfo],
) -> Result<Vec<FormatCandidate>, NoAcceptableFormat> {
    let media: Vec<&FormatInfo> = available
        .iter()
        .filter(|info| !info.is_storyboard() && (info.has_video() || info.has_audio()))
        .collect();

    let candidates = match policy {
        OutputPolicy::Video1080p60 => {
            let within_ceiling = media.iter().copied().filter(|info| {
                let (height, fps) = info.video_score();
                info.has_video() && height <= MAX_VIDEO_HEIGHT && fps <= MAX_VIDEO_FPS
            });
            rank_video(within_ceiling)
        }
        OutputPolicy::Wav | OutputPolicy::Mp3 => {
            let audio_only: Vec<&FormatInfo> = media
                .iter()
                .copied()
                .filter(|info| info.has_audio() && !info.has_video())
                .collect();
            if audio_only.is_empty() {
                // Muxed streams still carry audio the transcoder can extract.
                rank_audio(media.iter().copied().filter(|info| info.has_audio()))
            } else {
                rank_audio(audio_only.into_iter())
            }
        }
        OutputPolicy::NativeBest => rank_audio(media.iter().copied().filter(|info| {
            info.has_audio()
                && !info.has_video()
                && info
                    .ext
                    .as_deref()
                    .is_some_and(|ext| NATIVE_AUDIO_CONTAINERS.contains(&ext))
        })),
    };

    if candidates.is_empty() {
        let reason = match policy {
            OutputPolicy::Video1080p60 => "no video stream at or below 1080p60",
            OutputPolicy::Wav | OutputPolicy::Mp3 => "no stream carries audio",
            OutputPolicy::NativeBest => "no audio-only stream in a native container",
        };
        return Err(NoAcceptableFormat {
            policy,
            reason: reason.to_string(),
        });
    }

    Ok(candidates)
}

/// Ranks every media stream without applying any policy: video-bearing
/// streams first (highest resolution, then frame rate), audio-only after.
pub fn rank_all(available: &[FormatInfo]) -> Vec<FormatCandidate> {
    let media = available
        .iter()
        .filter(|info| !info.is_storyboard() && (info.has_video() || info.has_audio()));

    let (video, audio): (Vec<&FormatInfo>, Vec<&FormatInfo>) =
        media.partition(|info| info.has_video());

    let mut ranked = rank_video(video.into_iter());
    let offset = ranked.len();
    ranked.extend(rank_audio(audio.into_iter()).into_iter().map(|mut candidate| {
        candidate.rank += offset;
        candidate
    }));
    ranked
}

/// Builds the yt-dlp `--format` expression for the chosen candidate. Video-only
/// streams are paired with the best audio-only stream for merging.
pub fn format_spec(
    policy: OutputPolicy,
    chosen: &FormatCandidate,
    available: &[FormatInfo],
) -> String {
    if policy != OutputPolicy::Video1080p60 || chosen.has_audio {
        return chosen.format_id.clone();
    }

    let best_audio = rank_audio(
        available
            .iter()
            .filter(|info| !info.is_storyboard() && info.has_audio() && !info.has_video()),
    )
    .into_iter()
    .next();

    match best_audio {
        Some(audio) => format!("{}+{}", chosen.format_id, audio.format_id),
        None => format!("{}+bestaudio", chosen.format_id),
    }
}

fn rank_video<'a>(formats: impl Iterator<Item = &'a FormatInfo>) -> Vec<FormatCandidate> {
    let mut scored: Vec<((u32, u32), FormatCandidate)> = formats
        .filter_map(|info| {
            let (height, fps) = info.video_score();
            FormatCandidate::from_info(info, Quality::Video { height, fps })
                .map(|candidate| ((height, fps), candidate))
        })
        .collect();

    scored.sort_by(|(left_score, left), (right_score, right)| {
        right_score
            .cmp(left_score)
            .then_with(|| tie_break(left, right))
    });

    assign_ranks(scored.into_iter().map(|(_, candidate)| candidate))
}

fn rank_audio<'a>(formats: impl Iterator<Item = &'a FormatInfo>) -> Vec<FormatCandidate> {
    let mut scored: Vec<(u32, FormatCandidate)> = formats
        .filter_map(|info| {
            let kbps = info.audio_kbps();
            FormatCandidate::from_info(info, Quality::Audio { kbps }).map(|c| (kbps, c))
        })
        .collect();

    scored.sort_by(|(left_kbps, left), (right_kbps, right)| {
        right_kbps
            .cmp(left_kbps)
            .then_with(|| tie_break(left, right))
    });

    assign_ranks(scored.into_iter().map(|(_, candidate)| candidate))
}

/// Smaller file first, unknown sizes last, then format id for stability.
fn tie_break(left: &FormatCandidate, right: &FormatCandidate) -> Ordering {
    let left_size = left.filesize.unwrap_or(u64::MAX);
    let right_size = right.filesize.unwrap_or(u64::MAX);
    left_size
        .cmp(&right_size)
        .then_with(|| left.format_id.cmp(&right.format_id))
}

fn assign_ranks(candidates: impl Iterator<Item = FormatCandidate>) -> Vec<FormatCandidate> {
    candidates
        .enumerate()
        .map(|(index, mut candidate)| {
            candidate.rank = index + 1;
            candidate
        })
        .collect()
}

fn format_size(bytes: u64) -> String {
    let mib = bytes as f64 / 1_048_576.0;
    if mib >= 1024.0 {
        format!("{:.1}GiB", mib / 1024.0)
    } else {
        format!("{mib:.1}MiB")
    }
}
