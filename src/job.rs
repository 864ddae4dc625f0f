#![forbid(unsafe_code)]

//! Drives one download job across the items behind its URL.
//!
//! Items are processed strictly one after another. For each item the
//! orchestrator consults the archive, picks a format, fetches it through the
//! retry engine into a private staging directory, transcodes and tags it there
//! and only then renames the finished file into the output directory and
//! records it in the archive. Anything that stops an item early drops the
//! staging directory, so the output directory only ever receives complete
//! files.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tracing::{debug, info, warn};
use url::Url;

use crate::archive::ArchiveStore;
use crate::error::{FailureKind, Interrupted, ItemFailure, JobError};
use crate::fetch::{FetchEngine, FetchRequest, ItemInfo, Listing};
use crate::formats::{self, FormatCandidate, OutputPolicy};
use crate::pacing::DelayScheduler;
use crate::retry::{RetryEngine, RetryError};
use crate::tagger::{MetadataTagger, TrackTags};
use crate::template::{self, DEFAULT_TEMPLATE, TemplateFields};
use crate::transcode::AudioTranscoder;

const STAGING_PREFIX: &str = ".ytrip-";
const MERGE_CONTAINER: &str = "mp4";

/// One CLI invocation's worth of work. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub source_url: String,
    pub output_policy: OutputPolicy,
    pub output_directory: PathBuf,
    pub naming_template: String,
}

impl DownloadJob {
    pub fn new(
        source_url: impl Into<String>,
        output_policy: OutputPolicy,
        output_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            output_policy,
            output_directory: output_directory.into(),
            naming_template: DEFAULT_TEMPLATE.to_string(),
        }
    }

    pub fn with_template(mut self, template: Option<String>) -> Self {
        if let Some(template) = template.filter(|value| !value.trim().is_empty()) {
            self.naming_template = template;
        }
        self
    }

    /// Rejects malformed URLs and templates before anything touches the
    /// network.
    pub fn validate(&self) -> Result<(), JobError> {
        let invalid = |reason: String| JobError::InvalidUrl {
            url: self.source_url.clone(),
            reason,
        };
        let parsed = Url::parse(self.source_url.trim()).map_err(|err| invalid(err.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "unsupported scheme {:?}, expected http or https",
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }
        template::validate(&self.naming_template)?;
        Ok(())
    }
}

/// An entry of the listing behind a job's URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistItem {
    pub item_id: String,
    pub title: String,
    pub resolved_url: String,
}

/// Everything the orchestrator needs, injected so tests can swap any part.
pub struct JobContext {
    pub engine: Arc<dyn FetchEngine>,
    pub archive: Option<ArchiveStore>,
    pub retry: RetryEngine,
    pub delays: DelayScheduler,
    pub transcoder: Option<Box<dyn AudioTranscoder>>,
    /// Handed to the fetch engine for merging video and audio streams.
    pub ffmpeg: Option<PathBuf>,
    pub tagger: Option<Box<dyn MetadataTagger>>,
    pub ignore_errors: bool,
}

#[derive(Debug, Clone)]
pub struct CompletedItem {
    pub item: PlaylistItem,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct JobReport {
    pub total: usize,
    pub completed: Vec<CompletedItem>,
    pub skipped: Vec<PlaylistItem>,
    pub failures: Vec<ItemFailure>,
    /// Non-fatal tagging problems; the files were kept.
    pub warnings: Vec<String>,
    pub aborted: bool,
    pub interrupted: bool,
}

impl JobReport {
    /// `0` all good, `1` aborted or interrupted, `2` finished with reported
    /// failures under `--ignore-errors`.
    pub fn exit_code(&self) -> u8 {
        if self.aborted || self.interrupted {
            1
        } else if !self.failures.is_empty() {
            2
        } else {
            0
        }
    }
}

/// Ranked formats for one item, as shown by `--list-formats`.
#[derive(Debug, Clone)]
pub struct FormatListing {
    pub item: PlaylistItem,
    pub formats: Result<Vec<FormatCandidate>, String>,
}

pub struct Orchestrator {
    ctx: JobContext,
}

impl Orchestrator {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&mut self, job: &DownloadJob) -> Result<JobReport, JobError> {
        job.validate()?;
        self.check_tools(job.output_policy)?;

        std::fs::create_dir_all(&job.output_directory)
            .with_context(|| format!("creating {}", job.output_directory.display()))?;

        let listing = self.resolve(&job.source_url).await?;
        let total = listing.items.len();
        info!(url = %job.source_url, items = total, policy = %job.output_policy, "starting job");

        let mut report = JobReport {
            total,
            ..JobReport::default()
        };
        let mut processed_any = false;

        for (index, item) in listing.items.iter().enumerate() {
            if self.ctx.delays.cancellation().is_cancelled() {
                report.interrupted = true;
                break;
            }

            if let Some(archive) = &self.ctx.archive
                && archive.contains(&item.item_id)
            {
                println!(
                    "[{}/{}] Skipping {} ({}): already in archive",
                    index + 1,
                    total,
                    item.title,
                    item.item_id
                );
                report.skipped.push(item.clone());
                continue;
            }

            if processed_any && self.ctx.delays.wait_between_items().await.is_err() {
                report.interrupted = true;
                break;
            }
            processed_any = true;

            println!(
                "[{}/{}] Downloading {} ({})",
                index + 1,
                total,
                item.title,
                item.item_id
            );

            let outcome = match self
                .process_item(job, item, listing.playlist_title.as_deref(), &mut report)
                .await
            {
                Ok(path) => self.record_completion(item, path),
                Err(failure) => Err(failure),
            };

            match outcome {
                Ok(path) => {
                    println!("  Saved {}", path.display());
                    report.completed.push(CompletedItem {
                        item: item.clone(),
                        path,
                    });
                }
                Err(failure) => {
                    eprintln!("  {failure}");
                    let kind = failure.kind;
                    report.failures.push(failure);
                    if kind == FailureKind::Interrupted {
                        report.interrupted = true;
                        break;
                    }
                    if !self.ctx.ignore_errors {
                        report.aborted = true;
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Resolves `source_url` and ranks every format of every item without
    /// downloading anything.
    pub async fn list_formats(&self, source_url: &str) -> Result<Vec<FormatListing>, JobError> {
        let listing = self.resolve(source_url).await?;
        let mut listings = Vec::with_capacity(listing.items.len());
        for (index, item) in listing.items.into_iter().enumerate() {
            if index > 0 && self.ctx.delays.wait_between_items().await.is_err() {
                return Err(Interrupted.into());
            }
            let formats = match self.probe(&item).await {
                Ok(info) => Ok(formats::rank_all(&info.formats)),
                Err(RetryError::Interrupted { .. }) => return Err(Interrupted.into()),
                Err(err) => Err(err.last_detail().to_string()),
            };
            listings.push(FormatListing { item, formats });
        }
        Ok(listings)
    }

    fn check_tools(&self, policy: OutputPolicy) -> Result<(), JobError> {
        if policy.audio_target().is_some() && self.ctx.transcoder.is_none() {
            return Err(anyhow!("{policy} output needs a transcoder but none is configured").into());
        }
        if policy == OutputPolicy::Video1080p60 && self.ctx.ffmpeg.is_none() {
            return Err(anyhow!("{policy} output needs ffmpeg for merging streams").into());
        }
        Ok(())
    }

    async fn resolve(&self, source_url: &str) -> Result<Listing, JobError> {
        let engine = &self.ctx.engine;
        let result = self
            .ctx
            .retry
            .attempt(&self.ctx.delays, "resolve", |_| engine.resolve(source_url))
            .await;
        match result {
            Ok((listing, _)) => Ok(listing),
            Err(RetryError::Interrupted { .. }) => Err(Interrupted.into()),
            Err(err) => Err(JobError::Unresolvable {
                url: source_url.to_string(),
                detail: err.last_detail().to_string(),
            }),
        }
    }

    async fn probe(&self, item: &PlaylistItem) -> Result<ItemInfo, RetryError> {
        let engine = &self.ctx.engine;
        self.ctx
            .retry
            .attempt(&self.ctx.delays, &item.item_id, |_| engine.probe(item))
            .await
            .map(|(info, _)| info)
    }

    async fn process_item(
        &self,
        job: &DownloadJob,
        item: &PlaylistItem,
        playlist_title: Option<&str>,
        report: &mut JobReport,
    ) -> Result<PathBuf, ItemFailure> {
        let fatal = |detail: String| ItemFailure::new(item, FailureKind::Fatal, detail);

        let info = self
            .probe(item)
            .await
            .map_err(|err| retry_failure(item, err))?;

        let candidates = formats::select(job.output_policy, &info.formats).map_err(|err| {
            ItemFailure::new(item, FailureKind::NoAcceptableFormat, err.to_string())
        })?;

        // Dropped on every return path, taking partial files with it.
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&job.output_directory)
            .map_err(|err| {
                fatal(format!(
                    "creating staging directory in {}: {err}",
                    job.output_directory.display()
                ))
            })?;

        let mut file = self
            .fetch_best(job.output_policy, item, &info, &candidates, staging.path())
            .await?;

        if let Some(target) = job.output_policy.audio_target() {
            let Some(transcoder) = self.ctx.transcoder.as_deref() else {
                return Err(fatal("no transcoder configured".to_string()));
            };
            file = self
                .interruptible(transcoder.transcode(&file, target))
                .await
                .map_err(|_| interrupted(item))?
                .map_err(|err| fatal(format!("{err:#}")))?;
        }

        let tags = TrackTags {
            title: info.title.clone().unwrap_or_else(|| item.title.clone()),
            artist: info.artist.clone().or_else(|| info.uploader.clone()),
            album: info
                .album
                .clone()
                .or_else(|| info.playlist_title.clone())
                .or_else(|| playlist_title.map(str::to_string)),
            thumbnail_url: info.thumbnail.clone(),
        };

        if let Some(tagger) = self.ctx.tagger.as_deref() {
            let tagged = self
                .interruptible(tagger.tag(&file, &tags))
                .await
                .map_err(|_| interrupted(item))?;
            match tagged {
                Ok(()) => debug!(item_id = %item.item_id, "tagged"),
                Err(err) if err.is_corruption() => {
                    let _ = std::fs::remove_file(&file);
                    return Err(fatal(err.to_string()));
                }
                Err(err) => {
                    let warning = format!("{} ({}): {err}, keeping untagged file", item.item_id, item.title);
                    warn!(item_id = %item.item_id, error = %err, "tagging failed, keeping untagged file");
                    println!("  warning: {warning}");
                    report.warnings.push(warning);
                }
            }
        }

        let ext = file
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();
        let fields = TemplateFields {
            id: &item.item_id,
            title: &tags.title,
            uploader: info.uploader.as_deref(),
            artist: tags.artist.as_deref(),
            album: tags.album.as_deref(),
            ext: &ext,
        };
        let relative = template::render(&job.naming_template, &fields)
            .map_err(|err| fatal(format!("{err:#}")))?;
        let final_path = unclaimed_path(job.output_directory.join(relative), &item.item_id, report);

        if self.ctx.delays.cancellation().is_cancelled() {
            return Err(interrupted(item));
        }
        move_into_place(&file, &final_path).map_err(|err| fatal(format!("{err:#}")))?;
        Ok(final_path)
    }

    /// Tries candidates best first. Falling back to the next one only happens
    /// when the engine says the chosen format cannot be served.
    async fn fetch_best(
        &self,
        policy: OutputPolicy,
        item: &PlaylistItem,
        info: &ItemInfo,
        candidates: &[FormatCandidate],
        staging_dir: &Path,
    ) -> Result<PathBuf, ItemFailure> {
        let engine = &self.ctx.engine;
        let mut last_error = None;

        for (position, candidate) in candidates.iter().enumerate() {
            let format_spec = formats::format_spec(policy, candidate, &info.formats);
            let merge_container = format_spec.contains('+').then_some(MERGE_CONTAINER);
            let request = FetchRequest {
                item,
                format_spec: &format_spec,
                staging_dir,
                merge_container,
                ffmpeg: self.ctx.ffmpeg.as_deref(),
            };
            debug!(item_id = %item.item_id, format = %format_spec, rank = candidate.rank, "fetching");

            let result = self
                .ctx
                .retry
                .attempt(&self.ctx.delays, &item.item_id, |_| engine.fetch(&request))
                .await;
            match result {
                Ok((path, _)) => return Ok(path),
                Err(err @ RetryError::Fatal { .. })
                    if format_unavailable(err.last_detail()) && position + 1 < candidates.len() =>
                {
                    warn!(item_id = %item.item_id, format = %format_spec, "format refused, trying next candidate");
                    last_error = Some(err);
                }
                Err(err) => return Err(retry_failure(item, err)),
            }
        }

        Err(match last_error {
            Some(err) => retry_failure(item, err),
            None => ItemFailure::new(item, FailureKind::NoAcceptableFormat, "no candidates"),
        })
    }

    async fn interruptible<F: Future>(&self, future: F) -> Result<F::Output, Interrupted> {
        let cancel = self.ctx.delays.cancellation();
        if cancel.is_cancelled() {
            return Err(Interrupted);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupted),
            output = future => Ok(output),
        }
    }

    fn record_completion(&mut self, item: &PlaylistItem, path: PathBuf) -> Result<PathBuf, ItemFailure> {
        if let Some(archive) = self.ctx.archive.as_mut() {
            archive.add(&item.item_id).map_err(|err| {
                ItemFailure::new(
                    item,
                    FailureKind::Fatal,
                    format!("saved {} but could not record it: {err:#}", path.display()),
                )
            })?;
        }
        Ok(path)
    }
}

fn retry_failure(item: &PlaylistItem, err: RetryError) -> ItemFailure {
    let kind = match err {
        RetryError::Fatal { .. } => FailureKind::Fatal,
        RetryError::Exhausted { .. } => FailureKind::ExhaustedRetries,
        RetryError::Interrupted { .. } => FailureKind::Interrupted,
    };
    ItemFailure::new(item, kind, err.last_detail())
}

fn interrupted(item: &PlaylistItem) -> ItemFailure {
    ItemFailure::new(item, FailureKind::Interrupted, Interrupted.to_string())
}

fn format_unavailable(detail: &str) -> bool {
    let lowered = detail.to_ascii_lowercase();
    lowered.contains("requested format is not available") || lowered.contains("format not available")
}

/// Two items of one run may render to the same name. The later one gets its
/// id appended instead of replacing a file this run already saved.
fn unclaimed_path(path: PathBuf, item_id: &str, report: &JobReport) -> PathBuf {
    let taken = |candidate: &Path| report.completed.iter().any(|done| done.path == candidate);
    if !taken(&path) {
        return path;
    }

    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let mut copy = 1;
    loop {
        let suffix = match copy {
            1 => format!(" [{item_id}]"),
            n => format!(" [{item_id}] ({n})"),
        };
        let candidate = path.with_file_name(format!("{stem}{suffix}{ext}"));
        if !taken(&candidate) {
            warn!(item_id, path = %candidate.display(), "name already used in this run");
            return candidate;
        }
        copy += 1;
    }
}

fn move_into_place(staged: &Path, final_path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = final_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    if final_path.exists() {
        warn!(path = %final_path.display(), "replacing existing file");
        std::fs::remove_file(final_path)
            .with_context(|| format!("removing {}", final_path.display()))?;
    }
    std::fs::rename(staged, final_path)
        .with_context(|| format!("moving {} to {}", staged.display(), final_path.display()))
}
