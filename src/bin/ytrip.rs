#![forbid(unsafe_code)]

//! `ytrip`: download a video or playlist through yt-dlp, optionally as WAV or
//! MP3, with retries, pacing and a download archive.
//!
//! This binary only wires things together: settings, logging, Ctrl-C, the
//! ffmpeg provisioner and the orchestrator from the library. Exit status is
//! `0` on success, `1` when the run was aborted, interrupted or could not
//! start, and `2` when `--ignore-errors` carried the batch past failures.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{ArgGroup, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use ytrip_tools::archive::ArchiveStore;
use ytrip_tools::config::{SettingsOverrides, resolve_settings};
use ytrip_tools::error::{Interrupted, JobError};
use ytrip_tools::fetch::YtDlp;
use ytrip_tools::formats::OutputPolicy;
use ytrip_tools::job::{DownloadJob, FormatListing, JobContext, JobReport, Orchestrator};
use ytrip_tools::pacing::{DEFAULT_BACKOFF, DelayScheduler, TokioSleeper, WaitWindow};
use ytrip_tools::provision::{
    AssumeYes, FFMPEG, HttpInstaller, Operator, StdinOperator, ToolProvisioner,
};
use ytrip_tools::retry::{DEFAULT_MAX_ATTEMPTS, RetryEngine};
use ytrip_tools::tagger::{FfmpegTagger, MetadataTagger};
use ytrip_tools::transcode::{AudioTranscoder, Transcoder};

#[derive(Debug, Parser)]
#[command(name = "ytrip", version, about = "Resilient yt-dlp front end")]
#[command(group(ArgGroup::new("output_format").args(["wav", "mp3", "best_native"])))]
struct Cli {
    /// Video or playlist URL.
    #[arg(required_unless_present = "local", conflicts_with = "local")]
    url: Option<String>,

    /// Convert a local audio/video file to WAV instead of downloading.
    #[arg(long, value_name = "FILE")]
    local: Option<PathBuf>,

    /// Save audio as WAV (PCM 16-bit, 48 kHz, stereo).
    #[arg(long)]
    wav: bool,

    /// Save audio as MP3 (320 kbit/s).
    #[arg(long)]
    mp3: bool,

    /// Keep the best audio stream in its original container.
    #[arg(long = "best-native")]
    best_native: bool,

    /// Output directory.
    #[arg(short = 'o', long = "output", value_name = "DIR", conflicts_with = "warudo")]
    output: Option<PathBuf>,

    /// Save into the Warudo sounds folder.
    #[arg(long)]
    warudo: bool,

    /// ffmpeg binary, or a directory containing it.
    #[arg(long = "ffmpeg-path", value_name = "PATH")]
    ffmpeg_path: Option<PathBuf>,

    /// Minimum seconds to wait between playlist items.
    #[arg(long, value_name = "SECONDS")]
    delay: Option<u64>,

    /// Maximum seconds to wait between playlist items.
    #[arg(long = "max-delay", value_name = "SECONDS")]
    max_delay: Option<u64>,

    /// Record completed item ids here and skip ids already listed.
    #[arg(long = "download-archive", value_name = "FILE")]
    download_archive: Option<PathBuf>,

    /// File name template, e.g. "%(uploader)s - %(title)s.%(ext)s".
    #[arg(long = "output-template", value_name = "TEMPLATE")]
    output_template: Option<String>,

    /// Keep going when an item fails.
    #[arg(long = "ignore-errors")]
    ignore_errors: bool,

    /// Print the available formats and exit without downloading.
    #[arg(long = "list-formats", conflicts_with = "local")]
    list_formats: bool,

    /// Attempts per item before giving up on transient errors.
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_ATTEMPTS, value_parser = clap::value_parser!(u32).range(1..))]
    attempts: u32,

    /// Seconds before a single attempt is abandoned (0 disables the limit).
    #[arg(long = "attempt-timeout", value_name = "SECONDS", default_value_t = 1800)]
    attempt_timeout: u64,

    /// Answer yes to install prompts.
    #[arg(short = 'y', long)]
    yes: bool,

    /// Debug logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn policy(&self) -> OutputPolicy {
        if self.wav {
            OutputPolicy::Wav
        } else if self.mp3 {
            OutputPolicy::Mp3
        } else if self.best_native {
            OutputPolicy::NativeBest
        } else {
            OutputPolicy::Video1080p60
        }
    }

    fn operator(&self) -> Box<dyn Operator> {
        if self.yes {
            Box::new(AssumeYes)
        } else {
            Box::new(StdinOperator)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("Interrupt received, cleaning up...");
            interrupt.cancel();
        }
    });

    match run(cli, cancel).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<ExitCode> {
    let settings = resolve_settings(SettingsOverrides {
        output_dir: cli.output.clone(),
        ffmpeg_path: cli.ffmpeg_path.clone(),
        env_path: None,
    })?;
    let between_items = WaitWindow::from_bounds(cli.delay, cli.max_delay)?;

    let mut provisioner = ToolProvisioner::new(
        settings.tools_dir.clone(),
        cli.operator(),
        Box::new(HttpInstaller::default()),
    )
    .with_search_override(settings.ffmpeg_path.clone());

    if let Some(input) = cli.local.as_deref() {
        let output_dir = if cli.warudo {
            Some(settings.warudo_dir.clone())
        } else {
            cli.output.clone()
        };
        return convert_local(&cli, input, output_dir, &mut provisioner, &cancel).await;
    }

    let url = cli
        .url
        .clone()
        .ok_or_else(|| anyhow!("a URL is required unless --local is given"))?;
    let policy = cli.policy();
    let output_dir = if cli.warudo {
        settings.warudo_dir.clone()
    } else {
        settings.output_dir.clone()
    };
    let job = DownloadJob::new(url, policy, output_dir).with_template(cli.output_template.clone());
    job.validate()?;

    let ytdlp = YtDlp::new(&settings.ytdlp);
    let version = ytdlp
        .ensure_available()
        .await
        .context("yt-dlp is required")?;
    debug!(%version, "fetch engine available");

    let attempt_timeout = (cli.attempt_timeout > 0).then(|| Duration::from_secs(cli.attempt_timeout));
    let delays = DelayScheduler::new(
        between_items,
        DEFAULT_BACKOFF,
        Arc::new(TokioSleeper),
        cancel.clone(),
    );
    let retry = RetryEngine::new(cli.attempts, attempt_timeout);

    if cli.list_formats {
        let orchestrator = Orchestrator::new(JobContext {
            engine: Arc::new(ytdlp),
            archive: None,
            retry,
            delays,
            transcoder: None,
            ffmpeg: None,
            tagger: None,
            ignore_errors: true,
        });
        return match orchestrator.list_formats(&job.source_url).await {
            Ok(listings) => Ok(print_format_listings(&listings)),
            Err(JobError::Interrupted(_)) => Ok(ExitCode::from(1)),
            Err(err) => Err(err.into()),
        };
    }

    // Fail before any download when a required tool is missing.
    let ffmpeg = if policy.requires_transcoder() {
        Some(provisioner.ensure_available(FFMPEG).await?)
    } else {
        provisioner.probe(FFMPEG)
    };
    match &ffmpeg {
        Some(path) => debug!(path = %path.display(), "using ffmpeg"),
        None => debug!("ffmpeg not found, files will not be tagged"),
    }

    let transcoder = match (policy.audio_target(), &ffmpeg) {
        (Some(_), Some(path)) => Some(Box::new(Transcoder::new(path)) as Box<dyn AudioTranscoder>),
        _ => None,
    };
    let tagger = ffmpeg
        .as_ref()
        .map(|path| Box::new(FfmpegTagger::new(path)) as Box<dyn MetadataTagger>);
    let archive = cli
        .download_archive
        .as_deref()
        .map(ArchiveStore::open)
        .transpose()?;

    println!("Source: {}", job.source_url);
    println!("Output: {} ({})", job.output_directory.display(), policy);
    if let Some(archive) = &archive {
        println!(
            "Archive: {} ({} recorded)",
            archive.path().display(),
            archive.len()
        );
    }

    let mut orchestrator = Orchestrator::new(JobContext {
        engine: Arc::new(ytdlp),
        archive,
        retry,
        delays,
        transcoder,
        ffmpeg,
        tagger,
        ignore_errors: cli.ignore_errors,
    });

    match orchestrator.run(&job).await {
        Ok(report) => {
            print_summary(&report);
            Ok(ExitCode::from(report.exit_code()))
        }
        Err(JobError::Interrupted(_)) => {
            println!("Interrupted before any item was processed.");
            Ok(ExitCode::from(1))
        }
        Err(err) => Err(err.into()),
    }
}

async fn convert_local(
    cli: &Cli,
    input: &Path,
    output_dir: Option<PathBuf>,
    provisioner: &mut ToolProvisioner,
    cancel: &CancellationToken,
) -> Result<ExitCode> {
    let stem = input
        .file_stem()
        .ok_or_else(|| anyhow!("{} has no file name", input.display()))?;
    let output_dir = output_dir
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    let output = output_dir.join(format!("{}.wav", stem.to_string_lossy()));

    if output.exists()
        && !cli
            .operator()
            .confirm(&format!("{} already exists. Overwrite?", output.display()))
    {
        println!("Conversion cancelled.");
        return Ok(ExitCode::from(1));
    }

    let ffmpeg = provisioner.ensure_available(FFMPEG).await?;
    println!("Converting {} -> {}", input.display(), output.display());
    match Transcoder::new(ffmpeg)
        .convert_local(input, &output, cancel)
        .await
    {
        Ok(path) => {
            info!(path = %path.display(), "conversion finished");
            println!("Saved {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(err) if err.is::<Interrupted>() => {
            println!("Conversion interrupted.");
            Ok(ExitCode::from(1))
        }
        Err(err) => Err(err),
    }
}

fn print_format_listings(listings: &[FormatListing]) -> ExitCode {
    let mut all_listed = true;
    for listing in listings {
        println!();
        println!("{} ({})", listing.item.title, listing.item.item_id);
        match &listing.formats {
            Ok(candidates) if candidates.is_empty() => println!("  no downloadable formats"),
            Ok(candidates) => {
                println!(
                    "  {:>3}  {:<8} {:<6} {:<16} {:<9} {:>10}",
                    "#", "ID", "EXT", "CODEC", "QUALITY", "SIZE"
                );
                for candidate in candidates {
                    println!("  {}", candidate.describe());
                }
            }
            Err(detail) => {
                all_listed = false;
                println!("  could not list formats: {detail}");
            }
        }
    }
    if all_listed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn print_summary(report: &JobReport) {
    println!();
    println!(
        "Done: {} downloaded, {} skipped (archive), {} failed, {} item(s) total.",
        report.completed.len(),
        report.skipped.len(),
        report.failures.len(),
        report.total
    );
    if !report.failures.is_empty() {
        println!("Failures:");
        for failure in &report.failures {
            println!("  - {failure}");
        }
    }
    if !report.warnings.is_empty() {
        println!("Warnings:");
        for warning in &report.warnings {
            println!("  - {warning}");
        }
    }
    if report.aborted {
        println!("Stopped after the first failure; pass --ignore-errors to continue past failures.");
    }
    if report.interrupted {
        println!("Interrupted; the in-flight item was discarded.");
    }
}
