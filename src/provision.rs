#![forbid(unsafe_code)]

//! Locates external tools (ffmpeg) and, with the operator's consent, installs
//! a known-good build into a managed directory.
//!
//! Both the consent prompt ([`Operator`]) and the download ([`Installer`]) are
//! capabilities handed to [`ToolProvisioner`], so nothing here prompts or hits
//! the network unless the caller wired it to.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

pub const FFMPEG: &str = "ffmpeg";

/// How deep we look for a binary below a directory given with `--ffmpeg-path`
/// (unpacked builds keep it under `<build>/bin/`).
const OVERRIDE_SEARCH_DEPTH: usize = 3;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolUnavailable {
    #[error("{tool} is required but the operator declined to install it")]
    Declined { tool: String },
    #[error("{tool} could not be installed: {reason}")]
    InstallFailed { tool: String, reason: String },
}

/// Asks the human running the tool a yes/no question.
pub trait Operator: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Prompts on stdout and reads the answer from stdin. Anything but `y`/`yes`
/// (including a closed stdin) is a no.
pub struct StdinOperator;

impl Operator for StdinOperator {
    fn confirm(&self, prompt: &str) -> bool {
        print!("{prompt} [y/N] ");
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => false,
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        }
    }
}

/// Consent given up front on the command line (`--yes`).
pub struct AssumeYes;

impl Operator for AssumeYes {
    fn confirm(&self, prompt: &str) -> bool {
        debug!(prompt, "answering yes without prompting");
        true
    }
}

/// Fetches and unpacks a tool into `target_dir`, returning the executable.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn provision(&self, tool: &str, target_dir: &Path) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    TarXz,
}

/// Downloads static ffmpeg builds for the running platform.
pub struct HttpInstaller {
    agent: ureq::Agent,
}

impl Default for HttpInstaller {
    fn default() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(15))
            .timeout_read(Duration::from_secs(120))
            .build();
        Self { agent }
    }
}

impl HttpInstaller {
    fn distribution(tool: &str) -> Result<Vec<(&'static str, ArchiveKind)>> {
        if tool != FFMPEG {
            bail!("no known distribution for {tool}");
        }
        let urls = if cfg!(target_os = "windows") {
            vec![(
                "https://www.gyan.dev/ffmpeg/builds/ffmpeg-release-essentials.zip",
                ArchiveKind::Zip,
            )]
        } else if cfg!(target_os = "macos") {
            if cfg!(target_arch = "aarch64") {
                vec![
                    ("https://www.osxexperts.net/ffmpeg80arm.zip", ArchiveKind::Zip),
                    ("https://www.osxexperts.net/ffprobe80arm.zip", ArchiveKind::Zip),
                ]
            } else {
                vec![
                    ("https://www.osxexperts.net/ffmpeg80intel.zip", ArchiveKind::Zip),
                    ("https://www.osxexperts.net/ffprobe80intel.zip", ArchiveKind::Zip),
                ]
            }
        } else if cfg!(target_arch = "aarch64") {
            vec![(
                "https://github.com/BtbN/FFmpeg-Builds/releases/download/latest/ffmpeg-master-latest-linuxarm64-gpl.tar.xz",
                ArchiveKind::TarXz,
            )]
        } else {
            vec![(
                "https://github.com/BtbN/FFmpeg-Builds/releases/download/latest/ffmpeg-master-latest-linux64-gpl.tar.xz",
                ArchiveKind::TarXz,
            )]
        };
        Ok(urls)
    }
}

#[async_trait]
impl Installer for HttpInstaller {
    async fn provision(&self, tool: &str, target_dir: &Path) -> Result<PathBuf> {
        let downloads = Self::distribution(tool)?;
        tokio::fs::create_dir_all(target_dir)
            .await
            .with_context(|| format!("creating {}", target_dir.display()))?;

        let wanted = vec![executable_name(tool), executable_name("ffprobe")];
        for (url, kind) in downloads {
            info!(url, "downloading {tool}");
            let agent = self.agent.clone();
            let target = target_dir.to_path_buf();
            let wanted = wanted.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut archive = tempfile::NamedTempFile::new_in(&target)
                    .with_context(|| format!("creating download file in {}", target.display()))?;
                let response = agent
                    .get(url)
                    .call()
                    .map_err(|err| anyhow!("downloading {url}: {err}"))?;
                io::copy(&mut response.into_reader(), archive.as_file_mut())
                    .with_context(|| format!("saving {url}"))?;
                archive.as_file_mut().flush()?;
                extract_tools(archive.path(), kind, &wanted, &target)?;
                Ok(())
            })
            .await
            .map_err(|err| anyhow!("install task failed: {err}"))??;
        }

        let installed = target_dir.join(executable_name(tool));
        if !installed.is_file() {
            bail!("{} not found after extraction", installed.display());
        }
        info!(path = %installed.display(), "{tool} installed");
        Ok(installed)
    }
}

/// Pulls every entry whose file name is in `wanted` out of the archive and
/// into `dest`, ignoring the directory layout inside the archive.
fn extract_tools(
    archive: &Path,
    kind: ArchiveKind,
    wanted: &[String],
    dest: &Path,
) -> Result<Vec<PathBuf>> {
    let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    let mut extracted = Vec::new();

    match kind {
        ArchiveKind::Zip => {
            let mut zip = zip::ZipArchive::new(file)
                .with_context(|| format!("reading zip {}", archive.display()))?;
            for index in 0..zip.len() {
                let mut entry = zip.by_index(index)?;
                if entry.is_dir() {
                    continue;
                }
                let Some(name) = wanted_name(Path::new(entry.name()), wanted) else {
                    continue;
                };
                extracted.push(write_executable(&mut entry, &dest.join(name))?);
            }
        }
        ArchiveKind::TarXz => {
            let mut input = BufReader::new(file);
            let mut tarball = tempfile::tempfile_in(dest)
                .with_context(|| format!("creating scratch file in {}", dest.display()))?;
            lzma_rs::xz_decompress(&mut input, &mut tarball)
                .map_err(|err| anyhow!("decompressing {}: {err:?}", archive.display()))?;
            tarball.seek(SeekFrom::Start(0))?;

            let mut tar = tar::Archive::new(BufReader::new(tarball));
            for entry in tar.entries().context("reading tar entries")? {
                let mut entry = entry.context("reading tar entry")?;
                if !entry.header().entry_type().is_file() {
                    continue;
                }
                let path = entry.path()?.into_owned();
                let Some(name) = wanted_name(&path, wanted) else {
                    continue;
                };
                extracted.push(write_executable(&mut entry, &dest.join(name))?);
            }
        }
    }

    if extracted.is_empty() {
        bail!("{} does not contain {}", archive.display(), wanted.join(" or "));
    }
    Ok(extracted)
}

fn wanted_name(path: &Path, wanted: &[String]) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    wanted.iter().find(|candidate| *candidate == name).cloned()
}

/// Writes under a temporary name in the same directory and renames once the
/// whole entry is on disk, so an interrupted extraction never leaves a
/// truncated binary that a later search would pick up.
fn write_executable(reader: &mut impl io::Read, dest: &Path) -> Result<PathBuf> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::Builder::new()
        .prefix(".extracting-")
        .tempfile_in(dir)
        .with_context(|| format!("creating scratch file in {}", dir.display()))?;
    io::copy(reader, staged.as_file_mut()).with_context(|| format!("writing {}", dest.display()))?;
    staged.as_file_mut().flush()?;
    make_executable(staged.path())?;
    staged
        .persist(dest)
        .map_err(|err| err.error)
        .with_context(|| format!("moving {} into place", dest.display()))?;
    Ok(dest.to_path_buf())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("marking {} executable", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

pub fn executable_name(tool: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{tool}.exe")
    } else {
        tool.to_string()
    }
}

/// Resolves tool paths for one run and remembers what it found.
pub struct ToolProvisioner {
    search_override: Option<PathBuf>,
    managed_dir: PathBuf,
    search_system_path: bool,
    operator: Box<dyn Operator>,
    installer: Box<dyn Installer>,
    resolved: HashMap<String, PathBuf>,
}

impl ToolProvisioner {
    pub fn new(
        managed_dir: impl Into<PathBuf>,
        operator: Box<dyn Operator>,
        installer: Box<dyn Installer>,
    ) -> Self {
        Self {
            search_override: None,
            managed_dir: managed_dir.into(),
            search_system_path: true,
            operator,
            installer,
            resolved: HashMap::new(),
        }
    }

    /// Looks in `path` (a binary or a directory) before anything else.
    pub fn with_search_override(mut self, path: Option<PathBuf>) -> Self {
        self.search_override = path;
        self
    }

    /// Skip the `PATH` lookup; only the override and managed directory count.
    pub fn without_system_path(mut self) -> Self {
        self.search_system_path = false;
        self
    }

    /// Finds `tool` without prompting or installing anything.
    pub fn probe(&mut self, tool: &str) -> Option<PathBuf> {
        if let Some(path) = self.resolved.get(tool) {
            return Some(path.clone());
        }
        let found = self.search(tool)?;
        debug!(tool, path = %found.display(), "tool located");
        self.resolved.insert(tool.to_string(), found.clone());
        Some(found)
    }

    /// Finds `tool`, installing it with the operator's consent when missing.
    pub async fn ensure_available(&mut self, tool: &str) -> Result<PathBuf, ToolUnavailable> {
        if let Some(path) = self.probe(tool) {
            return Ok(path);
        }

        let prompt = format!(
            "{tool} was not found. Download and install it into {}?",
            self.managed_dir.display()
        );
        if !self.operator.confirm(&prompt) {
            return Err(ToolUnavailable::Declined {
                tool: tool.to_string(),
            });
        }

        let installed = self
            .installer
            .provision(tool, &self.managed_dir)
            .await
            .map_err(|err| ToolUnavailable::InstallFailed {
                tool: tool.to_string(),
                reason: format!("{err:#}"),
            })?;
        if !installed.is_file() {
            return Err(ToolUnavailable::InstallFailed {
                tool: tool.to_string(),
                reason: format!("{} does not exist after install", installed.display()),
            });
        }

        self.resolved.insert(tool.to_string(), installed.clone());
        Ok(installed)
    }

    fn search(&self, tool: &str) -> Option<PathBuf> {
        let name = executable_name(tool);

        if let Some(location) = &self.search_override {
            if location.is_file() {
                return Some(location.clone());
            }
            if location.is_dir()
                && let Some(found) = find_below(location, &name)
            {
                return Some(found);
            }
        }

        if self.search_system_path
            && let Ok(found) = which::which(&name)
        {
            return Some(found);
        }

        let managed = self.managed_dir.join(&name);
        managed.is_file().then_some(managed)
    }
}

fn find_below(dir: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(dir)
        .max_depth(OVERRIDE_SEARCH_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_file() && entry.file_name() == name)
        .map(|entry| entry.into_path())
}
