#![forbid(unsafe_code)]

//! Download archive: the set of item ids that already completed end to end.
//!
//! The backing file is newline-delimited and meant to be edited by hand. Lines
//! written by yt-dlp itself (`youtube <id>`) are accepted too, we only keep the
//! last whitespace-separated token of each line.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

#[derive(Debug)]
pub struct ArchiveStore {
    path: PathBuf,
    entries: HashSet<String>,
}

impl ArchiveStore {
    /// Loads the archive at `path`. A missing file is an empty archive; it is
    /// only created on the first [`ArchiveStore::add`].
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = load_entries(&path)?;
        debug!(path = %path.display(), entries = entries.len(), "loaded download archive");
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.entries.contains(item_id.trim())
    }

    /// Records a completed item. Ids already present are not written twice.
    pub fn add(&mut self, item_id: &str) -> Result<()> {
        let item_id = item_id.trim();
        if item_id.is_empty() || self.entries.contains(item_id) {
            return Ok(());
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening archive {}", self.path.display()))?;
        // One write per line keeps each record a single append.
        file.write_all(format!("{item_id}\n").as_bytes())
            .with_context(|| format!("writing archive entry for {item_id}"))?;
        file.sync_data()
            .with_context(|| format!("flushing archive {}", self.path.display()))?;

        self.entries.insert(item_id.to_owned());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn load_entries(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut entries = HashSet::new();

    for line in reader.lines() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(id) = trimmed.split_whitespace().last() {
            entries.insert(id.to_owned());
        }
    }

    Ok(entries)
}
