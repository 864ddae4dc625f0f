#![forbid(unsafe_code)]

//! Failure taxonomy shared by the orchestrator and the `ytrip` binary.
//!
//! Per-item failures never escape as `Err` from a batch run: they are caught
//! at the orchestrator boundary and turned into [`ItemFailure`] rows so the
//! report can always name the item, the kind of failure and the last detail
//! the fetch engine gave us. [`JobError`] is reserved for problems that stop
//! a job before (or instead of) processing items.

use std::fmt;

use thiserror::Error;

use crate::job::PlaylistItem;
use crate::provision::ToolUnavailable;

/// How a single playlist item ended when it did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The remote service refused the item for good (removed, private,
    /// region-blocked) or a local step hit an unrecoverable error.
    Fatal,
    /// Every attempt hit a transient condition.
    ExhaustedRetries,
    /// Nothing the service offered satisfies the output policy.
    NoAcceptableFormat,
    /// The operator interrupted the run while this item was in flight.
    Interrupted,
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            FailureKind::Fatal => "fatal",
            FailureKind::ExhaustedRetries => "exhausted retries",
            FailureKind::NoAcceptableFormat => "no acceptable format",
            FailureKind::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A reported, per-item failure.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub item: PlaylistItem,
    pub kind: FailureKind,
    pub detail: String,
}

impl ItemFailure {
    pub fn new(item: &PlaylistItem, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            item: item.clone(),
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) failed [{}]: {}",
            self.item.item_id, self.item.title, self.kind, self.detail
        )
    }
}

/// The operator asked us to stop.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("interrupted by operator")]
pub struct Interrupted;

/// Errors that abort a whole job rather than a single item.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid source URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    ToolUnavailable(#[from] ToolUnavailable),

    #[error("could not resolve {url}: {detail}")]
    Unresolvable { url: String, detail: String },

    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_failure_display_names_item_kind_and_detail() {
        let item = PlaylistItem {
            item_id: "abc123".into(),
            title: "Song".into(),
            resolved_url: "https://www.youtube.com/watch?v=abc123".into(),
        };
        let failure = ItemFailure::new(&item, FailureKind::ExhaustedRetries, "HTTP Error 429");
        let rendered = failure.to_string();
        assert!(rendered.contains("abc123"));
        assert!(rendered.contains("Song"));
        assert!(rendered.contains("exhausted retries"));
        assert!(rendered.contains("HTTP Error 429"));
    }
}
