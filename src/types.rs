// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types for offline transfers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whole task table, keyed by content id.
pub type DownloadTable = BTreeMap<String, DownloadEntry>;

/// Extension used when the source URL does not carry one.
const DEFAULT_EXTENSION: &str = "mp4";

/// Record keys owned by [`DownloadEntry`]; catalog metadata may not shadow them.
const RESERVED_KEYS: &[&str] = &[
    "url",
    "title",
    "iconUrl",
    "status",
    "progress",
    "filePath",
    "fileName",
    "addedAt",
    "expectedSizeBytes",
    "actualSizeBytes",
];

/// Status of an offline download.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Added, no worker started yet
    Pending,
    /// A worker is streaming bytes to disk
    Downloading,
    /// Stopped cooperatively; the partial file is kept
    Paused,
    /// File fully on disk
    Completed,
    /// Failed; retryable
    Error,
    /// Stopped and partial file deleted
    Cancelled,
    /// Not enough free space to start or continue
    StorageFull,
}

impl DownloadStatus {
    /// Returns true while a worker owns the entry.
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadStatus::Downloading)
    }

    /// Statuses that `add` is allowed to overwrite with a fresh entry.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Error | DownloadStatus::Cancelled | DownloadStatus::StorageFull
        )
    }

    /// Statuses accepted by `resume`.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Pending
                | DownloadStatus::Paused
                | DownloadStatus::Error
                | DownloadStatus::StorageFull
        )
    }

    /// Statuses accepted by `retry`.
    pub fn is_retryable(&self) -> bool {
        self.is_resumable() || matches!(self, DownloadStatus::Cancelled)
    }

    /// Stable lowercase name, matching the persisted form.
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Error => "error",
            DownloadStatus::Cancelled => "cancelled",
            DownloadStatus::StorageFull => "storage_full",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// Self-transitions are always allowed. Cancelling is allowed from any
    /// state; a completed entry can only be cancelled; only a worker run can
    /// complete (a pause may race with its last chunk); `Pending` is
    /// re-entered only by re-adding a failed or cancelled entry.
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;

        if self == next {
            return true;
        }
        match (self, next) {
            (_, Cancelled) => true,
            (Completed, _) => false,
            (_, Completed) => matches!(self, Downloading | Paused),
            (_, Pending) => self.is_restartable(),
            (Pending | Downloading | Paused | Error | Cancelled | StorageFull, _) => true,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Download progress in percent, or unknown when the server sent no length.
///
/// Persisted as a plain integer: `0..=100`, or `-1` for unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum Progress {
    Known(u8),
    Unknown,
}

impl Default for Progress {
    fn default() -> Self {
        Progress::Known(0)
    }
}

impl Progress {
    /// Progress of `done` out of `total` bytes; unknown when `total` is 0.
    pub fn from_bytes(done: u64, total: u64) -> Self {
        if total == 0 {
            return Progress::Unknown;
        }
        let percent = (done as u128 * 100 / total as u128).min(100);
        Progress::Known(percent as u8)
    }

    /// Percent value when known.
    pub fn percent(&self) -> Option<u8> {
        match self {
            Progress::Known(p) => Some(*p),
            Progress::Unknown => None,
        }
    }

    /// Integer form used on the wire and in events.
    pub fn as_i32(&self) -> i32 {
        i32::from(*self)
    }
}

impl From<i32> for Progress {
    fn from(value: i32) -> Self {
        if value < 0 {
            Progress::Unknown
        } else {
            Progress::Known(value.min(100) as u8)
        }
    }
}

impl From<Progress> for i32 {
    fn from(progress: Progress) -> Self {
        match progress {
            Progress::Known(p) => p as i32,
            Progress::Unknown => -1,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Known(p) => write!(f, "{}%", p),
            Progress::Unknown => f.write_str("?"),
        }
    }
}

/// One offline download, as kept in the task table and persisted to disk.
///
/// The id is the table key and is not repeated inside the JSON record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadEntry {
    /// Stable content identifier
    #[serde(skip)]
    pub id: String,
    /// Source location
    pub url: String,
    /// Display title, opaque to the manager
    pub title: String,
    /// Display icon, opaque to the manager
    #[serde(default)]
    pub icon_url: String,
    /// Current lifecycle status
    pub status: DownloadStatus,
    /// Last reported progress
    #[serde(default)]
    pub progress: Progress,
    /// Destination file
    pub file_path: PathBuf,
    /// File name inside the downloads directory
    pub file_name: String,
    /// When the entry was created
    pub added_at: DateTime<Utc>,
    /// Total size if known, else 0
    #[serde(default)]
    pub expected_size_bytes: u64,
    /// Bytes currently on disk
    #[serde(default)]
    pub actual_size_bytes: u64,
    /// Catalog metadata carried through untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DownloadEntry {
    /// Create a pending entry whose file lives in `downloads_dir`.
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
        icon_url: impl Into<String>,
        downloads_dir: &Path,
    ) -> Self {
        let id = id.into();
        let url = url.into();
        let file_name = file_name_for(&id, &url);
        Self {
            file_path: downloads_dir.join(&file_name),
            file_name,
            id,
            url,
            title: title.into(),
            icon_url: icon_url.into(),
            status: DownloadStatus::Pending,
            progress: Progress::default(),
            added_at: Utc::now(),
            expected_size_bytes: 0,
            actual_size_bytes: 0,
            extra: BTreeMap::new(),
        }
    }

    /// Attach catalog metadata. Keys that collide with record fields are dropped.
    pub fn with_extra(mut self, extra: BTreeMap<String, serde_json::Value>) -> Self {
        self.extra = extra
            .into_iter()
            .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()) && key != "id")
            .collect();
        self
    }

    /// Move to `next` if the lifecycle allows it.
    ///
    /// Returns false (and leaves the entry untouched) for illegal moves.
    pub fn transition(&mut self, next: DownloadStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                id = %self.id,
                from = %self.status,
                to = %next,
                "Rejected illegal status transition"
            );
            return false;
        }
        self.status = next;
        true
    }

    /// Forget everything on disk: zero bytes, zero progress.
    pub fn reset_progress(&mut self) {
        self.actual_size_bytes = 0;
        self.progress = Progress::default();
    }

    /// Bytes this entry occupies on disk.
    ///
    /// Completed files are measured; anything else trusts the last report.
    pub fn stored_bytes(&self) -> u64 {
        match self.status {
            DownloadStatus::Completed => std::fs::metadata(&self.file_path)
                .map(|m| m.len())
                .unwrap_or(self.actual_size_bytes),
            _ => self.actual_size_bytes,
        }
    }
}

/// Order entries for display: oldest first, ties by id.
pub fn sort_oldest_first(entries: &mut [DownloadEntry]) {
    entries.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.id.cmp(&b.id)));
}

/// Destination file name for a content id: `<id>.<ext of url path>`.
///
/// Falls back to `.mp4` when the URL path has no usable extension. The id is
/// percent-encoded, so distinct ids always get distinct names and none can
/// climb out of the downloads folder.
pub fn file_name_for(id: &str, url: &str) -> String {
    let ext = reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .and_then(|last| {
            Path::new(&last)
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
        })
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());

    format!("{}.{}", urlencoding::encode(id), ext)
}
