// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Terminal rendering of errors with likely causes and next steps.
//!
//! The library reports failures as typed errors and events; the CLI turns
//! them into something a person can act on.

use std::fmt;

use crate::errors::ManagerError;
use crate::types::{DownloadEntry, DownloadStatus};

/// Formats an error message with title, causes and fixes.
///
/// ```
/// use offline_vault::error::format_error;
///
/// let text = format_error(
///     "Download 'm1' failed",
///     &["Server returned 404"],
///     &["Check the URL: offline-vault list"],
/// );
/// assert!(text.starts_with("[✗] Download 'm1' failed"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}", title);

    if !causes.is_empty() {
        output.push_str("\n\nPossible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
    }

    if !fixes.is_empty() {
        output.push_str(if causes.is_empty() { "\n\n" } else { "\n" });
        output.push_str("Try these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
    }

    output.trim_end().to_string()
}

/// Builder for a formatted error report.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorReport {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    pub fn build(&self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(String::as_str).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(String::as_str).collect();
        format_error(&self.title, &causes, &fixes)
    }

    /// Report for a rejected manager command.
    pub fn for_command(err: &ManagerError) -> Self {
        match err {
            ManagerError::NotFound(id) => Self::new(format!("No download with id '{}'", id))
                .fix("List known downloads: offline-vault list"),
            ManagerError::InvalidState { id, status, action } => {
                let report = Self::new(err.to_string());
                match (status, *action) {
                    (DownloadStatus::Cancelled, "resume") => {
                        report.fix(format!("Start it again from zero: offline-vault retry {}", id))
                    }
                    (DownloadStatus::Completed, _) => report
                        .cause("The file is already fully downloaded")
                        .fix(format!("Delete it instead: offline-vault remove {}", id)),
                    _ => report.fix("Check its current status: offline-vault list"),
                }
            }
            ManagerError::PathInUse { other, .. } => Self::new(err.to_string())
                .cause("Both ids map to the same file name in the downloads folder")
                .fix(format!("Remove the other download first: offline-vault remove {}", other)),
            ManagerError::Busy { .. } => Self::new(err.to_string())
                .cause("Only one offline-vault process can manage downloads at a time")
                .fix("Wait for the other process to finish, or press Ctrl+C in it")
                .fix("Check its progress: offline-vault list"),
            ManagerError::Io(e) => Self::new("File system error in the data directory")
                .cause(e.to_string())
                .fix("Check permissions on the downloads directory: offline-vault config show"),
        }
    }

    /// Report for an entry that ended in a failed state, if it did.
    pub fn for_entry(entry: &DownloadEntry) -> Option<Self> {
        let title = format!("Download '{}' did not finish ({})", entry.id, entry.status);
        let report = match entry.status {
            DownloadStatus::StorageFull => Self::new(title)
                .cause("Not enough free space for the file plus the safety buffer")
                .fix(format!("Free some space, then: offline-vault resume {}", entry.id))
                .fix("See what is stored: offline-vault usage"),
            DownloadStatus::Error => Self::new(title)
                .cause("The server rejected the request or the transfer broke off")
                .fix(format!("Try again: offline-vault retry {}", entry.id))
                .fix(format!("Verify the URL: {}", entry.url)),
            DownloadStatus::Paused => Self::new(title)
                .cause("The network connection was lost")
                .fix(format!("Resume when online: offline-vault resume {}", entry.id)),
            _ => return None,
        };
        Some(report)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_format_error() {
        let error = format_error("Test Error", &["Cause 1", "Cause 2"], &["Fix 1", "Fix 2"]);

        assert!(error.starts_with("[✗] Test Error"));
        assert!(error.contains("Possible causes:\n  - Cause 1\n  - Cause 2"));
        assert!(error.contains("Try these fixes:\n  1. Fix 1\n  2. Fix 2"));
    }

    #[test]
    fn test_empty_causes_and_fixes() {
        let error = format_error("Empty test", &[], &[]);
        assert_eq!(error, "[✗] Empty test");
    }

    #[test]
    fn test_not_found_report() {
        let report = ErrorReport::for_command(&ManagerError::NotFound("m9".into()));
        let text = report.to_string();
        assert!(text.contains("No download with id 'm9'"));
        assert!(text.contains("offline-vault list"));
    }

    #[test]
    fn test_busy_data_dir_report() {
        let err = ManagerError::Busy {
            data_dir: "/data/vault".into(),
        };
        let text = ErrorReport::for_command(&err).build();
        assert!(text.contains("in use by another process"));
        assert!(text.contains("offline-vault list"));
    }

    #[test]
    fn test_resume_cancelled_suggests_retry() {
        let err = ManagerError::InvalidState {
            id: "m1".into(),
            status: DownloadStatus::Cancelled,
            action: "resume",
        };
        assert!(ErrorReport::for_command(&err).build().contains("offline-vault retry m1"));
    }

    #[test]
    fn test_entry_reports() {
        let mut entry = DownloadEntry::new("m1", "https://cdn.test/m1.mp4", "M1", "", Path::new("/d"));
        assert!(ErrorReport::for_entry(&entry).is_none());

        entry.status = DownloadStatus::StorageFull;
        let text = ErrorReport::for_entry(&entry).unwrap().build();
        assert!(text.contains("did not finish (storage_full)"));
        assert!(text.contains("offline-vault resume m1"));
    }
}
