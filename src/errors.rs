// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for manager commands and transfer failures.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::transport::TransportError;
use crate::types::DownloadStatus;

/// Longest piece of raw error detail shown to users.
const MAX_DETAIL_CHARS: usize = 100;

// ============================================================================
// Manager errors
// ============================================================================

/// Errors returned by [`crate::OfflineManager`] commands.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("No download with id '{0}'")]
    NotFound(String),

    #[error("Cannot {action} '{id}' while it is {status}")]
    InvalidState {
        id: String,
        status: DownloadStatus,
        action: &'static str,
    },

    /// Another entry already writes to the file this id maps to
    #[error("'{id}' would share its file with '{other}'")]
    PathInUse { id: String, other: String },

    /// Another manager holds the data directory
    #[error("Download data in {data_dir:?} is in use by another process")]
    Busy { data_dir: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Transfer failures
// ============================================================================

/// Why a transfer stopped without completing.
///
/// Every variant maps to the status the entry lands in and a short message
/// for the UI.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Connect failure, timeout or broken body stream
    #[error("network error: {0}")]
    Network(String),

    /// Server answered with a non-success status
    #[error("server returned HTTP {code}")]
    Http { code: u16 },

    /// The storage guard refused the next chunk
    #[error("insufficient free space for the next chunk")]
    InsufficientSpace,

    /// The filesystem reported it is out of space
    #[error("no space left on device")]
    DiskFull,

    /// The body ended before the announced length
    #[error("stream ended at {actual} of {expected} bytes")]
    Incomplete { expected: u64, actual: u64 },

    /// Any other local I/O failure
    #[error("file system error: {0}")]
    FileSystem(String),

    #[error("{0}")]
    Other(String),
}

impl TransferError {
    /// Status the entry lands in after this failure.
    pub fn status(&self) -> DownloadStatus {
        match self {
            TransferError::Network(_) => DownloadStatus::Paused,
            TransferError::InsufficientSpace | TransferError::DiskFull => DownloadStatus::StorageFull,
            TransferError::Http { .. }
            | TransferError::Incomplete { .. }
            | TransferError::FileSystem(_)
            | TransferError::Other(_) => DownloadStatus::Error,
        }
    }

    /// Short message for the error event.
    pub fn user_message(&self) -> String {
        match self {
            TransferError::Network(_) => "Network connection issue. Download paused.".to_string(),
            TransferError::Http { code } => format!("Download failed: Server error {}", code),
            TransferError::InsufficientSpace => {
                "Not enough storage space. Download paused.".to_string()
            }
            TransferError::DiskFull => "No space left on device. Download paused.".to_string(),
            TransferError::Incomplete { .. } => {
                "Download incomplete, stream ended prematurely.".to_string()
            }
            TransferError::FileSystem(_) => "File system error during download.".to_string(),
            TransferError::Other(detail) => {
                format!("An unexpected error occurred: {}.", short_detail(detail))
            }
        }
    }

    /// Taxonomy name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Network(_) => "network",
            TransferError::Http { .. } => "http",
            TransferError::InsufficientSpace | TransferError::DiskFull => "no_space",
            TransferError::Incomplete { .. } => "incomplete",
            TransferError::FileSystem(_) | TransferError::Other(_) => "other",
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        if is_out_of_space(&e) {
            TransferError::DiskFull
        } else {
            TransferError::FileSystem(e.to_string())
        }
    }
}

impl From<TransportError> for TransferError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Network(msg) => TransferError::Network(msg),
            TransportError::Http(code) => TransferError::Http { code },
            TransportError::Other(msg) => TransferError::Other(msg),
        }
    }
}

/// True for the OS "disk full" errors.
pub fn is_out_of_space(e: &io::Error) -> bool {
    #[cfg(unix)]
    const CODES: &[i32] = &[28]; // ENOSPC
    #[cfg(windows)]
    const CODES: &[i32] = &[39, 112]; // ERROR_HANDLE_DISK_FULL, ERROR_DISK_FULL
    #[cfg(not(any(unix, windows)))]
    const CODES: &[i32] = &[];

    e.raw_os_error().is_some_and(|code| CODES.contains(&code))
}

/// First [`MAX_DETAIL_CHARS`] characters of an error message.
pub fn short_detail(detail: &str) -> String {
    let mut out: String = detail.chars().take(MAX_DETAIL_CHARS).collect();
    if detail.chars().count() > MAX_DETAIL_CHARS {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_status_mapping() {
        assert_eq!(TransferError::Network("reset".into()).status(), DownloadStatus::Paused);
        assert_eq!(TransferError::Http { code: 404 }.status(), DownloadStatus::Error);
        assert_eq!(TransferError::InsufficientSpace.status(), DownloadStatus::StorageFull);
        assert_eq!(TransferError::DiskFull.status(), DownloadStatus::StorageFull);
        assert_eq!(
            TransferError::Incomplete { expected: 10, actual: 5 }.status(),
            DownloadStatus::Error
        );
        assert_eq!(TransferError::FileSystem("denied".into()).status(), DownloadStatus::Error);
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(
            TransferError::Http { code: 503 }.user_message(),
            "Download failed: Server error 503"
        );
        assert_eq!(
            TransferError::Network("timed out".into()).user_message(),
            "Network connection issue. Download paused."
        );
        assert_eq!(
            TransferError::DiskFull.user_message(),
            "No space left on device. Download paused."
        );
    }

    #[test]
    fn test_other_message_is_truncated() {
        let long = "x".repeat(500);
        let msg = TransferError::Other(long).user_message();
        assert!(msg.len() < 140, "message too long: {}", msg.len());
        assert!(msg.starts_with("An unexpected error occurred: xxx"));
    }

    #[cfg(unix)]
    #[test]
    fn test_enospc_maps_to_disk_full() {
        let err = io::Error::from_raw_os_error(28);
        assert!(matches!(TransferError::from(err), TransferError::DiskFull));

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(TransferError::from(err), TransferError::FileSystem(_)));
    }

    #[test]
    fn test_transport_error_conversion() {
        assert!(matches!(
            TransferError::from(TransportError::Http(416)),
            TransferError::Http { code: 416 }
        ));
        assert_eq!(
            TransferError::from(TransportError::Network("eof".into())).kind(),
            "network"
        );
    }

    #[test]
    fn test_manager_error_display() {
        let err = ManagerError::InvalidState {
            id: "m1".into(),
            status: DownloadStatus::Completed,
            action: "resume",
        };
        assert_eq!(err.to_string(), "Cannot resume 'm1' while it is completed");
    }
}
