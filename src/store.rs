// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent metadata for offline downloads.
//!
//! The whole task table is written as one JSON object keyed by content id so
//! downloads survive a restart. Writes go through a temp file and an atomic
//! rename while an advisory lock on a sibling `.lock` file is held.
//!
//! [`InstanceLock`] is separate: one manager holds it for its whole lifetime
//! so two processes never drive the same data directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fs2::FileExt;

use crate::errors::ManagerError;
use crate::types::{DownloadStatus, DownloadTable};

/// Default timeout for acquiring file locks (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Durable id → record mapping backed by a single JSON file.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl MetadataStore {
    /// Store backed by `path`. Parent directories are created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Override the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Location of the metadata file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock file coordinating access to the metadata file.
    ///
    /// A separate file lets the lock stay held across the atomic rename.
    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Load the task table.
    ///
    /// Never fails: a missing, unreadable or malformed file yields an empty
    /// table. Entries persisted as `Downloading` come back as `Paused`, since
    /// no worker survives a restart.
    pub fn load(&self) -> DownloadTable {
        let mut table = match self.snapshot() {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    "Discarding unreadable download metadata: {:#}",
                    e
                );
                return DownloadTable::new();
            }
        };

        for (id, entry) in table.iter_mut() {
            if entry.status == DownloadStatus::Downloading {
                tracing::info!(id = %id, "Recovered interrupted download as paused");
                entry.status = DownloadStatus::Paused;
            }
        }

        table
    }

    /// The table exactly as last saved, with no crash recovery applied.
    ///
    /// Used to show the state of a data directory another process owns,
    /// where `Downloading` really means a transfer is running.
    pub fn snapshot(&self) -> Result<DownloadTable> {
        let mut table = self.try_load()?;
        for (id, entry) in table.iter_mut() {
            entry.id = id.clone();
        }
        Ok(table)
    }

    fn try_load(&self) -> Result<DownloadTable> {
        if !self.path.exists() {
            return Ok(DownloadTable::new());
        }

        // Shared lock: many readers, blocked while a writer holds it
        let lock_file = open_lock_file(&self.lock_path())?;
        acquire_shared_lock_with_timeout(&lock_file, self.lock_timeout)?;

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read metadata file: {:?}", self.path))?;

        let table: DownloadTable = serde_json::from_str(&content)
            .with_context(|| "Failed to parse metadata file")?;

        Ok(table)
    }

    /// Save the task table atomically.
    ///
    /// Callers treat a failure as non-fatal: the in-memory table stays
    /// authoritative and the next save tries again.
    pub fn save(&self, table: &DownloadTable) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let _lock_guard = acquire_exclusive_lock_with_timeout(&self.lock_path(), self.lock_timeout)?;

        let temp_path = self.path.with_extension("tmp");
        let content = serde_json::to_string_pretty(table)
            .with_context(|| "Failed to serialize download metadata")?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;

            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write to temp file")?;

            // Flush before rename so a crash never leaves a half-written file
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp file to metadata file: {:?} -> {:?}",
                temp_path, self.path
            )
        })?;

        Ok(())
    }
}

/// Exclusive ownership of a data directory.
///
/// Released when dropped. A second [`InstanceLock::acquire`] on the same
/// path, from this process or another, fails with [`ManagerError::Busy`].
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> std::result::Result<Self, ManagerError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Acquired instance lock");
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if is_contended(&e) => Err(ManagerError::Busy {
                data_dir: path.parent().unwrap_or(path).to_path_buf(),
            }),
            Err(e) => Err(ManagerError::Io(e)),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), "Failed to release instance lock: {}", e);
        }
    }
}

/// Lock held elsewhere, as opposed to a real I/O failure.
fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {:?}", path))
}

/// Acquire an exclusive lock on `path`, polling until `timeout` expires.
///
/// The returned handle holds the lock until dropped.
fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
    let lock_file = open_lock_file(path)?;
    let start = Instant::now();

    loop {
        match FileExt::try_lock_exclusive(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if is_contended(&e) => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for exclusive lock on {:?} after {:?}. \
                         Another instance may be writing download metadata.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
            }
        }
    }
}

/// Acquire a shared lock on an open lock file, polling until `timeout` expires.
fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
    let start = Instant::now();

    loop {
        match FileExt::try_lock_shared(file) {
            Ok(()) => return Ok(()),
            Err(e) if is_contended(&e) => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for shared lock after {:?}. \
                         Another instance may be writing download metadata.",
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e).with_context(|| "Failed to acquire shared lock on metadata file");
            }
        }
    }
}
