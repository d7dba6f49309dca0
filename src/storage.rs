// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Free-space checks before and during transfers.
//!
//! [`StorageGuard`] answers "is there room for N more bytes plus the safety
//! buffer?". Workers wrap it in a [`SpaceBudget`] so the free-space query is
//! not issued for every chunk.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default safety margin kept free on the downloads volume (10 MiB).
pub const DEFAULT_STORAGE_BUFFER: u64 = 10 * 1024 * 1024;

/// Source of free-space readings.
pub trait SpaceProbe: Send + Sync + fmt::Debug {
    /// Bytes available to this process on the volume holding `path`.
    fn available_space(&self, path: &Path) -> io::Result<u64>;
}

/// Reads free space from the filesystem via `fs2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fs2SpaceProbe;

impl SpaceProbe for Fs2SpaceProbe {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        // The downloads directory may not exist yet; ask its closest ancestor.
        let mut target = path;
        while !target.exists() {
            match target.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => target = parent,
                _ => {
                    target = Path::new(".");
                    break;
                }
            }
        }
        fs2::available_space(target)
    }
}

/// Probe reporting an adjustable amount of free space.
///
/// Clones share state, so a test can keep one handle and change the reading
/// while a transfer runs.
#[derive(Debug, Clone, Default)]
pub struct FixedSpaceProbe {
    free: Arc<AtomicU64>,
    failing: Arc<AtomicBool>,
    queries: Arc<AtomicUsize>,
}

impl FixedSpaceProbe {
    pub fn new(free_bytes: u64) -> Self {
        let probe = Self::default();
        probe.set(free_bytes);
        probe
    }

    /// Change the reported free space.
    pub fn set(&self, free_bytes: u64) {
        self.free.store(free_bytes, Ordering::SeqCst);
    }

    /// Make every query fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of queries answered so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl SpaceProbe for FixedSpaceProbe {
    fn available_space(&self, _path: &Path) -> io::Result<u64> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "free space unavailable"));
        }
        Ok(self.free.load(Ordering::SeqCst))
    }
}

/// Enforces the storage safety buffer for one downloads directory.
#[derive(Debug, Clone)]
pub struct StorageGuard {
    probe: Arc<dyn SpaceProbe>,
    dir: PathBuf,
    buffer: u64,
}

impl StorageGuard {
    pub fn new(probe: Arc<dyn SpaceProbe>, dir: impl Into<PathBuf>, buffer: u64) -> Self {
        Self {
            probe,
            dir: dir.into(),
            buffer,
        }
    }

    /// Safety buffer in bytes.
    pub fn buffer(&self) -> u64 {
        self.buffer
    }

    /// Current free space, or `None` when the probe fails.
    pub fn free_space(&self) -> Option<u64> {
        match self.probe.available_space(&self.dir) {
            Ok(free) => Some(free),
            Err(e) => {
                tracing::warn!(
                    dir = %self.dir.display(),
                    "Could not query free space, not enforcing storage buffer: {}",
                    e
                );
                None
            }
        }
    }

    /// Pre-flight check for a transfer needing `required` more bytes.
    ///
    /// An unknown size never blocks; the per-chunk check covers it.
    pub fn check_before_start(&self, required: Option<u64>) -> bool {
        match required {
            Some(required) => self.has_room_for(required),
            None => true,
        }
    }

    /// Check before writing a chunk of `next_chunk` bytes.
    pub fn check_during_transfer(&self, next_chunk: u64) -> bool {
        self.has_room_for(next_chunk)
    }

    fn has_room_for(&self, bytes: u64) -> bool {
        match self.free_space() {
            Some(free) => {
                let ok = free >= bytes.saturating_add(self.buffer);
                if !ok {
                    tracing::debug!(free, needed = bytes, buffer = self.buffer, "Storage check failed");
                }
                ok
            }
            None => true,
        }
    }

    /// Throttled per-chunk checker for one transfer.
    pub fn budget(&self, check_interval: u32) -> SpaceBudget {
        SpaceBudget {
            guard: self.clone(),
            check_interval: check_interval.max(1),
            chunks_since_check: 0,
            headroom: Headroom::Unmeasured,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Headroom {
    Unmeasured,
    /// Probe failed; writes are not limited until the next reading
    Unlimited,
    Bytes(u64),
}

/// Per-transfer view of the storage guard.
///
/// Free space is re-read every `check_interval` chunks, and also whenever the
/// headroom left from the last reading cannot cover the next chunk. Between
/// readings the headroom shrinks by every admitted chunk, so a write never
/// goes past what was last measured.
#[derive(Debug)]
pub struct SpaceBudget {
    guard: StorageGuard,
    check_interval: u32,
    chunks_since_check: u32,
    headroom: Headroom,
}

impl SpaceBudget {
    /// Whether a chunk of `len` bytes may be written now.
    pub fn admit(&mut self, len: u64) -> bool {
        let stale = match self.headroom {
            Headroom::Unmeasured => true,
            Headroom::Bytes(left) => left < len,
            Headroom::Unlimited => false,
        };
        if stale || self.chunks_since_check >= self.check_interval {
            self.measure();
        }

        match self.headroom {
            Headroom::Unlimited => {
                self.chunks_since_check += 1;
                true
            }
            Headroom::Bytes(left) if left >= len => {
                self.headroom = Headroom::Bytes(left - len);
                self.chunks_since_check += 1;
                true
            }
            _ => false,
        }
    }

    fn measure(&mut self) {
        self.chunks_since_check = 0;
        self.headroom = match self.guard.free_space() {
            Some(free) => Headroom::Bytes(free.saturating_sub(self.guard.buffer)),
            None => Headroom::Unlimited,
        };
    }
}

/// Format bytes to human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
